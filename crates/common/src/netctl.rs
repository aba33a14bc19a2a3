//! System network control
//!
//! The broker configures the host by shelling out to `ip` and `wg`. All of
//! that goes through the `NetworkController` trait so the provisioning and
//! recovery logic can be exercised against a recording fake.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of one executed command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A route add that already exists is not a failure; everything else is.
fn is_duplicate_route(command: &str, output: &CommandOutput) -> bool {
    command.contains("route add")
        && (output.stderr.contains("File exists") || output.stdout.contains("File exists"))
}

/// Interface to the host's network configuration
#[async_trait]
pub trait NetworkController: Send + Sync {
    /// Run a single shell command
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Apply an ordered command list, aborting on the first failure.
    ///
    /// Informational lines (leading `#`) are skipped, and duplicate-route
    /// failures are tolerated so re-applies stay idempotent.
    async fn apply(&self, commands: &[String]) -> Result<()> {
        for command in commands {
            if command.starts_with('#') {
                continue;
            }
            let output = self.run(command).await?;
            if !output.success() {
                if is_duplicate_route(command, &output) {
                    debug!("Route already exists, skipping: {}", command);
                    continue;
                }
                return Err(Error::CommandExecutionFailed {
                    command: command.clone(),
                    output: format!("{}{}", output.stdout, output.stderr),
                });
            }
        }
        Ok(())
    }

    /// Live SIT/GRE tunnel interfaces, excluding the kernel's default `sit0`
    async fn list_tunnel_interfaces(&self) -> Result<Vec<String>> {
        let output = self.run("ip tunnel show").await?;
        if !output.success() {
            warn!("'ip tunnel show' failed: {}", output.stderr);
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split(':').next())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && name != "sit0")
            .collect())
    }

    /// Public keys of the peers on the shared WireGuard interface.
    ///
    /// An absent interface means zero peers, not an error.
    async fn list_wireguard_peers(&self, interface: &str) -> Result<Vec<String>> {
        let output = self.run(&format!("wg show {} peers", interface)).await?;
        if !output.success() {
            debug!("No WireGuard peers found or {} not available", interface);
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Run an external script by path
    async fn run_script(&self, path: &Path) -> Result<()> {
        let command = path.display().to_string();
        let output = self.run(&command).await?;
        if !output.success() {
            return Err(Error::CommandExecutionFailed {
                command,
                output: format!("{}{}", output.stdout, output.stderr),
            });
        }
        Ok(())
    }
}

/// Production controller: runs commands through `sh -c`
pub struct ShellController;

#[async_trait]
impl NetworkController for ShellController {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!("Running: {}", command);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Recording fake for tests: captures every command, answers the listing
/// operations from scripted state, and can inject failures.
#[derive(Default)]
pub struct RecordingController {
    commands: Mutex<Vec<String>>,
    tunnel_interfaces: Mutex<Vec<String>>,
    wireguard_peers: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands run so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn set_tunnel_interfaces(&self, interfaces: Vec<String>) {
        *self.tunnel_interfaces.lock() = interfaces;
    }

    pub fn set_wireguard_peers(&self, peers: Vec<String>) {
        *self.wireguard_peers.lock() = peers;
    }

    /// Make every command containing `needle` fail with the given stderr
    pub fn fail_on(&self, needle: &str, stderr: &str) {
        self.failures
            .lock()
            .push((needle.to_string(), stderr.to_string()));
    }
}

#[async_trait]
impl NetworkController for RecordingController {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().push(command.to_string());
        if let Some((_, stderr)) = self
            .failures
            .lock()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }
        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn list_tunnel_interfaces(&self) -> Result<Vec<String>> {
        Ok(self.tunnel_interfaces.lock().clone())
    }

    async fn list_wireguard_peers(&self, _interface: &str) -> Result<Vec<String>> {
        Ok(self.wireguard_peers.lock().clone())
    }
}
