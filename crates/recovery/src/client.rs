//! Provisioning API client
//!
//! The recovery process reads the tunnel inventory through the provisioning
//! API rather than the database, so it sees exactly what the broker serves.

use sixtun_common::{Error, Result, TunnelRecord, TunnelWithCommands};

pub struct ApiClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Client against the broker's configured listen address
    pub fn new(listen: &str, api_key: &str) -> Self {
        Self {
            base_url: format!("http://{}", listen),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the full tunnel inventory
    pub async fn get_tunnels(&self) -> Result<Vec<TunnelRecord>> {
        let url = format!("{}/api/v1/tunnels", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "API returned {}: {}",
                status, body
            )));
        }

        let tunnels: Vec<TunnelWithCommands> = response
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(tunnels.into_iter().map(|t| t.tunnel).collect())
    }
}
