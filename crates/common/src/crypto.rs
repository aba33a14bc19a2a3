//! WireGuard key material
//!
//! Client peers get a fresh X25519 keypair per tunnel; the server side uses
//! one global keypair for the shared interface, loaded from configuration.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// A WireGuard private/public key pair, base64-encoded
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a WireGuard keypair.
///
/// 32 random bytes, clamped as Curve25519 requires, public key via base-point
/// scalar multiplication.
pub fn generate_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // WireGuard key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the base64 public key from a base64 private key.
///
/// Used at startup to fill in the global server public key from the
/// configured private-key file.
pub fn public_key_from_private(private_b64: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(private_b64.trim())
        .map_err(|e| Error::Crypto(format!("invalid private key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("private key must be 32 bytes".to_string()))?;

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}
