//! Apple-TV pairing primitives
//!
//! Self-contained codecs and cryptography used during Apple-TV pair-setup
//! and pair-verify, independent of the iOS stack: TLV8 and OPACK2
//! encodings, an SRP-6a client, HKDF-SHA512, Ed25519 signing and
//! ChaCha20-Poly1305 sealing, plus mDNS browse parsing and host-identity
//! derivation.

pub mod bonjour;
mod crypto;
mod opack;
pub mod srp;
pub mod tlv;

pub use crypto::{
    chacha20_poly1305_decrypt, chacha20_poly1305_encrypt, ed25519_verify, hkdf_sha512,
    Ed25519KeyPair, ED25519_SIGNATURE_LENGTH, HKDF_MAX_OUTPUT,
};
pub use opack::opack_dumps;
pub use srp::{SrpClient, PAIR_SETUP_USERNAME, SRP_KEY_LENGTH};

use uuid::Uuid;

use crate::RemoteXpcError;

/// Derives the stable host identity for a hostname
///
/// UUIDv3 over the DNS namespace, rendered uppercase the way lockdown
/// records host IDs. Deterministic for a given hostname.
pub fn derive_host_id(hostname: &str) -> Result<String, RemoteXpcError> {
    if hostname.is_empty() {
        return Err(RemoteXpcError::State(
            "hostname must be a non-empty string".to_string(),
        ));
    }
    let uuid = Uuid::new_v3(&Uuid::NAMESPACE_DNS, hostname.as_bytes());
    Ok(uuid.to_string().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_is_deterministic() {
        let first = derive_host_id("my-host.local").unwrap();
        let second = derive_host_id("my-host.local").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, derive_host_id("other-host.local").unwrap());
    }

    #[test]
    fn host_id_is_uppercase_uuid() {
        let id = derive_host_id("my-host.local").unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(id, id.to_uppercase());
        assert_eq!(id.split('-').count(), 5);
    }

    #[test]
    fn empty_hostname_is_rejected() {
        assert!(matches!(
            derive_host_id(""),
            Err(RemoteXpcError::State(_))
        ));
    }
}
