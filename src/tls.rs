// Lockdown serves a certificate chained to the per-device root inside the
// pair record, never to a public CA, so rustls's stock verification can
// only fail. Verification is disabled and the pair record itself is the
// trust anchor: when we hold the record's device certificate we compare
// the presented leaf against it and log a mismatch, but never reject the
// handshake over it (devices re-key their leaf across major OS updates).

use log::warn;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use std::sync::Arc;

use crate::{pair_record::PairRecord, RemoteXpcError};

/// Signature schemes offered to the device, newest stacks first
///
/// Modern devices present ECDSA P-256 identities; pre-iOS-16 lockdown
/// certificates are RSA-2048, signed PKCS#1 (SHA-1 on the oldest stacks
/// still in the field); TLS 1.3 requires the PSS forms for RSA keys.
/// Ed25519 rounds out what device firmware has been observed to accept.
const ACCEPTED_SIGNATURE_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::RSA_PKCS1_SHA1,
    SignatureScheme::ED25519,
];

/// Certificate verifier anchored on the pair record instead of a CA store
#[derive(Debug)]
pub struct PairRecordVerifier {
    /// The device certificate from the pair record, when it parsed
    device_certificate: Option<CertificateDer<'static>>,
}

impl PairRecordVerifier {
    pub fn new(pair_record: &PairRecord) -> Self {
        let device_certificate =
            match CertificateDer::from_pem_slice(&pair_record.device_certificate) {
                Ok(cert) => Some(cert),
                Err(e) => {
                    warn!("Pair record device certificate did not parse: {e:?}");
                    None
                }
            };
        Self { device_certificate }
    }
}

impl ServerCertVerifier for PairRecordVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(expected) = &self.device_certificate {
            if expected != end_entity {
                warn!("Device presented a certificate not in the pair record");
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ACCEPTED_SIGNATURE_SCHEMES.to_vec()
    }
}

/// Builds a TLS client config that authenticates with the pair record's
/// host certificate and key and anchors trust on the record itself
pub fn create_client_config(pair_record: &PairRecord) -> Result<ClientConfig, RemoteXpcError> {
    let certificate = CertificateDer::from_pem_slice(&pair_record.host_certificate)?;
    let private_key = PrivateKeyDer::from_pem_slice(&pair_record.host_private_key)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PairRecordVerifier::new(pair_record)))
        .with_client_auth_cert(vec![certificate], private_key)?;

    // A resumed session would skip the client-auth exchange lockdown expects
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}
