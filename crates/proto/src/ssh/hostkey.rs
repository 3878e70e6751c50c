//! Server host key handling: parsing K_S, verifying the exchange-hash
//! signature, and rendering fingerprints.
//!
//! The key blob and signature arrive in SSH wire format inside
//! SSH_MSG_KEXDH_REPLY. Parsing and signature verification are delegated
//! to the `ssh-key` crate; the legacy "ssh-rsa" (SHA-1) signature scheme is
//! verified through the `rsa` crate directly since `ssh-key` only covers
//! the SHA-2 RSA variants.

use base64::Engine;
use sha2::{Digest, Sha256};
use signature::Verifier;
use skiff_platform::{SkiffError, SkiffResult};
use ssh_encoding::Decode;
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, PublicKey, Signature};
use std::sync::Arc;

/// A parsed server host key.
#[derive(Debug, Clone)]
pub struct HostKey {
    key: PublicKey,
    blob: Vec<u8>,
}

impl HostKey {
    /// Parses a host key blob and checks it against the negotiated host key
    /// algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] when the blob is malformed or its
    /// algorithm differs from `expected_algorithm`.
    pub fn parse(blob: &[u8], expected_algorithm: &str) -> SkiffResult<Self> {
        let mut reader = blob;
        let key_data = KeyData::decode(&mut reader)
            .map_err(|e| SkiffError::Protocol(format!("Invalid host key blob: {}", e)))?;

        if !reader.is_empty() {
            return Err(SkiffError::Protocol(
                "Trailing data after host key blob".to_string(),
            ));
        }

        let name = key_data.algorithm().to_string();
        if name != expected_algorithm {
            return Err(SkiffError::Protocol(format!(
                "Host key algorithm mismatch: negotiated {}, server sent {}",
                expected_algorithm, name
            )));
        }

        Ok(Self {
            key: PublicKey::new(key_data, ""),
            blob: blob.to_vec(),
        })
    }

    /// Returns the algorithm name (e.g. "ssh-rsa").
    pub fn algorithm_name(&self) -> String {
        self.key.algorithm().to_string()
    }

    /// Returns the raw wire blob as received from the server.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Returns the SHA-256 fingerprint in the usual `SHA256:` base64 form.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.blob);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(hash)
        )
    }

    /// Verifies the server's signature over the exchange hash.
    ///
    /// The signature blob is `string algorithm-name || string signature`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Security`] when the signature does not verify
    /// or does not match the host key type, [`SkiffError::Protocol`] when
    /// the blob is malformed.
    pub fn verify_exchange_hash(
        &self,
        exchange_hash: &[u8],
        signature_blob: &[u8],
    ) -> SkiffResult<()> {
        let mut reader = signature_blob;
        let algorithm = Algorithm::decode(&mut reader)
            .map_err(|e| SkiffError::Protocol(format!("Invalid signature format: {}", e)))?;
        let sig_bytes = Vec::<u8>::decode(&mut reader)
            .map_err(|e| SkiffError::Protocol(format!("Invalid signature data: {}", e)))?;

        match algorithm {
            // ssh-rsa signatures hash with SHA-1, which ssh-key's verifier
            // does not cover; go through the rsa crate.
            Algorithm::Rsa { hash: None } => {
                let rsa_key = self.key.key_data().rsa().ok_or_else(|| {
                    SkiffError::Security(
                        "ssh-rsa signature offered for a non-RSA host key".to_string(),
                    )
                })?;
                let verifying_key = rsa::pkcs1v15::VerifyingKey::<sha1::Sha1>::try_from(rsa_key)
                    .map_err(|_| SkiffError::Security("Invalid RSA host key".to_string()))?;
                let signature = rsa::pkcs1v15::Signature::try_from(sig_bytes.as_slice())
                    .map_err(|_| SkiffError::Security("Malformed RSA signature".to_string()))?;
                verifying_key
                    .verify(exchange_hash, &signature)
                    .map_err(|_| signature_failure())
            }
            other => {
                let signature = Signature::new(other, sig_bytes)
                    .map_err(|e| SkiffError::Protocol(format!("Invalid signature: {}", e)))?;
                Verifier::verify(&self.key, exchange_hash, &signature)
                    .map_err(|_| signature_failure())
            }
        }
    }
}

fn signature_failure() -> SkiffError {
    SkiffError::Security("Host key signature verification failed".to_string())
}

/// Host key verification callback.
///
/// Invoked once, on the first key exchange of a connection, with the server
/// identity (host, port) and the parsed host key. Returning `false` rejects
/// the connection.
pub type HostKeyVerifier = Arc<dyn Fn(&str, u16, &HostKey) -> bool + Send + Sync>;
