//! SSH transport cryptography: ciphers and MACs.
//!
//! This module implements the encryption and integrity algorithms the
//! client advertises:
//! - AES-128-CTR, AES-256-CTR (stream mode)
//! - 3DES-CBC, Blowfish-CBC (block mode)
//! - HMAC-SHA1
//!
//! SSH2 classic ciphers encrypt the whole packet image, length field
//! included; the MAC is computed over `sequence_number || plaintext image`
//! and travels unencrypted after the ciphertext.
//!
//! # Security
//!
//! - MAC comparison is constant-time via [`subtle`]
//! - key material is zeroized on drop

use cipher::inout::InOutBuf;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type TdesCbcEnc = cbc::Encryptor<des::TdesEde3>;
type TdesCbcDec = cbc::Decryptor<des::TdesEde3>;
type BlowfishCbcEnc = cbc::Encryptor<blowfish::Blowfish>;
type BlowfishCbcDec = cbc::Decryptor<blowfish::Blowfish>;

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-256 in counter mode
    Aes256Ctr,
    /// AES-128 in counter mode
    Aes128Ctr,
    /// Triple DES (EDE3) in CBC mode
    TripleDesCbc,
    /// Blowfish in CBC mode
    BlowfishCbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name as used in KEXINIT name-lists.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::TripleDesCbc => "3des-cbc",
            CipherAlgorithm::BlowfishCbc => "blowfish-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes256Ctr => 32,
            CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::TripleDesCbc => 24,
            CipherAlgorithm::BlowfishCbc => 16,
        }
    }

    /// Returns the IV size in bytes (one cipher block).
    pub fn iv_size(&self) -> usize {
        self.block_size()
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes128Ctr => 16,
            CipherAlgorithm::TripleDesCbc | CipherAlgorithm::BlowfishCbc => 8,
        }
    }

    /// Parses a cipher algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "3des-cbc" => Some(CipherAlgorithm::TripleDesCbc),
            "blowfish-cbc" => Some(CipherAlgorithm::BlowfishCbc),
            _ => None,
        }
    }
}

enum CipherInner {
    Aes256Ctr(Box<Aes256Ctr>),
    Aes128Ctr(Box<Aes128Ctr>),
    TdesEncrypt(Box<TdesCbcEnc>),
    TdesDecrypt(Box<TdesCbcDec>),
    BlowfishEncrypt(Box<BlowfishCbcEnc>),
    BlowfishDecrypt(Box<BlowfishCbcDec>),
}

/// A directional packet cipher instance.
///
/// CTR ciphers process both directions identically; CBC ciphers carry a
/// direction fixed at construction, so a `Cipher` built with
/// [`Cipher::encryptor`] must only ever encrypt and vice versa.
pub struct Cipher {
    algorithm: CipherAlgorithm,
    inner: CipherInner,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl Cipher {
    /// Creates the sending-side cipher instance.
    pub fn encryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        Self::check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let inner = match algorithm {
            CipherAlgorithm::Aes256Ctr => CipherInner::Aes256Ctr(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::Aes128Ctr => CipherInner::Aes128Ctr(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::TripleDesCbc => CipherInner::TdesEncrypt(Box::new(
                TdesCbcEnc::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::BlowfishCbc => CipherInner::BlowfishEncrypt(Box::new(
                BlowfishCbcEnc::new_from_slices(key, iv).map_err(bad_material)?,
            )),
        };

        Ok(Self { algorithm, inner })
    }

    /// Creates the receiving-side cipher instance.
    pub fn decryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<Self> {
        Self::check_material(algorithm, key, iv)?;
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let inner = match algorithm {
            CipherAlgorithm::Aes256Ctr => CipherInner::Aes256Ctr(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::Aes128Ctr => CipherInner::Aes128Ctr(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::TripleDesCbc => CipherInner::TdesDecrypt(Box::new(
                TdesCbcDec::new_from_slices(key, iv).map_err(bad_material)?,
            )),
            CipherAlgorithm::BlowfishCbc => CipherInner::BlowfishDecrypt(Box::new(
                BlowfishCbcDec::new_from_slices(key, iv).map_err(bad_material)?,
            )),
        };

        Ok(Self { algorithm, inner })
    }

    fn check_material(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SkiffResult<()> {
        if key.len() < algorithm.key_size() {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key.len()
            )));
        }
        if iv.len() < algorithm.iv_size() {
            return Err(SkiffError::Security(format!(
                "Insufficient IV material for {}: expected {}, got {}",
                algorithm.name(),
                algorithm.iv_size(),
                iv.len()
            )));
        }
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// Transforms `data` in place in the direction fixed at construction.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if `data` is not a multiple of the
    /// cipher block size (CBC modes).
    pub fn process(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        match &mut self.inner {
            CipherInner::Aes256Ctr(c) => c.apply_keystream(data),
            CipherInner::Aes128Ctr(c) => c.apply_keystream(data),
            CipherInner::TdesEncrypt(c) => {
                let (blocks, tail) = InOutBuf::from(&mut *data).into_chunks();
                if !tail.is_empty() {
                    return Err(not_block_aligned(self.algorithm));
                }
                c.encrypt_blocks_inout_mut(blocks);
            }
            CipherInner::TdesDecrypt(c) => {
                let (blocks, tail) = InOutBuf::from(&mut *data).into_chunks();
                if !tail.is_empty() {
                    return Err(not_block_aligned(self.algorithm));
                }
                c.decrypt_blocks_inout_mut(blocks);
            }
            CipherInner::BlowfishEncrypt(c) => {
                let (blocks, tail) = InOutBuf::from(&mut *data).into_chunks();
                if !tail.is_empty() {
                    return Err(not_block_aligned(self.algorithm));
                }
                c.encrypt_blocks_inout_mut(blocks);
            }
            CipherInner::BlowfishDecrypt(c) => {
                let (blocks, tail) = InOutBuf::from(&mut *data).into_chunks();
                if !tail.is_empty() {
                    return Err(not_block_aligned(self.algorithm));
                }
                c.decrypt_blocks_inout_mut(blocks);
            }
        }
        Ok(())
    }
}

fn bad_material(_: cipher::InvalidLength) -> SkiffError {
    SkiffError::Security("Invalid cipher key or IV length".to_string())
}

fn not_block_aligned(algorithm: CipherAlgorithm) -> SkiffError {
    SkiffError::Protocol(format!(
        "Packet length not a multiple of the {} block size",
        algorithm.name()
    ))
}

/// MAC algorithm for SSH packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1 (RFC 4253 required algorithm)
    HmacSha1,
}

impl MacAlgorithm {
    /// Returns the algorithm name as used in KEXINIT name-lists.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Returns the MAC tag size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Parses a MAC algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            _ => None,
        }
    }
}

/// Keyed MAC instance for one direction.
///
/// The sequence number is owned by the transport and passed in explicitly,
/// so the same key can verify packets in any order the transport presents
/// them.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes the MAC over `sequence_number || packet_data`.
    pub fn compute(&self, sequence: u32, packet_data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(&self.key).expect("HMAC key size is valid");
                mac.update(&sequence.to_be_bytes());
                mac.update(packet_data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Security`] on mismatch.
    pub fn verify(&self, sequence: u32, packet_data: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(sequence, packet_data);

        if computed.len() != received.len() {
            return Err(SkiffError::Security("MAC length mismatch".to_string()));
        }

        if computed.ct_eq(received).into() {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Returns the MAC tag size in bytes.
    pub fn mac_size(&self) -> usize {
        self.algorithm.mac_size()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
