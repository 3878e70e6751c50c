//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module implements the SSH_MSG_KEXINIT message, the algorithm
//! name-lists the client advertises, and the "first client preference
//! present in the server's list" negotiation rule applied to every
//! algorithm family.

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{put_bool, put_name_list, Reader};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Hash function used for the exchange hash and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy groups)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Returns the digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        use sha1::Digest;
        match self {
            HashAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}

/// Diffie-Hellman key exchange algorithm.
///
/// All supported methods are fixed-group DH; they differ in the MODP group
/// and the hash bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// diffie-hellman-group16-sha512 (4096-bit group, RFC 8268)
    DhGroup16Sha512,
    /// diffie-hellman-group18-sha512 (8192-bit group, RFC 8268)
    DhGroup18Sha512,
    /// diffie-hellman-group14-sha256 (2048-bit group, RFC 8268)
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1 (2048-bit group, RFC 4253)
    DhGroup14Sha1,
    /// diffie-hellman-group1-sha1 (1024-bit group, RFC 4253)
    DhGroup1Sha1,
}

impl KexAlgorithm {
    /// Client preference order, most preferred first.
    pub const PREFERRED: [KexAlgorithm; 5] = [
        KexAlgorithm::DhGroup16Sha512,
        KexAlgorithm::DhGroup18Sha512,
        KexAlgorithm::DhGroup14Sha256,
        KexAlgorithm::DhGroup14Sha1,
        KexAlgorithm::DhGroup1Sha1,
    ];

    /// Returns the algorithm name as used in KEXINIT name-lists.
    pub fn name(&self) -> &'static str {
        match self {
            KexAlgorithm::DhGroup16Sha512 => "diffie-hellman-group16-sha512",
            KexAlgorithm::DhGroup18Sha512 => "diffie-hellman-group18-sha512",
            KexAlgorithm::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexAlgorithm::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            KexAlgorithm::DhGroup1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Returns the hash algorithm bound to this method.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            KexAlgorithm::DhGroup16Sha512 | KexAlgorithm::DhGroup18Sha512 => HashAlgorithm::Sha512,
            KexAlgorithm::DhGroup14Sha256 => HashAlgorithm::Sha256,
            KexAlgorithm::DhGroup14Sha1 | KexAlgorithm::DhGroup1Sha1 => HashAlgorithm::Sha1,
        }
    }

    /// Parses a kex algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::PREFERRED.iter().copied().find(|a| a.name() == name)
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds the client's KEXINIT from the configured preferences.
    ///
    /// The kex list is fixed ([`KexAlgorithm::PREFERRED`]); host key and
    /// encryption preferences come from the connection parameters; MAC is
    /// "hmac-sha1" and compression "none" in both directions.
    pub fn new_client(
        host_key_algorithms: &[String],
        encryption_algorithms: &[String],
    ) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let kex_algorithms = KexAlgorithm::PREFERRED
            .iter()
            .map(|a| a.name().to_string())
            .collect::<Vec<_>>();

        Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms: host_key_algorithms.to_vec(),
            encryption_algorithms_client_to_server: encryption_algorithms.to_vec(),
            encryption_algorithms_server_to_client: encryption_algorithms.to_vec(),
            mac_algorithms_client_to_server: vec![MacAlgorithm::HmacSha1.name().to_string()],
            mac_algorithms_server_to_client: vec![MacAlgorithm::HmacSha1.name().to_string()],
            compression_algorithms_client_to_server: vec!["none".to_string()],
            compression_algorithms_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the kex algorithm list (server-side and test harnesses
    /// advertising a restricted set).
    pub fn with_kex_algorithms(mut self, kex_algorithms: Vec<String>) -> Self {
        self.kex_algorithms = kex_algorithms;
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns whether the peer claims its guessed first kex packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms (client to server)
    /// name-list    encryption_algorithms (server to client)
    /// name-list    mac_algorithms (client to server)
    /// name-list    mac_algorithms (server to client)
    /// name-list    compression_algorithms (client to server)
    /// name-list    compression_algorithms (server to client)
    /// name-list    languages (client to server)
    /// name-list    languages (server to client)
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        put_name_list(&mut buf, &self.kex_algorithms);
        put_name_list(&mut buf, &self.server_host_key_algorithms);
        put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        put_name_list(&mut buf, &self.languages_client_to_server);
        put_name_list(&mut buf, &self.languages_server_to_client);

        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] on a wrong opcode or truncated
    /// name-lists.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut reader = Reader::new(data);

        let opcode = reader.take_u8("message type")?;
        if opcode != MessageType::KexInit as u8 {
            return Err(SkiffError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                opcode
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.take_raw(16, "cookie")?);

        let kex_algorithms = reader.take_name_list("kex_algorithms")?;
        let server_host_key_algorithms = reader.take_name_list("server_host_key_algorithms")?;
        let encryption_algorithms_client_to_server =
            reader.take_name_list("encryption_algorithms_c2s")?;
        let encryption_algorithms_server_to_client =
            reader.take_name_list("encryption_algorithms_s2c")?;
        let mac_algorithms_client_to_server = reader.take_name_list("mac_algorithms_c2s")?;
        let mac_algorithms_server_to_client = reader.take_name_list("mac_algorithms_s2c")?;
        let compression_algorithms_client_to_server =
            reader.take_name_list("compression_algorithms_c2s")?;
        let compression_algorithms_server_to_client =
            reader.take_name_list("compression_algorithms_s2c")?;
        let languages_client_to_server = reader.take_name_list("languages_c2s")?;
        let languages_server_to_client = reader.take_name_list("languages_s2c")?;
        let first_kex_packet_follows = reader.take_bool("first_kex_packet_follows")?;
        let _reserved = reader.take_u32("reserved")?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Serializes the single-byte NEWKEYS message.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }
}

/// Result of algorithm negotiation over both KEXINIT messages.
#[derive(Debug, Clone)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: KexAlgorithm,
    /// Server host key algorithm name (e.g. "ssh-rsa").
    pub host_key: String,
    /// Client-to-server cipher.
    pub cipher_out: CipherAlgorithm,
    /// Server-to-client cipher.
    pub cipher_in: CipherAlgorithm,
    /// Client-to-server MAC.
    pub mac_out: MacAlgorithm,
    /// Server-to-client MAC.
    pub mac_in: MacAlgorithm,
}

/// Picks the first client preference present in the server's list.
///
/// # Errors
///
/// Returns [`SkiffError::Negotiation`] when the lists do not intersect.
pub fn negotiate_algorithm(
    client: &[String],
    server: &[String],
    family: &str,
) -> SkiffResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| {
            SkiffError::Negotiation(format!(
                "No common {} algorithm (ours: {}, theirs: {})",
                family,
                client.join(","),
                server.join(",")
            ))
        })
}

/// Negotiates every algorithm family between our KEXINIT and the peer's.
///
/// Also enforces the `first_kex_packet_follows` rule: when the peer set the
/// flag and its guessed kex or host key algorithm differs from our first
/// preference, the exchange fails.
///
/// # Errors
///
/// Returns [`SkiffError::Negotiation`] when any family fails to intersect,
/// the negotiated name is not supported, or the peer's guess was wrong.
pub fn negotiate(ours: &KexInit, theirs: &KexInit) -> SkiffResult<NegotiatedAlgorithms> {
    if theirs.first_kex_packet_follows {
        let kex_guess_ok = ours.kex_algorithms.first() == theirs.kex_algorithms.first();
        let host_key_guess_ok =
            ours.server_host_key_algorithms.first() == theirs.server_host_key_algorithms.first();
        if !kex_guess_ok || !host_key_guess_ok {
            return Err(SkiffError::Negotiation(
                "Peer guessed its first kex packet with mismatched algorithms".to_string(),
            ));
        }
    }

    let kex_name = negotiate_algorithm(&ours.kex_algorithms, &theirs.kex_algorithms, "kex")?;
    let kex = KexAlgorithm::from_name(&kex_name)
        .ok_or_else(|| SkiffError::Negotiation(format!("Unsupported kex algorithm: {}", kex_name)))?;

    let host_key = negotiate_algorithm(
        &ours.server_host_key_algorithms,
        &theirs.server_host_key_algorithms,
        "host key",
    )?;

    let cipher_out_name = negotiate_algorithm(
        &ours.encryption_algorithms_client_to_server,
        &theirs.encryption_algorithms_client_to_server,
        "encryption (client to server)",
    )?;
    let cipher_out = CipherAlgorithm::from_name(&cipher_out_name).ok_or_else(|| {
        SkiffError::Negotiation(format!("Unsupported cipher: {}", cipher_out_name))
    })?;

    let cipher_in_name = negotiate_algorithm(
        &ours.encryption_algorithms_server_to_client,
        &theirs.encryption_algorithms_server_to_client,
        "encryption (server to client)",
    )?;
    let cipher_in = CipherAlgorithm::from_name(&cipher_in_name).ok_or_else(|| {
        SkiffError::Negotiation(format!("Unsupported cipher: {}", cipher_in_name))
    })?;

    let mac_out_name = negotiate_algorithm(
        &ours.mac_algorithms_client_to_server,
        &theirs.mac_algorithms_client_to_server,
        "MAC (client to server)",
    )?;
    let mac_out = MacAlgorithm::from_name(&mac_out_name)
        .ok_or_else(|| SkiffError::Negotiation(format!("Unsupported MAC: {}", mac_out_name)))?;

    let mac_in_name = negotiate_algorithm(
        &ours.mac_algorithms_server_to_client,
        &theirs.mac_algorithms_server_to_client,
        "MAC (server to client)",
    )?;
    let mac_in = MacAlgorithm::from_name(&mac_in_name)
        .ok_or_else(|| SkiffError::Negotiation(format!("Unsupported MAC: {}", mac_in_name)))?;

    // Compression must resolve to "none" in both directions
    for (ours_c, theirs_c, dir) in [
        (
            &ours.compression_algorithms_client_to_server,
            &theirs.compression_algorithms_client_to_server,
            "client to server",
        ),
        (
            &ours.compression_algorithms_server_to_client,
            &theirs.compression_algorithms_server_to_client,
            "server to client",
        ),
    ] {
        let compression =
            negotiate_algorithm(ours_c, theirs_c, &format!("compression ({})", dir))?;
        if compression != "none" {
            return Err(SkiffError::Negotiation(format!(
                "Unsupported compression: {}",
                compression
            )));
        }
    }

    Ok(NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_out,
        cipher_in,
        mac_out,
        mac_in,
    })
}
