//! Diffie-Hellman key exchange arithmetic (RFC 4253 Section 8, RFC 8268).
//!
//! This module holds the fixed MODP groups (RFC 2409 / RFC 3526), the
//! ephemeral exchange state for one key-exchange run, the exchange hash,
//! and the RFC 4253 Section 7.2 key derivation that turns the shared
//! secret into the six cipher/IV/MAC keys.
//!
//! # Security
//!
//! - private exponents are validated to `1 < x < (p-1)/2`
//! - peer public values are validated to `1 < f < p-1`
//! - exponent bytes are zeroized on drop

use crate::ssh::crypto::{Cipher, MacKey};
use crate::ssh::kex::{HashAlgorithm, KexAlgorithm, NegotiatedAlgorithms};
use crate::ssh::wire::{put_mpint, put_string};
use bytes::BytesMut;
use num_bigint::{BigUint, RandBigInt};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// Fixed MODP group primes (RFC 2409 Section 6.2, RFC 3526 Sections 3-7).
///
/// Pure computation caches: decoded lazily, exactly once, never mutated.
mod groups {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    fn decode(hex_str: &str) -> BigUint {
        let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
        BigUint::from_bytes_be(&hex::decode(cleaned).expect("Invalid group prime hex"))
    }

    /// Oakley Group 2 prime (1024-bit), diffie-hellman-group1.
    pub static P_GROUP1: Lazy<BigUint> = Lazy::new(|| {
        decode(
            "FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
             29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
             EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
             E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
             EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE65381
             FFFFFFFF FFFFFFFF",
        )
    });

    /// RFC 3526 Group 14 prime (2048-bit).
    pub static P_GROUP14: Lazy<BigUint> = Lazy::new(|| {
        decode(
            "FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
             29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
             EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
             E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
             EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
             C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
             83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
             670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
             E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
             DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
             15728E5A 8AACAA68 FFFFFFFF FFFFFFFF",
        )
    });

    /// RFC 3526 Group 16 prime (4096-bit).
    pub static P_GROUP16: Lazy<BigUint> = Lazy::new(|| {
        decode(
            "FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
             29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
             EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
             E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
             EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE45B3D
             C2007CB8 A163BF05 98DA4836 1C55D39A 69163FA8 FD24CF5F
             83655D23 DCA3AD96 1C62F356 208552BB 9ED52907 7096966D
             670C354E 4ABC9804 F1746C08 CA18217C 32905E46 2E36CE3B
             E39E772C 180E8603 9B2783A2 EC07A28F B5C55DF0 6F4C52C9
             DE2BCBF6 95581718 3995497C EA956AE5 15D22618 98FA0510
             15728E5A 8AAAC42D AD33170D 04507A33 A85521AB DF1CBA64
             ECFB8504 58DBEF0A 8AEA7157 5D060C7D B3970F85 A6E1E4C7
             ABF5AE8C DB0933D7 1E8C94E0 4A25619D CEE3D226 1AD2EE6B
             F12FFA06 D98A0864 D8760273 3EC86A64 521F2B18 177B200C
             BBE11757 7A615D6C 770988C0 BAD946E2 08E24FA0 74E5AB31
             43DB5BFC E0FD108E 4B82D120 A9210801 1A723C12 A787E6D7
             88719A10 BDBA5B26 99C32718 6AF4E23C 1A946834 B6150BDA
             2583E9CA 2AD44CE8 DBBBC2DB 04DE8EF9 2E8EFC14 1FBECAA6
             287C5947 4E6BC05D 99B2964F A090C3A2 233BA186 515BE7ED
             1F612970 CEE2D7AF B81BDD76 2170481C D0069127 D5B05AA9
             93B4EA98 8D8FDDC1 86FFB7DC 90A6C08F 4DF435C9 34063199
             FFFFFFFF FFFFFFFF",
        )
    });

    /// RFC 3526 Group 18 prime (8192-bit).
    pub static P_GROUP18: Lazy<BigUint> = Lazy::new(|| {
        decode(
            "FFFFFFFF FFFFFFFF C90FDAA2 2168C234 C4C6628B 80DC1CD1
             29024E08 8A67CC74 020BBEA6 3B139B22 514A0879 8E3404DD
             EF9519B3 CD3A431B 302B0A6D F25F1437 4FE1356D 6D51C245
             E485B576 625E7EC6 F44C42E9 A637ED6B 0BFF5CB6 F406B7ED
             EE386BFB 5A899FA5 AE9F2411 7C4B1FE6 49286651 ECE65381
             FFFFFFFF FFFFFFFF 7ADBB2CE 2FCBF1A1 8E3A443F 71FB6F5D
             382CFB52 9A007F1C 4E4B3A3F B4C30C05 0E634647 34626B76
             07D6F0E0 C2D97300 C813EFC6 15F69E5C 95F4917A D7EB9C25
             4E957C2F 34AA2F99 798FC7B4 27C6BC9F F9B109F1 5B3F5946
             7F0ABDB6 C67DDEA7 A38D0811 B2C6C272 70D91FBD 5C6DAA4C
             DF4A4036 726F52A5 95C6ACDB CDE06C2A B7D225A1 7C7B7FE3
             2BCDF302 6D7F5034 26CFFDA0 10A0D08C 6D28E169 A7EFA46E
             EFC381D9 31C6E9A0 3D56D26A 42EFB168 2AE4C3B3 7B72C6E0
             AF568AB3 956C0A39 F83F7B2A 2D8F6E90 3732FD7B 4C6D9314
             ED0A0EED 3395FC82 187F6D2C 17C43A67 67C5D74F D56A1B4A
             B44F6DA0 36E1DBA5 6C0B605F CF2ED8D6 9B43A65B B3FD6192
             E39529FA A6C1835C 888A0A20 4CED7829 A691B20E 96A8D050
             31E589FC C4FCD4E4 58E2D50B 7B0AF49F 9D79C358 81A0A93B
             C62AF35B 3876DD66 75BD0B02 3C2743FB 9012B3D5 85EAD0F1
             58B6A4F4 7EA37AC6 84B67D3D 6C3F6E99 7F7F19F6 41D6B423
             6E21E7C6 C8DA55E7 C58989A9 0D3E196E 72E1D845 97938EC5
             71F7C0B5 83599B9E 5B6C0F84 91D23D87 3985A747 746B10F2
             CA6C175D 8926E51A A04D4E77 A2A3684B 89C0591E 917C0670
             9A68BEBC 73CDB7F9 7C927C3A F60ACD3E F89E4B06 B56C5E5C
             0C602283 5A691DB6 3AFEAFA6 C364B8C4 7D1F5969 7E9E3C2F
             FFFFFFFF FFFFFFFF",
        )
    });
}

/// Returns the MODP prime for a kex algorithm's group.
pub fn group_prime(algorithm: KexAlgorithm) -> &'static BigUint {
    match algorithm {
        KexAlgorithm::DhGroup1Sha1 => &groups::P_GROUP1,
        KexAlgorithm::DhGroup14Sha1 | KexAlgorithm::DhGroup14Sha256 => &groups::P_GROUP14,
        KexAlgorithm::DhGroup16Sha512 => &groups::P_GROUP16,
        KexAlgorithm::DhGroup18Sha512 => &groups::P_GROUP18,
    }
}

/// Ephemeral client state for one Diffie-Hellman run.
///
/// Lifetime is a single key exchange: create, send `e`, feed the server's
/// `f` through [`DhExchange::compute_shared_secret`], drop.
pub struct DhExchange {
    algorithm: KexAlgorithm,
    /// Private exponent x (big-endian bytes)
    private_key: Vec<u8>,
    /// Public value e = 2^x mod p (big-endian bytes)
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates a fresh exchange for the given group.
    ///
    /// The private exponent is drawn with bit length two below the group
    /// size and rejected until `1 < x < (p-1)/2`.
    pub fn new(algorithm: KexAlgorithm) -> Self {
        let p = group_prime(algorithm);
        let half = (p - 1u32) / 2u32;
        let one = BigUint::from(1u32);
        let mut rng = rand::thread_rng();

        let x = loop {
            let candidate = rng.gen_biguint(p.bits() - 2);
            if candidate > one && candidate < half {
                break candidate;
            }
        };

        let e = BigUint::from(2u32).modpow(&x, p);

        Self {
            algorithm,
            private_key: x.to_bytes_be(),
            public_key: e.to_bytes_be(),
        }
    }

    /// Returns the public value e as big-endian bytes.
    pub fn public_value(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret k = f^x mod p.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] when the peer's public value is out
    /// of range (`f <= 1` or `f >= p-1`).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SkiffResult<Vec<u8>> {
        let p = group_prime(self.algorithm);
        let f = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);

        if f <= one || f >= p - &one {
            return Err(SkiffError::Protocol(
                "Invalid peer public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = f.modpow(&x, p);

        Ok(k.to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Inputs to the exchange hash H (RFC 4253 Section 8).
pub struct ExchangeHashParams<'a> {
    /// Client identification line V_C (without line terminator)
    pub client_version: &'a str,
    /// Server identification line V_S (without line terminator)
    pub server_version: &'a str,
    /// Client KEXINIT payload I_C
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload I_S
    pub server_kexinit: &'a [u8],
    /// Server host key blob K_S
    pub host_key_blob: &'a [u8],
    /// Client public value e (big-endian bytes)
    pub client_public: &'a [u8],
    /// Server public value f (big-endian bytes)
    pub server_public: &'a [u8],
    /// Shared secret k (big-endian bytes)
    pub shared_secret: &'a [u8],
}

/// Computes the exchange hash
/// `H = HASH(V_C || V_S || I_C || I_S || K_S || e || f || k)`,
/// each field length-prefixed per the SSH `string`/`mpint` rules.
pub fn compute_exchange_hash(hash: HashAlgorithm, params: &ExchangeHashParams<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();

    put_string(&mut buf, params.client_version.as_bytes());
    put_string(&mut buf, params.server_version.as_bytes());
    put_string(&mut buf, params.client_kexinit);
    put_string(&mut buf, params.server_kexinit);
    put_string(&mut buf, params.host_key_blob);
    put_mpint(&mut buf, params.client_public);
    put_mpint(&mut buf, params.server_public);
    put_mpint(&mut buf, params.shared_secret);

    hash.digest(&buf)
}

/// Derives one session key per RFC 4253 Section 7.2.
///
/// ```text
/// K1     = HASH(K || H || X || session_id)
/// Kn+1   = HASH(K || H || K1 || ... || Kn)
/// ```
///
/// where K is the shared secret as an mpint, H the exchange hash of this
/// run, X the letter tag, and session_id the exchange hash of the first
/// run. The concatenation is truncated to `key_length`.
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = BytesMut::new();
    put_mpint(&mut k_mpint, shared_secret);

    let mut input = Vec::new();
    input.extend_from_slice(&k_mpint);
    input.extend_from_slice(exchange_hash);
    input.push(key_type);
    input.extend_from_slice(session_id);

    let mut key = hash.digest(&input);

    while key.len() < key_length {
        let mut next = Vec::new();
        next.extend_from_slice(&k_mpint);
        next.extend_from_slice(exchange_hash);
        next.extend_from_slice(&key);
        key.extend_from_slice(&hash.digest(&next));
    }

    key.truncate(key_length);
    key
}

/// The four keyed objects produced by one key-exchange run.
///
/// Built once per run and then transferred into the transport: the
/// outbound pair at our NEWKEYS, the inbound pair at the peer's.
pub struct CipherSettings {
    /// Client-to-server cipher (letter tags 'C' key, 'A' IV)
    pub outbound_cipher: Cipher,
    /// Server-to-client cipher (letter tags 'D' key, 'B' IV)
    pub inbound_cipher: Cipher,
    /// Client-to-server MAC (letter tag 'E')
    pub outbound_mac: MacKey,
    /// Server-to-client MAC (letter tag 'F')
    pub inbound_mac: MacKey,
}

/// Derives the full [`CipherSettings`] for the negotiated algorithms.
pub fn derive_cipher_settings(
    algorithms: &NegotiatedAlgorithms,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> SkiffResult<CipherSettings> {
    let hash = algorithms.kex.hash();

    let mut iv_out = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'A',
        algorithms.cipher_out.iv_size(),
    );
    let mut iv_in = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'B',
        algorithms.cipher_in.iv_size(),
    );
    let mut key_out = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'C',
        algorithms.cipher_out.key_size(),
    );
    let mut key_in = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'D',
        algorithms.cipher_in.key_size(),
    );
    let mut mac_out = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'E',
        algorithms.mac_out.key_size(),
    );
    let mut mac_in = derive_key(
        hash,
        shared_secret,
        exchange_hash,
        session_id,
        b'F',
        algorithms.mac_in.key_size(),
    );

    let settings = CipherSettings {
        outbound_cipher: Cipher::encryptor(algorithms.cipher_out, &key_out, &iv_out)?,
        inbound_cipher: Cipher::decryptor(algorithms.cipher_in, &key_in, &iv_in)?,
        outbound_mac: MacKey::new(algorithms.mac_out, &mac_out)?,
        inbound_mac: MacKey::new(algorithms.mac_in, &mac_in)?,
    };

    iv_out.zeroize();
    iv_in.zeroize();
    key_out.zeroize();
    key_in.zeroize();
    mac_out.zeroize();
    mac_in.zeroize();

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};

    #[test]
    fn test_group_prime_sizes() {
        assert_eq!(group_prime(KexAlgorithm::DhGroup1Sha1).bits(), 1024);
        assert_eq!(group_prime(KexAlgorithm::DhGroup14Sha256).bits(), 2048);
        assert_eq!(group_prime(KexAlgorithm::DhGroup16Sha512).bits(), 4096);
        assert_eq!(group_prime(KexAlgorithm::DhGroup18Sha512).bits(), 8192);
    }

    #[test]
    fn test_dh_exchange_agreement() {
        // Both sides of a group14 exchange must agree on k
        let client = DhExchange::new(KexAlgorithm::DhGroup14Sha256);
        let server = DhExchange::new(KexAlgorithm::DhGroup14Sha256);

        let client_k = client.compute_shared_secret(server.public_value()).unwrap();
        let server_k = server.compute_shared_secret(client.public_value()).unwrap();

        assert_eq!(client_k, server_k);
        assert!(!client_k.is_empty());
    }

    #[test]
    fn test_dh_rejects_degenerate_peer_values() {
        let exchange = DhExchange::new(KexAlgorithm::DhGroup14Sha1);

        assert!(exchange.compute_shared_secret(&[0]).is_err());
        assert!(exchange.compute_shared_secret(&[1]).is_err());

        let p_minus_one = (group_prime(KexAlgorithm::DhGroup14Sha1) - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_private_exponent_range() {
        let exchange = DhExchange::new(KexAlgorithm::DhGroup1Sha1);
        let p = group_prime(KexAlgorithm::DhGroup1Sha1);
        let x = BigUint::from_bytes_be(&exchange.private_key);

        assert!(x > BigUint::from(1u32));
        assert!(x < (p - 1u32) / 2u32);
    }

    #[test]
    fn test_exchange_hash_deterministic_and_sized() {
        let params = ExchangeHashParams {
            client_version: "SSH-2.0-Skiff_0.1.0",
            server_version: "SSH-2.0-OpenSSH_8.9",
            client_kexinit: b"client kexinit payload",
            server_kexinit: b"server kexinit payload",
            host_key_blob: b"host key blob",
            client_public: &[0x11; 256],
            server_public: &[0x22; 256],
            shared_secret: &[0x33; 256],
        };

        let h1 = compute_exchange_hash(HashAlgorithm::Sha256, &params);
        let h2 = compute_exchange_hash(HashAlgorithm::Sha256, &params);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        assert_eq!(compute_exchange_hash(HashAlgorithm::Sha1, &params).len(), 20);
        assert_eq!(
            compute_exchange_hash(HashAlgorithm::Sha512, &params).len(),
            64
        );
    }

    #[test]
    fn test_exchange_hash_binds_every_field() {
        let base = ExchangeHashParams {
            client_version: "SSH-2.0-Skiff_0.1.0",
            server_version: "SSH-2.0-OpenSSH_8.9",
            client_kexinit: b"ic",
            server_kexinit: b"is",
            host_key_blob: b"ks",
            client_public: &[0x11; 16],
            server_public: &[0x22; 16],
            shared_secret: &[0x33; 16],
        };
        let reference = compute_exchange_hash(HashAlgorithm::Sha256, &base);

        let changed = ExchangeHashParams {
            server_version: "SSH-2.0-Other_1.0",
            ..base
        };
        assert_ne!(reference, compute_exchange_hash(HashAlgorithm::Sha256, &changed));
    }

    #[test]
    fn test_derive_key_lengths_and_distinctness() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let key_c = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'C', 32);
        assert_eq!(key_c.len(), 32);

        let key_a = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', 32);
        assert_ne!(key_a, key_c);

        // Extension beyond one digest block
        let long = derive_key(HashAlgorithm::Sha1, &k, &h, &sid, b'C', 48);
        assert_eq!(long.len(), 48);
        let prefix = derive_key(HashAlgorithm::Sha1, &k, &h, &sid, b'C', 20);
        assert_eq!(&long[..20], &prefix[..]);
    }

    #[test]
    fn test_derive_cipher_settings() {
        let algorithms = NegotiatedAlgorithms {
            kex: KexAlgorithm::DhGroup14Sha256,
            host_key: "ssh-rsa".to_string(),
            cipher_out: CipherAlgorithm::Aes128Ctr,
            cipher_in: CipherAlgorithm::Aes128Ctr,
            mac_out: MacAlgorithm::HmacSha1,
            mac_in: MacAlgorithm::HmacSha1,
        };

        let k = vec![0x55; 256];
        let h = vec![0x66; 32];

        let settings = derive_cipher_settings(&algorithms, &k, &h, &h).unwrap();
        assert_eq!(
            settings.outbound_cipher.algorithm(),
            CipherAlgorithm::Aes128Ctr
        );
        assert_eq!(settings.inbound_mac.algorithm(), MacAlgorithm::HmacSha1);
    }

    #[test]
    fn test_cipher_settings_symmetric_between_peers() {
        // A server deriving with mirrored letters decrypts what the client
        // encrypts.
        let algorithms = NegotiatedAlgorithms {
            kex: KexAlgorithm::DhGroup14Sha1,
            host_key: "ssh-rsa".to_string(),
            cipher_out: CipherAlgorithm::TripleDesCbc,
            cipher_in: CipherAlgorithm::TripleDesCbc,
            mac_out: MacAlgorithm::HmacSha1,
            mac_in: MacAlgorithm::HmacSha1,
        };

        let k = vec![0x37; 256];
        let h = vec![0x01; 20];
        let hash = algorithms.kex.hash();

        let client = derive_cipher_settings(&algorithms, &k, &h, &h).unwrap();

        let server_key = derive_key(hash, &k, &h, &h, b'C', 24);
        let server_iv = derive_key(hash, &k, &h, &h, b'A', 8);
        let mut server_in =
            Cipher::decryptor(CipherAlgorithm::TripleDesCbc, &server_key, &server_iv).unwrap();

        let mut client_out = client.outbound_cipher;
        let mut data = b"0123456789abcdef".to_vec();
        client_out.process(&mut data).unwrap();
        server_in.process(&mut data).unwrap();
        assert_eq!(data, b"0123456789abcdef".to_vec());
    }
}
