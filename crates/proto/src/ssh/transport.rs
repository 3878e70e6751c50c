//! SSH transport framing: ciphered, MAC-protected, sequence-numbered packets.
//!
//! The [`Transport`] owns both halves of the TCP stream and the per-direction
//! cipher state. Each direction is one critical section: {socket half,
//! cipher, MAC key, sequence number} live under a single lock, so
//!
//! - no outbound packet can straddle a cipher swap,
//! - the wire order of packets always equals their sequence order,
//! - the MAC (which covers the sequence number) is always computed against
//!   the state the packet is actually sent or received under.
//!
//! Sequence numbers start at zero with the version exchange, are never
//! reset, and continue across rekeys.

use crate::ssh::crypto::{Cipher, MacKey};
use crate::ssh::packet::{Packet, MAX_PACKET_SIZE, MIN_BLOCK_SIZE};
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

struct TxState {
    writer: OwnedWriteHalf,
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
    sequence: u32,
}

struct RxState {
    reader: OwnedReadHalf,
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
    sequence: u32,
}

/// The transport-layer framer.
///
/// Serializes outbound payloads into padded, encrypted, MAC'd packets and
/// deserializes inbound bytes back into payloads, maintaining independent
/// monotonic sequence counters per direction.
pub struct Transport {
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
}

impl Transport {
    /// Creates a transport over a split TCP stream, starting in plaintext
    /// (pre-NEWKEYS) mode.
    pub fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        Self {
            tx: Mutex::new(TxState {
                writer,
                cipher: None,
                mac: None,
                sequence: 0,
            }),
            rx: Mutex::new(RxState {
                reader,
                cipher: None,
                mac: None,
                sequence: 0,
            }),
        }
    }

    /// Sends one payload as a single SSH packet.
    ///
    /// The packet image is built, MAC'd, encrypted, and written under the
    /// outbound cipher lock.
    pub async fn send_payload(&self, payload: &[u8]) -> SkiffResult<()> {
        let mut tx = self.tx.lock().await;
        Self::seal_and_write(&mut tx, payload).await
    }

    /// Sends `newkeys_payload` and installs the new outbound cipher pair in
    /// one critical section.
    ///
    /// The NEWKEYS packet itself goes out under the old keys; every packet
    /// sealed after this call uses the new pair. Callers must invoke this
    /// exactly at the SSH_MSG_NEWKEYS point of a key exchange.
    pub async fn rekey_outbound(
        &self,
        newkeys_payload: &[u8],
        cipher: Cipher,
        mac: MacKey,
    ) -> SkiffResult<()> {
        let mut tx = self.tx.lock().await;
        Self::seal_and_write(&mut tx, newkeys_payload).await?;
        tx.cipher = Some(cipher);
        tx.mac = Some(mac);
        Ok(())
    }

    /// Installs the new inbound cipher pair.
    ///
    /// Callers must invoke this immediately after consuming the peer's
    /// SSH_MSG_NEWKEYS, before the next inbound packet is read.
    pub async fn rekey_inbound(&self, cipher: Cipher, mac: MacKey) {
        let mut rx = self.rx.lock().await;
        rx.cipher = Some(cipher);
        rx.mac = Some(mac);
    }

    async fn seal_and_write(tx: &mut TxState, payload: &[u8]) -> SkiffResult<()> {
        let block_size = tx
            .cipher
            .as_ref()
            .map_or(MIN_BLOCK_SIZE, |c| c.block_size().max(MIN_BLOCK_SIZE));

        let packet = Packet::with_block_size(payload.to_vec(), block_size);
        let mut image = packet.to_bytes();

        let tag = tx.mac.as_ref().map(|mac| mac.compute(tx.sequence, &image));

        if let Some(cipher) = &mut tx.cipher {
            cipher.process(&mut image)?;
        }
        if let Some(tag) = tag {
            image.extend_from_slice(&tag);
        }

        tx.writer.write_all(&image).await.map_err(SkiffError::Io)?;

        tx.sequence = tx
            .sequence
            .checked_add(1)
            .ok_or_else(|| SkiffError::Protocol("Outbound sequence number overflow".to_string()))?;

        Ok(())
    }

    /// Reads one packet and returns its payload together with the sequence
    /// number it was accepted under.
    ///
    /// The first cipher block is decrypted to learn the packet length, the
    /// remainder is read and decrypted, and the MAC is verified over
    /// `sequence || plaintext image`. Any failure is fatal to the
    /// connection.
    pub async fn read_payload(&self) -> SkiffResult<(Vec<u8>, u32)> {
        let mut rx = self.rx.lock().await;

        let block_size = rx
            .cipher
            .as_ref()
            .map_or(MIN_BLOCK_SIZE, |c| c.block_size().max(MIN_BLOCK_SIZE));

        let mut first = vec![0u8; block_size];
        rx.reader
            .read_exact(&mut first)
            .await
            .map_err(SkiffError::Io)?;

        if let Some(cipher) = &mut rx.cipher {
            cipher.process(&mut first)?;
        }

        let packet_length = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Inbound packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length < 5 || packet_length + 4 < block_size {
            return Err(SkiffError::Protocol(format!(
                "Inbound packet too small: {} bytes",
                packet_length
            )));
        }
        if (packet_length + 4) % block_size != 0 {
            return Err(SkiffError::Protocol(format!(
                "Inbound packet length {} not a multiple of cipher block size {}",
                packet_length + 4,
                block_size
            )));
        }

        let mut image = first;
        let remaining = packet_length + 4 - image.len();
        if remaining > 0 {
            let mut rest = vec![0u8; remaining];
            rx.reader
                .read_exact(&mut rest)
                .await
                .map_err(SkiffError::Io)?;
            if let Some(cipher) = &mut rx.cipher {
                cipher.process(&mut rest)?;
            }
            image.extend_from_slice(&rest);
        }

        if let Some(mac_size) = rx.mac.as_ref().map(|mac| mac.mac_size()) {
            let mut tag = vec![0u8; mac_size];
            rx.reader
                .read_exact(&mut tag)
                .await
                .map_err(SkiffError::Io)?;
            if let Some(mac) = &rx.mac {
                mac.verify(rx.sequence, &image, &tag)?;
            }
        }

        let packet = Packet::from_bytes(&image)?;
        let sequence = rx.sequence;
        rx.sequence = rx
            .sequence
            .checked_add(1)
            .ok_or_else(|| SkiffError::Protocol("Inbound sequence number overflow".to_string()))?;

        Ok((packet.payload().to_vec(), sequence))
    }

    /// Returns the next outbound sequence number (for diagnostics/tests).
    pub async fn outbound_sequence(&self) -> u32 {
        self.tx.lock().await.sequence
    }

    /// Returns the next inbound sequence number (for diagnostics/tests).
    pub async fn inbound_sequence(&self) -> u32 {
        self.rx.lock().await.sequence
    }

    /// Shuts down the write half of the socket.
    pub async fn shutdown(&self) {
        let mut tx = self.tx.lock().await;
        let _ = tx.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
    use tokio::net::{TcpListener, TcpStream};

    async fn transport_pair() -> (Transport, Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, (server, _)) =
            tokio::join!(async { TcpStream::connect(addr).await.unwrap() }, async {
                listener.accept().await.unwrap()
            });

        let (cr, cw) = client.into_split();
        let (sr, sw) = server.into_split();
        (Transport::new(cr, cw), Transport::new(sr, sw))
    }

    fn cipher_pair(algorithm: CipherAlgorithm) -> (Cipher, Cipher, MacKey, MacKey) {
        let key = vec![0x11u8; algorithm.key_size()];
        let iv = vec![0x22u8; algorithm.iv_size()];
        let mac_key = vec![0x33u8; 20];

        (
            Cipher::encryptor(algorithm, &key, &iv).unwrap(),
            Cipher::decryptor(algorithm, &key, &iv).unwrap(),
            MacKey::new(MacAlgorithm::HmacSha1, &mac_key).unwrap(),
            MacKey::new(MacAlgorithm::HmacSha1, &mac_key).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_plaintext_round_trip() {
        let (a, b) = transport_pair().await;

        a.send_payload(b"\x02hello").await.unwrap();
        let (payload, seq) = b.read_payload().await.unwrap();

        assert_eq!(payload, b"\x02hello");
        assert_eq!(seq, 0);
        assert_eq!(a.outbound_sequence().await, 1);
        assert_eq!(b.inbound_sequence().await, 1);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip_all_ciphers() {
        for algorithm in [
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes256Ctr,
            CipherAlgorithm::TripleDesCbc,
            CipherAlgorithm::BlowfishCbc,
        ] {
            let (a, b) = transport_pair().await;
            let (enc, dec, mac_out, mac_in) = cipher_pair(algorithm);

            a.rekey_outbound(b"\x15", enc, mac_out).await.unwrap();
            let (newkeys, _) = b.read_payload().await.unwrap();
            assert_eq!(newkeys, b"\x15");
            b.rekey_inbound(dec, mac_in).await;

            for i in 0u8..4 {
                let payload = vec![0x5e, i, i, i];
                a.send_payload(&payload).await.unwrap();
                let (received, _) = b.read_payload().await.unwrap();
                assert_eq!(received, payload, "{} round {}", algorithm.name(), i);
            }
        }
    }

    #[tokio::test]
    async fn test_sequence_continues_across_rekey() {
        let (a, b) = transport_pair().await;

        a.send_payload(b"\x02one").await.unwrap();
        a.send_payload(b"\x02two").await.unwrap();
        b.read_payload().await.unwrap();
        b.read_payload().await.unwrap();

        let (enc, dec, mac_out, mac_in) = cipher_pair(CipherAlgorithm::Aes128Ctr);
        a.rekey_outbound(b"\x15", enc, mac_out).await.unwrap();
        let (_, newkeys_seq) = b.read_payload().await.unwrap();
        assert_eq!(newkeys_seq, 2);
        b.rekey_inbound(dec, mac_in).await;

        a.send_payload(b"\x02three").await.unwrap();
        let (payload, seq) = b.read_payload().await.unwrap();
        assert_eq!(payload, b"\x02three");
        assert_eq!(seq, 3, "sequence must continue unbroken across rekey");
    }

    #[tokio::test]
    async fn test_corrupted_mac_is_fatal() {
        let (a, b) = transport_pair().await;
        let (enc, dec, mac_out, _) = cipher_pair(CipherAlgorithm::Aes128Ctr);

        a.rekey_outbound(b"\x15", enc, mac_out).await.unwrap();
        b.read_payload().await.unwrap();
        // Install a decryptor whose MAC key differs from the sender's
        let wrong_mac = MacKey::new(MacAlgorithm::HmacSha1, &[0xffu8; 20]).unwrap();
        b.rekey_inbound(dec, wrong_mac).await;

        a.send_payload(b"\x5e data").await.unwrap();
        let err = b.read_payload().await.unwrap_err();
        assert!(matches!(err, SkiffError::Security(_)));
    }

    #[tokio::test]
    async fn test_oversize_length_is_fatal() {
        let (a, b) = transport_pair().await;

        // Hand-craft a frame advertising an absurd length
        {
            let mut tx = a.tx.lock().await;
            let mut frame = Vec::new();
            frame.extend_from_slice(&(200_000u32).to_be_bytes());
            frame.extend_from_slice(&[4, 0, 0, 0]);
            tx.writer.write_all(&frame).await.unwrap();
        }

        let err = b.read_payload().await.unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));
    }
}
