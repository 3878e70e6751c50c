//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! ```
//!
//! The MAC is not part of the packet image; it is computed by the transport
//! over `sequence_number || image` and appended after encryption.
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the MAC or the length field itself
//! - `padding_length` is between 4 and 255 bytes
//! - the total image length is a multiple of the cipher block size (minimum 8)
//! - maximum packet size: 35000 bytes (security limit per RFC 4253)

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
///
/// This limit prevents denial-of-service attacks via extremely large packets.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Minimum cipher block size used for padding alignment.
pub const MIN_BLOCK_SIZE: usize = 8;

/// SSH binary packet image.
///
/// Represents the plaintext form of one SSH packet: payload plus random
/// padding, aligned to the cipher block size in force when it was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a new SSH packet with the given payload, aligned to the
    /// default 8-byte block size.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, MIN_BLOCK_SIZE)
    }

    /// Creates a new SSH packet aligned to the given cipher block size.
    ///
    /// The packet is padded so that:
    /// - at least 4 bytes of padding are present
    /// - the total image (length field included) is a multiple of
    ///   `max(8, block_size)`
    /// - the padding is filled with cryptographically secure random bytes
    ///
    /// # Panics
    ///
    /// Panics if the payload cannot fit within [`MAX_PACKET_SIZE`]; callers
    /// are expected to chunk application data below this limit.
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> Self {
        let block_size = block_size.max(MIN_BLOCK_SIZE);

        // image = 4 (length field) + 1 (padding_length) + payload + padding
        let unpadded_len = 5 + payload.len();
        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % block_size != 0 {
            padding_len += 1;
        }

        assert!(
            padding_len <= MAX_PADDING_LEN as usize,
            "Payload too large, cannot add sufficient padding"
        );

        let total_size = unpadded_len + padding_len;
        assert!(
            total_size <= MAX_PACKET_SIZE + 4,
            "Packet size {} exceeds maximum {}",
            total_size,
            MAX_PACKET_SIZE
        );

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes this packet to its plaintext wire image.
    ///
    /// ```text
    /// uint32    packet_length (big-endian)
    /// byte      padding_length
    /// byte[n1]  payload
    /// byte[n2]  random padding
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses a packet from a decrypted wire image (without MAC).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - the image is shorter than the 5-byte header
    /// - `packet_length` exceeds [`MAX_PACKET_SIZE`]
    /// - `padding_length` is below the 4-byte minimum
    /// - the image length does not match the declared `packet_length`
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.len() < 5 {
            return Err(SkiffError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let packet_length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SkiffError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        if packet_length < 5 {
            return Err(SkiffError::Protocol(format!(
                "Packet too small: {} bytes (minimum 5)",
                packet_length
            )));
        }

        if data.len() != 4 + packet_length {
            return Err(SkiffError::Protocol(format!(
                "Packet image length mismatch: declared {}, have {}",
                packet_length,
                data.len() - 4
            )));
        }

        let padding_length = data[4] as usize;

        if padding_length < MIN_PADDING_LEN as usize {
            return Err(SkiffError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if packet_length < 1 + padding_length {
            return Err(SkiffError::Protocol(format!(
                "Invalid packet: packet_length ({}) too small for padding ({})",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = data[5..5 + payload_length].to_vec();
        let padding = data[5 + payload_length..].to_vec();

        Ok(Self { payload, padding })
    }
}
