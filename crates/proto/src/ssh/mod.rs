//! SSH version 2 client connection core.
//!
//! This module implements the client side of the SSH protocol according to
//! RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered, leaves first:
//!
//! 1. **Wire / Packet Layer** ([`wire`], [`packet`]) - binary packet
//!    protocol (RFC 4253 Section 6)
//! 2. **Transport Layer** ([`transport`], [`crypto`]) - ciphered,
//!    MAC-protected, sequence-numbered framing
//! 3. **Interceptor Fabric** ([`interceptor`]) - stateful consumers that
//!    own a slice of the opcode space while their sub-protocol runs
//! 4. **Key Exchange** ([`kex`], [`kex_dh`], [`hostkey`], [`kex_driver`]) -
//!    Diffie-Hellman group exchanges with mid-stream rekeying
//! 5. **Authentication** ([`auth`], [`authenticator`]) - password, public
//!    key, and keyboard-interactive (RFC 4252, RFC 4256)
//! 6. **Connection Layer** ([`connection`], [`channel`], [`forwarding`],
//!    [`agent`]) - channels, global requests, port and agent forwarding
//!    (RFC 4254)
//!
//! # Security Considerations
//!
//! - **Input validation**: every packet parse is bounds-checked; packets
//!   above 35000 bytes are rejected
//! - **Constant-time MAC comparison** via `subtle`
//! - **Memory safety**: secrets are zeroized on drop using `zeroize`
//! - **No unsafe code**
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::authenticator::AuthCredentials;
//! use skiff_proto::ssh::connection::{Connection, ConnectionParams, NullEvents};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let params = ConnectionParams::new(
//!     "server.example.com",
//!     22,
//!     "alice",
//!     AuthCredentials::Password {
//!         password: "secret".to_string(),
//!     },
//! );
//!
//! let connection = Connection::connect(params, Arc::new(NullEvents)).await?;
//! assert!(connection.is_open());
//! connection.disconnect_by_application().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication

pub mod agent;
pub mod auth;
pub mod authenticator;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod forwarding;
pub mod hostkey;
pub mod interceptor;
pub mod kex;
pub mod kex_dh;
pub mod kex_driver;
pub mod message;
pub mod packet;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use agent::{AgentForwarder, AgentIdentity, AgentKeyProvider};
pub use auth::{construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthRequest, InfoPrompt, InfoRequest, InfoResponse};
pub use authenticator::{AuthCredentials, AuthState, Authenticator, PromptHandler};
pub use channel::{Channel, ChannelEvents, ChannelTable, OpenFailureReason};
pub use connection::{Connection, ConnectionEvents, ConnectionParams, NullEvents};
pub use crypto::{Cipher, CipherAlgorithm, MacAlgorithm, MacKey};
pub use forwarding::{ForwardAddr, ForwardedPortHandler, LocalForward, RemotePortForwarder};
pub use hostkey::{HostKey, HostKeyVerifier};
pub use interceptor::{CloseHandle, InterceptOutcome, InterceptorChain, PacketInterceptor, ResponseSlot};
pub use kex::{negotiate, negotiate_algorithm, HashAlgorithm, KexAlgorithm, KexInit, NegotiatedAlgorithms, NewKeys};
pub use kex_dh::{compute_exchange_hash, derive_cipher_settings, derive_key, CipherSettings, DhExchange, ExchangeHashParams};
pub use kex_driver::{KexConfig, KexPhase, KeyExchanger};
pub use message::MessageType;
pub use packet::{Packet, MAX_PACKET_SIZE};
pub use transport::Transport;
pub use version::Version;
