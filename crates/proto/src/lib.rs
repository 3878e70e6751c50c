//! Protocol implementations for the Skiff remote-access toolkit.
//!
//! This crate currently provides the SSH2 client connection core:
//!
//! - **SSH** (Secure Shell) client - RFC 4251-4254 compliant transport,
//!   key exchange, user authentication, and channel multiplexing
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted libraries (`aes`, `cbc`,
//!   `ctr`, `hmac`, `rsa`, `ssh-key`)
//! - Constant-time MAC comparison via `subtle`
//! - Secret material is zeroized on drop with `zeroize`
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
