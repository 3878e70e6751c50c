//! Port forwarding over the SSH connection.
//!
//! - [`remote`]: "tcpip-forward" global requests and inbound
//!   "forwarded-tcpip" channels (the server listens, we accept)
//! - [`local`]: local listeners relayed through "direct-tcpip" channels
//! - [`types`]: shared address types

pub mod local;
pub mod remote;
pub mod types;

pub use local::LocalForward;
pub use remote::{ForwardedPortHandler, RemotePortForwarder};
pub use types::ForwardAddr;
