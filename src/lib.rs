//! warren - a peer-to-peer TCP tunnel daemon
//!
//! Two hosts, possibly both behind NAT, expose TCP endpoints to each other
//! across the internet through a rendezvous service ("tracker"). Connections
//! are named and addressed by a hierarchical path; one side is configured as
//! server (dials a local backend once a peer arrives), the other as client
//! (listens locally and multiplexes accepted TCP clients over the peer
//! link). Peers authenticate with long-lived identity keys and encrypt
//! payload traffic end to end.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     warren::supervisor::run(PathBuf::from("/etc/warren"), "default".to_string()).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connections;
pub mod control;
pub mod crypto;
pub mod error;
pub mod front;
pub mod proto;
pub mod session;
pub mod supervisor;
pub mod tracker;
pub mod transport;

pub use config::WarrenConfig;
pub use error::WarrenError;
