//! Stratum mining server.
//!
//! A line-delimited JSON server that authenticates external proof-of-work
//! workers, broadcasts the single authoritative in-flight job to every
//! logged-in peer and forwards the first valid solution back to the job's
//! producer. TLS is enabled iff both a certificate and a private key are
//! configured; otherwise the server speaks plain TCP.
//!
//! The server is independent of the wallet core: it talks to the node
//! through [`server::StratumHandle`] and to miners through the wire
//! protocol in [`protocol`].

pub mod acl;
pub mod error;
pub mod protocol;
pub mod server;

pub use error::{Result, StratumError};
pub use server::{FoundBlock, Options, StratumHandle, StratumServer};
