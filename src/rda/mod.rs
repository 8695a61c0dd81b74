//! RDA network streaming
//!
//! [`RdaServer`] mirrors the blocks passing through it to TCP clients,
//! [`RdaClient`] is a source stage reading such a stream back.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{CONNECT_COMMAND, ConnectionState, DISCONNECT_COMMAND, RdaClient, RdaClientSettings};
pub use protocol::{DEFAULT_PORT, Header, Message};
pub use server::{RdaServer, RdaServerSettings};
