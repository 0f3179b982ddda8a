//! Tracker protocol client
//!
//! Three layers: [`wire`] encodes and decodes single lines,
//! [`connection`] owns the stream and failover, and [`directory`] maps
//! tracker commands onto typed results.

pub mod connection;
pub mod directory;
pub mod wire;

pub use connection::{TcpConnector, TrackerConnection, TrackerConnector};
pub use directory::{CreateOpenTicket, DomainClasses, ListKeysPage, ObjectDirectory};
pub use wire::{TrackerCommand, TrackerResponse, decode_response, encode_request};
