//! filecast transport library
//!
//! Framed TCP control channel plus a lossy connectionless chunk channel
//! for one-to-many file distribution

pub mod connect;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod request;

pub use connect::{Connector, EndpointFactory, Listener};
pub use endpoint::{Endpoint, EndpointConfig, EndpointHandler};
pub use error::{Result, TransportError};
pub use receiver::{ChunkReceiver, DatagramSource, ReceiverConfig, UdpDatagramSource};
pub use request::{FileLookup, FileRequestClient, RequestConfig, ResponseRouter};
