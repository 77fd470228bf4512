//! Outbound protocol adapters
//!
//! An adapter is the stateful byte transformer between an inbound flow and
//! its outbound transport. It only rewrites bytes and raises protocol
//! errors; it never owns or closes the transports.

pub mod vless;

pub use vless::{DatagramDecoder, VlessCodec, VlessCommand};

use crate::common::net::Destination;
use crate::Result;
use bytes::Bytes;
use uuid::Uuid;

/// Closed set of supported outbound protocols.
///
/// Future protocols become additional variants.
pub enum Adapter {
    Vless(VlessCodec),
}

impl Adapter {
    pub fn vless(uuid: Uuid, command: VlessCommand) -> Self {
        Adapter::Vless(VlessCodec::new(uuid, command))
    }

    /// Transform a payload headed for the remote.
    pub fn transform_outbound(&mut self, payload: &[u8], destination: &Destination) -> Result<Bytes> {
        match self {
            Adapter::Vless(codec) => codec.seal(payload, destination),
        }
    }

    /// Transform a chunk received from the remote. May return an empty
    /// buffer while a protocol header is still being assembled.
    pub fn transform_inbound(&mut self, chunk: &[u8]) -> Result<Bytes> {
        match self {
            Adapter::Vless(codec) => codec.open(chunk),
        }
    }
}
