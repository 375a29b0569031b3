//! Network plumbing for the dslink field agent.
//!
//! Provides:
//! - `Uplink` - UDP envelope exchange with the remote monitor
//! - `TelemetryIngest` - Local telemetry listener feeding the uplink
//! - Built-in frame decoders (raw, JSON)

pub mod decoder;
pub mod error;
pub mod ingest;
pub mod uplink;

pub use decoder::{JsonDecoder, RawDecoder, decoder_for};
pub use error::TransportError;
pub use ingest::TelemetryIngest;
pub use uplink::Uplink;
