//! Position Source
//!
//! TCP client for the external target position stream and the codec for
//! its newline-delimited JSON records.

mod client;
mod codec;

pub use client::{
    DEFAULT_MAX_LINE_LENGTH, PositionSourceClient, PositionSourceConfig, PositionSourceError,
    TargetPositionSink,
};
pub use codec::{RecordError, SourceRecord, decode_record};
