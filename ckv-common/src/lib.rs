// ckv-common - Shared command, value and wire codec definitions for ClusterKV
//
// This crate holds everything the client core exchanges with the wire:
// commands going out, values coming back, and the RESP2/RESP3 codec.

pub mod command;
pub mod error;
pub mod resp;
pub mod value;

// Re-export for convenience
pub use command::*;
pub use error::*;
pub use resp::{encode_command, parse_value, ProtocolVersion};
pub use value::*;
