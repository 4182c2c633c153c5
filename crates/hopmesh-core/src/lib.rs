//! Core protocol implementation for an ad-hoc, multi-hop chat network over a
//! shared half-duplex medium: MAC arbitration, address self-assignment,
//! distance-vector routing, stop-and-wait reliability with forwarding,
//! message chunking, and reassembly.

pub mod addressing;
pub mod chunker;
pub mod console;
pub mod error;
pub mod mac;
pub mod medium;
pub mod node;
pub mod reassembler;
pub mod reliability;
pub mod routing;

pub use error::NodeError;
