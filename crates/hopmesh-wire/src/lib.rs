//! Wire format for the hopmesh ad-hoc chat protocol.
//!
//! Every node id in this protocol is a 5-bit value in `1..=31`; `0` means
//! "unassigned". Three DATA variants (unicast fragment, link-state, addressing)
//! share the same 32-byte envelope, discriminated by the top two bits of
//! byte 0. DATA_SHORT frames are 2 bytes (ACK or keep-alive).

pub mod frame;
pub mod node_id;

pub use frame::{AddressingFrame, DataShort, Frame, LinkStateFrame, UnicastFrame, WireError};
pub use node_id::NodeId;
