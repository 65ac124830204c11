//! Wire types shared by the CANopen SDO server core and its clients
#![no_std]
#![allow(clippy::comparison_chain)]

pub mod atomic_cell;
pub mod crc;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

pub use atomic_cell::AtomicCell;
pub use node_id::{ConfiguredId, InvalidNodeIdError, NodeId};
