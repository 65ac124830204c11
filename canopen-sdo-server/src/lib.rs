#![no_std]
#![allow(clippy::comparison_chain)]

pub mod binding;
pub mod config;
pub mod od;
pub mod od_fields;
pub mod receiver;
pub mod server;

pub use canopen_common as common;
pub use critical_section;

pub use binding::{CobBinding, SdoBinding};
pub use config::ServerConfig;
pub use od::{
    AccessType, CallbackObject, DataType, ODEntry, ObjectAccess, ObjectCode, ObjectFlagAccess,
    ProvidesSubObjects, SubInfo, find_object, find_object_entry,
};
pub use od_fields::{
    ByteField, CallbackSubObject, ConstByteRefField, ConstField, NullTermByteField, ScalarField,
    SubObjectAccess,
};
pub use receiver::SdoReceiver;
pub use server::{ObjectId, ProcessOutcome, SdoServer, SDO_BUFFER_SIZE};
