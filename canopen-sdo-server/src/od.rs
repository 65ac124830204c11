//! The object-dictionary adapter contract
//!
//! Defines the attribute/data-length/read/write contract the SDO server
//! consumes (spec §4.2), plus the ergonomic `ProvidesSubObjects` path most
//! objects are expected to implement rather than `ObjectAccess` directly.

use canopen_common::sdo::AbortCode;
use canopen_common::AtomicCell;

use crate::od_fields::SubObjectAccess;

/// The CANopen object type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectCode {
    /// An object with no content
    Null,
    /// Large, variable-length data with no declared length
    Domain,
    /// A type definition
    DefType,
    /// A structure definition
    DefStruct,
    /// A single-value object (no sub 0 count)
    Var,
    /// A fixed-type array, sub 0 holds the highest valid sub-index
    Array,
    /// A mixed-type record, sub 0 holds the highest valid sub-index
    Record,
}

/// The declared data type of a sub-object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// Boolean, 1 byte on the wire
    Boolean,
    /// Signed 8-bit
    Int8,
    /// Signed 16-bit
    Int16,
    /// Signed 32-bit
    Int32,
    /// Unsigned 8-bit
    UInt8,
    /// Unsigned 16-bit
    UInt16,
    /// Unsigned 32-bit
    UInt32,
    /// IEEE-754 single precision
    Float32,
    /// Null-terminated ASCII string, variable length up to declared size
    VisibleString,
    /// Raw byte string
    OctetString,
    /// Null-terminated UTF-16 string, variable length up to declared size
    UnicodeString,
    /// Arbitrary-length opaque data with no declared size
    Domain,
}

impl DataType {
    /// True for the string types, which support a null-terminated "current size" shorter than
    /// their declared maximum size
    pub fn is_str(&self) -> bool {
        matches!(self, Self::VisibleString | Self::UnicodeString)
    }

    /// True for multi-byte numeric types, which require an endianness swap on big-endian hosts
    /// (spec §9 "Endianness")
    pub fn is_multibyte(&self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Int32 | Self::UInt16 | Self::UInt32 | Self::Float32
        )
    }

    /// True for the variable-length domain type, whose declared size is 0/unknown
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain)
    }
}

/// Read/write permission of a sub-object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Readable only
    ReadOnly,
    /// Writable only
    WriteOnly,
    /// Both readable and writable
    ReadWrite,
    /// Read-only and immutable (e.g. a compile-time constant)
    Const,
}

impl AccessType {
    /// True if the object can be read
    pub fn is_readable(&self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// True if the object can be written
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Metadata about a single sub-object, as the SDO server needs it
///
/// Constructed with one of the typed `new_*` constructors and refined with
/// builder methods, e.g. `SubInfo::new_u32().rw_access().persist(true)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubInfo {
    /// The declared data type
    pub data_type: DataType,
    /// Read/write permission
    pub access_type: AccessType,
    /// Declared size in bytes; 0 for a Domain object of unknown length
    pub size: usize,
    /// True if this sub-object can be mapped into a receive PDO
    pub rpdo_mappable: bool,
    /// True if this sub-object can be mapped into a transmit PDO
    pub tpdo_mappable: bool,
    /// True if the value should survive a reset (persistence is out of scope for the SDO core;
    /// this flag is carried through for the benefit of an external persistence collaborator)
    pub persist: bool,
}

impl SubInfo {
    /// A read-only `UInt8` sub 0, used as the "highest sub-index" entry of arrays and records
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        size: 1,
        rpdo_mappable: false,
        tpdo_mappable: false,
        persist: false,
    };

    const fn scalar(data_type: DataType, size: usize) -> Self {
        Self {
            data_type,
            access_type: AccessType::ReadOnly,
            size,
            rpdo_mappable: false,
            tpdo_mappable: false,
            persist: false,
        }
    }

    /// A `Boolean` sub-object
    pub const fn new_bool() -> Self {
        Self::scalar(DataType::Boolean, 1)
    }
    /// A `UInt8` sub-object
    pub const fn new_u8() -> Self {
        Self::scalar(DataType::UInt8, 1)
    }
    /// A `UInt16` sub-object
    pub const fn new_u16() -> Self {
        Self::scalar(DataType::UInt16, 2)
    }
    /// A `UInt32` sub-object
    pub const fn new_u32() -> Self {
        Self::scalar(DataType::UInt32, 4)
    }
    /// An `Int8` sub-object
    pub const fn new_i8() -> Self {
        Self::scalar(DataType::Int8, 1)
    }
    /// An `Int16` sub-object
    pub const fn new_i16() -> Self {
        Self::scalar(DataType::Int16, 2)
    }
    /// An `Int32` sub-object
    pub const fn new_i32() -> Self {
        Self::scalar(DataType::Int32, 4)
    }
    /// A `Float32` sub-object
    pub const fn new_f32() -> Self {
        Self::scalar(DataType::Float32, 4)
    }
    /// A `VisibleString` sub-object with the given maximum length
    pub const fn new_visibile_str(len: usize) -> Self {
        Self::scalar(DataType::VisibleString, len)
    }
    /// An `OctetString` sub-object with the given maximum length
    pub const fn new_octet_str(len: usize) -> Self {
        Self::scalar(DataType::OctetString, len)
    }
    /// A `Domain` sub-object of unknown/unbounded length
    pub const fn new_domain() -> Self {
        Self::scalar(DataType::Domain, 0)
    }

    /// Mark the sub-object read/write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::ReadWrite;
        self
    }
    /// Mark the sub-object write-only
    pub const fn wo_access(mut self) -> Self {
        self.access_type = AccessType::WriteOnly;
        self
    }
    /// Mark the sub-object read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::ReadOnly;
        self
    }
    /// Mark whether the sub-object should persist across resets
    pub const fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
    /// Mark the sub-object mappable into a receive PDO
    pub const fn mappable_rpdo(mut self) -> Self {
        self.rpdo_mappable = true;
        self
    }
    /// Mark the sub-object mappable into a transmit PDO
    pub const fn mappable_tpdo(mut self) -> Self {
        self.tpdo_mappable = true;
        self
    }
}

/// Read/write/event-flag access to a whole object, addressed by sub-index
///
/// Any type implementing an entry in the object dictionary must implement
/// this trait. Most objects should implement [`ProvidesSubObjects`] instead
/// and get this trait for free via the blanket impl below.
pub trait ObjectAccess: Sync + Send {
    /// Read raw bytes from a sub-object, per spec §4.2's `read` contract
    ///
    /// Implementers must support reading any sub-range (`offset` may be
    /// non-zero and `buf` shorter than the remaining data) and must write at
    /// least one byte whenever at least one remains to be read.
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// Get the number of bytes currently available for read
    fn read_size(&self, sub: u8) -> Result<usize, AbortCode>;

    /// Write raw bytes to a sub-object, per spec §4.2's `write` contract
    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode>;

    /// Begin a multi-call partial write, used by segmented/block download of Domain objects
    ///
    /// The default rejects with `ReadOnly`/`UnsupportedAccess` as appropriate; objects that
    /// support partial writes (Domain, long strings) must override it.
    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        let sub_info = self.sub_info(sub)?;
        if sub_info.access_type.is_writable() {
            Err(AbortCode::UnsupportedAccess)
        } else {
            Err(AbortCode::ReadOnly)
        }
    }

    /// Continue a partial write begun with [`begin_partial`](Self::begin_partial)
    fn write_partial(&self, _sub: u8, _buf: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::GeneralError)
    }

    /// Finish a partial write begun with [`begin_partial`](Self::begin_partial)
    fn end_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::GeneralError)
    }

    /// The object's type
    fn object_code(&self) -> ObjectCode;

    /// Metadata about one sub-object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;

    /// The highest valid sub-index of this object
    fn max_sub_number(&self) -> u8 {
        match self.object_code() {
            ObjectCode::Null | ObjectCode::Domain | ObjectCode::DefType | ObjectCode::DefStruct
            | ObjectCode::Var => 0,
            ObjectCode::Array | ObjectCode::Record => self.read_u8(0).unwrap_or(0),
        }
    }

    /// Set the TPDO-event flag for a sub-object, if the object supports event flags
    fn set_event_flag(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Read the TPDO-event flag for a sub-object
    fn read_event_flag(&self, _sub: u8) -> bool {
        false
    }

    /// Clear all event flags on this object
    fn clear_events(&self) {}

    /// The access type of a sub-object
    fn access_type(&self, sub: u8) -> Result<AccessType, AbortCode> {
        Ok(self.sub_info(sub)?.access_type)
    }

    /// The data type of a sub-object
    fn data_type(&self, sub: u8) -> Result<DataType, AbortCode> {
        Ok(self.sub_info(sub)?.data_type)
    }

    /// The declared (maximum) size of a sub-object, in bytes; 0 for an unknown-length Domain
    fn size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    /// The current size of a sub-object
    ///
    /// For string types this may be shorter than the declared size, terminated by a null byte.
    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        const CHUNK_SIZE: usize = 8;

        let size = self.size(sub)?;
        if self.data_type(sub)?.is_str() {
            let mut chunk = 0;
            let mut buf = [0; CHUNK_SIZE];
            while chunk < size / CHUNK_SIZE + 1 {
                let offset = chunk * CHUNK_SIZE;
                let bytes_to_read = (size - offset).min(CHUNK_SIZE);
                self.read(sub, offset, &mut buf[0..bytes_to_read])?;
                if let Some(zero_pos) = buf[0..bytes_to_read].iter().position(|b| *b == 0) {
                    return Ok(zero_pos + chunk * CHUNK_SIZE);
                }
                chunk += 1;
            }
        }
        Ok(size)
    }

    /// Read a sub-object as a `u32`
    fn read_u32(&self, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    /// Read a sub-object as a `u16`
    fn read_u16(&self, sub: u8) -> Result<u16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    /// Read a sub-object as a `u8`
    fn read_u8(&self, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0])
    }
    /// Read a sub-object as an `i32`
    fn read_i32(&self, sub: u8) -> Result<i32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
    /// Read a sub-object as an `i16`
    fn read_i16(&self, sub: u8) -> Result<i16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }
    /// Read a sub-object as an `i8`
    fn read_i8(&self, sub: u8) -> Result<i8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0] as i8)
    }
}

/// The ergonomic way to implement an OD object: provide a `(SubInfo, &dyn SubObjectAccess)` per
/// sub-index and get [`ObjectAccess`] for free via the blanket impl below.
pub trait ProvidesSubObjects {
    /// Get the `SubInfo` and storage for one sub-index, or `None` if it does not exist
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)>;

    /// Get the event-flag storage for this object, if it supports TPDO triggering
    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        None
    }

    /// The object's type
    fn object_code(&self) -> ObjectCode;
}

/// Storage for per-sub-index TPDO event flags
pub trait ObjectFlagAccess: Sync + Send {
    /// Set the event flag for a sub-index
    fn set_flag(&self, sub: u8);
    /// Read the event flag for a sub-index
    fn get_flag(&self, sub: u8) -> bool;
    /// Clear all event flags
    fn clear_flags(&self);
}

impl<T: ProvidesSubObjects + Sync + Send> ObjectAccess for T {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_readable() {
                access.read(offset, buf)
            } else {
                Err(AbortCode::WriteOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        if let Some((_info, access)) = self.get_sub_object(sub) {
            Ok(access.read_size())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_writable() {
                access.write(data)
            } else {
                Err(AbortCode::ReadOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_writable() {
                access.begin_partial()
            } else {
                Err(AbortCode::ReadOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn write_partial(&self, sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        if let Some((_, access)) = self.get_sub_object(sub) {
            access.write_partial(buf)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some((_, access)) = self.get_sub_object(sub) {
            access.end_partial()
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn set_event_flag(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some(flags) = self.flags() {
            flags.set_flag(sub);
            Ok(())
        } else {
            Err(AbortCode::UnsupportedAccess)
        }
    }

    fn read_event_flag(&self, sub: u8) -> bool {
        self.flags().map(|f| f.get_flag(sub)).unwrap_or(false)
    }

    fn clear_events(&self) {
        if let Some(flags) = self.flags() {
            flags.clear_flags();
        }
    }

    fn object_code(&self) -> ObjectCode {
        ProvidesSubObjects::object_code(self)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.get_sub_object(sub)
            .map(|(info, _)| info)
            .ok_or(AbortCode::NoSuchSubIndex)
    }
}

/// An OD placeholder whose implementation is registered at runtime
#[allow(missing_debug_implementations)]
pub struct CallbackObject<'a> {
    obj: AtomicCell<Option<&'a dyn ObjectAccess>>,
    object_code: ObjectCode,
}

impl CallbackObject<'_> {
    /// Create a new, unregistered callback object
    pub const fn new(object_code: ObjectCode) -> Self {
        Self {
            obj: AtomicCell::new(None),
            object_code,
        }
    }

    /// Register the implementation backing this object
    pub fn register(&self, obj: &'static dyn ObjectAccess) {
        self.obj.store(Some(obj));
    }
}

impl ObjectAccess for CallbackObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.read(sub, offset, buf)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.read_size(sub)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.write(sub, data)
    }

    fn write_partial(&self, sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.write_partial(sub, buf)
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.end_partial(sub)
    }

    fn object_code(&self) -> ObjectCode {
        self.object_code
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.obj.load().ok_or(AbortCode::DeviceIncompatible)?.sub_info(sub)
    }
}

/// One entry in the in-memory object dictionary table
#[allow(missing_debug_implementations)]
pub struct ODEntry<'a> {
    /// The object index
    pub index: u16,
    /// The object implementation
    pub data: &'a dyn ObjectAccess,
}

/// Look up an object in the dictionary table
///
/// `table` must be sorted by `index`.
pub fn find_object<'a, 'b>(table: &'b [ODEntry<'a>], index: u16) -> Option<&'a dyn ObjectAccess> {
    find_object_entry(table, index).map(|entry| entry.data)
}

/// Look up an entry (rather than just its object) in the dictionary table
///
/// `table` must be sorted by `index`.
pub fn find_object_entry<'a, 'b>(table: &'b [ODEntry<'a>], index: u16) -> Option<&'b ODEntry<'a>> {
    table
        .binary_search_by_key(&index, |e| e.index)
        .ok()
        .map(|i| &table[i])
}
