//! Dynamic COB-ID configuration surface, installed at 0x1200 (first channel) or
//! 0x1201..0x127F (additional channels)
//!
//! Reconfiguring the actual CAN RX/TX filters in response to a binding change is the caller's
//! job (spec §6.3); this module only validates writes and exposes the resulting binding via
//! [`SdoBinding::binding`] for the caller to poll after each `process()` call.

use canopen_common::sdo::AbortCode;
use canopen_common::AtomicCell;

use crate::od::{AccessType, DataType, ObjectAccess, ObjectCode, SubInfo};

/// Bits of a COB-ID sub-object that are neither the 11-bit identifier nor the invalid flag
const RESERVED_COB_MASK: u32 = 0x3FFF_F800;
/// Set in a COB-ID value to mark the channel invalid (unbound)
const COB_INVALID_BIT: u32 = 1 << 31;

/// The COB-ID pair (and, for additional channels, node ID) currently bound to one SDO channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CobBinding {
    /// Client-to-server COB-ID, high bit set when invalid
    pub cob_c2s: u32,
    /// Server-to-client COB-ID, high bit set when invalid
    pub cob_s2c: u32,
    /// Node ID of the SDO server for this channel (additional channels only)
    pub node_id: u8,
}

impl CobBinding {
    /// Build a binding from raw COB-ID values
    pub const fn new(cob_c2s: u32, cob_s2c: u32, node_id: u8) -> Self {
        Self {
            cob_c2s,
            cob_s2c,
            node_id,
        }
    }

    /// True if the client-to-server direction is currently bound
    pub fn c2s_valid(&self) -> bool {
        self.cob_c2s & COB_INVALID_BIT == 0
    }

    /// True if the server-to-client direction is currently bound
    pub fn s2c_valid(&self) -> bool {
        self.cob_s2c & COB_INVALID_BIT == 0
    }

    /// True iff both COB-IDs have the validity bit clear (spec §3 `valid`)
    pub fn is_valid(&self) -> bool {
        self.c2s_valid() && self.s2c_valid()
    }
}

/// An object dictionary entry exposing one SDO channel's COB-ID binding
///
/// Install at 0x1200 for the first channel (`has_node_id = false`, sub 3 absent) or at
/// 0x1201..0x127F for additional channels (`has_node_id = true`).
#[allow(missing_debug_implementations)]
pub struct SdoBinding {
    binding: AtomicCell<CobBinding>,
    has_node_id: bool,
    dynamic_od: bool,
}

impl SdoBinding {
    /// Create a new binding object with the given initial COB-IDs
    ///
    /// `dynamic_od` mirrors `ServerConfig::dynamic_od`: when false, every write to this object is
    /// rejected with `UNSUPPORTED_ACCESS` regardless of channel validity, matching the capability
    /// gate `process()` applies to segmented/block transfer.
    pub const fn new(initial: CobBinding, has_node_id: bool, dynamic_od: bool) -> Self {
        Self {
            binding: AtomicCell::new(initial),
            has_node_id,
            dynamic_od,
        }
    }

    /// The currently-bound COB-IDs and node ID
    pub fn binding(&self) -> CobBinding {
        self.binding.load()
    }

    /// Reject writes to reserved bits, and writes that would rebind an already-valid channel
    /// (spec §6.2, §9 Open Question (b))
    fn validate_write(current: u32, new_value: u32) -> Result<(), AbortCode> {
        if new_value & RESERVED_COB_MASK != 0 {
            return Err(AbortCode::InvalidValue);
        }
        if current & COB_INVALID_BIT == 0 && new_value != current {
            return Err(AbortCode::InvalidValue);
        }
        Ok(())
    }
}

impl ObjectAccess for SdoBinding {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let bytes = match sub {
            0 => [self.max_sub_number(), 0, 0, 0],
            1 => self.binding.load().cob_c2s.to_le_bytes(),
            2 => self.binding.load().cob_s2c.to_le_bytes(),
            3 if self.has_node_id => {
                let mut b = [0u8; 4];
                b[0] = self.binding.load().node_id;
                b
            }
            _ => return Err(AbortCode::NoSuchSubIndex),
        };
        let size = self.sub_info(sub)?.size;
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min(size - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.dynamic_od {
            return Err(AbortCode::UnsupportedAccess);
        }
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => {
                let value = u32::from_le_bytes(
                    data.try_into().map_err(|_| AbortCode::LengthMismatch)?,
                );
                let current = self.binding.load();
                Self::validate_write(current.cob_c2s, value)?;
                self.binding
                    .fetch_update(|mut b| {
                        b.cob_c2s = value;
                        Some(b)
                    })
                    .map_err(|_| AbortCode::GeneralError)?;
                Ok(())
            }
            2 => {
                let value = u32::from_le_bytes(
                    data.try_into().map_err(|_| AbortCode::LengthMismatch)?,
                );
                let current = self.binding.load();
                Self::validate_write(current.cob_s2c, value)?;
                self.binding
                    .fetch_update(|mut b| {
                        b.cob_s2c = value;
                        Some(b)
                    })
                    .map_err(|_| AbortCode::GeneralError)?;
                Ok(())
            }
            3 if self.has_node_id => {
                if data.len() != 1 {
                    return Err(AbortCode::LengthMismatch);
                }
                let node_id = data[0];
                if !(1..=127).contains(&node_id) {
                    return Err(AbortCode::InvalidValue);
                }
                self.binding
                    .fetch_update(|mut b| {
                        b.node_id = node_id;
                        Some(b)
                    })
                    .map_err(|_| AbortCode::GeneralError)?;
                Ok(())
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 | 2 => Ok(SubInfo {
                data_type: DataType::UInt32,
                access_type: AccessType::ReadWrite,
                size: 4,
                rpdo_mappable: false,
                tpdo_mappable: false,
                persist: true,
            }),
            3 if self.has_node_id => Ok(SubInfo {
                data_type: DataType::UInt8,
                access_type: AccessType::ReadWrite,
                size: 1,
                rpdo_mappable: false,
                tpdo_mappable: false,
                persist: true,
            }),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn max_sub_number(&self) -> u8 {
        if self.has_node_id {
            3
        } else {
            2
        }
    }
}
