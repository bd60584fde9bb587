use alloc::vec::Vec;
use core::fmt;

/// Dictionary key: 16-bit index plus 8-bit sub-index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjKey {
    pub index: u16,
    pub sub: u8,
}

impl ObjKey {
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}:{:#04X}", self.index, self.sub)
    }
}

/// Access properties of an object entry as a type-safe bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjFlags(pub u16);

impl ObjFlags {
    // --- Flag Constants ---
    /// Entry is readable.
    pub const RD: Self = Self(1 << 0);
    /// Entry is writable.
    pub const WR: Self = Self(1 << 1);
    /// Entry may be mapped into a PDO.
    pub const PDO_MAP: Self = Self(1 << 2);
    /// The node-id is added on read and removed on write.
    pub const NODE_ID: Self = Self(1 << 3);
    /// Entry is writable in pre-operational mode only.
    pub const PREOP: Self = Self(1 << 4);
    /// A write to this entry triggers asynchronous transmit PDOs
    /// mapping it.
    pub const ASYNC: Self = Self(1 << 5);

    /// Readable and writable.
    pub const RW: Self = Self(Self::RD.0 | Self::WR.0);

    // --- Methods ---

    /// Checks if all of the specified flags are set.
    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns an empty set of flags.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Inserts the specified flags.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the specified flags.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for ObjFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The payload of an object entry. Scalars own their value inline;
/// strings are constant byte sequences, domains are variable-length
/// buffers whose length fixes the transfer capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjData {
    Byte(u8),
    Word(u16),
    Long(u32),
    Str(Vec<u8>),
    Domain(Vec<u8>),
}

/// A single entry of the object dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: ObjKey,
    pub flags: ObjFlags,
    pub data: ObjData,
}

impl ObjectEntry {
    pub fn new(key: ObjKey, flags: ObjFlags, data: ObjData) -> Self {
        Self { key, flags, data }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match &self.data {
            ObjData::Byte(_) => 1,
            ObjData::Word(_) => 2,
            ObjData::Long(_) => 4,
            ObjData::Str(s) => s.len(),
            ObjData::Domain(d) => d.len(),
        }
    }

    /// Copies up to `out.len()` payload bytes starting at `offset` into
    /// `out` (scalars little-endian) and returns the copied count.
    pub fn read_window(&self, offset: usize, out: &mut [u8]) -> usize {
        let scalar;
        let bytes: &[u8] = match &self.data {
            ObjData::Byte(v) => {
                scalar = [*v, 0, 0, 0];
                &scalar[..1]
            }
            ObjData::Word(v) => {
                scalar = {
                    let le = v.to_le_bytes();
                    [le[0], le[1], 0, 0]
                };
                &scalar[..2]
            }
            ObjData::Long(v) => {
                scalar = v.to_le_bytes();
                &scalar[..]
            }
            ObjData::Str(s) => s,
            ObjData::Domain(d) => d,
        };
        if offset >= bytes.len() {
            return 0;
        }
        let n = (bytes.len() - offset).min(out.len());
        out[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }

    /// Stores raw payload bytes at `offset`. Scalars accept exactly one
    /// full-width write at offset zero; domains accept any in-capacity
    /// range; strings refuse the write.
    pub fn write_window(&mut self, offset: usize, data: &[u8]) -> Result<(), crate::hal::CoError> {
        use crate::hal::CoError;
        match &mut self.data {
            ObjData::Byte(v) => {
                if offset != 0 || data.len() != 1 {
                    return Err(CoError::ObjWrite);
                }
                *v = data[0];
            }
            ObjData::Word(v) => {
                if offset != 0 || data.len() != 2 {
                    return Err(CoError::ObjWrite);
                }
                *v = u16::from_le_bytes([data[0], data[1]]);
            }
            ObjData::Long(v) => {
                if offset != 0 || data.len() != 4 {
                    return Err(CoError::ObjWrite);
                }
                *v = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            }
            ObjData::Str(_) => return Err(CoError::ObjWrite),
            ObjData::Domain(d) => {
                if offset + data.len() > d.len() {
                    return Err(CoError::ObjWrite);
                }
                d[offset..offset + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }

    /// Scalar value widened to u32; `None` for strings and domains.
    pub fn as_u32(&self) -> Option<u32> {
        match &self.data {
            ObjData::Byte(v) => Some(*v as u32),
            ObjData::Word(v) => Some(*v as u32),
            ObjData::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Stores a scalar value, truncated to the entry width; fails for
    /// strings and domains.
    pub fn set_u32(&mut self, value: u32) -> Result<(), crate::hal::CoError> {
        match &mut self.data {
            ObjData::Byte(v) => *v = value as u8,
            ObjData::Word(v) => *v = value as u16,
            ObjData::Long(v) => *v = value,
            _ => return Err(crate::hal::CoError::ObjWrite),
        }
        Ok(())
    }
}
