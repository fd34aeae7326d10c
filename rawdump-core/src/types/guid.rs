use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fmt;
use std::str::FromStr;

use dataview::Pod;

/// A 16 byte globally unique identifier as stored in GPT partition tables
/// and vendor specific dump sections.
///
/// The first three members are stored in little-endian order, the last eight bytes are stored as is.
///
/// # Examples
///
/// ```
/// use rawdump_core::types::Guid;
///
/// let guid: Guid = "66C9B323-F7FC-48B6-BF96-6F32E335A428".parse().unwrap();
/// assert_eq!(guid.to_string(), "66C9B323-F7FC-48B6-BF96-6F32E335A428");
/// ```
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}
unsafe impl Pod for Guid {}

impl Guid {
    /// The all-zero GUID, used to mark unused entries.
    pub const NIL: Guid = Guid::new(0, 0, 0, [0; 8]);

    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// Decodes a GUID from its 16 byte on-disk representation.
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Self {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    /// Encodes the GUID into its 16 byte on-disk representation.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.data1.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.data2.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.data3.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.data4);
        bytes
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}", self)
    }
}

impl FromStr for Guid {
    type Err = Error;

    /// Parses the canonical `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` form, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(s);

        let parts = s.split('-').collect::<Vec<_>>();
        let lengths = [8, 4, 4, 4, 12];
        if parts.len() != lengths.len()
            || parts
                .iter()
                .zip(lengths.iter())
                .any(|(p, l)| p.len() != *l || !p.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(Error(ErrorOrigin::Other, ErrorKind::Encoding).log_debug(s));
        }

        let hex = |s: &str| {
            u64::from_str_radix(s, 16).map_err(|_| Error(ErrorOrigin::Other, ErrorKind::Encoding))
        };

        let tail = hex(parts[3])? << 48 | hex(parts[4])?;
        Ok(Self {
            data1: hex(parts[0])? as u32,
            data2: hex(parts[1])? as u16,
            data3: hex(parts[2])? as u16,
            data4: tail.to_be_bytes(),
        })
    }
}

#[cfg(feature = "serde")]
impl<'de> ::serde::Deserialize<'de> for Guid {
    fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| ::serde::de::Error::custom(format!("invalid guid: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_size() {
        assert_eq!(size_of::<Guid>(), 16);
    }

    #[test]
    fn test_parse_display() {
        let guid: Guid = "{0df632e9-5c48-43aa-b8bd-5ff61805025f}".parse().unwrap();
        assert_eq!(guid.data1, 0x0df632e9);
        assert_eq!(guid.data2, 0x5c48);
        assert_eq!(guid.data3, 0x43aa);
        assert_eq!(guid.data4, [0xb8, 0xbd, 0x5f, 0xf6, 0x18, 0x05, 0x02, 0x5f]);
        assert_eq!(guid.to_string(), "0DF632E9-5C48-43AA-B8BD-5FF61805025F");
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<Guid>().is_err());
        assert!("0df632e9-5c48-43aa-b8bd".parse::<Guid>().is_err());
        assert!("0df632e9-5c48-43aa-b8bd-5ff61805025g".parse::<Guid>().is_err());
        assert!("+df632e9-5c48-43aa-b8bd-5ff61805025f".parse::<Guid>().is_err());
    }

    #[test]
    fn test_bytes() {
        let guid = Guid::new(
            0x66C9B323,
            0xF7FC,
            0x48B6,
            [0xBF, 0x96, 0x6F, 0x32, 0xE3, 0x35, 0xA4, 0x28],
        );
        let bytes = guid.to_bytes();
        assert_eq!(&bytes[0..4], &[0x23, 0xB3, 0xC9, 0x66]);
        assert_eq!(&bytes[8..16], &guid.data4);
        assert_eq!(Guid::from_bytes(&bytes), guid);
        assert!(!guid.is_nil());
        assert!(Guid::from_bytes(&[0; 16]).is_nil());
    }
}
