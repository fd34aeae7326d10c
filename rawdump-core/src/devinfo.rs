/*!
Device specific information appended to processed raw dumps.

After a dump got processed a fixed size 1024 byte trailer describing the
device and the reset reason is appended to it. The current layout starts
with a signature, two older layouts without a signature exist and are
detected by the position of the bug check code.
*/

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;

use dataview::{DataView, Pod, PodMethods};
use log::{debug, info};

/// "DevSpInf"
pub const DEVICE_INFO_SIGNATURE: u64 = 0x666e_4970_5376_6544;
pub const DEVICE_INFO_VERSION: u32 = 1;
/// Size of the trailer appended to the dump.
pub const DEVICE_INFO_BUFFER_LEN: usize = 1024;

/// Bug check code reported for abnormal resets.
pub const FATAL_ABNORMAL_RESET_ERROR: u32 = 0x14C;

/// `PROCESSOR_ARCHITECTURE_INTEL`
pub const DEVICE_TYPE_X86: u32 = 0;
/// Legacy Intel x86 device type.
pub const DEVICE_TYPE_INTEL_X86: u32 = 1;
/// Legacy Qualcomm 32 bit device type.
pub const DEVICE_TYPE_QCOM32: u32 = 2;
/// `PROCESSOR_ARCHITECTURE_ARM`
pub const DEVICE_TYPE_ARM: u32 = 5;
/// `PROCESSOR_ARCHITECTURE_ARM64`
pub const DEVICE_TYPE_ARM64: u32 = 12;

/// The common record, byte packed.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct PackedDeviceInfo {
    pub device_type: u32,       // 0x00
    pub dump_instance_id: u64,  // 0x04
    pub ap_reg_pa: u64,         // 0x0C, cpu context address on x86
    pub va: u64,                // 0x14
    pub pa: u64,                // 0x1C
    pub size: u32,              // 0x24
    pub bug_check_code: u32,    // 0x28
    pub bug_check_params: [u32; 4], // 0x2C
} // size: 0x3C
unsafe impl Pod for PackedDeviceInfo {}

/// The common record with natural alignment, written by old firmware tools.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct UnpackedDeviceInfo {
    pub device_type: u32,       // 0x00
    pub pad0: u32,              // 0x04
    pub dump_instance_id: u64,  // 0x08
    pub ap_reg_pa: u64,         // 0x10
    pub va: u64,                // 0x18
    pub pa: u64,                // 0x20
    pub size: u32,              // 0x28
    pub pad1: u32,              // 0x2C
    pub bug_check_code: u32,    // 0x30
    pub bug_check_params: [u32; 4], // 0x34
    pub pad2: u32,              // 0x44
} // size: 0x48
unsafe impl Pod for UnpackedDeviceInfo {}

/// The current record, prefixed by a signature.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SignedDeviceInfo {
    pub signature: u64,         // 0x00
    pub version: u32,           // 0x08
    pub payload_size: u32,      // 0x0C
    pub info: PackedDeviceInfo, // 0x10
} // size: 0x4C
unsafe impl Pod for SignedDeviceInfo {}

/// Size of the record following the signed header.
pub const DEVICE_INFO_PAYLOAD_SIZE: u32 = size_of::<PackedDeviceInfo>() as u32;

/// Offset of the bug check code in a packed legacy record.
const PACKED_BUG_CHECK_OFFSET: usize = 0x28;
/// Offset of the bug check code in an unpacked legacy record.
const UNPACKED_BUG_CHECK_OFFSET: usize = 0x30;

/// Which layout a trailer was stored in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    Latest,
    Packed,
    Unpacked,
}

/// Device type specific part of the record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceDetails {
    /// x86 devices store the address of the cpu context.
    CpuContext { address: u64 },
    /// ARM devices store the location of the AP register dump and of the in-memory diagnostic data.
    ApReg { ap_reg_pa: u64, va: u64, pa: u64, size: u32 },
}

/// Bug check code and parameters describing the reset.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BugCheck {
    pub code: u32,
    pub params: [u32; 4],
}

/// The decoded device specific information.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceSpecificInfo {
    /// Record version, 0 for the legacy layouts which carry none.
    pub version: u32,
    pub device_type: u32,
    pub dump_instance_id: u64,
    pub details: DeviceDetails,
    pub bug_check: BugCheck,
}

impl DeviceSpecificInfo {
    fn from_fields(
        version: u32,
        device_type: u32,
        dump_instance_id: u64,
        union: (u64, u64, u64, u32),
        bug_check: BugCheck,
    ) -> Result<Self> {
        let details = match device_type {
            DEVICE_TYPE_X86 | DEVICE_TYPE_INTEL_X86 => DeviceDetails::CpuContext { address: union.0 },
            DEVICE_TYPE_QCOM32 | DEVICE_TYPE_ARM | DEVICE_TYPE_ARM64 => DeviceDetails::ApReg {
                ap_reg_pa: union.0,
                va: union.1,
                pa: union.2,
                size: union.3,
            },
            _ => {
                return Err(Error(ErrorOrigin::DeviceInfo, ErrorKind::UnsupportedArchitecture)
                    .log_warn(format!("device_type={}", device_type)))
            }
        };
        Ok(Self {
            version,
            device_type,
            dump_instance_id,
            details,
            bug_check,
        })
    }

    fn from_packed(version: u32, raw: &PackedDeviceInfo) -> Result<Self> {
        let raw = *raw;
        Self::from_fields(
            version,
            raw.device_type,
            raw.dump_instance_id,
            (raw.ap_reg_pa, raw.va, raw.pa, raw.size),
            BugCheck {
                code: raw.bug_check_code,
                params: raw.bug_check_params,
            },
        )
    }

    fn from_unpacked(raw: &UnpackedDeviceInfo) -> Result<Self> {
        Self::from_fields(
            0,
            raw.device_type,
            raw.dump_instance_id,
            (raw.ap_reg_pa, raw.va, raw.pa, raw.size),
            BugCheck {
                code: raw.bug_check_code,
                params: raw.bug_check_params,
            },
        )
    }

    /// Encodes the record into the byte packed layout.
    pub fn to_packed(&self) -> PackedDeviceInfo {
        let mut raw = PackedDeviceInfo::zeroed();
        raw.device_type = self.device_type;
        raw.dump_instance_id = self.dump_instance_id;
        match self.details {
            DeviceDetails::CpuContext { address } => raw.ap_reg_pa = address,
            DeviceDetails::ApReg {
                ap_reg_pa,
                va,
                pa,
                size,
            } => {
                raw.ap_reg_pa = ap_reg_pa;
                raw.va = va;
                raw.pa = pa;
                raw.size = size;
            }
        }
        raw.bug_check_code = self.bug_check.code;
        raw.bug_check_params = self.bug_check.params;
        raw
    }

    /// Encodes the record into a complete trailer buffer in the current layout.
    pub fn to_buffer(&self) -> [u8; DEVICE_INFO_BUFFER_LEN] {
        let mut signed = SignedDeviceInfo::zeroed();
        signed.signature = DEVICE_INFO_SIGNATURE;
        signed.version = DEVICE_INFO_VERSION;
        signed.payload_size = DEVICE_INFO_PAYLOAD_SIZE;
        signed.info = self.to_packed();

        let mut buf = [0u8; DEVICE_INFO_BUFFER_LEN];
        buf[..size_of::<SignedDeviceInfo>()].copy_from_slice(signed.as_bytes());
        buf
    }

    /// Decodes a trailer buffer, detecting its layout.
    pub fn from_buffer(buf: &[u8]) -> Result<(Self, Layout)> {
        let view = DataView::from(buf);

        if view.try_read::<u64>(0) == Some(DEVICE_INFO_SIGNATURE) {
            let signed = view
                .try_read::<SignedDeviceInfo>(0)
                .ok_or(Error(ErrorOrigin::DeviceInfo, ErrorKind::InvalidBuffer))?;
            let (version, payload_size) = (signed.version, signed.payload_size);
            debug!(
                "device info: version={} payload_size={:x}",
                version, payload_size
            );
            Ok((Self::from_packed(version, &signed.info)?, Layout::Latest))
        } else if view.try_read::<u32>(PACKED_BUG_CHECK_OFFSET) == Some(FATAL_ABNORMAL_RESET_ERROR) {
            let raw = view
                .try_read::<PackedDeviceInfo>(0)
                .ok_or(Error(ErrorOrigin::DeviceInfo, ErrorKind::InvalidBuffer))?;
            Ok((Self::from_packed(0, &raw)?, Layout::Packed))
        } else if view.try_read::<u32>(UNPACKED_BUG_CHECK_OFFSET) == Some(FATAL_ABNORMAL_RESET_ERROR) {
            let raw = view
                .try_read::<UnpackedDeviceInfo>(0)
                .ok_or(Error(ErrorOrigin::DeviceInfo, ErrorKind::InvalidBuffer))?;
            Ok((Self::from_unpacked(&raw)?, Layout::Unpacked))
        } else {
            Err(Error(ErrorOrigin::DeviceInfo, ErrorKind::InvalidDeviceInfo).log_debug("no known layout detected"))
        }
    }
}

/// Writes the trailer at `offset`.
///
/// Signature, version and payload size are always set to the current values.
pub fn write_device_info<W: Write + Seek>(writer: &mut W, info: &DeviceSpecificInfo, offset: u64) -> Result<()> {
    let buf = info.to_buffer();
    writer.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToSeekFile).log_error(format!("offset={:x}: {}", offset, err))
    })?;
    writer.write_all(&buf).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToWriteFile)
            .log_error(format!("offset={:x} len={:x}: {}", offset, buf.len(), err))
    })
}

/// Reads the trailer at `offset` and returns it together with the detected layout.
pub fn read_device_info<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<(DeviceSpecificInfo, Layout)> {
    let mut buf = [0u8; DEVICE_INFO_BUFFER_LEN];
    reader.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToSeekFile).log_error(format!("offset={:x}: {}", offset, err))
    })?;
    reader.read_exact(&mut buf).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToReadFile)
            .log_debug(format!("offset={:x} len={:x}: {}", offset, buf.len(), err))
    })?;
    DeviceSpecificInfo::from_buffer(&buf)
}

/// Appends the trailer at the end of the stream and returns its offset.
pub fn append_device_info<W: Write + Seek>(writer: &mut W, info: &DeviceSpecificInfo) -> Result<u64> {
    let offset = writer.seek(SeekFrom::End(0)).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToSeekFile).log_error(err)
    })?;
    write_device_info(writer, info, offset)?;
    info!(
        "appended device info at {:x}: type={} bug_check={:x}",
        offset, info.device_type, info.bug_check.code
    );
    Ok(offset)
}

/// Reads the trailer from the last 1024 bytes of the stream.
pub fn read_appended_device_info<R: Read + Seek>(reader: &mut R) -> Result<(DeviceSpecificInfo, Layout)> {
    let len = reader.seek(SeekFrom::End(0)).map_err(|err| {
        Error(ErrorOrigin::DeviceInfo, ErrorKind::UnableToSeekFile).log_error(err)
    })?;
    let offset = len
        .checked_sub(DEVICE_INFO_BUFFER_LEN as u64)
        .ok_or(Error(ErrorOrigin::DeviceInfo, ErrorKind::EndOfMedium))?;
    read_device_info(reader, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn arm_info() -> DeviceSpecificInfo {
        DeviceSpecificInfo {
            version: DEVICE_INFO_VERSION,
            device_type: DEVICE_TYPE_ARM64,
            dump_instance_id: 7,
            details: DeviceDetails::ApReg {
                ap_reg_pa: 0x8600_0000,
                va: 0xFFFF_F800_1234_0000,
                pa: 0x8610_0000,
                size: 0x2000,
            },
            bug_check: BugCheck {
                code: FATAL_ABNORMAL_RESET_ERROR,
                params: [2, 1, 0, 0x1234_0000],
            },
        }
    }

    fn legacy_packed(info: &DeviceSpecificInfo) -> Vec<u8> {
        let mut buf = vec![0u8; DEVICE_INFO_BUFFER_LEN];
        buf[..size_of::<PackedDeviceInfo>()].copy_from_slice(info.to_packed().as_bytes());
        buf
    }

    fn legacy_unpacked(info: &DeviceSpecificInfo) -> Vec<u8> {
        let packed = info.to_packed();
        let mut raw = UnpackedDeviceInfo::zeroed();
        raw.device_type = packed.device_type;
        raw.dump_instance_id = packed.dump_instance_id;
        raw.ap_reg_pa = packed.ap_reg_pa;
        raw.va = packed.va;
        raw.pa = packed.pa;
        raw.size = packed.size;
        raw.bug_check_code = packed.bug_check_code;
        raw.bug_check_params = packed.bug_check_params;

        let mut buf = vec![0u8; DEVICE_INFO_BUFFER_LEN];
        buf[..size_of::<UnpackedDeviceInfo>()].copy_from_slice(raw.as_bytes());
        buf
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<PackedDeviceInfo>(), 60);
        assert_eq!(size_of::<UnpackedDeviceInfo>(), 72);
        assert_eq!(size_of::<SignedDeviceInfo>(), 76);
        assert_eq!(DEVICE_INFO_PAYLOAD_SIZE, 60);
    }

    #[test]
    fn test_field_offsets() {
        let raw = arm_info().to_packed();
        let bytes = raw.as_bytes();
        assert_eq!(&bytes[0x28..0x2C], &FATAL_ABNORMAL_RESET_ERROR.to_le_bytes());
        assert_eq!(&bytes[0x0C..0x14], &0x8600_0000u64.to_le_bytes());

        let unpacked = legacy_unpacked(&arm_info());
        assert_eq!(&unpacked[0x30..0x34], &FATAL_ABNORMAL_RESET_ERROR.to_le_bytes());
        assert_eq!(&unpacked[0x10..0x18], &0x8600_0000u64.to_le_bytes());
    }

    #[test]
    fn write_read_latest() {
        let info = arm_info();
        let mut stream = Cursor::new(vec![0xFFu8; 0x100]);
        assert_eq!(append_device_info(&mut stream, &info).unwrap(), 0x100);
        assert_eq!(stream.get_ref().len(), 0x100 + DEVICE_INFO_BUFFER_LEN);
        assert_eq!(&stream.get_ref()[0x100..0x108], b"DevSpInf");

        assert_eq!(
            read_device_info(&mut stream, 0x100).unwrap(),
            (info, Layout::Latest)
        );
        assert_eq!(
            read_appended_device_info(&mut stream).unwrap(),
            (info, Layout::Latest)
        );
    }

    #[test]
    fn read_legacy_layouts() {
        let info = DeviceSpecificInfo {
            version: 0,
            ..arm_info()
        };
        assert_eq!(
            DeviceSpecificInfo::from_buffer(&legacy_packed(&info)).unwrap(),
            (info, Layout::Packed)
        );
        assert_eq!(
            DeviceSpecificInfo::from_buffer(&legacy_unpacked(&info)).unwrap(),
            (info, Layout::Unpacked)
        );
    }

    #[test]
    fn read_x86() {
        let info = DeviceSpecificInfo {
            version: 0,
            device_type: DEVICE_TYPE_INTEL_X86,
            dump_instance_id: 0,
            details: DeviceDetails::CpuContext { address: 0x7FF0_0000 },
            bug_check: BugCheck {
                code: FATAL_ABNORMAL_RESET_ERROR,
                params: [2, 1, 0, 0xFFFF_FFFF],
            },
        };
        let (decoded, layout) = DeviceSpecificInfo::from_buffer(&legacy_unpacked(&info)).unwrap();
        assert_eq!(layout, Layout::Unpacked);
        assert_eq!(decoded.details, DeviceDetails::CpuContext { address: 0x7FF0_0000 });
        assert_eq!(decoded, info);
    }

    #[test]
    fn record_version_kept() {
        let mut buf = arm_info().to_buffer();
        buf[0x08..0x0C].copy_from_slice(&3u32.to_le_bytes());
        let (decoded, layout) = DeviceSpecificInfo::from_buffer(&buf).unwrap();
        assert_eq!(layout, Layout::Latest);
        assert_eq!(decoded.version, 3);
        assert_eq!(decoded.bug_check, arm_info().bug_check);

        // rewriting stamps the current version
        let mut stream = Cursor::new(Vec::new());
        write_device_info(&mut stream, &decoded, 0).unwrap();
        assert_eq!(
            read_device_info(&mut stream, 0).unwrap().0.version,
            DEVICE_INFO_VERSION
        );
    }

    #[test]
    fn no_layout() {
        let buf = vec![0u8; DEVICE_INFO_BUFFER_LEN];
        assert_eq!(
            DeviceSpecificInfo::from_buffer(&buf).unwrap_err(),
            Error(ErrorOrigin::DeviceInfo, ErrorKind::InvalidDeviceInfo)
        );

        // legacy records without the abnormal reset bug check cannot be detected
        let mut info = arm_info();
        info.bug_check.code = 0x1;
        assert!(DeviceSpecificInfo::from_buffer(&legacy_packed(&info)).is_err());

        let mut short = Cursor::new(vec![0u8; 0x10]);
        assert_eq!(
            read_device_info(&mut short, 0).unwrap_err().1,
            ErrorKind::UnableToReadFile
        );
    }

    #[test]
    fn unsupported_architecture() {
        let mut info = arm_info();
        info.device_type = 9;
        let err = DeviceSpecificInfo::from_buffer(&info.to_buffer()).unwrap_err();
        assert_eq!(err.1, ErrorKind::UnsupportedArchitecture);
    }
}
