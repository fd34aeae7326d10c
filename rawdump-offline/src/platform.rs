/*!
Architecture specific extraction of reset information.

The extractor is chosen once from the processor architecture.
`Extractor::IntelX86` only requires the cpu context address of the dump header,
`Extractor::Qcom` inspects vendor sections, the AP register dump and the
in-memory diagnostic buffer to classify the reset.
*/

use crate::variables::{InMemDataInfo, VariableStore, AP_REG_ADDRESS, IN_MEMORY_DATA_INFO};

use rawdump_core::devinfo::{
    BugCheck, DeviceDetails, DeviceSpecificInfo, DEVICE_INFO_VERSION, DEVICE_TYPE_ARM, DEVICE_TYPE_ARM64, DEVICE_TYPE_X86,
    FATAL_ABNORMAL_RESET_ERROR,
};
use rawdump_core::dump::{DdrMemoryMap, SectionTable, SectionType};
use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};
use rawdump_core::sv;

use std::cmp::min;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use dataview::{Pod, PodMethods};
use log::{debug, info, warn};
use smallvec::SmallVec;

/// First parameter of the bug check, describes what triggered the reset.
pub const RESET_WATCHDOG: u32 = 0x2;
pub const RESET_FALLBACK: u32 = 0x3;
pub const RESET_THERMAL: u32 = 0x4;
pub const RESET_USER_INITIATED: u32 = 0x5;
pub const RESET_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Second parameter of a watchdog reset.
pub const WATCHDOG_NON_SECURE: u32 = 0x1;
pub const WATCHDOG_SECURE: u32 = 0x2;

const DEFAULT_PARAM4: u32 = 0xFFFF_FFFF;

pub const AP_REG_MAGIC: u32 = 0x4443_4151;
pub const AP_REG_MAX_CPUS: usize = 4;
/// The watchdog bit of a per core status.
pub const SC_STATUS_WDT: u32 = 0x2;

/// Signature at the start of the in-memory diagnostic data.
pub const DIAG_BUFFER_SIGNATURE: [u8; 16] = *br"\/\/PCl2D|\/|PGo";
/// Size of the sentinel preceding the in-memory dump header.
const DIAG_SENTINEL_SIZE: u64 = 0x1C;
/// Offset of the bug check code in the in-memory dump header.
const DIAG_BUG_CHECK_OFFSET: u64 = 0x28;
/// Offset of the comment field in the in-memory dump header.
const DIAG_COMMENT_OFFSET: u64 = 0x820;
/// Minimum size of the in-memory diagnostic data.
pub const DIAG_BUFFER_MIN_SIZE: u64 = 0x50;

const RST_STAT_LEN: usize = 4;
const PMIC_PON_LEN: usize = 8;

/// Processor architecture as reported by the platform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessorArchitecture {
    Intel,
    Arm,
    Arm64,
    Amd64,
    Unknown(u16),
}

impl ProcessorArchitecture {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => ProcessorArchitecture::Intel,
            5 => ProcessorArchitecture::Arm,
            9 => ProcessorArchitecture::Amd64,
            12 => ProcessorArchitecture::Arm64,
            _ => ProcessorArchitecture::Unknown(raw),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ProcessorArchitecture::Intel => 0,
            ProcessorArchitecture::Arm => 5,
            ProcessorArchitecture::Amd64 => 9,
            ProcessorArchitecture::Arm64 => 12,
            ProcessorArchitecture::Unknown(raw) => raw,
        }
    }

    /// The architecture this program was compiled for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86") {
            ProcessorArchitecture::Intel
        } else if cfg!(target_arch = "x86_64") {
            ProcessorArchitecture::Amd64
        } else if cfg!(target_arch = "arm") {
            ProcessorArchitecture::Arm
        } else if cfg!(target_arch = "aarch64") {
            ProcessorArchitecture::Arm64
        } else {
            ProcessorArchitecture::Unknown(0xFFFF)
        }
    }
}

/// What triggered the reset, derived from the bug check parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetReason {
    Thermal,
    UserInitiated,
    Watchdog { secure: bool },
    /// A bug check which failed to produce a regular dump
    Fallback { bug_check_code: u32 },
    Unknown,
}

impl ResetReason {
    pub fn from_bug_check(bug_check: &BugCheck) -> Self {
        match bug_check.params[0] {
            RESET_THERMAL => ResetReason::Thermal,
            RESET_USER_INITIATED => ResetReason::UserInitiated,
            RESET_WATCHDOG => ResetReason::Watchdog {
                secure: bug_check.params[1] == WATCHDOG_SECURE,
            },
            RESET_FALLBACK => ResetReason::Fallback {
                bug_check_code: bug_check.params[1],
            },
            _ => ResetReason::Unknown,
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResetReason::Thermal => write!(f, "thermal reset"),
            ResetReason::UserInitiated => write!(f, "user initiated reset"),
            ResetReason::Watchdog { secure: true } => write!(f, "secure watchdog bite"),
            ResetReason::Watchdog { secure: false } => write!(f, "non-secure watchdog bite"),
            ResetReason::Fallback { bug_check_code } => {
                write!(f, "failed bug check {:x}", bug_check_code)
            }
            ResetReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Extracts the reset information of a dump.
#[derive(Clone, Debug)]
pub enum Extractor {
    IntelX86(IntelX86),
    Qcom(Qcom),
}

impl Extractor {
    pub fn new(architecture: ProcessorArchitecture) -> Result<Self> {
        match architecture {
            ProcessorArchitecture::Intel => Ok(Extractor::IntelX86(IntelX86::default())),
            ProcessorArchitecture::Arm => Ok(Extractor::Qcom(Qcom::new(false))),
            ProcessorArchitecture::Arm64 => Ok(Extractor::Qcom(Qcom::new(true))),
            _ => Err(Error(ErrorOrigin::Platform, ErrorKind::UnsupportedArchitecture)
                .log_error(format!("{:?}", architecture))),
        }
    }

    /// Collects the information required to build the bug check.
    pub fn process<R: Read + Seek, S: VariableStore>(
        &mut self,
        reader: &mut R,
        table: &SectionTable,
        map: &DdrMemoryMap,
        store: &mut S,
        reset_variables: bool,
    ) -> Result<()> {
        match self {
            Extractor::IntelX86(intel) => intel.process(table),
            Extractor::Qcom(qcom) => qcom.process(reader, table, map, store, reset_variables),
        }
    }

    pub fn bug_check(&self) -> BugCheck {
        let bug_check = match self {
            Extractor::IntelX86(intel) => intel.bug_check(),
            Extractor::Qcom(qcom) => qcom.bug_check(),
        };
        info!(
            "bug check: code={:x} params={:x?}",
            bug_check.code, bug_check.params
        );
        bug_check
    }

    pub fn device_info(&self, dump_instance_id: u64) -> DeviceSpecificInfo {
        let bug_check = self.bug_check();
        match self {
            Extractor::IntelX86(intel) => DeviceSpecificInfo {
                version: DEVICE_INFO_VERSION,
                device_type: DEVICE_TYPE_X86,
                dump_instance_id,
                details: DeviceDetails::CpuContext {
                    address: intel.cpu_context_address,
                },
                bug_check,
            },
            Extractor::Qcom(qcom) => DeviceSpecificInfo {
                version: DEVICE_INFO_VERSION,
                device_type: if qcom.is_64bit {
                    DEVICE_TYPE_ARM64
                } else {
                    DEVICE_TYPE_ARM
                },
                dump_instance_id,
                details: DeviceDetails::ApReg {
                    ap_reg_pa: qcom.ap_reg_address,
                    va: qcom.in_mem.va,
                    pa: qcom.in_mem.pa,
                    size: qcom.in_mem.size as u32,
                },
                bug_check,
            },
        }
    }
}

/// Intel x86 devices only implement watchdog resets.
#[derive(Clone, Debug, Default)]
pub struct IntelX86 {
    cpu_context_address: u64,
}

impl IntelX86 {
    fn process(&mut self, table: &SectionTable) -> Result<()> {
        self.cpu_context_address = table.header().cpu_context();
        if self.cpu_context_address == 0 {
            return Err(Error(ErrorOrigin::Platform, ErrorKind::NotFound).log_error("cpu context is not present"));
        }
        debug!("cpu context at {:x}", self.cpu_context_address);
        Ok(())
    }

    fn bug_check(&self) -> BugCheck {
        BugCheck {
            code: FATAL_ABNORMAL_RESET_ERROR,
            params: [RESET_WATCHDOG, WATCHDOG_NON_SECURE, 0, DEFAULT_PARAM4],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct ApRegHeader {
    magic: u32,
    version: u32,
    cpu_count: u32,
}
unsafe impl Pod for ApRegHeader {}

/// The header of the AP register dump together with the per core status.
#[derive(Clone, Debug)]
pub struct ApReg {
    pub version: u32,
    pub cpu_count: u32,
    /// Legacy 32 bit layout, identified by its magic
    pub legacy: bool,
    /// Per core status, only read for the legacy layout
    pub cpu_status: SmallVec<[u32; AP_REG_MAX_CPUS]>,
}

impl ApReg {
    fn read<R: Read + Seek>(map: &DdrMemoryMap, reader: &mut R, addr: u64) -> Result<Self> {
        let header = map.read_physical_pod::<ApRegHeader, R>(reader, addr)?;
        let legacy = header.magic == AP_REG_MAGIC;

        let mut cpu_status = SmallVec::new();
        if legacy {
            let count = min(header.cpu_count as usize, AP_REG_MAX_CPUS);
            for core in 0..count {
                let status_addr = offset_addr(addr, (std::mem::size_of::<ApRegHeader>() + 4 * core) as u64)?;
                cpu_status.push(map.read_physical_pod::<u32, R>(reader, status_addr)?);
            }
        } else {
            debug!("AP_REG magic {:x} not found, assuming 64 bit layout", header.magic);
        }

        Ok(Self {
            version: header.version,
            cpu_count: header.cpu_count,
            legacy,
            cpu_status,
        })
    }

    /// At least one core reports a watchdog bite.
    pub fn is_non_secure_watchdog(&self) -> bool {
        self.cpu_status.iter().any(|s| s & SC_STATUS_WDT != 0)
    }
}

/// Qualcomm devices.
#[derive(Clone, Debug)]
pub struct Qcom {
    is_64bit: bool,
    ap_reg_address: u64,
    ap_reg: Option<ApReg>,
    in_mem: InMemDataInfo,
    /// Bug check code and parameters found in the in-memory diagnostic data
    diag_bug_check: Option<[u32; 5]>,
    rst_stat: Option<[u8; RST_STAT_LEN]>,
    pmic_pon: Option<[u8; PMIC_PON_LEN]>,
}

impl Qcom {
    pub fn new(is_64bit: bool) -> Self {
        Self {
            is_64bit,
            ap_reg_address: 0,
            ap_reg: None,
            in_mem: InMemDataInfo::default(),
            diag_bug_check: None,
            rst_stat: None,
            pmic_pon: None,
        }
    }

    pub fn ap_reg(&self) -> Option<&ApReg> {
        self.ap_reg.as_ref()
    }

    fn process<R: Read + Seek, S: VariableStore>(
        &mut self,
        reader: &mut R,
        table: &SectionTable,
        map: &DdrMemoryMap,
        store: &mut S,
        reset_variables: bool,
    ) -> Result<()> {
        self.read_sv_sections(reader, table)?;

        self.ap_reg_address = store.read_u64(AP_REG_ADDRESS)?;
        if self.ap_reg_address == 0 {
            return Err(Error(ErrorOrigin::Platform, ErrorKind::InvalidRange).log_error("AP_REG address is zero"));
        }
        info!("AP_REG at {:x}", self.ap_reg_address);
        self.ap_reg = Some(ApReg::read(map, reader, self.ap_reg_address)?);

        // the diagnostic buffer is optional
        if let Err(err) = self.read_diag_buffer(reader, map, store, reset_variables) {
            warn!("unable to build the diagnostic buffer: {}", err);
        }
        Ok(())
    }

    /// Copies the contents of the `RST_STAT` and `PMIC_PON` sections.
    fn read_sv_sections<R: Read + Seek>(&mut self, reader: &mut R, table: &SectionTable) -> Result<()> {
        let sections = table
            .header()
            .sections()
            .filter(|s| s.section_type() == SectionType::SvSpecific);
        for section in sections {
            let known = sv::by_name(&section.name());
            if known.guid == sv::RST_STAT_GUID {
                let mut rst_stat = [0u8; RST_STAT_LEN];
                read_section_prefix(reader, section.offset(), section.size(), &mut rst_stat)?;
                info!("RST_STAT: {:x?}", rst_stat);
                self.rst_stat = Some(rst_stat);
            } else if known.guid == sv::PMIC_PON_GUID {
                let mut pmic_pon = [0u8; PMIC_PON_LEN];
                read_section_prefix(reader, section.offset(), section.size(), &mut pmic_pon)?;
                info!("PMIC_PON: {:x?}", pmic_pon);
                self.pmic_pon = Some(pmic_pon);
            }
        }
        Ok(())
    }

    fn read_diag_buffer<R: Read + Seek, S: VariableStore>(
        &mut self,
        reader: &mut R,
        map: &DdrMemoryMap,
        store: &mut S,
        reset_variables: bool,
    ) -> Result<()> {
        let in_mem = store.read_pod::<InMemDataInfo>(IN_MEMORY_DATA_INFO)?;
        if reset_variables {
            store.write_variable(IN_MEMORY_DATA_INFO, InMemDataInfo::default().as_bytes())?;
        }
        debug!(
            "in-memory data: va={:x} pa={:x} size={:x}",
            in_mem.va, in_mem.pa, in_mem.size
        );
        self.in_mem = in_mem;

        if in_mem.size == 0 || in_mem.pa == 0 || in_mem.va == 0 {
            return Err(Error(ErrorOrigin::Platform, ErrorKind::InvalidDeviceInfo).log_warn("in-memory data info is incomplete"));
        }
        if in_mem.size < DIAG_BUFFER_MIN_SIZE {
            return Err(Error(ErrorOrigin::Platform, ErrorKind::InvalidBuffer).log_warn(format!(
                "in-memory data too small: expected={:x} actual={:x}",
                DIAG_BUFFER_MIN_SIZE, in_mem.size
            )));
        }

        let mut signature = [0u8; 16];
        map.read_physical_exact(reader, in_mem.pa, &mut signature)?;
        if signature != DIAG_BUFFER_SIGNATURE {
            return Err(Error(ErrorOrigin::Platform, ErrorKind::InvalidSignature)
                .log_warn(format!("diagnostic buffer signature {:x?}", signature)));
        }

        let bug_check = map.read_physical_pod::<[u32; 5], R>(
            reader,
            offset_addr(in_mem.pa, DIAG_SENTINEL_SIZE + DIAG_BUG_CHECK_OFFSET)?,
        )?;
        info!("in-memory bug check: {:x?}", bug_check);

        match offset_addr(in_mem.pa, DIAG_SENTINEL_SIZE + DIAG_COMMENT_OFFSET)
            .and_then(|addr| map.read_physical_pod::<u32, R>(reader, addr))
        {
            Ok(addr) => debug!("address of dummy function: {:x}", addr),
            Err(err) => debug!("unable to read the address of the dummy function: {}", err),
        }

        self.diag_bug_check = Some(bug_check);
        Ok(())
    }

    fn bug_check(&self) -> BugCheck {
        let mut bug_check = BugCheck {
            code: FATAL_ABNORMAL_RESET_ERROR,
            params: [RESET_UNKNOWN, 0, 0, DEFAULT_PARAM4],
        };
        if self.diag_bug_check.is_some() {
            bug_check.params[3] = self.in_mem.va as u32;
        }

        if self.classify_reset(&mut bug_check) {
            self.check_fallback(&mut bug_check);
        }
        bug_check
    }

    /// Fills in the reset trigger, returns true if a failed bug check has to be checked for.
    fn classify_reset(&self, bug_check: &mut BugCheck) -> bool {
        let rst_stat = match self.rst_stat {
            Some(rst_stat) => rst_stat[0],
            None => {
                info!("RST_STAT is not available, unable to determine the reset trigger");
                return true;
            }
        };

        if rst_stat & 0x8 != 0 {
            info!("trigger is a thermal reset");
            bug_check.params[0] = RESET_THERMAL;
            return false;
        }

        if rst_stat == 0 {
            // an extended power button hold is wired through the PMIC
            match self.pmic_pon {
                Some(pmic_pon) if pmic_pon[2] == 0x2 => {
                    info!("trigger is an extended power button hold");
                    bug_check.params[0] = RESET_USER_INITIATED;
                    return true;
                }
                Some(_) => debug!("PS_HOLD not set, not a power button hold"),
                None => debug!("PMIC_PON is not available"),
            }
        }

        if rst_stat & 0x2 != 0 {
            bug_check.params[0] = RESET_WATCHDOG;
            bug_check.params[1] = WATCHDOG_SECURE;
            match &self.ap_reg {
                Some(ap_reg) if ap_reg.is_non_secure_watchdog() => {
                    info!("trigger is a non-secure watchdog bite");
                    bug_check.params[1] = WATCHDOG_NON_SECURE;
                    return true;
                }
                Some(_) => {
                    info!("trigger is a secure watchdog bite");
                    return false;
                }
                None => info!("AP_REG is not valid, unable to determine the watchdog type"),
            }
        }

        true
    }

    fn check_fallback(&self, bug_check: &mut BugCheck) {
        match self.diag_bug_check {
            Some(data) if data[0] != FATAL_ABNORMAL_RESET_ERROR && data[0] != 0 => {
                info!("original bug check {:x} failed to produce a dump", data[0]);
                bug_check.params[2] = bug_check.params[0];
                bug_check.params[1] = data[0];
                bug_check.params[0] = RESET_FALLBACK;
            }
            Some(_) => debug!("not a failed bug check"),
            None => debug!("diagnostic buffer not available, unable to check for a failed bug check"),
        }
    }
}

fn offset_addr(base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset).ok_or_else(|| {
        Error(ErrorOrigin::Platform, ErrorKind::Overflow).log_warn(format!("address {:x} + {:x}", base, offset))
    })
}

fn read_section_prefix<R: Read + Seek>(reader: &mut R, offset: u64, size: u64, buf: &mut [u8]) -> Result<()> {
    let len = min(size, buf.len() as u64) as usize;
    reader.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::Platform, ErrorKind::UnableToSeekFile).log_error(format!("offset={:x}: {}", offset, err))
    })?;
    reader.read_exact(&mut buf[..len]).map_err(|err| {
        Error(ErrorOrigin::Platform, ErrorKind::UnableToReadFile)
            .log_error(format!("offset={:x} len={:x}: {}", offset, len, err))
    })
}
