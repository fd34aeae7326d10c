/*!
Known vendor specific (SV) sections.

SV sections are identified by the GUID stored in their section entry.
Every known section also has a file name and a default size which is
used when a section is synthesized.
*/

use crate::types::size;
use crate::types::Guid;

/// A known SV section.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SvSection {
    pub guid: Guid,
    pub name: &'static str,
    pub default_size: u64,
}

pub const AP_REG_GUID: Guid = Guid::new(0xAB3A051F, 0xEF0B, 0x4A5F, [0xA7, 0x9A, 0x80, 0xC2, 0x43, 0xBA, 0x08, 0x48]);
pub const OCIMEM_GUID: Guid = Guid::new(0xD0A267A1, 0x9CA5, 0x471D, [0x8E, 0x9C, 0x79, 0xC9, 0x86, 0xBE, 0x77, 0x77]);
pub const CODERAM_GUID: Guid = Guid::new(0x100B990B, 0x0F9B, 0x40B3, [0x82, 0xEF, 0x06, 0x61, 0x4F, 0x53, 0x05, 0xFE]);
pub const DATARAM_GUID: Guid = Guid::new(0x82233308, 0xCE47, 0x4D52, [0x92, 0x11, 0xF4, 0x2E, 0x89, 0x61, 0x8A, 0xF4]);
pub const MSGRAM_GUID: Guid = Guid::new(0x91A8C35C, 0xA340, 0x4F2E, [0xB7, 0x27, 0x65, 0x39, 0x47, 0xDB, 0x9C, 0x76]);
pub const LPM_GUID: Guid = Guid::new(0x877F61E0, 0xA870, 0x4635, [0x9F, 0x41, 0x33, 0x00, 0x53, 0x20, 0x26, 0x05]);
pub const PMIC_PON_GUID: Guid = Guid::new(0x10D25EDD, 0x1558, 0x4B88, [0xAB, 0x5C, 0xE8, 0x1E, 0x7F, 0x47, 0xDA, 0xD9]);
pub const RST_STAT_GUID: Guid = Guid::new(0xD0352E48, 0xE359, 0x459E, [0x9B, 0xBF, 0x2E, 0x16, 0xE6, 0x28, 0xAC, 0xFB]);
pub const LOAD_GUID: Guid = Guid::new(0x066A56C8, 0xCE2A, 0x4686, [0xB6, 0x10, 0x5B, 0xFC, 0x22, 0xD0, 0xC7, 0xAB]);
pub const RAWDUMP_GUID: Guid = Guid::new(0x0df632e9, 0x5c48, 0x43aa, [0xb8, 0xbd, 0x5f, 0xf6, 0x18, 0x05, 0x02, 0x5f]);
pub const DDR_DATA_GUID: Guid = Guid::new(0x62fb2678, 0x933f, 0x4177, [0x86, 0x29, 0xff, 0x3f, 0x70, 0x55, 0x02, 0xe3]);
pub const UNKNOWN_GUID: Guid = Guid::new(0x6901D825, 0x0E25, 0x4D6C, [0x8C, 0x11, 0xE0, 0xAB, 0x2E, 0x98, 0xCA, 0xEF]);

pub const AP_REG: &str = "AP_REG";
pub const PMIC_PON: &str = "PMIC_PON.BIN";
pub const RST_STAT: &str = "RST_STAT.BIN";

const fn section(guid: Guid, name: &'static str, default_size: u64) -> SvSection {
    SvSection {
        guid,
        name,
        default_size,
    }
}

/// All known SV sections. The `UNKNOWN` entry is last and serves as fallback.
pub const SV_SECTIONS: [SvSection; 16] = [
    section(AP_REG_GUID, AP_REG, 0x1000),
    section(OCIMEM_GUID, "OCIMEM.BIN", 0x10000),
    section(CODERAM_GUID, "CODERAM.BIN", 0x28000),
    section(DATARAM_GUID, "DATARAM.BIN", 0x14000),
    section(MSGRAM_GUID, "MSGRAM.BIN", 0x4000),
    section(LPM_GUID, "LPM.BIN", 0x10000),
    section(Guid::NIL, "IPA_SRAM.BIN", 0x3efc),
    section(Guid::NIL, "IPA_MBOX.BIN", 0xfc),
    section(Guid::NIL, "IPA_IRAM.BIN", 0x2000),
    section(Guid::NIL, "IPA_DRAM.BIN", 0x3efc),
    section(PMIC_PON_GUID, PMIC_PON, 8),
    section(RST_STAT_GUID, RST_STAT, 4),
    section(DDR_DATA_GUID, "DDR_DATA.BIN", 0x100000),
    section(LOAD_GUID, "load.cmm", 0x510),
    section(RAWDUMP_GUID, "rawdump.bin", size::mb(512)),
    section(UNKNOWN_GUID, "UNKNOWN", 0),
];

/// The fallback entry for sections which are not known.
pub fn unknown() -> &'static SvSection {
    &SV_SECTIONS[SV_SECTIONS.len() - 1]
}

/// Looks up a section by its file name, ignoring ascii case.
///
/// Unknown names resolve to the `UNKNOWN` entry.
pub fn by_name(name: &str) -> &'static SvSection {
    SV_SECTIONS
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(unknown)
}

/// Looks up a section by its GUID. Sections without a GUID can not be found this way.
pub fn by_guid(guid: &Guid) -> Option<&'static SvSection> {
    if guid.is_nil() {
        return None;
    }
    SV_SECTIONS.iter().find(|s| s.guid == *guid)
}
