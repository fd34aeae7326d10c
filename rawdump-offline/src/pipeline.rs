/*!
End to end processing of a raw dump.

The located dump is brought into a single file in the output directory,
either by copying the dump partition or by collating the section files of a
split dump. The file is then validated, the reset information is extracted
and the device specific info is appended to it.
*/

use crate::config::OfflineConfig;
use crate::discovery::{locate, DumpLocation};
use crate::platform::{Extractor, ProcessorArchitecture, ResetReason};
use crate::variables::{dump_instance, VariableStore};

use rawdump_core::collate::CollatePlan;
use rawdump_core::device::{DeviceIo, DeviceTarget, PartitionSelector};
use rawdump_core::devinfo::{append_device_info, DeviceSpecificInfo};
use rawdump_core::dump::validate_header;
use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::info;

/// Summary of a processed dump.
#[derive(Clone, Debug)]
pub struct ProcessReport {
    /// The processed dump file
    pub output: PathBuf,
    pub dump_size: u64,
    pub sections: u32,
    pub ddr_ranges: usize,
    /// Sections of a split dump without a file
    pub missing_sections: usize,
    pub truncated: bool,
    pub reset: ResetReason,
    pub device_info: DeviceSpecificInfo,
    /// Offset of the appended device specific info
    pub device_info_offset: u64,
}

impl fmt::Display for ProcessReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "output: {}", self.output.display())?;
        writeln!(
            f,
            "dump size: {:x} sections={} ddr_ranges={} missing={}{}",
            self.dump_size,
            self.sections,
            self.ddr_ranges,
            self.missing_sections,
            if self.truncated { " (truncated)" } else { "" }
        )?;
        writeln!(f, "reset: {}", self.reset)?;
        write!(
            f,
            "bug check: {:x} {:x?} (device info at {:x})",
            self.device_info.bug_check.code, self.device_info.bug_check.params, self.device_info_offset
        )
    }
}

fn architecture(config: &OfflineConfig) -> ProcessorArchitecture {
    config
        .architecture
        .map(ProcessorArchitecture::from_u16)
        .unwrap_or_else(ProcessorArchitecture::host)
}

fn create_output(config: &OfflineConfig, output_dir: &Path) -> Result<(PathBuf, File)> {
    fs::create_dir_all(output_dir).map_err(|err| {
        Error(ErrorOrigin::Pipeline, ErrorKind::InvalidPath).log_error(format!("{}: {}", output_dir.display(), err))
    })?;

    let path = config.dump_path(output_dir);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|err| {
            Error(ErrorOrigin::Pipeline, ErrorKind::UnableToOpenFile).log_error(format!("{}: {}", path.display(), err))
        })?;
    Ok((path, file))
}

/// Locates the dump and processes it.
pub fn process_dump<S: VariableStore>(config: &OfflineConfig, store: &mut S) -> Result<ProcessReport> {
    let source = locate(config)?;
    info!("processing {} into {}", source.location, source.output_dir.display());

    match source.location {
        DumpLocation::Partition { device, partition } => {
            let mut device_io = DeviceIo::new(config.device_options());
            device_io.open(&DeviceTarget::Name(device))?;
            device_io.select_partition(&PartitionSelector::Index(partition.index))?;
            process_partition(config, &mut device_io, &source.output_dir, store)
        }
        DumpLocation::File { path, .. } => process_split_dump(config, &path, &source.output_dir, store),
    }
}

/// Copies the selected dump partition of `device` into the output directory and processes the copy.
pub fn process_partition<T: Read + Write + Seek, S: VariableStore>(
    config: &OfflineConfig,
    device: &mut DeviceIo<T>,
    output_dir: &Path,
    store: &mut S,
) -> Result<ProcessReport> {
    let header = validate_header(device)?;
    info!("dump partition header: {}", header);

    let (path, mut file) = create_output(config, output_dir)?;
    device.copy_partition_to(&mut file)?;
    finish(config, path, file, 0, store)
}

/// Collates a dump which was written as one file per section and processes the result.
///
/// `header_path` is the `rawdump.bin` holding the header, section files are expected next to it.
pub fn process_split_dump<S: VariableStore>(
    config: &OfflineConfig,
    header_path: &Path,
    output_dir: &Path,
    store: &mut S,
) -> Result<ProcessReport> {
    let mut header_file = File::open(header_path).map_err(|err| {
        Error(ErrorOrigin::Pipeline, ErrorKind::UnableToOpenFile).log_error(format!("{}: {}", header_path.display(), err))
    })?;
    let header = validate_header(&mut header_file)?;

    let dir = header_path
        .parent()
        .ok_or_else(|| Error(ErrorOrigin::Pipeline, ErrorKind::InvalidPath).log_error(header_path.display()))?;
    let plan = CollatePlan::new(&header, dir)?;

    let (path, mut file) = create_output(config, output_dir)?;
    plan.write(&mut file)?;
    finish(config, path, file, plan.missing_count(), store)
}

fn finish<S: VariableStore>(
    config: &OfflineConfig,
    path: PathBuf,
    mut file: File,
    missing_sections: usize,
    store: &mut S,
) -> Result<ProcessReport> {
    file.flush().map_err(|err| {
        Error(ErrorOrigin::Pipeline, ErrorKind::UnableToWriteFile).log_error(format!("{}: {}", path.display(), err))
    })?;

    let header = validate_header(&mut file)?;
    let table = header.validate_sections()?;
    let map = table.build_memory_map()?;

    let instance = dump_instance(store);
    let mut extractor = Extractor::new(architecture(config))?;
    extractor.process(&mut file, &table, &map, store, config.reset_variables)?;

    let device_info = extractor.device_info(instance);
    let device_info_offset = append_device_info(&mut file, &device_info)?;
    info!("device specific info appended at {:x}", device_info_offset);

    Ok(ProcessReport {
        output: path,
        dump_size: header.dump_size(),
        sections: header.sections_count(),
        ddr_ranges: map.len(),
        missing_sections,
        truncated: table.stats().truncated,
        reset: ResetReason::from_bug_check(&device_info.bug_check),
        device_info,
        device_info_offset,
    })
}
