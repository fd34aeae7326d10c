/*!
Locates the raw dump written by the firmware.

A dump is either stored on a dedicated partition of a fixed drive or as a
`rawdump.bin` file (plus section files) on removable media. Removable media
hold the dump in the root directory or in numbered folders, one per capture:

```text
/media/sdcard/1/rawdump.bin
/media/sdcard/1/wpdone.txt     <- already processed
/media/sdcard/2/rawdump.bin
/media/sdcard/2/errfile.txt    <- capture failed
/media/sdcard/3/rawdump.bin    <- chosen
```
*/

use crate::config::OfflineConfig;

use rawdump_core::device::{
    DeviceIo, DeviceTarget, Partition, PartitionSelector, CRASHDUMP_PARTITION, SVRAWDUMP_PARTITION_TYPE,
};
use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

/// Where the dump was found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DumpLocation {
    /// A dump partition on a fixed drive
    Partition { device: String, partition: Partition },
    /// A dump header file on removable media, with the folder number it was found in
    File { path: PathBuf, folder: Option<u32> },
}

impl fmt::Display for DumpLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DumpLocation::Partition { device, partition } => {
                write!(f, "partition '{}' on {}", partition.name, device)
            }
            DumpLocation::File { path, folder: Some(folder) } => {
                write!(f, "{} (folder {})", path.display(), folder)
            }
            DumpLocation::File { path, folder: None } => write!(f, "{}", path.display()),
        }
    }
}

/// A located dump and the directory its processed form is written to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpSource {
    pub location: DumpLocation,
    pub output_dir: PathBuf,
}

/// The dump partition found by `find_partition_in`.
pub struct FoundPartition<T> {
    pub device: DeviceIo<T>,
    pub partition: Partition,
    /// The first drive carries a `CrashDump` partition
    pub legacy: bool,
}

/// Searches already opened drives for the dump partition.
///
/// Drive 0 is additionally checked for a legacy `CrashDump` partition,
/// which moves the output to the legacy output directory.
/// The dump partition is selected on the returned device.
pub fn find_partition_in<T, I>(drives: I) -> Option<FoundPartition<T>>
where
    T: Read + Write + Seek,
    I: IntoIterator<Item = (u32, DeviceIo<T>)>,
{
    let mut legacy = false;
    for (index, mut device) in drives {
        if index == 0 {
            legacy = device
                .partitions()
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(CRASHDUMP_PARTITION));
            if legacy {
                info!("{} carries a legacy {} partition", device.name(), CRASHDUMP_PARTITION);
            }
        }

        match device.select_partition(&PartitionSelector::TypeGuid(SVRAWDUMP_PARTITION_TYPE)) {
            Ok(partition) => {
                let partition = partition.clone();
                info!("found dump partition on {}: {:?}", device.name(), partition);
                return Some(FoundPartition {
                    device,
                    partition,
                    legacy,
                });
            }
            Err(err) => debug!("no dump partition on {}: {}", device.name(), err),
        }
    }
    None
}

/// Opens the configured devices, or the physical drives `0..drive_count`, and searches them for the dump partition.
pub fn find_dump_partition(config: &OfflineConfig) -> Option<FoundPartition<File>> {
    let targets: Vec<DeviceTarget> = if config.devices.is_empty() {
        (0..config.drive_count).map(DeviceTarget::Index).collect()
    } else {
        config
            .devices
            .iter()
            .map(|name| DeviceTarget::Name(name.clone()))
            .collect()
    };

    let drives = targets.into_iter().enumerate().filter_map(|(index, target)| {
        let mut device = DeviceIo::new(config.device_options());
        match device.open(&target) {
            Ok(()) => Some((index as u32, device)),
            Err(err) => {
                debug!("skipping {:?}: {}", target, err);
                None
            }
        }
    });

    find_partition_in(drives)
}

fn marker_exists(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

/// Searches the removable media roots for a dump that was not processed yet.
///
/// The chosen folder is marked as processed right away so that a dump which
/// fails processing is not picked up again.
pub fn find_removable_dump(config: &OfflineConfig) -> Option<DumpLocation> {
    for root in config.search_roots.iter() {
        let path = root.join(&config.dump_file_name);
        if path.is_file() {
            info!("found dump in the root directory: {}", path.display());
            return Some(DumpLocation::File { path, folder: None });
        }
        debug!("no dump in the root directory of {}", root.display());

        for folder in config.first_folder..=config.last_folder {
            let dir = root.join(folder.to_string());
            let path = dir.join(&config.dump_file_name);
            if !path.is_file() {
                continue;
            }

            if marker_exists(&dir, &config.error_marker) {
                info!("skipping {}: the capture reported errors", dir.display());
                continue;
            }
            if marker_exists(&dir, &config.done_marker) {
                debug!("skipping {}: already processed", dir.display());
                continue;
            }

            if let Err(err) = fs::write(dir.join(&config.done_marker), b"") {
                warn!("unable to mark {} as processed: {}", dir.display(), err);
            }
            info!("found dump in folder {}: {}", folder, path.display());
            return Some(DumpLocation::File {
                path,
                folder: Some(folder),
            });
        }
    }
    None
}

/// Finds the dump to be processed, trying the dump partition first.
pub fn locate(config: &OfflineConfig) -> Result<DumpSource> {
    if let Some(found) = find_dump_partition(config) {
        let output_dir = if found.legacy {
            config.legacy_output_dir.clone()
        } else {
            config.output_dir.clone()
        };
        return Ok(DumpSource {
            location: DumpLocation::Partition {
                device: found.device.name().to_string(),
                partition: found.partition,
            },
            output_dir,
        });
    }

    match find_removable_dump(config) {
        Some(location) => Ok(DumpSource {
            location,
            output_dir: config.output_dir.clone(),
        }),
        None => Err(Error(ErrorOrigin::Discovery, ErrorKind::NotFound).log_error("no raw dump found")),
    }
}
