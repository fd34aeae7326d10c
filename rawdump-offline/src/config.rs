/*!
Configuration of the offline dump service.

The configuration is loaded from a [TOML](https://toml.io/) file.
Every field is optional, missing fields take their default value.

# Examples

```toml
devices = ["/dev/mmcblk0"]
search_roots = ["/media/sdcard"]
output_dir = "/var/crash/rawdump"
cache_blocks = 0x1000
architecture = 12
variables = "/etc/rawdump/variables.toml"
```
*/

use rawdump_core::device::{DeviceOptions, DEFAULT_CACHE_BLOCKS};
use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const RAWDUMP_FILE_NAME: &str = "rawdump.bin";
pub const ERROR_MARKER_NAME: &str = "errfile.txt";
pub const DONE_MARKER_NAME: &str = "wpdone.txt";
pub const DEFAULT_OUTPUT_DIR: &str = "Data/CrashDump";
pub const LEGACY_OUTPUT_DIR: &str = "CrashDump";

pub const FIRST_DUMP_FOLDER: u32 = 1;
pub const LAST_DUMP_FOLDER: u32 = 100;

/// Number of physical drives probed for a dump partition when no devices are configured.
pub const DEFAULT_DRIVE_COUNT: u32 = 8;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfflineConfig {
    /// Block devices searched for a dump partition, drives `0..drive_count` if empty
    pub devices: Vec<String>,
    pub drive_count: u32,
    /// Roots of removable volumes searched for `rawdump.bin`
    pub search_roots: Vec<PathBuf>,
    pub first_folder: u32,
    pub last_folder: u32,
    pub dump_file_name: String,
    pub error_marker: String,
    pub done_marker: String,
    /// Directory receiving the processed dump
    pub output_dir: PathBuf,
    /// Used instead of `output_dir` if the first drive carries a legacy `CrashDump` partition
    pub legacy_output_dir: PathBuf,
    pub block_size: Option<usize>,
    pub cache_blocks: usize,
    /// Processor architecture override, detected from the host otherwise
    pub architecture: Option<u16>,
    /// TOML file backing the firmware variable store
    pub variables: Option<PathBuf>,
    /// Zeroes the in-memory data info variable once it was consumed
    pub reset_variables: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            drive_count: DEFAULT_DRIVE_COUNT,
            search_roots: Vec::new(),
            first_folder: FIRST_DUMP_FOLDER,
            last_folder: LAST_DUMP_FOLDER,
            dump_file_name: RAWDUMP_FILE_NAME.to_string(),
            error_marker: ERROR_MARKER_NAME.to_string(),
            done_marker: DONE_MARKER_NAME.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            legacy_output_dir: PathBuf::from(LEGACY_OUTPUT_DIR),
            block_size: None,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            architecture: None,
            variables: None,
            reset_variables: true,
        }
    }
}

impl OfflineConfig {
    /// Loads the configuration from a TOML file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            Error(ErrorOrigin::Config, ErrorKind::UnableToOpenFile).log_error(format!("{}: {}", path.display(), err))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: OfflineConfig = toml::from_str(contents).map_err(|err| {
            Error(ErrorOrigin::Config, ErrorKind::Configuration)
                .log_error(format!("unable to parse the configuration: {}", err))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.first_folder > self.last_folder {
            return Err(Error(ErrorOrigin::Config, ErrorKind::Configuration).log_error(format!(
                "empty folder range {}..={}",
                self.first_folder, self.last_folder
            )));
        }
        if let Some(block_size) = self.block_size {
            if !block_size.is_power_of_two() || !(512..=4096).contains(&block_size) {
                return Err(Error(ErrorOrigin::Config, ErrorKind::Configuration)
                    .log_error(format!("unsupported block size {:x}", block_size)));
            }
        }
        if self.cache_blocks == 0 {
            return Err(Error(ErrorOrigin::Config, ErrorKind::Configuration).log_error("cache_blocks=0"));
        }
        Ok(())
    }

    /// Options for opening block devices.
    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            block_size: self.block_size,
            cache_blocks: self.cache_blocks,
            removable: None,
        }
    }

    /// Path of the processed dump in `dir`.
    pub fn dump_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.dump_file_name)
    }
}
