/*!
Specialized `Error` and `Result` types for rawdump.
*/

use std::{error, fmt, result};

use log::{debug, error, info, trace, warn};

/// Specialized `Error` type for rawdump errors.
///
/// The first member describes the component that failed, the second one what went wrong.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Error(pub ErrorOrigin, pub ErrorKind);

impl Error {
    /// Returns a static string representing the type of error.
    pub fn as_str(&self) -> &'static str {
        self.1.to_str()
    }

    /// Returns a static string representing the type of error.
    pub fn into_str(self) -> &'static str {
        self.as_str()
    }

    /// Encodes the error as a negative integer which can be used as a process exit code.
    pub const fn into_i32(self) -> i32 {
        let origin = ((self.0 as i32 + 1) & 0xFFFi32) << 4;
        let kind = ((self.1 as i32 + 1) & 0xFFFi32) << 16;
        -(1 + origin + kind)
    }

    /// Decodes an error previously encoded with `into_i32`.
    pub fn from_i32(error: i32) -> Self {
        let origin = ((-error - 1) >> 4i32) & 0xFFFi32;
        let kind = ((-error - 1) >> 16i32) & 0xFFFi32;

        let error_origin = if origin > 0 && origin <= ErrorOrigin::Other as i32 + 1 {
            ErrorOrigin::from_u16(origin as u16 - 1)
        } else {
            ErrorOrigin::Other
        };

        let error_kind = if kind > 0 && kind <= ErrorKind::Unknown as i32 + 1 {
            ErrorKind::from_u16(kind as u16 - 1)
        } else {
            ErrorKind::Unknown
        };

        Self(error_origin, error_kind)
    }

    /// Returns true if the error was caused by the byte content of a dump.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.0,
            ErrorOrigin::DumpHeader
                | ErrorOrigin::SectionTable
                | ErrorOrigin::MemoryMap
                | ErrorOrigin::DeviceInfo
        )
    }

    pub fn log_error(self, err: impl fmt::Display) -> Self {
        error!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_warn(self, err: impl fmt::Display) -> Self {
        warn!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_info(self, err: impl fmt::Display) -> Self {
        info!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_debug(self, err: impl fmt::Display) -> Self {
        debug!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_trace(self, err: impl fmt::Display) -> Self {
        trace!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.to_str(), self.1.to_str())
    }
}

impl error::Error for Error {}

/// Convert from PartialError
impl<T> From<PartialError<T>> for Error {
    fn from(err: PartialError<T>) -> Self {
        match err {
            PartialError::Error(e) => e,
            _ => Error(ErrorOrigin::Device, ErrorKind::PartialData),
        }
    }
}

/// Allows rawdump errors to travel through `std::io` based interfaces.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err)
    }
}

macro_rules! u16_enum {
    ($name:ident { $($variant:ident => $desc:expr,)* }) => {
        #[repr(u16)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum $name {
            $($variant,)*
        }

        impl $name {
            const VARIANTS: &'static [$name] = &[$($name::$variant,)*];

            /// Returns a static string representing the type of error.
            pub fn to_str(self) -> &'static str {
                match self {
                    $($name::$variant => $desc,)*
                }
            }

            fn from_u16(value: u16) -> Self {
                Self::VARIANTS
                    .get(value as usize)
                    .copied()
                    .unwrap_or(Self::VARIANTS[Self::VARIANTS.len() - 1])
            }
        }
    };
}

u16_enum!(ErrorOrigin {
    Device => "device io",
    PartitionTable => "partition table",
    Cache => "block cache",

    DumpHeader => "dump header",
    SectionTable => "section table",
    MemoryMap => "memory map",
    PhysicalMemory => "physical memory",

    Collator => "collator",
    DeviceInfo => "device specific info",
    Builder => "dump builder",

    Config => "config",
    Discovery => "discovery",
    VariableStore => "variable store",
    Platform => "platform",
    Pipeline => "pipeline",

    Other => "other",
});

u16_enum!(ErrorKind {
    NotReady => "device is not open",
    AlreadyOpened => "device is already opened",
    InvalidHandle => "invalid handle",
    InvalidBuffer => "invalid buffer or size",
    CacheInvalid => "cache is invalid",
    InvalidPosition => "invalid position",
    PartitionNotSet => "no partition selected",
    PartitionNotFound => "partition not found",
    UnsupportedPartition => "unsupported partition scheme",
    EndOfMedium => "end of medium",
    PartialData => "partial data",

    NotFound => "not found",
    NotSupported => "not supported",
    InvalidPath => "invalid path",
    UnableToOpenFile => "unable to open file",
    UnableToReadFile => "unable to read file",
    UnableToWriteFile => "unable to write file",
    UnableToSeekFile => "unable to seek file",
    UnableToReadDir => "unable to read directory",

    InvalidSignature => "invalid signature",
    InvalidVersion => "invalid version",
    InvalidFlags => "invalid flags",
    InvalidDumpSize => "invalid size, should not be zero",
    InvalidSectionCount => "invalid number of sections, should not be zero",
    NoDdrSections => "no ddr sections found",
    DdrSectionsNotAdjacent => "ddr sections are not adjacent",
    InvalidSectionVersion => "invalid section version",
    InvalidSectionFlags => "invalid section flags",
    MisplacedInsufficientStorage => "insufficient storage flag set on a section other than the last one",
    InvalidSectionType => "invalid section type",

    InvalidRange => "invalid memory range",
    MemoryMapOverlap => "overlapping memory ranges",
    OutOfMemoryRange => "out of memory range",
    NonContiguousRead => "read spans non contiguous memory ranges",
    Overflow => "arithmetic overflow",

    UnsupportedArchitecture => "unsupported architecture",
    InvalidDeviceInfo => "invalid device specific info",
    Configuration => "configuration error",
    Encoding => "encoding error",

    Unknown => "unknown error",
});

/// Specialized `PartialError` type for recoverable rawdump errors.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum PartialError<T> {
    /// Hard Error
    ///
    /// Catch-all for all hard errors
    Error(Error),
    /// Partial Read Error
    ///
    /// The read only completed partially, the contained value describes what was read.
    PartialRead(T),
    /// Partial Write Error
    ///
    /// The write only completed partially, the contained value describes what was written.
    PartialWrite(T),
}

/// Convert from Error
impl<T> From<Error> for PartialError<T> {
    fn from(err: Error) -> Self {
        PartialError::Error(err)
    }
}

impl<T> PartialError<T> {
    /// Returns a static string representing the type of error.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialError::Error(e) => e.as_str(),
            PartialError::PartialRead(_) => "partial read",
            PartialError::PartialWrite(_) => "partial write",
        }
    }

    /// Returns a static string representing the type of error.
    pub fn into_str(self) -> &'static str {
        self.as_str()
    }
}

/// Custom fmt::Debug impl for the specialized `PartialError` type.
/// This is required due to our generic type T.
impl<T> fmt::Debug for PartialError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl<T> fmt::Display for PartialError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PartialError::Error(e) => write!(f, "{}", e),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl<T: fmt::Debug> error::Error for PartialError<T> {}

/// Specialized `Result` type for rawdump results.
pub type Result<T> = result::Result<T, Error>;

/// Specialized `PartialResult` type for rawdump results with recoverable errors.
pub type PartialResult<T> = result::Result<T, PartialError<T>>;

/// Specialized `PartialResult` extension for results.
pub trait PartialResultExt<T> {
    /// Tries to extract the data from the `Result`.
    /// This will return a full error even if a partial error happened.
    fn data(self) -> Result<T>;

    /// Tries to extract the data or partial data from the `Result`.
    /// This will return a full error only if a hard error happened.
    /// A partial error will be converted to an `Ok(T)`.
    fn data_part(self) -> Result<T>;

    /// Maps the data contained in the partial result to another result.
    /// This is especially useful if you want to return a different result type
    /// but want to keep the partial result information.
    fn map_data<U, F: FnOnce(T) -> U>(self, func: F) -> PartialResult<U>;
}

impl<T> PartialResultExt<T> for PartialResult<T> {
    fn data(self) -> Result<T> {
        match self {
            Ok(data) => Ok(data),
            Err(PartialError::Error(e)) => Err(e),
            Err(_) => Err(Error(ErrorOrigin::Device, ErrorKind::PartialData)),
        }
    }

    fn data_part(self) -> Result<T> {
        match self {
            Ok(data) => Ok(data),
            Err(PartialError::PartialRead(data)) => Ok(data),
            Err(PartialError::PartialWrite(data)) => Ok(data),
            Err(PartialError::Error(e)) => Err(e),
        }
    }

    fn map_data<U, F: FnOnce(T) -> U>(self, func: F) -> PartialResult<U> {
        match self {
            Ok(data) => Ok(func(data)),
            Err(PartialError::Error(e)) => Err(PartialError::Error(e)),
            Err(PartialError::PartialRead(data)) => Err(PartialError::PartialRead(func(data))),
            Err(PartialError::PartialWrite(data)) => Err(PartialError::PartialWrite(func(data))),
        }
    }
}
