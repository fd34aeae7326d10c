/*!
This crate contains the foundation of offline raw dump recovery.

A raw dump is a snapshot of physical memory written by firmware after an
abnormal reset, stored either on a dedicated partition or as files on
removable media.

It contains abstractions over [block devices and dump files](device/index.html),
[parsing and validation of the dump format](dump/index.html),
[collation of split dumps](collate/index.html) and
[the device specific trailer](devinfo/index.html) appended to processed dumps.
*/

#[macro_use]
extern crate bitflags;

pub mod error;
#[doc(hidden)]
pub use error::*;

pub mod types;
#[doc(hidden)]
pub use types::*;

pub mod device;
#[doc(hidden)]
pub use device::{DeviceIo, DeviceOptions, DeviceTarget, MediumKind, PartitionSelector, Position};

pub mod dump;
#[doc(hidden)]
pub use dump::{validate_header, DdrMemoryMap, DumpFlags, DumpHeader, SectionTable};

pub mod collate;
#[doc(hidden)]
pub use collate::CollatePlan;

pub mod devinfo;
#[doc(hidden)]
pub use devinfo::{DeviceSpecificInfo, Layout};

pub mod sv;

pub mod builder;
#[doc(hidden)]
pub use builder::DumpBuilder;
