/*!
The offline dump service.

It builds on `rawdump-core` to find the raw dump written after an abnormal
reset, turn it into a single validated dump file and append the
[device specific info](../rawdump_core/devinfo/index.html) describing the reset.

# Examples

```no_run
use rawdump_offline::{process_dump, FileVariableStore, OfflineConfig};

let config = OfflineConfig::open("/etc/rawdump/offline.toml").unwrap();
let mut store = FileVariableStore::open("/etc/rawdump/variables.toml").unwrap();
let report = process_dump(&config, &mut store).unwrap();
println!("{}", report);
```
*/

pub mod config;
#[doc(hidden)]
pub use config::OfflineConfig;

pub mod variables;
#[doc(hidden)]
pub use variables::{FileVariableStore, MemoryVariableStore, VariableStore};

pub mod discovery;
#[doc(hidden)]
pub use discovery::{locate, DumpLocation, DumpSource};

pub mod platform;
#[doc(hidden)]
pub use platform::{Extractor, ProcessorArchitecture, ResetReason};

pub mod pipeline;
#[doc(hidden)]
pub use pipeline::{process_dump, ProcessReport};
