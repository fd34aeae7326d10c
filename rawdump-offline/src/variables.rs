/*!
Access to firmware variables.

The firmware leaves the location of diagnostic structures in a set of
variables. `VariableStore` abstracts over where they come from,
`FileVariableStore` reads them from a [TOML](https://toml.io/) file:

```toml
[variables]
APRegAddress = 0x86000000
DumpInstancePrvBoot = 7
InMemoryDataInfo = [0xc0001000, 0x86100000, 0x1000]
```

Integers are stored as 64 bit little endian values, arrays as the
concatenation of their elements and strings as their bytes.
*/

use rawdump_core::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::collections::HashMap;
use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};

use dataview::{DataView, Pod, PodMethods};
use log::{debug, warn};
use toml::{Table, Value};

/// Physical address of the AP register dump.
pub const AP_REG_ADDRESS: &str = "APRegAddress";
/// Location of the in-memory diagnostic data, see `InMemDataInfo`.
pub const IN_MEMORY_DATA_INFO: &str = "InMemoryDataInfo";
/// Instance id of the dump written during the previous boot.
pub const DUMP_INSTANCE: &str = "DumpInstancePrvBoot";

/// Location of the in-memory diagnostic data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InMemDataInfo {
    pub va: u64,
    pub pa: u64,
    pub size: u64,
}
unsafe impl Pod for InMemDataInfo {}

/// A store of named firmware variables.
pub trait VariableStore {
    /// Reads a variable, fails with `NotFound` if it does not exist.
    fn read_variable(&self, name: &str) -> Result<Vec<u8>>;

    fn write_variable(&mut self, name: &str, data: &[u8]) -> Result<()>;

    fn read_u64(&self, name: &str) -> Result<u64>
    where
        Self: Sized,
    {
        self.read_pod::<u64>(name)
    }

    /// Reads a variable and checks that its size matches `T`.
    fn read_pod<T: Pod>(&self, name: &str) -> Result<T>
    where
        Self: Sized,
    {
        let data = self.read_variable(name)?;
        if data.len() != size_of::<T>() {
            return Err(Error(ErrorOrigin::VariableStore, ErrorKind::InvalidBuffer).log_warn(format!(
                "unexpected size of variable {}: expected={:x} actual={:x}",
                name,
                size_of::<T>(),
                data.len()
            )));
        }
        DataView::from(&data[..])
            .try_read::<T>(0)
            .ok_or(Error(ErrorOrigin::VariableStore, ErrorKind::InvalidBuffer))
    }
}

/// An in-memory variable store.
#[derive(Clone, Debug, Default)]
pub struct MemoryVariableStore {
    variables: HashMap<String, Vec<u8>>,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_u64(mut self, name: &str, value: u64) -> Self {
        self.variables.insert(name.to_string(), value.to_le_bytes().to_vec());
        self
    }

    pub fn with_pod<T: Pod>(mut self, name: &str, value: &T) -> Self {
        self.variables.insert(name.to_string(), value.as_bytes().to_vec());
        self
    }
}

impl VariableStore for MemoryVariableStore {
    fn read_variable(&self, name: &str) -> Result<Vec<u8>> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| Error(ErrorOrigin::VariableStore, ErrorKind::NotFound).log_debug(name))
    }

    fn write_variable(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.variables.insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// A variable store backed by a TOML file.
///
/// Writes are saved back to the file immediately. Only values made of
/// 64 bit integers can be written.
#[derive(Clone, Debug)]
pub struct FileVariableStore {
    path: PathBuf,
    variables: Table,
}

impl FileVariableStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            Error(ErrorOrigin::VariableStore, ErrorKind::UnableToOpenFile)
                .log_error(format!("{}: {}", path.display(), err))
        })?;

        let mut file: Table = contents.parse().map_err(|err| {
            Error(ErrorOrigin::VariableStore, ErrorKind::Configuration)
                .log_error(format!("unable to parse the variable file: {}", err))
        })?;

        let variables = match file.remove("variables") {
            Some(Value::Table(variables)) => variables,
            Some(_) => {
                return Err(Error(ErrorOrigin::VariableStore, ErrorKind::Configuration)
                    .log_error("'variables' is not a table"))
            }
            None => Table::new(),
        };

        debug!("loaded {} variables from {}", variables.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            variables,
        })
    }

    fn save(&self) -> Result<()> {
        let mut file = Table::new();
        file.insert("variables".to_string(), Value::Table(self.variables.clone()));
        fs::write(&self.path, file.to_string()).map_err(|err| {
            Error(ErrorOrigin::VariableStore, ErrorKind::UnableToWriteFile)
                .log_error(format!("{}: {}", self.path.display(), err))
        })
    }
}

fn encode_value(name: &str, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Integer(i) => out.extend_from_slice(&(*i as u64).to_le_bytes()),
        Value::String(s) => out.extend_from_slice(s.as_bytes()),
        Value::Boolean(b) => out.push(*b as u8),
        Value::Array(items) => {
            for item in items.iter() {
                encode_value(name, item, out)?;
            }
        }
        _ => {
            return Err(Error(ErrorOrigin::VariableStore, ErrorKind::Encoding)
                .log_warn(format!("unsupported value type of variable {}", name)))
        }
    }
    Ok(())
}

fn decode_value(name: &str, data: &[u8]) -> Result<Value> {
    if data.len() % 8 != 0 {
        return Err(Error(ErrorOrigin::VariableStore, ErrorKind::Encoding).log_warn(format!(
            "variable {} of {:x} bytes can not be stored as 64 bit values",
            name,
            data.len()
        )));
    }
    let mut items = data
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            Value::Integer(u64::from_le_bytes(raw) as i64)
        })
        .collect::<Vec<_>>();
    if items.len() == 1 {
        Ok(items.remove(0))
    } else {
        Ok(Value::Array(items))
    }
}

impl VariableStore for FileVariableStore {
    fn read_variable(&self, name: &str) -> Result<Vec<u8>> {
        let value = self
            .variables
            .get(name)
            .ok_or_else(|| Error(ErrorOrigin::VariableStore, ErrorKind::NotFound).log_debug(name))?;
        let mut out = Vec::new();
        encode_value(name, value, &mut out)?;
        Ok(out)
    }

    fn write_variable(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let value = decode_value(name, data)?;
        self.variables.insert(name.to_string(), value);
        self.save()
    }
}

/// Reads the dump instance id, defaulting to 0 if the variable is not available.
pub fn dump_instance<S: VariableStore>(store: &S) -> u64 {
    match store.read_u64(DUMP_INSTANCE) {
        Ok(instance) => instance,
        Err(err) => {
            warn!("unable to read the dump instance, using default value of zero: {}", err);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARIABLES: &str = r#"
[variables]
APRegAddress = 0x86000000
DumpInstancePrvBoot = 7
InMemoryDataInfo = [0xc0001000, 0x86100000, 0x1000]
Short = [1, 2, 3]
"#;

    fn store() -> (tempfile::TempDir, FileVariableStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.toml");
        fs::write(&path, VARIABLES).unwrap();
        let store = FileVariableStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn read_file_variables() {
        let (_dir, store) = store();
        assert_eq!(store.read_u64(AP_REG_ADDRESS).unwrap(), 0x8600_0000);
        assert_eq!(dump_instance(&store), 7);

        let info = store.read_pod::<InMemDataInfo>(IN_MEMORY_DATA_INFO).unwrap();
        assert_eq!(
            info,
            InMemDataInfo {
                va: 0xc000_1000,
                pa: 0x8610_0000,
                size: 0x1000
            }
        );

        assert_eq!(
            store.read_pod::<InMemDataInfo>("Short").unwrap_err(),
            Error(ErrorOrigin::VariableStore, ErrorKind::InvalidBuffer)
        );
        assert_eq!(
            store.read_variable("Missing").unwrap_err(),
            Error(ErrorOrigin::VariableStore, ErrorKind::NotFound)
        );
    }

    #[test]
    fn write_file_variables() {
        let (dir, mut store) = store();
        store
            .write_variable(IN_MEMORY_DATA_INFO, InMemDataInfo::default().as_bytes())
            .unwrap();

        let reloaded = FileVariableStore::open(dir.path().join("variables.toml")).unwrap();
        assert_eq!(
            reloaded.read_pod::<InMemDataInfo>(IN_MEMORY_DATA_INFO).unwrap(),
            InMemDataInfo::default()
        );
        assert_eq!(reloaded.read_u64(AP_REG_ADDRESS).unwrap(), 0x8600_0000);

        assert_eq!(
            store.write_variable("Odd", &[1, 2, 3]).unwrap_err(),
            Error(ErrorOrigin::VariableStore, ErrorKind::Encoding)
        );
    }

    #[test]
    fn missing_instance() {
        assert_eq!(dump_instance(&MemoryVariableStore::new()), 0);
        let store = MemoryVariableStore::new().with_u64(DUMP_INSTANCE, 3);
        assert_eq!(dump_instance(&store), 3);
    }
}
