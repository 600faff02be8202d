use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use launcher_common::{
    error::{ERR_FAIL, ERR_STORAGE_UNAVAILABLE},
    store::{STORE_NAMESPACE, STORE_TARGET_KEY},
    Error, HardwareAddress, Result, TargetRecord, TargetStore,
};

// Target store backed by `<data_dir>/prov/targetMAC`, a raw 6-byte file.
// Writes go to a sibling temp file which is synced and renamed over the record.
// The last record read or written is cached under the same lock, so heartbeat
// intake does not touch the disk.
pub struct FileTargetStore {
    namespace_dir: PathBuf,
    cache: Mutex<Option<TargetRecord>>,
}

impl FileTargetStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            namespace_dir: data_dir.as_ref().join(STORE_NAMESPACE),
            cache: Mutex::new(None),
        }
    }

    pub fn record_path(&self) -> PathBuf {
        self.namespace_dir.join(STORE_TARGET_KEY)
    }

    fn temp_path(&self) -> PathBuf {
        self.namespace_dir.join(format!("{STORE_TARGET_KEY}.tmp"))
    }

    fn lock(&self) -> MutexGuard<'_, Option<TargetRecord>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_record(&self) -> Result<TargetRecord> {
        match fs::read(self.record_path()) {
            // A blob of any other length never came from a committed write.
            Ok(raw) => Ok(HardwareAddress::from_slice(&raw)
                .map(TargetRecord::configured)
                .unwrap_or_default()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(TargetRecord::unset()),
            Err(err) => Err(unavailable(&err)),
        }
    }

    fn write_record(&self, address: HardwareAddress) -> io::Result<()> {
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp)?;
        file.write_all(address.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, self.record_path())
    }
}

fn unavailable(err: &io::Error) -> Error {
    Error::storage_unavailable(
        err.raw_os_error().unwrap_or(ERR_STORAGE_UNAVAILABLE),
        err.to_string(),
    )
}

impl TargetStore for FileTargetStore {
    fn get(&self) -> Result<TargetRecord> {
        let mut cache = self.lock();
        if let Some(record) = *cache {
            return Ok(record);
        }
        let record = self.read_record()?;
        *cache = Some(record);
        Ok(record)
    }

    fn set(&self, address: HardwareAddress) -> Result<()> {
        let mut cache = self.lock();
        fs::create_dir_all(&self.namespace_dir).map_err(|err| unavailable(&err))?;

        self.write_record(address).map_err(|err| {
            let _ = fs::remove_file(self.temp_path());
            Error::storage_error(err.raw_os_error().unwrap_or(ERR_FAIL), err.to_string())
        })?;
        *cache = Some(TargetRecord::configured(address));
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        let mut cache = self.lock();
        match fs::remove_dir_all(&self.namespace_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                *cache = None;
                return Err(unavailable(&err));
            }
        }
        *cache = Some(TargetRecord::unset());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: HardwareAddress = HardwareAddress::new([0x22, 0x33, 0x4D, 0x06, 0x43, 0xED]);

    #[test]
    fn missing_file_reads_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        assert_eq!(store.get().unwrap(), TargetRecord::unset());
    }

    #[test]
    fn record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FileTargetStore::new(dir.path()).set(TARGET).unwrap();

        let store = FileTargetStore::new(dir.path());
        assert_eq!(store.get().unwrap(), TargetRecord::configured(TARGET));
        assert_eq!(fs::read(store.record_path()).unwrap(), TARGET.as_bytes());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn overwrite_replaces_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        let next = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        store.set(TARGET).unwrap();
        store.set(next).unwrap();
        assert_eq!(store.get().unwrap().target(), Some(next));
    }

    #[test]
    fn erase_drops_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        store.set(TARGET).unwrap();

        store.erase().unwrap();
        assert!(!dir.path().join("prov").exists());
        assert_eq!(store.get().unwrap(), TargetRecord::unset());
        store.erase().unwrap();
    }

    #[test]
    fn truncated_blob_is_not_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        fs::create_dir_all(dir.path().join("prov")).unwrap();
        fs::write(store.record_path(), [0x22, 0x33, 0x4D]).unwrap();

        assert!(!store.get().unwrap().valid);
    }

    #[test]
    fn unwritable_namespace_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the namespace directory should be.
        fs::write(dir.path().join("prov"), b"").unwrap();
        let store = FileTargetStore::new(dir.path());

        assert!(matches!(store.set(TARGET), Err(Error::StorageUnavailable { .. })));
    }

    #[test]
    fn reads_are_served_from_cache_after_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        store.set(TARGET).unwrap();

        fs::remove_file(store.record_path()).unwrap();
        assert_eq!(store.get().unwrap(), TargetRecord::configured(TARGET));

        let reopened = FileTargetStore::new(dir.path());
        assert_eq!(reopened.get().unwrap(), TargetRecord::unset());
    }
}
