use std::sync::{Mutex, MutexGuard};

use crate::{
    address::HardwareAddress,
    error::{Error, Result, ERR_STORAGE_UNAVAILABLE},
};

pub const STORE_NAMESPACE: &str = "prov";
pub const STORE_TARGET_KEY: &str = "targetMAC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetRecord {
    pub address: HardwareAddress,
    pub valid: bool,
}

impl TargetRecord {
    pub fn configured(address: HardwareAddress) -> Self {
        Self {
            address,
            valid: true,
        }
    }

    pub fn unset() -> Self {
        Self::default()
    }

    pub fn target(&self) -> Option<HardwareAddress> {
        self.valid.then_some(self.address)
    }
}

// `set` must be atomic: on failure readers keep seeing the previous record.
pub trait TargetStore: Send + Sync {
    fn get(&self) -> Result<TargetRecord>;
    fn set(&self, address: HardwareAddress) -> Result<()>;
    fn erase(&self) -> Result<()>;
}

impl<T: TargetStore + ?Sized> TargetStore for std::sync::Arc<T> {
    fn get(&self) -> Result<TargetRecord> {
        (**self).get()
    }

    fn set(&self, address: HardwareAddress) -> Result<()> {
        (**self).set(address)
    }

    fn erase(&self) -> Result<()> {
        (**self).erase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFault {
    #[default]
    None,
    Unavailable,
    CommitFails(i32),
}

#[derive(Debug, Default)]
struct MemoryState {
    record: TargetRecord,
    fault: StoreFault,
    writes: u32,
}

#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    state: Mutex<MemoryState>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(address: HardwareAddress) -> Self {
        let store = Self::default();
        store.lock().record = TargetRecord::configured(address);
        store
    }

    pub fn inject_fault(&self, fault: StoreFault) {
        self.lock().fault = fault;
    }

    pub fn writes(&self) -> u32 {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TargetStore for MemoryTargetStore {
    fn get(&self) -> Result<TargetRecord> {
        let state = self.lock();
        if state.fault == StoreFault::Unavailable {
            return Err(Error::storage_unavailable(ERR_STORAGE_UNAVAILABLE, "memory store closed"));
        }
        Ok(state.record)
    }

    fn set(&self, address: HardwareAddress) -> Result<()> {
        let mut state = self.lock();
        match state.fault {
            StoreFault::Unavailable => Err(Error::storage_unavailable(ERR_STORAGE_UNAVAILABLE, "memory store closed")),
            StoreFault::CommitFails(code) => Err(Error::storage_error(code, "commit rejected")),
            StoreFault::None => {
                state.record = TargetRecord::configured(address);
                state.writes += 1;
                Ok(())
            }
        }
    }

    fn erase(&self) -> Result<()> {
        let mut state = self.lock();
        if state.fault == StoreFault::Unavailable {
            return Err(Error::storage_unavailable(ERR_STORAGE_UNAVAILABLE, "memory store closed"));
        }
        state.record = TargetRecord::unset();
        Ok(())
    }
}
