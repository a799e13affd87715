#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use joydb::interfaces::{MemoryAccess, MemoryError, ModuleResolver};

#[derive(Debug, Clone)]
pub struct FakeModule {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub path: PathBuf,
}

/// In-memory debuggee: a module list plus byte-granular written-memory
/// tracking, standing in for the OS debug interfaces.
#[derive(Default)]
pub struct FakeTarget {
    modules: RwLock<Vec<FakeModule>>,
    anonymous: RwLock<Vec<(u64, u64)>>,
    written: RwLock<HashMap<u64, u8>>,
}

impl FakeTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_module(&self, name: &str, base: u64, size: u64, path: impl Into<PathBuf>) {
        self.modules.write().push(FakeModule {
            name: name.to_string(),
            base,
            size,
            path: path.into(),
        });
    }

    /// Relocate a module, as a fresh launch under ASLR would.
    pub fn move_module(&self, name: &str, new_base: u64) {
        for module in self.modules.write().iter_mut() {
            if module.name.eq_ignore_ascii_case(name) {
                module.base = new_base;
            }
        }
    }

    /// Mark `[start, start + size)` readable without any owning module.
    pub fn map_anonymous(&self, start: u64, size: u64) {
        self.anonymous.write().push((start, size));
    }

    /// Byte last written to `va` through `MemoryAccess::write`, if any.
    pub fn written_byte(&self, va: u64) -> Option<u8> {
        self.written.read().get(&va).copied()
    }
}

impl ModuleResolver for FakeTarget {
    fn base_of(&self, name: &str) -> Option<u64> {
        self.modules
            .read()
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
            .map(|module| module.base)
    }

    fn name_of(&self, va: u64) -> Option<String> {
        self.modules
            .read()
            .iter()
            .find(|module| va >= module.base && va < module.base + module.size)
            .map(|module| module.name.clone())
    }

    fn path_of(&self, va: u64) -> Option<PathBuf> {
        self.modules
            .read()
            .iter()
            .find(|module| va >= module.base && va < module.base + module.size)
            .map(|module| module.path.clone())
    }
}

impl MemoryAccess for FakeTarget {
    fn is_readable(&self, va: u64) -> bool {
        let in_module = self
            .modules
            .read()
            .iter()
            .any(|module| va >= module.base && va < module.base + module.size);
        in_module
            || self
                .anonymous
                .read()
                .iter()
                .any(|&(start, size)| va >= start && va < start + size)
    }

    fn read(&self, va: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        if !self.is_readable(va) {
            return Err(MemoryError::NotAccessible(va));
        }
        let written = self.written.read();
        Ok((0..len as u64)
            .map(|offset| written.get(&(va + offset)).copied().unwrap_or(0))
            .collect())
    }

    fn write(&self, va: u64, data: &[u8]) -> Result<(), MemoryError> {
        if !self.is_readable(va) {
            return Err(MemoryError::NotAccessible(va));
        }
        let mut written = self.written.write();
        for (offset, &byte) in data.iter().enumerate() {
            written.insert(va + offset as u64, byte);
        }
        Ok(())
    }
}
