use std::sync::Arc;

use crate::interfaces::ModuleResolver;

const MURMUR_SEED: u32 = 0x12345678;

/// MurmurHash2 over `data`. This is the hash the on-disk format declares as
/// `"hashAlgorithm": "murmurhash"`, so it cannot be swapped for another
/// algorithm without breaking old databases.
pub fn murmurhash(data: &[u8]) -> u32 {
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let mut h = MURMUR_SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }
    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }
    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Hash of a module name, case-insensitive. An empty name hashes to 0 so
/// unresolved addresses key on their raw value alone.
pub fn module_hash(name: &str) -> u64 {
    if name.is_empty() {
        return 0;
    }
    murmurhash(name.to_ascii_lowercase().as_bytes()) as u64
}

/// Stable identifier for an annotated location: which module plus the offset
/// into it. Entries at addresses outside any module keep `module == 0` and
/// `rva == va`; those keys do not survive a reload under ASLR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey {
    pub module: u64,
    pub rva: u64,
}

impl AddressKey {
    pub fn new(module_name: &str, rva: u64) -> Self {
        Self {
            module: module_hash(module_name),
            rva,
        }
    }

    /// The historical single-integer key (`hash(module) + rva`), kept only for
    /// the plugin-facing boundary. Two modules can collide in this form;
    /// nothing in this crate indexes by it.
    pub fn legacy(&self) -> u64 {
        self.module.wrapping_add(self.rva)
    }
}

/// VA <-> (module, RVA) translation against the live module list.
#[derive(Clone)]
pub struct AddressSpace {
    resolver: Arc<dyn ModuleResolver>,
}

impl AddressSpace {
    pub fn new(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<dyn ModuleResolver> {
        &self.resolver
    }

    /// Split an absolute address into module name + RVA. Addresses outside any
    /// named module come back with an empty name and `rva == va`.
    pub fn resolve(&self, va: u64) -> (String, u64) {
        match self.resolver.name_of(va) {
            Some(name) => {
                let base = self.resolver.base_of(&name).unwrap_or(0);
                (name, va.wrapping_sub(base))
            }
            None => (String::new(), va),
        }
    }

    pub fn key_of(&self, va: u64) -> AddressKey {
        let (name, rva) = self.resolve(va);
        AddressKey::new(&name, rva)
    }

    /// Absolute address of `rva` against the module's *current* base. A module
    /// that is not loaded right now rebases against 0, i.e. VA == RVA.
    pub fn rebase(&self, module_name: &str, rva: u64) -> u64 {
        let base = if module_name.is_empty() {
            0
        } else {
            self.resolver.base_of(module_name).unwrap_or(0)
        };
        base.wrapping_add(rva)
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace").finish_non_exhaustive()
    }
}
