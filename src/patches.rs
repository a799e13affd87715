use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::address::{AddressKey, AddressSpace};
use crate::interfaces::{MemoryAccess, ModuleResolver, PatchFileError};
use crate::persist;

#[derive(Debug, Clone, PartialEq)]
pub struct PatchEntry {
    pub module: String,
    pub rva: u64,
    /// The original, unpatched byte. Survives any number of re-edits at the
    /// same address.
    pub old_byte: u8,
    pub new_byte: u8,
}

/// Byte patches over the live debuggee, with merge/undo semantics. Unlike the
/// annotation stores, deleting a patch can write through to target memory,
/// and patches are exported to files rather than serialized into the
/// database document.
pub struct PatchStore {
    space: AddressSpace,
    memory: Arc<dyn MemoryAccess>,
    map: RwLock<HashMap<AddressKey, PatchEntry>>,
}

impl PatchStore {
    pub fn new(resolver: Arc<dyn ModuleResolver>, memory: Arc<dyn MemoryAccess>) -> Self {
        Self {
            space: AddressSpace::new(resolver),
            memory,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Record a byte edit at `va`. Re-editing a patched address keeps the
    /// first-seen original byte; editing back to that original removes the
    /// patch entirely (the net change is zero). A degenerate edit
    /// (`old == new`) succeeds without recording anything.
    pub fn set(&self, va: u64, old_byte: u8, new_byte: u8) -> bool {
        if !self.memory.is_readable(va) {
            return false;
        }
        if old_byte == new_byte {
            return true;
        }
        let (module, rva) = self.space.resolve(va);
        let key = AddressKey::new(&module, rva);

        let mut map = self.map.write();
        let original = map.get(&key).map(|patch| patch.old_byte);
        match original {
            Some(original) if original == new_byte => {
                map.remove(&key);
            }
            Some(original) => {
                map.insert(
                    key,
                    PatchEntry {
                        module,
                        rva,
                        old_byte: original,
                        new_byte,
                    },
                );
            }
            None => {
                map.insert(
                    key,
                    PatchEntry {
                        module,
                        rva,
                        old_byte,
                        new_byte,
                    },
                );
            }
        }
        true
    }

    pub fn get(&self, va: u64) -> Option<PatchEntry> {
        self.map.read().get(&self.space.key_of(va)).cloned()
    }

    pub fn contains(&self, va: u64) -> bool {
        self.map.read().contains_key(&self.space.key_of(va))
    }

    /// Remove the patch at `va`. With `restore`, the original byte is written
    /// back into the live target first.
    pub fn delete(&self, va: u64, restore: bool) -> bool {
        let key = self.space.key_of(va);
        let mut map = self.map.write();
        let Some(entry) = map.get(&key).cloned() else {
            return false;
        };
        if restore {
            let target = self.space.rebase(&entry.module, entry.rva);
            if let Err(err) = self.memory.write(target, &[entry.old_byte]) {
                warn!(target = format_args!("0x{:X}", target), %err, "failed to restore original byte");
            }
        }
        map.remove(&key).is_some()
    }

    /// Remove every patch whose current absolute address lies in
    /// `[start, end)`, restoring bytes per entry if requested. The full-range
    /// wildcard clears the whole store without iterating; a range spanning
    /// two modules is a no-op.
    pub fn delete_range(&self, start: u64, end: u64, restore: bool) {
        if start == 0 && end == u64::MAX {
            self.map.write().clear();
            return;
        }
        let (start_module, start_rva) = self.space.resolve(start);
        let (end_module, end_rva) = self.space.resolve(end);
        if start_module != end_module {
            return;
        }
        let mut map = self.map.write();
        map.retain(|_, entry| {
            if !entry.module.eq_ignore_ascii_case(&start_module) {
                return true;
            }
            if entry.rva < start_rva || entry.rva >= end_rva {
                return true;
            }
            if restore {
                let target = self.space.rebase(&entry.module, entry.rva);
                if let Err(err) = self.memory.write(target, &[entry.old_byte]) {
                    warn!(target = format_args!("0x{:X}", target), %err, "failed to restore original byte");
                }
            }
            false
        });
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Drop all patches belonging to one module, e.g. when it unloads.
    pub fn clear_module(&self, module: &str) {
        self.map
            .write()
            .retain(|_, entry| !entry.module.eq_ignore_ascii_case(module));
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Snapshot of every patch, taken under one shared-lock scope.
    pub fn list(&self) -> Vec<PatchEntry> {
        self.map.read().values().cloned().collect()
    }

    /// Current absolute address of a patch.
    pub fn va_of(&self, entry: &PatchEntry) -> u64 {
        self.space.rebase(&entry.module, entry.rva)
    }

    /// Apply `entries` to a copy of their module's on-disk image, written to
    /// `target_path`. All entries must belong to one loaded module. Entries
    /// whose RVA has no file offset (header padding, bss) are skipped;
    /// copy/map failures abort the whole operation. Returns how many bytes
    /// were written.
    pub fn patch_file(&self, entries: &[PatchEntry], target_path: &Path) -> Result<usize, PatchFileError> {
        let Some(first) = entries.first() else {
            return Err(PatchFileError::NoPatches);
        };
        let module = first.module.clone();
        if entries.iter().any(|entry| !entry.module.eq_ignore_ascii_case(&module)) {
            return Err(PatchFileError::MixedModules(module));
        }

        let resolver = self.space.resolver();
        let Some(base) = resolver.base_of(&module) else {
            return Err(PatchFileError::ModuleNotLoaded(module));
        };
        let Some(source) = resolver.path_of(base) else {
            return Err(PatchFileError::ModulePathUnknown(module));
        };

        fs::copy(&source, target_path).map_err(PatchFileError::CopyFailed)?;

        // The copy inherits the source attributes; strip read-only so the map
        // can be opened for writing.
        if let Ok(metadata) = fs::metadata(target_path) {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(target_path, permissions);
            }
        }

        let mut mapped = persist::map_file_mut(target_path).map_err(PatchFileError::MapFailed)?;
        let offsets = file_offsets(&mapped, entries)?;

        let mut patched = 0usize;
        for (entry, offset) in entries.iter().zip(offsets) {
            match offset {
                Some(offset) if offset < mapped.len() => {
                    mapped[offset] = entry.new_byte;
                    patched += 1;
                }
                _ => {
                    trace!(
                        module = %entry.module,
                        rva = format_args!("0x{:X}", entry.rva),
                        "patch has no raw file offset, skipped"
                    );
                }
            }
        }
        mapped.flush().map_err(PatchFileError::MapFailed)?;
        trace!(patched, target = %target_path.display(), "file patched");
        Ok(patched)
    }

    /// Textual patch export: a `>module` header per module followed by
    /// `RVA:OLD->NEW` lines, uppercase hex.
    pub fn export_1337(&self, entries: &[PatchEntry]) -> String {
        let mut grouped: BTreeMap<&str, Vec<&PatchEntry>> = BTreeMap::new();
        for entry in entries {
            grouped.entry(entry.module.as_str()).or_default().push(entry);
        }
        let mut lines = Vec::with_capacity(entries.len() + grouped.len());
        for (module, patches) in grouped {
            if module.is_empty() {
                continue;
            }
            lines.push(format!(">{module}"));
            for patch in patches {
                lines.push(format!(
                    "{:016X}:{:02X}->{:02X}",
                    patch.rva, patch.old_byte, patch.new_byte
                ));
            }
        }
        lines.join("\n")
    }

    /// Generate a self-contained C re-patcher for `entries`. File offsets are
    /// resolved at export time against the module's on-disk image, with the
    /// same skip rule as [`patch_file`](Self::patch_file).
    pub fn export_c(&self, entries: &[PatchEntry]) -> Result<String, PatchFileError> {
        let Some(first) = entries.first() else {
            return Err(PatchFileError::NoPatches);
        };
        let module = first.module.clone();
        if entries.iter().any(|entry| !entry.module.eq_ignore_ascii_case(&module)) {
            return Err(PatchFileError::MixedModules(module));
        }
        let resolver = self.space.resolver();
        let Some(base) = resolver.base_of(&module) else {
            return Err(PatchFileError::ModuleNotLoaded(module));
        };
        let Some(source) = resolver.path_of(base) else {
            return Err(PatchFileError::ModulePathUnknown(module));
        };
        let image = fs::read(&source).map_err(PatchFileError::CopyFailed)?;
        let offsets = file_offsets(&image, entries)?;

        let mut rows = String::new();
        for (entry, offset) in entries.iter().zip(offsets) {
            if let Some(offset) = offset {
                rows.push_str(&format!(
                    "    {{ 0x{offset:X}, 0x{:02X}, 0x{:02X} }},\n",
                    entry.old_byte, entry.new_byte
                ));
            }
        }
        Ok(C_PATCHER_TEMPLATE
            .replace("{MODULE}", &module)
            .replace("{PATCHES}", &rows))
    }
}

impl std::fmt::Debug for PatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchStore").field("len", &self.len()).finish()
    }
}

/// Translate every entry's RVA to a raw file offset via the image's section
/// table. `None` entries have no backing file byte.
fn file_offsets(image: &[u8], entries: &[PatchEntry]) -> Result<Vec<Option<usize>>, PatchFileError> {
    let pe = pelite::PeFile::from_bytes(image).map_err(|_| PatchFileError::InvalidImage)?;
    let mut offsets = Vec::with_capacity(entries.len());
    for entry in entries {
        let rva = match u32::try_from(entry.rva) {
            Ok(rva) => rva,
            Err(_) => {
                offsets.push(None);
                continue;
            }
        };
        let offset = match pe {
            pelite::Wrap::T32(pe) => {
                use pelite::pe32::Pe;
                pe.rva_to_file_offset(rva).ok()
            }
            pelite::Wrap::T64(pe) => {
                use pelite::pe64::Pe;
                pe.rva_to_file_offset(rva).ok()
            }
        };
        offsets.push(offset);
    }
    Ok(offsets)
}

const C_PATCHER_TEMPLATE: &str = r#"/* Patches for {MODULE} */
#include <stdio.h>

struct patch
{
    unsigned long offset;
    unsigned char oldbyte;
    unsigned char newbyte;
};

static struct patch patches[] =
{
{PATCHES}};

int main(int argc, char* argv[])
{
    const char* path = argc > 1 ? argv[1] : "{MODULE}";
    FILE* file = fopen(path, "rb+");
    if(!file)
    {
        printf("failed to open %s\n", path);
        return 1;
    }
    unsigned long count = sizeof(patches) / sizeof(patches[0]);
    unsigned long applied = 0;
    for(unsigned long i = 0; i < count; i++)
    {
        unsigned char current;
        if(fseek(file, patches[i].offset, SEEK_SET) || fread(&current, 1, 1, file) != 1)
            continue;
        if(current != patches[i].oldbyte && current != patches[i].newbyte)
            continue;
        if(fseek(file, patches[i].offset, SEEK_SET))
            continue;
        if(fwrite(&patches[i].newbyte, 1, 1, file) == 1)
            applied++;
    }
    fclose(file);
    printf("%lu/%lu patch(es) applied to %s\n", applied, count, path);
    return applied == count ? 0 : 1;
}
"#;
