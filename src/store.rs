use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::trace;

use crate::address::{AddressKey, AddressSpace};
use crate::interfaces::{MemoryAccess, ModuleResolver};

pub const MAX_COMMENT_SIZE: usize = 512;
pub const MAX_LABEL_SIZE: usize = 256;
/// Historical field separator of the text export formats; annotation text may
/// not contain it.
pub const RESERVED_DELIMITER: char = '\u{1}';

pub type JsonObject = Map<String, Value>;

pub fn set_str(obj: &mut JsonObject, key: &str, value: &str) {
    obj.insert(key.to_string(), Value::String(value.to_string()));
}

pub fn get_str<'a>(obj: &'a JsonObject, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Addresses persist as bare hex strings, the format old databases use.
pub fn set_hex(obj: &mut JsonObject, key: &str, value: u64) {
    obj.insert(key.to_string(), Value::String(format!("{value:x}")));
}

pub fn get_hex(obj: &JsonObject, key: &str) -> Option<u64> {
    let text = obj.get(key)?.as_str()?;
    let text = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(text, 16).ok()
}

pub fn set_bool(obj: &mut JsonObject, key: &str, value: bool) {
    obj.insert(key.to_string(), Value::Bool(value));
}

pub fn get_bool(obj: &JsonObject, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

pub fn set_int(obj: &mut JsonObject, key: &str, value: u64) {
    obj.insert(key.to_string(), Value::Number(value.into()));
}

pub fn get_int(obj: &JsonObject, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

/// One annotation. `rva` is relative to `module`'s base, so the entry stays
/// valid when the module moves between launches. `manual` distinguishes
/// user-authored entries from analysis output.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<P> {
    pub module: String,
    pub rva: u64,
    pub manual: bool,
    pub payload: P,
}

/// Serializer capability of a store payload: which document array it lives
/// in and how its extra fields (de)serialize. Module/address/manual are
/// handled by the store itself.
pub trait EntryPayload: Clone + Send + Sync + 'static {
    const JSON_KEY: &'static str;
    /// Array key of databases written before this payload's current key.
    const LEGACY_KEY: Option<&'static str> = None;
    /// Field the anchor RVA persists under. Range payloads use `start`.
    const ADDRESS_FIELD: &'static str = "address";

    fn save(&self, obj: &mut JsonObject);
    fn load(obj: &JsonObject) -> Option<Self>;

    /// Checked on `add` and on every loaded entry. `rva` is the anchor.
    fn validate(&self, rva: u64) -> bool {
        let _ = rva;
        true
    }
}

/// Thread-safe address-keyed store with JSON cache save/load. Reads take the
/// shared side of the lock, mutators the exclusive side; `list` returns an
/// owned snapshot taken under one lock scope.
pub struct EntryStore<P: EntryPayload> {
    space: AddressSpace,
    memory: Arc<dyn MemoryAccess>,
    map: RwLock<HashMap<AddressKey, Entry<P>>>,
}

impl<P: EntryPayload> EntryStore<P> {
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

    /// Upsert by address. Returns false only on validation failure; an entry
    /// already present at the key is overwritten, never an error.
    pub fn add(&self, va: u64, payload: P, manual: bool) -> bool {
        if !self.memory.is_readable(va) {
            trace!(key = P::JSON_KEY, va = format_args!("0x{:X}", va), "rejecting entry at unreadable address");
            return false;
        }
        let (module, rva) = self.space.resolve(va);
        if !payload.validate(rva) {
            trace!(key = P::JSON_KEY, va = format_args!("0x{:X}", va), "rejecting invalid payload");
            return false;
        }
        let key = AddressKey::new(&module, rva);
        self.map.write().insert(
            key,
            Entry {
                module,
                rva,
                manual,
                payload,
            },
        );
        true
    }

    pub fn get(&self, va: u64) -> Option<Entry<P>> {
        self.map.read().get(&self.space.key_of(va)).cloned()
    }

    pub fn contains(&self, va: u64) -> bool {
        self.map.read().contains_key(&self.space.key_of(va))
    }

    pub fn delete(&self, va: u64) -> bool {
        self.map.write().remove(&self.space.key_of(va)).is_some()
    }

    /// Remove every entry whose current absolute address lies in
    /// `[start, end)` and that matches `filter`. `[0, u64::MAX)` clears the
    /// whole store without iterating; a range spanning two modules is a no-op.
    pub fn delete_range(&self, start: u64, end: u64, filter: impl Fn(&Entry<P>) -> bool) {
        if start == 0 && end == u64::MAX {
            self.clear();
            return;
        }
        let (start_module, start_rva) = self.space.resolve(start);
        let (end_module, end_rva) = self.space.resolve(end);
        if start_module != end_module {
            return;
        }
        self.map.write().retain(|_, entry| {
            if !entry.module.eq_ignore_ascii_case(&start_module) || !filter(entry) {
                return true;
            }
            !(entry.rva >= start_rva && entry.rva < end_rva)
        });
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Snapshot of every entry, taken under one shared-lock scope.
    pub fn list(&self) -> Vec<Entry<P>> {
        self.map.read().values().cloned().collect()
    }

    /// Current absolute address of an entry (rebased against the module's
    /// live base; an unloaded module rebases against 0).
    pub fn va_of(&self, entry: &Entry<P>) -> u64 {
        self.space.rebase(&entry.module, entry.rva)
    }

    /// Serialize all entries into an array under the payload's key. Empty
    /// stores contribute nothing to the document.
    pub fn cache_save(&self, root: &mut JsonObject) {
        let map = self.map.read();
        let mut items = Vec::with_capacity(map.len());
        for entry in map.values() {
            let mut obj = JsonObject::new();
            set_str(&mut obj, "module", &entry.module);
            set_hex(&mut obj, P::ADDRESS_FIELD, entry.rva);
            set_bool(&mut obj, "manual", entry.manual);
            entry.payload.save(&mut obj);
            items.push(Value::Object(obj));
        }
        if !items.is_empty() {
            root.insert(P::JSON_KEY.to_string(), Value::Array(items));
        }
    }

    /// Repopulate from the document, clearing first unless `merge`. Databases
    /// written before the current key fall back to the payload's legacy
    /// array; their entries carry no `manual` flag and load as user-authored.
    pub fn cache_load(&self, root: &JsonObject, merge: bool) {
        let section = root
            .get(P::JSON_KEY)
            .or_else(|| P::LEGACY_KEY.and_then(|key| root.get(key)));
        let mut map = self.map.write();
        if !merge {
            map.clear();
        }
        let Some(items) = section.and_then(Value::as_array) else {
            return;
        };
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            let Some(module) = get_str(obj, "module") else { continue };
            let Some(rva) = get_hex(obj, P::ADDRESS_FIELD) else {
                continue;
            };
            let Some(payload) = P::load(obj) else { continue };
            if !payload.validate(rva) {
                continue;
            }
            let manual = get_bool(obj, "manual").unwrap_or(true);
            map.insert(
                AddressKey::new(module, rva),
                Entry {
                    module: module.to_string(),
                    rva,
                    manual,
                    payload,
                },
            );
        }
        trace!(key = P::JSON_KEY, count = map.len(), "store cache loaded");
    }
}

impl<P: EntryPayload> std::fmt::Debug for EntryStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("key", &P::JSON_KEY)
            .field("len", &self.len())
            .finish()
    }
}
