use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, trace, warn};

use crate::address::murmurhash;
use crate::annotations::{
    Arguments, Bookmarks, Breakpoints, Comments, EncodeMaps, Functions, Labels, Loops, Watches,
    Xrefs,
};
use crate::interfaces::{DatabaseError, MemoryAccess, ModuleResolver, PluginStorage};
use crate::patches::PatchStore;
use crate::persist;
use crate::store::{get_hex, get_str, set_hex, set_str, JsonObject};

/// The algorithm name the document declares for its staleness hash. Part of
/// the on-disk format.
pub const HASH_ALGORITHM: &str = "murmurhash";

const BACKUP_SUFFIX: &str = "bak";
const COMMAND_LINE_SUFFIX: &str = "cmdline";
const WRITE_PROBE_FILE: &str = ".dbwritetest";

/// Which parts of the document a save/load touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveScope {
    CommandLine,
    /// Everything except the command line.
    DebugData,
    All,
}

impl SaveScope {
    fn command_line(self) -> bool {
        matches!(self, SaveScope::CommandLine | SaveScope::All)
    }

    fn debug_data(self) -> bool {
        matches!(self, SaveScope::DebugData | SaveScope::All)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Central directory for database files when they cannot (or should not)
    /// live beside the debuggee.
    pub database_dir: PathBuf,
    /// Prefer a database beside the debuggee module when its directory is
    /// writable.
    pub save_beside_module: bool,
    pub disable_compression: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("db"),
            save_beside_module: false,
            disable_compression: false,
        }
    }
}

#[derive(Default)]
struct DatabaseState {
    path: Option<PathBuf>,
    database_dir: Option<PathBuf>,
    /// On-disk image the annotations belong to; source of the staleness hash.
    module_path: Option<PathBuf>,
    command_line: String,
    notes: String,
    init_script: String,
    /// Last adopted content hash of the debuggee image.
    hash: u64,
}

/// One debugger session's annotation database: every store plus the
/// whole-document save/load orchestration. Owning the stores here (instead
/// of module-level singletons) keeps sessions isolated and testable.
pub struct Database {
    pub comments: Comments,
    pub labels: Labels,
    pub bookmarks: Bookmarks,
    pub functions: Functions,
    pub arguments: Arguments,
    pub loops: Loops,
    pub xrefs: Xrefs,
    pub watches: Watches,
    pub encode_maps: EncodeMaps,
    pub breakpoints: Breakpoints,
    pub patches: PatchStore,

    config: DatabaseConfig,
    /// Database-wide lock: save/load/set_path see one consistent instant,
    /// independent of the per-store locks taken while iterating stores.
    state: Mutex<DatabaseState>,
    plugins: RwLock<Vec<Arc<dyn PluginStorage>>>,
}

impl Database {
    pub fn new(
        resolver: Arc<dyn ModuleResolver>,
        memory: Arc<dyn MemoryAccess>,
        config: DatabaseConfig,
    ) -> Self {
        Self {
            comments: Comments::new(resolver.clone(), memory.clone()),
            labels: Labels::new(resolver.clone(), memory.clone()),
            bookmarks: Bookmarks::new(resolver.clone(), memory.clone()),
            functions: Functions::new(resolver.clone(), memory.clone()),
            arguments: Arguments::new(resolver.clone(), memory.clone()),
            loops: Loops::new(resolver.clone(), memory.clone()),
            xrefs: Xrefs::new(resolver.clone(), memory.clone()),
            watches: Watches::new(resolver.clone(), memory.clone()),
            encode_maps: EncodeMaps::new(resolver.clone(), memory.clone()),
            breakpoints: Breakpoints::new(resolver.clone(), memory.clone()),
            patches: PatchStore::new(resolver, memory),
            config,
            state: Mutex::new(DatabaseState::default()),
            plugins: RwLock::new(Vec::new()),
        }
    }

    pub fn register_plugin(&self, plugin: Arc<dyn PluginStorage>) {
        self.plugins.write().push(plugin);
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    pub fn set_command_line(&self, command_line: &str) {
        self.state.lock().command_line = command_line.to_string();
    }

    pub fn command_line(&self) -> String {
        self.state.lock().command_line.clone()
    }

    pub fn set_notes(&self, notes: &str) {
        self.state.lock().notes = notes.to_string();
    }

    pub fn notes(&self) -> String {
        self.state.lock().notes.clone()
    }

    pub fn set_init_script(&self, script: &str) {
        self.state.lock().init_script = script.to_string();
    }

    pub fn init_script(&self) -> String {
        self.state.lock().init_script.clone()
    }

    /// Last adopted staleness hash of the debuggee image.
    pub fn stored_hash(&self) -> u64 {
        self.state.lock().hash
    }

    /// Derive the database file location for a debuggee module. `dir`
    /// overrides the central database directory for this session. The file
    /// name is the module file name plus a bit-width suffix
    /// (`app.exe.dd64`); it lands beside the module when that is configured
    /// and the directory accepts a throwaway probe file, otherwise in the
    /// central directory.
    pub fn set_path(&self, dir: Option<&Path>, module_path: Option<&Path>) {
        let mut state = self.state.lock();
        if let Some(dir) = dir {
            state.database_dir = Some(dir.to_path_buf());
        }
        let Some(module_path) = module_path else {
            return;
        };
        state.module_path = Some(module_path.to_path_buf());

        let file_name = match module_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return,
        };
        let bits = module_bits(module_path);
        let db_name = format!("{file_name}.dd{bits}");

        let beside = module_path.parent().filter(|parent| {
            self.config.save_beside_module && directory_writable(parent)
        });
        let directory = match beside {
            Some(parent) => parent.to_path_buf(),
            None => {
                let central = state
                    .database_dir
                    .clone()
                    .unwrap_or_else(|| self.config.database_dir.clone());
                let _ = fs::create_dir_all(&central);
                central
            }
        };
        let path = directory.join(db_name);
        trace!(path = %path.display(), "database path set");
        state.path = Some(path);
    }

    /// Serialize the scoped document and write it out. An empty document
    /// deletes the database file and its sidecar instead: an empty database
    /// is the same thing as no database. The previous file is copied to a
    /// `.bak` first, best-effort; write failures leave the old file alone.
    pub fn save(
        &self,
        scope: SaveScope,
        path: Option<&Path>,
        disable_compression: Option<bool>,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        let path = match path.map(Path::to_path_buf).or_else(|| state.path.clone()) {
            Some(path) => path,
            None => return Err(DatabaseError::NoPath),
        };
        info!(path = %path.display(), "saving database");
        let started = Instant::now();

        let mut root = JsonObject::new();
        let sidecar = sibling(&path, COMMAND_LINE_SUFFIX);

        if scope.command_line() {
            if state.command_line.is_empty() {
                let _ = fs::remove_file(&sidecar);
            } else {
                if let Err(err) = persist::write_atomic(&sidecar, state.command_line.as_bytes()) {
                    warn!(%err, "failed to write command line sidecar");
                }
                let mut section = JsonObject::new();
                set_str(&mut section, "cmdLine", &state.command_line);
                root.insert("commandLine".to_string(), Value::Object(section));
            }
        }

        if scope.debug_data() {
            let mut data = JsonObject::new();
            self.comments.cache_save(&mut data);
            self.labels.cache_save(&mut data);
            self.bookmarks.cache_save(&mut data);
            self.functions.cache_save(&mut data);
            self.arguments.cache_save(&mut data);
            self.loops.cache_save(&mut data);
            self.xrefs.cache_save(&mut data);
            self.watches.cache_save(&mut data);
            self.encode_maps.cache_save(&mut data);
            self.breakpoints.cache_save(&mut data);

            if !state.notes.is_empty() {
                set_str(&mut data, "notes", &state.notes);
            }
            if !state.init_script.is_empty() {
                set_str(&mut data, "initscript", &state.init_script);
            }

            let mut plugin_root = JsonObject::new();
            for plugin in self.plugins.read().iter() {
                if let Some(Value::Object(tree)) = plugin.save() {
                    plugin_root.extend(tree);
                }
            }
            if !plugin_root.is_empty() {
                data.insert("plugins".to_string(), Value::Object(plugin_root));
            }

            // The hash accompanies actual debug data; it alone must not keep
            // an otherwise empty database alive on disk.
            if !data.is_empty() {
                if let Some(live) = live_module_hash(state.module_path.as_deref()) {
                    state.hash = live;
                }
                if state.hash != 0 {
                    set_str(&mut data, "hashAlgorithm", HASH_ALGORITHM);
                    set_hex(&mut data, "hash", state.hash);
                }
            }
            root.extend(data);
        }

        if root.is_empty() {
            trace!("empty database, removing on-disk files");
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(&sidecar);
            return Ok(());
        }

        if path.exists() {
            let _ = fs::copy(&path, sibling(&path, BACKUP_SUFFIX));
        }

        let text = serde_json::to_vec_pretty(&Value::Object(root))?;
        let disable = disable_compression.unwrap_or(self.config.disable_compression);
        let bytes = if disable {
            text
        } else {
            persist::compress_bytes(&text)?
        };
        if let Err(err) = persist::write_atomic(&path, &bytes) {
            error!(%err, path = %path.display(), "failed to write database file");
            return Err(err.into());
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "database saved");
        Ok(())
    }

    /// Parse the on-disk document and repopulate the scoped state. A missing
    /// file is a no-op (there is no database yet, which is fine); a file that
    /// is not compressed is parsed as-is. Parse failures surface an error and
    /// leave in-memory state untouched.
    pub fn load(&self, scope: SaveScope, path: Option<&Path>) -> Result<(), DatabaseError> {
        let mut state = self.state.lock();
        let path = match path.map(Path::to_path_buf).or_else(|| state.path.clone()) {
            Some(path) => path,
            None => return Err(DatabaseError::NoPath),
        };
        if !path.exists() {
            return Ok(());
        }
        info!(path = %path.display(), "loading database");
        let started = Instant::now();

        let mapped = persist::read_mapped(&path).map_err(|err| {
            error!(%err, "failed to open database file");
            DatabaseError::Io(err)
        })?;
        let root: Value = match persist::decompress_bytes(&mapped)? {
            Some(plain) => serde_json::from_slice(&plain),
            None => serde_json::from_slice(&mapped),
        }
        .map_err(|err| {
            error!(%err, "invalid database file (JSON)");
            DatabaseError::Json(err)
        })?;
        drop(mapped);
        let Some(root) = root.as_object() else {
            error!("invalid database file (JSON): top level is not an object");
            return Err(DatabaseError::InvalidArchive(
                "top level is not an object".to_string(),
            ));
        };

        if scope.command_line() {
            if let Some(command_line) = root
                .get("commandLine")
                .and_then(Value::as_object)
                .and_then(|section| get_str(section, "cmdLine"))
            {
                state.command_line = command_line.to_string();
                let sidecar = sibling(&path, COMMAND_LINE_SUFFIX);
                if let Err(err) = persist::write_atomic(&sidecar, command_line.as_bytes()) {
                    warn!(%err, "failed to restore command line sidecar");
                }
            }
        }

        if scope.debug_data() {
            self.comments.cache_load(root, false);
            self.labels.cache_load(root, false);
            self.bookmarks.cache_load(root, false);
            self.functions.cache_load(root, false);
            self.arguments.cache_load(root, false);
            self.loops.cache_load(root, false);
            self.xrefs.cache_load(root, false);
            self.watches.cache_load(root, false);
            self.encode_maps.cache_load(root, false);
            self.breakpoints.cache_load(root, false);

            state.notes = get_str(root, "notes").unwrap_or_default().to_string();
            state.init_script = get_str(root, "initscript").unwrap_or_default().to_string();

            if let Some(plugin_root) = root.get("plugins") {
                for plugin in self.plugins.read().iter() {
                    plugin.load(plugin_root);
                }
            }

            if let Some(stored) = get_hex(root, "hash") {
                let algorithm = get_str(root, "hashAlgorithm").unwrap_or(HASH_ALGORITHM);
                if algorithm != HASH_ALGORITHM {
                    warn!(algorithm, "unknown database hash algorithm, ignoring stored hash");
                    state.hash = live_module_hash(state.module_path.as_deref()).unwrap_or(0);
                } else {
                    match live_module_hash(state.module_path.as_deref()) {
                        Some(live) => {
                            if live != stored {
                                // Non-fatal: the annotations may describe an
                                // older build. The live hash wins from here on.
                                warn!(
                                    stored = format_args!("0x{:X}", stored),
                                    live = format_args!("0x{:X}", live),
                                    "database was saved for a different version of this module"
                                );
                            }
                            state.hash = live;
                        }
                        None => state.hash = stored,
                    }
                }
            }
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "database loaded");
        Ok(())
    }

    /// Save everything, then drop all live annotation state. The detach path.
    pub fn close(&self) -> Result<(), DatabaseError> {
        let result = self.save(SaveScope::All, None, None);
        self.clear();
        result
    }

    /// Drop all live annotation state without touching the on-disk database.
    pub fn clear(&self) {
        self.comments.clear();
        self.labels.clear();
        self.bookmarks.clear();
        self.functions.clear();
        self.arguments.clear();
        self.loops.clear();
        self.xrefs.clear();
        self.watches.clear();
        self.encode_maps.clear();
        self.breakpoints.clear();
        self.patches.clear();
        let mut state = self.state.lock();
        state.command_line.clear();
        state.notes.clear();
        state.init_script.clear();
        state.hash = 0;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.state.lock().path)
            .finish_non_exhaustive()
    }
}

/// `<file>.<suffix>` beside `path`, keeping the original extension.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Content hash of the debuggee image on disk, 0-free so "no hash" can stay
/// unrepresented in the document.
fn live_module_hash(module_path: Option<&Path>) -> Option<u64> {
    let bytes = fs::read(module_path?).ok()?;
    let hash = murmurhash(&bytes) as u64;
    if hash == 0 {
        None
    } else {
        Some(hash)
    }
}

/// Probe with a throwaway file; directory metadata alone lies on network
/// shares.
fn directory_writable(dir: &Path) -> bool {
    let probe = dir.join(WRITE_PROBE_FILE);
    match fs::File::create(&probe) {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Bit width of a PE image, used for the database suffix. Anything
/// unreadable or unparseable counts as 64-bit.
fn module_bits(path: &Path) -> u32 {
    let Ok(bytes) = fs::read(path) else {
        return 64;
    };
    match pelite::PeFile::from_bytes(&bytes) {
        Ok(pelite::Wrap::T32(_)) => 32,
        Ok(pelite::Wrap::T64(_)) => 64,
        Err(_) => 64,
    }
}
