//! Script records and the per-language backend contract.
//!
//! A [`Script`] is a plain record: normalized path fields, the language
//! fixed from its extension, and its lifecycle state. Native runtime state
//! (modules, environments, registered callbacks) lives inside the
//! [`ScriptBackend`] that services the script, keyed by [`ScriptId`].
//!
//! The lifecycle itself is implemented once, as provided methods on
//! [`ScriptBackend`]; backends only supply the runtime-specific steps.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::detach::{CallbackRecord, DetachedCallbacks};

// ===== Languages =====

/// Scripting languages the subsystem knows how to dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptLanguage {
    Lua,
    Python,
}

impl ScriptLanguage {
    /// Languages whose backends are compiled into this build, in the order
    /// reported by `supported_formats`.
    pub const COMPILED: &'static [Self] = &[
        #[cfg(feature = "lua")]
        Self::Lua,
        #[cfg(feature = "python")]
        Self::Python,
    ];

    /// File extension, without the leading dot.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Lua => "lua",
            Self::Python => "py",
        }
    }

    /// Match an extension (without dot), ignoring ASCII case.
    pub fn from_extension(ext: &str) -> Option<Self> {
        [Self::Lua, Self::Python]
            .into_iter()
            .find(|lang| lang.extension().eq_ignore_ascii_case(ext))
    }

    /// Language selected by the extension of the last path component.
    pub fn from_path(path: &str) -> Option<Self> {
        let file = file_component(path);
        let (_, ext) = file.rsplit_once('.')?;
        Self::from_extension(ext)
    }
}

impl fmt::Display for ScriptLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lua => "Lua",
            Self::Python => "Python",
        })
    }
}

fn file_component(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

// ===== Paths =====

/// Normalized path fields of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPath {
    path: String,
    dir: String,
    file: String,
}

impl ScriptPath {
    /// Normalize `path` (backslashes become forward slashes) and split it
    /// into its directory, including the trailing slash, and its base name
    /// with the language extension stripped.
    pub fn parse(path: &str, language: ScriptLanguage) -> Self {
        let path = path.replace('\\', "/");
        let (dir, file) = match path.rfind('/') {
            Some(slash) => (&path[..=slash], &path[slash + 1..]),
            None => ("", path.as_str()),
        };

        let suffix_len = language.extension().len() + 1;
        let file = match file.len().checked_sub(suffix_len) {
            Some(stem_len)
                if file.is_char_boundary(stem_len)
                    && file[stem_len..].starts_with('.')
                    && file[stem_len + 1..].eq_ignore_ascii_case(language.extension()) =>
            {
                &file[..stem_len]
            }
            _ => file,
        };

        Self {
            dir: dir.to_string(),
            file: file.to_string(),
            path,
        }
    }

    /// Full normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Containing directory with its trailing slash, or empty.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Base name without the extension; the module name for import.
    pub fn file(&self) -> &str {
        &self.file
    }
}

// ===== Script record =====

/// Identity of a script inside its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(u64);

impl ScriptId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a [`Script`].
///
/// Destruction consumes the record, so there is no destroyed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptState {
    Created,
    Loaded,
    LoadFailed,
    Unloaded,
}

/// One script file serviced by exactly one backend.
#[derive(Debug)]
pub struct Script {
    id: ScriptId,
    path: ScriptPath,
    language: ScriptLanguage,
    state: ScriptState,
}

impl Script {
    pub fn new(path: &str, language: ScriptLanguage) -> Self {
        Self {
            id: ScriptId::next(),
            path: ScriptPath::parse(path, language),
            language,
            state: ScriptState::Created,
        }
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn path(&self) -> &str {
        self.path.path()
    }

    pub fn file(&self) -> &str {
        self.path.file()
    }

    pub fn dir(&self) -> &str {
        self.path.dir()
    }

    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    pub fn state(&self) -> ScriptState {
        self.state
    }

    pub fn loaded(&self) -> bool {
        self.state == ScriptState::Loaded
    }
}

// ===== Search paths =====

/// Directories already registered on a runtime's module search path.
#[derive(Debug, Default, Clone)]
pub struct SearchPathSet {
    paths: Vec<String>,
}

impl SearchPathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `dir`. Returns false for an empty or already known directory.
    pub fn insert(&mut self, dir: &str) -> bool {
        if dir.is_empty() || self.contains(dir) {
            return false;
        }
        self.paths.push(dir.to_string());
        true
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.paths.iter().any(|known| known == dir)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }
}

// ===== Backend contract =====

/// Runtime-specific half of the script lifecycle for one language.
///
/// Implementations serialize access to their runtime internally; all
/// methods take `&self`.
pub trait ScriptBackend: Send + Sync {
    fn language(&self) -> ScriptLanguage;

    /// Bring the runtime up if it is not yet. Idempotent; returns whether
    /// the runtime is usable. A failed bootstrap is not retried.
    fn bootstrap(&self) -> bool;

    /// Whether the runtime finished its bootstrap successfully.
    fn is_ready(&self) -> bool;

    /// Register `dir` on the runtime's module search path. Returns true only
    /// when the directory was newly added.
    fn add_search_path(&self, dir: &str) -> bool;

    /// The runtime's live module search path entries.
    fn search_path(&self) -> Vec<String>;

    /// Import the script, inject the host surface and run its load hook.
    /// On failure nothing of the script stays registered in the runtime.
    fn import_script(&self, script: &Script) -> bool;

    /// Run the script's unload hook and release its runtime state. Returns
    /// the callback records the script still had registered.
    fn release_script(&self, script: &Script) -> Vec<Arc<CallbackRecord>>;

    /// Call every callback the script registered for `event`, in
    /// registration order. Returns how many ran.
    fn emit(&self, script: &Script, event: &str, payload: &str) -> usize;

    /// Tear the runtime down. Scripts are expected to be destroyed already.
    fn shutdown(&self);

    /// Allocate a record for `path`, register its directory and attempt
    /// the first load.
    fn create(&self, path: &str) -> Script {
        let mut script = Script::new(path, self.language());
        self.add_search_path(script.dir());
        self.load(&mut script);
        script
    }

    /// Load `script` unless it already is. Returns the resulting state.
    fn load(&self, script: &mut Script) -> bool {
        if script.loaded() {
            return true;
        }
        script.state = if self.import_script(script) {
            ScriptState::Loaded
        } else {
            ScriptState::LoadFailed
        };
        script.loaded()
    }

    /// Unload `script` if loaded, detaching its callbacks. Returns how many
    /// callbacks were detached.
    fn unload(&self, script: &mut Script, detached: &DetachedCallbacks) -> usize {
        if !script.loaded() {
            return 0;
        }
        let records = self.release_script(script);
        script.state = ScriptState::Unloaded;
        records
            .into_iter()
            .filter(|record| detached.detach(Arc::clone(record)))
            .count()
    }

    /// Unload then load again.
    fn reload(&self, script: &mut Script, detached: &DetachedCallbacks) -> bool {
        self.unload(script, detached);
        self.load(script)
    }

    /// Unload if still loaded, then release the record.
    fn destroy(&self, mut script: Script, detached: &DetachedCallbacks) -> usize {
        let count = self.unload(&mut script, detached);
        tracing::trace!(path = script.path(), "Destroyed script");
        count
    }
}
