//! The scripting subsystem façade.
//!
//! [`Scripting`] owns everything the subsystem runs: the deferred call
//! queue and its thread, the detached-callback registry, and one backend per
//! compiled-in language. Script operations are meant to be driven from one
//! host thread; only deferred posting is safe from any thread.

use std::sync::Arc;

use crate::config::ScriptingConfig;
use crate::deferred::{DeferredQueue, DeferredSender};
use crate::detach::DetachedCallbacks;
use crate::error::{Result, ScriptingError};
#[cfg(feature = "lua")]
use crate::lua::LuaBackend;
#[cfg(feature = "python")]
use crate::python::PythonBackend;
use crate::script::{Script, ScriptBackend, ScriptLanguage};

pub struct Scripting {
    config: ScriptingConfig,
    loaded: bool,
    deferred: Option<DeferredQueue>,
    detached: Arc<DetachedCallbacks>,
    backends: Vec<Arc<dyn ScriptBackend>>,
    #[cfg(feature = "python")]
    python: Option<Arc<PythonBackend>>,
}

impl Scripting {
    /// Subsystem with one backend per compiled-in language. Nothing runs
    /// until [`Scripting::load`].
    pub fn new(config: ScriptingConfig) -> Self {
        let mut backends: Vec<Arc<dyn ScriptBackend>> = Vec::new();

        #[cfg(feature = "lua")]
        backends.push(Arc::new(LuaBackend::new(config.lua.clone())));

        #[cfg(feature = "python")]
        let python = {
            let python = Arc::new(PythonBackend::new(config.python.clone()));
            backends.push(Arc::clone(&python) as Arc<dyn ScriptBackend>);
            Some(python)
        };

        Self {
            config,
            loaded: false,
            deferred: None,
            detached: Arc::new(DetachedCallbacks::new()),
            backends,
            #[cfg(feature = "python")]
            python,
        }
    }

    /// Subsystem over caller-supplied backends, one per language.
    pub fn with_backends(config: ScriptingConfig, backends: Vec<Arc<dyn ScriptBackend>>) -> Self {
        Self {
            config,
            loaded: false,
            deferred: None,
            detached: Arc::new(DetachedCallbacks::new()),
            backends,
            #[cfg(feature = "python")]
            python: None,
        }
    }

    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Start the deferred call thread and bootstrap every backend.
    ///
    /// A backend that fails to bootstrap stays unavailable without failing
    /// the subsystem.
    pub fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Err(ScriptingError::AlreadyLoaded);
        }

        let deferred = DeferredQueue::start(&self.config.deferred.thread_name)?;

        for backend in &self.backends {
            let language = backend.language();
            if language == ScriptLanguage::Python && !self.config.python.bootstrap_on_load {
                continue;
            }
            if !backend.bootstrap() {
                tracing::warn!(%language, "Scripting backend unavailable");
            }
        }

        self.deferred = Some(deferred);
        self.loaded = true;
        tracing::info!(formats = ?Self::supported_formats(), "Scripting subsystem loaded");
        Ok(())
    }

    /// Tear down every backend, free detached callbacks, then stop the
    /// deferred call thread. No-op when not loaded.
    pub fn unload(&mut self) {
        if !self.loaded {
            return;
        }

        for backend in &self.backends {
            backend.shutdown();
        }

        let total = self.detached.drain_and_free_all();
        tracing::info!(total, "Total detached callbacks: {total}");

        if let Some(mut deferred) = self.deferred.take() {
            deferred.shutdown();
        }
        self.loaded = false;
        tracing::debug!("Scripting subsystem unloaded");
    }

    /// Extensions of the compiled-in languages, in declared order.
    pub fn supported_formats() -> Vec<&'static str> {
        ScriptLanguage::COMPILED
            .iter()
            .map(|language| language.extension())
            .collect()
    }

    fn backend(&self, language: ScriptLanguage) -> Option<&Arc<dyn ScriptBackend>> {
        self.backends
            .iter()
            .find(|backend| backend.language() == language)
    }

    /// Create and load a script. `None` when the subsystem is not loaded,
    /// the path is empty or the extension is not handled by this build. A
    /// script that fails to load, including because its language runtime is
    /// unavailable, is still returned; check [`Script::loaded`].
    pub fn create_script(&self, path: &str) -> Option<Script> {
        if !self.loaded {
            tracing::warn!(path, "Scripting subsystem is not loaded");
            return None;
        }
        if path.is_empty() {
            tracing::warn!("Script path is empty");
            return None;
        }

        let backend = ScriptLanguage::from_path(path).and_then(|language| self.backend(language));
        let Some(backend) = backend else {
            tracing::warn!(path, "Unsupported/unknown script type");
            return None;
        };

        Some(backend.create(path))
    }

    /// Unload then load `script`. Returns the resulting loaded state.
    pub fn reload_script(&self, script: &mut Script) -> bool {
        if !self.loaded {
            return false;
        }
        let Some(backend) = self.backend(script.language()) else {
            return false;
        };
        let loaded = backend.reload(script, &self.detached);
        self.schedule_reclaim();
        loaded
    }

    /// Unload `script` if needed and release it.
    pub fn destroy_script(&self, script: Script) {
        if !self.loaded {
            return;
        }
        let Some(backend) = self.backend(script.language()) else {
            return;
        };
        if backend.destroy(script, &self.detached) > 0 {
            self.schedule_reclaim();
        }
    }

    /// Fire `event` at every callback `script` registered for it. Returns
    /// how many callbacks ran.
    pub fn emit(&self, script: &Script, event: &str, payload: &str) -> usize {
        if !self.loaded || !script.loaded() {
            return 0;
        }
        self.backend(script.language())
            .map_or(0, |backend| backend.emit(script, event, payload))
    }

    /// Module search path entries of `language`'s runtime.
    pub fn search_path(&self, language: ScriptLanguage) -> Vec<String> {
        self.backend(language)
            .map(|backend| backend.search_path())
            .unwrap_or_default()
    }

    /// Queue `call` on the deferred call thread. False when not loaded or
    /// shutting down.
    pub fn defer<F>(&self, call: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.as_ref().is_some_and(|deferred| deferred.post(call))
    }

    /// Producer handle for the deferred call queue, usable from any thread.
    pub fn deferred_sender(&self) -> Option<DeferredSender> {
        self.deferred.as_ref().map(DeferredQueue::sender)
    }

    /// Detached callbacks not yet freed.
    pub fn detached_callbacks(&self) -> usize {
        self.detached.len()
    }

    fn schedule_reclaim(&self) {
        let detached = Arc::clone(&self.detached);
        self.defer(move || {
            let freed = detached.reclaim();
            if freed > 0 {
                tracing::trace!(freed, "Reclaimed detached callbacks");
            }
        });
    }

    // ===== Python runtime queries =====

    /// Whether this build carries the Python backend. The runtime library
    /// itself is always bound at run time.
    pub fn python_runtime_linked() -> bool {
        cfg!(feature = "python")
    }

    /// Whether the Python runtime finished its bootstrap.
    pub fn python_loaded(&self) -> bool {
        #[cfg(feature = "python")]
        {
            if let Some(python) = &self.python {
                return python.is_ready();
            }
        }
        self.backend(ScriptLanguage::Python)
            .is_some_and(|backend| backend.is_ready())
    }

    /// Bootstrap the Python runtime with `home` as its home directory.
    /// A runtime that already failed is not retried.
    pub fn load_python(&self, home: &str) -> bool {
        #[cfg(feature = "python")]
        {
            if let Some(python) = &self.python {
                return python.bootstrap_with_home(Some(home));
            }
        }
        let _ = home;
        self.backend(ScriptLanguage::Python)
            .is_some_and(|backend| backend.bootstrap())
    }
}

impl Drop for Scripting {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for Scripting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripting")
            .field("loaded", &self.loaded)
            .field(
                "backends",
                &self.backends.iter().map(|b| b.language()).collect::<Vec<_>>(),
            )
            .field("detached", &self.detached.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::testing::MockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    struct CountWarnings(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for CountWarnings {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountWarnings(Arc::clone(&count)));
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, count.load(Ordering::SeqCst))
    }

    fn mock_scripting() -> (Scripting, Arc<MockBackend>, Arc<MockBackend>) {
        let lua = Arc::new(MockBackend::new(ScriptLanguage::Lua));
        let python = Arc::new(MockBackend::new(ScriptLanguage::Python));
        let scripting = Scripting::with_backends(
            ScriptingConfig::default(),
            vec![
                Arc::clone(&lua) as Arc<dyn ScriptBackend>,
                Arc::clone(&python) as Arc<dyn ScriptBackend>,
            ],
        );
        (scripting, lua, python)
    }

    fn loaded_mock_scripting() -> (Scripting, Arc<MockBackend>, Arc<MockBackend>) {
        let (mut scripting, lua, python) = mock_scripting();
        scripting.load().unwrap();
        (scripting, lua, python)
    }

    #[test]
    fn create_before_load_is_rejected() {
        let (scripting, _lua, python) = mock_scripting();
        assert!(scripting.create_script("/scripts/foo.py").is_none());
        assert!(python.state.lock().imports.is_empty());
    }

    #[test]
    fn load_twice_is_an_error() {
        let (mut scripting, _lua, _python) = loaded_mock_scripting();
        assert!(matches!(scripting.load(), Err(ScriptingError::AlreadyLoaded)));
    }

    #[test]
    fn create_dispatches_by_extension() {
        let (scripting, lua, python) = loaded_mock_scripting();

        let script = scripting.create_script("/scripts/foo.py").unwrap();
        assert_eq!(script.language(), ScriptLanguage::Python);
        assert_eq!(script.path(), "/scripts/foo.py");
        assert_eq!(script.file(), "foo");
        assert_eq!(script.dir(), "/scripts/");
        assert!(script.loaded());

        let upper = scripting.create_script("/scripts/intro.LUA").unwrap();
        assert_eq!(upper.language(), ScriptLanguage::Lua);

        assert_eq!(python.state.lock().imports, vec!["/scripts/foo.py"]);
        assert_eq!(lua.state.lock().imports, vec!["/scripts/intro.LUA"]);
    }

    #[test]
    fn unsupported_extension_warns_once_and_touches_no_backend() {
        let (scripting, lua, python) = loaded_mock_scripting();

        let (script, warnings) = count_warnings(|| scripting.create_script("/scripts/foo.txt"));
        assert!(script.is_none());
        assert_eq!(warnings, 1);
        assert!(lua.state.lock().imports.is_empty());
        assert!(python.state.lock().imports.is_empty());
    }

    #[test]
    fn empty_path_is_rejected() {
        let (scripting, _lua, _python) = loaded_mock_scripting();
        let (script, warnings) = count_warnings(|| scripting.create_script(""));
        assert!(script.is_none());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn unavailable_backend_returns_unloaded_scripts_but_others_work() {
        let lua = Arc::new(MockBackend::new(ScriptLanguage::Lua));
        let python = Arc::new(MockBackend::failing(ScriptLanguage::Python));
        let mut scripting = Scripting::with_backends(
            ScriptingConfig::default(),
            vec![
                Arc::clone(&lua) as Arc<dyn ScriptBackend>,
                Arc::clone(&python) as Arc<dyn ScriptBackend>,
            ],
        );
        scripting.load().unwrap();

        let script = scripting.create_script("/scripts/foo.py").unwrap();
        assert!(!script.loaded());
        assert!(python.state.lock().imports.is_empty());
        assert!(scripting.create_script("/scripts/foo.lua").unwrap().loaded());
        assert!(!scripting.python_loaded());
    }

    #[test]
    fn python_bootstrap_can_be_deferred_to_first_script() {
        let lua = Arc::new(MockBackend::new(ScriptLanguage::Lua));
        let python = Arc::new(MockBackend::new(ScriptLanguage::Python));
        let mut config = ScriptingConfig::default();
        config.python.bootstrap_on_load = false;
        let mut scripting = Scripting::with_backends(
            config,
            vec![
                Arc::clone(&lua) as Arc<dyn ScriptBackend>,
                Arc::clone(&python) as Arc<dyn ScriptBackend>,
            ],
        );

        scripting.load().unwrap();
        assert_eq!(python.state.lock().bootstrap_calls, 0);
        assert_eq!(lua.state.lock().bootstrap_calls, 1);

        assert!(scripting.create_script("/scripts/foo.py").is_some());
        assert!(scripting.python_loaded());
    }

    #[test]
    fn destroy_runs_unload_once_and_detaches() {
        let (scripting, _lua, python) = loaded_mock_scripting();

        let script = scripting.create_script("/scripts/foo.py").unwrap();
        scripting.destroy_script(script);
        assert_eq!(python.state.lock().unload_hooks, vec!["/scripts/foo.py"]);

        let mut script = scripting.create_script("/scripts/bar.py").unwrap();
        assert!(scripting.reload_script(&mut script));
        assert_eq!(python.state.lock().unload_hooks.len(), 2);
    }

    #[test]
    fn detached_callbacks_are_reclaimed_on_deferred_thread() {
        let (scripting, _lua, _python) = loaded_mock_scripting();
        let script = scripting.create_script("/scripts/foo.lua").unwrap();
        scripting.destroy_script(script);

        // The reclaim is queued before this marker, so it has run once the
        // marker does.
        let (tx, rx) = mpsc::channel();
        assert!(scripting.defer(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(scripting.detached_callbacks(), 0);
    }

    #[test]
    fn emit_requires_loaded_script() {
        let (scripting, _lua, python) = loaded_mock_scripting();
        let mut script = scripting.create_script("/scripts/foo.py").unwrap();

        assert_eq!(scripting.emit(&script, "tick", "0.016"), 1);
        assert_eq!(
            python.state.lock().fired,
            vec![("tick".to_string(), "0.016".to_string())]
        );

        let detached = DetachedCallbacks::new();
        python.unload(&mut script, &detached);
        assert_eq!(scripting.emit(&script, "tick", "0.016"), 0);
    }

    #[test]
    fn unload_tears_down_backends_then_queue() {
        let (mut scripting, lua, python) = loaded_mock_scripting();
        let sender = scripting.deferred_sender().unwrap();

        scripting.unload();
        assert!(!scripting.is_loaded());
        assert_eq!(lua.state.lock().shutdown_calls, 1);
        assert_eq!(python.state.lock().shutdown_calls, 1);
        assert!(sender.is_exiting());
        assert!(!scripting.defer(|| {}));

        scripting.unload();
        assert_eq!(lua.state.lock().shutdown_calls, 1);
    }

    #[test]
    fn operations_after_unload_are_noops() {
        let (mut scripting, _lua, python) = loaded_mock_scripting();
        let mut script = scripting.create_script("/scripts/foo.py").unwrap();
        scripting.unload();

        assert!(!scripting.reload_script(&mut script));
        scripting.destroy_script(script);
        assert!(python.state.lock().unload_hooks.is_empty());
    }

    #[test]
    fn supported_formats_follow_compiled_backends() {
        let formats = Scripting::supported_formats();
        let expected: Vec<&str> = ScriptLanguage::COMPILED
            .iter()
            .map(|language| language.extension())
            .collect();
        assert_eq!(formats, expected);
        if cfg!(all(feature = "lua", feature = "python")) {
            assert_eq!(formats, vec!["lua", "py"]);
        }
        assert_eq!(Scripting::python_runtime_linked(), cfg!(feature = "python"));
    }

    #[test]
    fn search_path_is_deduplicated_per_language() {
        let (scripting, _lua, _python) = loaded_mock_scripting();
        let _a = scripting.create_script("/scripts/a.lua").unwrap();
        let _b = scripting.create_script("/scripts/b.lua").unwrap();
        let _c = scripting.create_script("/other/c.lua").unwrap();

        assert_eq!(
            scripting.search_path(ScriptLanguage::Lua),
            vec!["/scripts/", "/other/"]
        );
        assert!(scripting.search_path(ScriptLanguage::Python).is_empty());
    }
}
