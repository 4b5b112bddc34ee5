//! Integration tests for the scripting crate.
//!
//! Drives the full subsystem (deferred thread, detachment registry, real Lua
//! backend) through the public API. The Python backend is pointed at a
//! directory without an interpreter, so these run on machines without one.

#![cfg(feature = "lua")]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use studio_scripting::{ScriptLanguage, Scripting, ScriptingConfig};

fn write_script(dir: &Path, name: &str, source: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path.to_string_lossy().replace('\\', "/")
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn config_without_python(dir: &Path) -> ScriptingConfig {
    let mut config = ScriptingConfig::default();
    config.python.library_dir = Some(dir.join("no-python"));
    config.python.library_name = "studio-missing-python".to_string();
    config
}

fn loaded_scripting(dir: &Path) -> Scripting {
    let mut scripting = Scripting::new(config_without_python(dir));
    scripting.load().unwrap();
    scripting
}

const RECORDING_SCRIPT: &str = r#"
local function append(name, text)
    local f = assert(io.open(__script_dir__ .. name, "a"))
    f:write(text)
    f:close()
end

function script_load()
    append("loaded.txt", get_script_path())
    on("tick", function(payload) append("ticks.txt", payload .. ";") end)
end

function script_unload()
    append("unloaded.txt", "x")
end
"#;

// --- Script lifecycle ---

#[test]
fn lua_script_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "recorder.lua", RECORDING_SCRIPT);
    let scripting = loaded_scripting(dir.path());

    let script = scripting.create_script(&path).unwrap();
    assert!(script.loaded());
    assert_eq!(script.language(), ScriptLanguage::Lua);
    assert_eq!(script.file(), "recorder");
    assert_eq!(read(&dir.path().join("loaded.txt")), script.dir());

    assert_eq!(scripting.emit(&script, "tick", "1"), 1);
    assert_eq!(scripting.emit(&script, "tick", "2"), 1);
    assert_eq!(scripting.emit(&script, "frame", "3"), 0);
    assert_eq!(read(&dir.path().join("ticks.txt")), "1;2;");

    scripting.destroy_script(script);
    assert_eq!(read(&dir.path().join("unloaded.txt")), "x");
}

#[test]
fn reload_runs_unload_hook_and_reimports() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "recorder.lua", RECORDING_SCRIPT);
    let scripting = loaded_scripting(dir.path());

    let mut script = scripting.create_script(&path).unwrap();
    assert!(scripting.reload_script(&mut script));
    assert_eq!(read(&dir.path().join("unloaded.txt")), "x");

    // Old callbacks were detached; only the re-registered one fires.
    assert_eq!(scripting.emit(&script, "tick", "after"), 1);
    assert_eq!(read(&dir.path().join("ticks.txt")), "after;");

    scripting.destroy_script(script);
    assert_eq!(read(&dir.path().join("unloaded.txt")), "xx");
}

#[test]
fn broken_script_is_returned_unloaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "broken.lua", "this is not lua");
    let scripting = loaded_scripting(dir.path());

    let mut script = scripting.create_script(&path).unwrap();
    assert!(!script.loaded());
    assert_eq!(scripting.emit(&script, "tick", ""), 0);

    // Fixing the file and reloading recovers the script.
    std::fs::write(&path, "function script_load() end\n").unwrap();
    assert!(scripting.reload_script(&mut script));
    scripting.destroy_script(script);
}

#[test]
fn unsupported_scripts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let scripting = loaded_scripting(dir.path());

    let notes = dir.path().join("notes.txt");
    assert!(scripting.create_script(&notes.to_string_lossy()).is_none());
    assert!(scripting.create_script("").is_none());
}

#[test]
fn unavailable_runtime_returns_unloaded_script() {
    let dir = tempfile::tempdir().unwrap();
    let py = write_script(dir.path(), "tool.py", "def script_load():\n    pass\n");
    let scripting = loaded_scripting(dir.path());

    let mut script = scripting.create_script(&py).unwrap();
    assert!(!script.loaded());
    assert_eq!(script.file(), "tool");
    assert_eq!(scripting.emit(&script, "tick", ""), 0);
    assert!(!scripting.reload_script(&mut script));
    scripting.destroy_script(script);

    assert!(!scripting.python_loaded());
    assert!(!scripting.load_python("/opt/python"));
}

#[test]
fn create_before_load_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "early.lua", "");
    let scripting = Scripting::new(config_without_python(dir.path()));
    assert!(scripting.create_script(&path).is_none());
}

#[test]
fn lua_search_path_registers_directory_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_script(dir.path(), "a.lua", "");
    let b = write_script(dir.path(), "b.lua", "");
    let scripting = loaded_scripting(dir.path());

    let script_a = scripting.create_script(&a).unwrap();
    let script_b = scripting.create_script(&b).unwrap();
    let pattern = format!("{}?.lua", script_a.dir());
    let entries = scripting.search_path(ScriptLanguage::Lua);
    assert_eq!(entries.iter().filter(|entry| **entry == pattern).count(), 1);

    scripting.destroy_script(script_a);
    scripting.destroy_script(script_b);
}

#[test]
fn script_can_require_sibling_module() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "helpers.lua", "return { greeting = 'hello' }\n");
    let main = write_script(
        dir.path(),
        "main.lua",
        r#"
function script_load()
    local helpers = require("helpers")
    local f = assert(io.open(__script_dir__ .. "greeting.txt", "w"))
    f:write(helpers.greeting)
    f:close()
end
"#,
    );
    let scripting = loaded_scripting(dir.path());

    let script = scripting.create_script(&main).unwrap();
    assert!(script.loaded());
    assert_eq!(read(&dir.path().join("greeting.txt")), "hello");
    scripting.destroy_script(script);
}

// --- Deferred calls and teardown ---

#[test]
fn deferred_calls_run_in_order_until_unload() {
    let dir = tempfile::tempdir().unwrap();
    let mut scripting = loaded_scripting(dir.path());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let sender = scripting.deferred_sender().unwrap();
    let producer = {
        let order = Arc::clone(&order);
        std::thread::spawn(move || {
            for index in 0..20 {
                let order = Arc::clone(&order);
                assert!(sender.post(move || order.lock().push(index)));
            }
        })
    };
    producer.join().unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(scripting.defer(move || tx.send(()).unwrap()));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());

    scripting.unload();
    let late = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&late);
    assert!(!scripting.defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[test]
fn unload_frees_detached_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "recorder.lua", RECORDING_SCRIPT);
    let mut scripting = loaded_scripting(dir.path());

    let script = scripting.create_script(&path).unwrap();
    scripting.destroy_script(script);
    scripting.unload();

    assert_eq!(scripting.detached_callbacks(), 0);
    assert!(!scripting.is_loaded());
}

#[test]
fn lua_works_again_after_unload_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), "recorder.lua", RECORDING_SCRIPT);
    let mut scripting = loaded_scripting(dir.path());

    let first = scripting.create_script(&path).unwrap();
    scripting.destroy_script(first);
    scripting.unload();

    scripting.load().unwrap();
    let script = scripting.create_script(&path).unwrap();
    assert!(script.loaded());
    assert_eq!(scripting.emit(&script, "tick", "again"), 1);
    assert_eq!(read(&dir.path().join("ticks.txt")), "again;");

    let pattern = format!("{}?.lua", script.dir());
    let entries = scripting.search_path(ScriptLanguage::Lua);
    assert_eq!(entries.iter().filter(|entry| **entry == pattern).count(), 1);
    scripting.destroy_script(script);
}
