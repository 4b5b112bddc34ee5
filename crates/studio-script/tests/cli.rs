//! CLI contract tests for `studio-script`.
//!
//! Runs the binary against script fixtures in a temp directory and checks
//! exit codes plus the per-script status lines on stdout.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Fixture helpers
// =============================================================================

fn write(dir: &TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path.to_string_lossy().replace('\\', "/")
}

/// Config whose Python runtime can never be found, so results do not depend
/// on the machine having an interpreter installed.
fn config_without_python(dir: &TempDir) -> String {
    let missing = dir.path().join("no-python").to_string_lossy().replace('\\', "/");
    write(
        dir,
        "scripting.toml",
        &format!(
            r#"
[python]
library_dir = "{missing}"
library_name = "studio-missing-python"

[deferred]
thread_name = "cli-defer"
"#
        ),
    )
}

fn studio_script() -> Command {
    let mut cmd = Command::cargo_bin("studio-script").expect("binary built");
    cmd.env_remove("RUST_LOG").env_remove("STUDIO_SCRIPT_CONFIG");
    cmd
}

// =============================================================================
// formats
// =============================================================================

#[test]
fn formats_lists_compiled_extensions() {
    let assert = studio_script().arg("formats").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    let formats: Vec<&str> = stdout.lines().collect();
    if cfg!(feature = "lua") {
        assert!(formats.contains(&"lua"));
    }
    if cfg!(feature = "python") {
        assert!(formats.contains(&"py"));
    }
}

// =============================================================================
// run
// =============================================================================

#[cfg(feature = "lua")]
#[test]
fn run_ticks_a_lua_script() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_without_python(&dir);
    let script = write(
        &dir,
        "counter.lua",
        r#"
local count = 0
function script_load()
    on("tick", function() count = count + 1 end)
end
function script_unload()
    local f = assert(io.open(__script_dir__ .. "count.txt", "w"))
    f:write(tostring(count))
    f:close()
end
"#,
    );

    studio_script()
        .args(["--config", &config, "run", &script, "--ticks", "3", "--interval-ms", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("loaded {script}")));

    let count = std::fs::read_to_string(dir.path().join("count.txt")).expect("count written");
    assert_eq!(count, "3");
}

#[cfg(feature = "lua")]
#[test]
fn run_fails_when_a_script_fails_to_load() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_without_python(&dir);
    let good = write(&dir, "good.lua", "function script_load() end\n");
    let bad = write(&dir, "bad.lua", "function script_load(\n");

    studio_script()
        .args(["--config", &config, "run", &good, &bad])
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!("loaded {good}")))
        .stdout(predicate::str::contains(format!("failed {bad}")))
        .stderr(predicate::str::contains("1 of 2 script(s) failed to load"));
}

#[test]
fn run_rejects_unsupported_extension() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_without_python(&dir);
    let notes = write(&dir, "notes.txt", "not a script");

    studio_script()
        .args(["--config", &config, "run", &notes])
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!("rejected {notes}")));
}

#[test]
fn run_reports_invalid_config() {
    let dir = TempDir::new().expect("temp dir");
    let config = write(&dir, "broken.toml", "[python\nlibrary_name = 3");

    studio_script()
        .args(["--config", &config, "run", "whatever.lua"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn run_without_scripts_is_a_usage_error() {
    studio_script().arg("run").assert().failure().code(2);
}

// =============================================================================
// python
// =============================================================================

#[test]
fn python_reports_missing_runtime() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_without_python(&dir);

    studio_script()
        .args(["--config", &config, "python"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("python: ready").not());
}
