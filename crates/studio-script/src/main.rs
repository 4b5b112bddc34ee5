//! studio-script: command-line host for studio scripts.
//!
//! Loads the scripting subsystem outside the studio application so scripts
//! can be exercised and the Python runtime lookup diagnosed.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use studio_scripting::{Script, Scripting, ScriptingConfig};

use crate::logging::{LogConfig, LogFormat, init_logging};

#[derive(Parser, Debug)]
#[command(name = "studio-script", version, about = "Run studio scripts outside the studio host")]
struct Cli {
    /// Scripting configuration file (TOML). Defaults apply when absent.
    #[arg(long, short = 'c', global = true, env = "STUDIO_SCRIPT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter; RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Also append logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the script extensions this build supports
    Formats,

    /// Load scripts, fire events at them, then tear everything down
    Run {
        /// Script files to load
        #[arg(required = true)]
        scripts: Vec<String>,

        /// Number of events to fire at every loaded script
        #[arg(long, default_value_t = 0)]
        ticks: u32,

        /// Delay between events
        #[arg(long, default_value_t = 16)]
        interval_ms: u64,

        /// Event name fired on each tick
        #[arg(long, default_value = "tick")]
        event: String,
    },

    /// Try to bootstrap the Python runtime and report the result
    Python {
        /// Runtime home directory (overrides the config file)
        #[arg(long)]
        home: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<ScriptingConfig> {
    match path {
        Some(path) => ScriptingConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(ScriptingConfig::default()),
    }
}

fn cmd_formats() {
    for format in Scripting::supported_formats() {
        println!("{format}");
    }
}

fn cmd_run(
    config: ScriptingConfig,
    paths: &[String],
    ticks: u32,
    interval: Duration,
    event: &str,
) -> Result<()> {
    let mut scripting = Scripting::new(config);
    scripting.load().context("failed to load scripting subsystem")?;

    let mut scripts: Vec<Script> = Vec::with_capacity(paths.len());
    let mut failed = 0usize;
    for path in paths {
        match scripting.create_script(path) {
            Some(script) if script.loaded() => {
                println!("loaded {path}");
                scripts.push(script);
            }
            Some(script) => {
                println!("failed {path}");
                failed += 1;
                scripting.destroy_script(script);
            }
            None => {
                println!("rejected {path}");
                failed += 1;
            }
        }
    }

    for tick in 0..ticks {
        let payload = tick.to_string();
        let fired: usize = scripts
            .iter()
            .map(|script| scripting.emit(script, event, &payload))
            .sum();
        tracing::debug!(tick, event, fired, "Fired event");
        if tick + 1 < ticks {
            std::thread::sleep(interval);
        }
    }

    for script in scripts {
        scripting.destroy_script(script);
    }
    scripting.unload();

    if failed > 0 {
        bail!("{failed} of {} script(s) failed to load", paths.len());
    }
    Ok(())
}

fn cmd_python(mut config: ScriptingConfig, home: Option<PathBuf>) -> Result<()> {
    if !Scripting::python_runtime_linked() {
        bail!("this build does not include the Python backend");
    }
    if let Some(home) = home {
        config.python.home = Some(home);
    }
    config.python.bootstrap_on_load = true;

    let mut scripting = Scripting::new(config);
    scripting.load().context("failed to load scripting subsystem")?;
    let ready = scripting.python_loaded();
    if ready {
        println!("python: ready");
        for entry in scripting.search_path(studio_scripting::ScriptLanguage::Python) {
            println!("  {entry}");
        }
    }
    scripting.unload();

    if !ready {
        bail!("Python runtime unavailable (see log for the library that failed to bind)");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    match cli.command {
        Commands::Formats => {
            cmd_formats();
            Ok(())
        }
        Commands::Run {
            scripts,
            ticks,
            interval_ms,
            event,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_run(config, &scripts, ticks, Duration::from_millis(interval_ms), &event)
        }
        Commands::Python { home } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_python(config, home)
        }
    }
}
