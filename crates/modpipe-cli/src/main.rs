//! CLI entry point for modpipe.
//!
//! Loads a pipeline configuration, resolves and instantiates the configured
//! modules, and drives them through the full lifecycle. The engine itself is
//! synchronous; the async runtime exists only to wire Ctrl-C into the
//! engine's interrupt flag, so an interrupt lets the current lifecycle call
//! finish and then proceeds straight to teardown.
//!
//! Exit codes: 0 on success, 1 on configuration errors (including plugin
//! resolution), 2 on execution errors, 3 on internal faults.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use modpipe_core::{CoreError, LibrarySource, ModuleManager, PipelineConfig, PluginLoader};

const EXIT_CONFIG: u8 = 1;
const EXIT_EXECUTION: u8 = 2;
const EXIT_INTERNAL: u8 = 3;

#[derive(Parser)]
#[command(name = "modpipe")]
#[command(about = "Modular event-processing pipeline", long_about = None)]
struct Cli {
    /// Path to the pipeline configuration file
    config: PathBuf,

    /// Write log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match PipelineConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.engine.log_level)
        .to_string();
    if let Err(e) = init_logging(&level, cli.log_file.as_ref()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_INTERNAL);
    }

    let manager = match ModuleManager::new(&config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Ctrl-C finishes the current lifecycle call, then abandons the rest.
    let interrupt = manager.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current module call");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let outcome = tokio::task::spawn_blocking(move || run_pipeline(config, manager)).await;
    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("internal fault: {e}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

fn run_pipeline(config: PipelineConfig, mut manager: ModuleManager) -> ExitCode {
    let source = LibrarySource::new(config.engine.module_path.clone()).with_env_paths();
    let mut loader = PluginLoader::new(source);

    if let Err(e) = manager.load(&mut loader, &config.modules) {
        error!("{e}");
        return ExitCode::from(EXIT_CONFIG);
    }
    info!(
        instances = manager.instance_count(),
        events = config.engine.events,
        "pipeline loaded"
    );

    let report = match manager.execute() {
        Ok(report) => report,
        Err(e @ CoreError::ModuleFailed { .. }) => {
            error!("{e}");
            manager.shutdown();
            return ExitCode::from(EXIT_EXECUTION);
        }
        Err(e) => {
            error!("{e}");
            manager.shutdown();
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    if report.interrupted {
        warn!(
            events_completed = report.events_completed,
            "pipeline interrupted"
        );
    } else {
        info!(
            events_completed = report.events_completed,
            "pipeline finished"
        );
    }
    manager.shutdown();
    ExitCode::SUCCESS
}
