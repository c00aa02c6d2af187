#![warn(clippy::pedantic)]

use clap::Parser;
use log::{error, info};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use weft::db::SnapshotDb;
use weft::resource::{ResourceResolver, SchedulerKind, TomlResourceResolver};
use weft::scheduler::distributed::Distributed;
use weft::scheduler::local::Local;
use weft::scheduler::Scheduler;
use weft::{host, DATA_DIRECTORY_NAME};

/// The engine host process: spawned with exactly three
/// positional arguments by the connection layer, either as a local
/// subprocess or over SSH on the submitting host.
#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "The weft workflow engine host process.")]
struct Options {
    /// Identifies which resource's configuration to place this engine under.
    resource_id: String,

    /// A client-supplied name distinguishing this engine instance from any
    /// other engine the same client may have running concurrently.
    object_name: String,

    /// A free-form tag threaded through this process's log lines.
    log_tag: String,
}

fn main_detail() -> Result<(), Box<dyn Error>> {
    let options = Options::parse();

    let env = env_logger::Env::default()
        .filter_or("WEFT_LOG", "info")
        .write_style_or("WEFT_LOG_STYLE", "auto");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    info!(
        "Starting engine host for resource '{}', object '{}' [{}].",
        options.resource_id, options.object_name, options.log_tag
    );

    let resolver = TomlResourceResolver::open()?;
    let config = resolver.resolve(&options.resource_id)?;

    let scheduler: Arc<dyn Scheduler> = match config.scheduler {
        SchedulerKind::Local => Local::new(config.workers.max(1)),
        SchedulerKind::Distributed => Distributed::new(config.workers.max(1), 1),
    };

    let home = match std::env::var("WEFT_HOME") {
        Ok(weft_home) => std::path::PathBuf::from(weft_home),
        Err(_) => home::home_dir().ok_or(weft::Error::NoHome)?,
    };
    let data_directory = home
        .join(".config")
        .join("weft")
        .join(DATA_DIRECTORY_NAME)
        .join(&options.resource_id)
        .join(&options.object_name);

    let db = Arc::new(SnapshotDb::open(&data_directory)?);
    let engine = weft::engine::Engine::new(db, scheduler, data_directory);

    host::run(engine, &config.login)?;

    Ok(())
}

fn main() -> ExitCode {
    if let Err(error) = main_detail() {
        error!("{error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
