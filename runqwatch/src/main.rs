use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use runqwatch::{RunqWatchEngine, settings::Settings};

#[derive(Debug, Parser)]
#[clap(about = "Run queue latency and preemption attribution per container")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Prebuilt BPF object (overrides PROBE__OBJECT_PATH)
    #[clap(long, value_name = "PATH")]
    probe_object: Option<PathBuf>,

    /// Log metric points instead of exporting them
    #[clap(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let mut settings = Settings::new()?;
    if let Some(path) = opt.probe_object {
        settings.probe.object_path = Some(path.to_string_lossy().into_owned());
    }
    info!("Starting runqwatch");

    RunqWatchEngine::new(settings)
        .dry_run(opt.dry_run)
        .run()
        .await
}
