//! 🚀 rollup-cli: the front door. Loads config, sets up logging, hands off to the library,
//! prints the summary.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..." 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🛫 Roll flight data up into per-partition summary reports.
#[derive(Debug, Parser)]
#[command(name = "rollup", version, about)]
struct Args {
    /// TOML config file. Missing file means environment variables (ROLLUP_*) only.
    #[arg(default_value = "rollup.toml")]
    config: PathBuf,
}

fn looks_like_a_connection_problem(err: &anyhow::Error) -> bool {
    err.chain().skip(1).any(|cause| {
        let cause = cause.to_string();
        cause.contains("error sending request")
            || cause.contains("connection refused")
            || cause.contains("Connection refused")
            || cause.contains("tcp connect error")
            || cause.contains("dns error")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_file = args
        .config
        .try_exists()
        .with_context(|| {
            format!(
                "💀 Couldn't check whether the config file exists. Relative paths are relative to the cwd; try an absolute one. Was checking here: '{}'",
                args.config.display()
            )
        })?
        .then_some(args.config.as_path());

    let app_config = rollup::app_config::load_config(config_file)
        .context("💀 Couldn't load the configuration. Check the TOML and any ROLLUP_* variables.")?;

    match rollup::run(app_config).await {
        Ok(summary) => {
            println!("{summary}");
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            if looks_like_a_connection_problem(&err) {
                error!(
                    "🔧 hint: looks like Elasticsearch isn't reachable. Check the url and that the \
                    cluster is up (`curl <url>` should answer). If it runs in Docker, `docker ps` \
                    will tell you whether it's alive. ☕"
                );
            }
            std::process::exit(1);
        }
    }
}
