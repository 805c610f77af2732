mod cli;
mod telemetry;
mod watch;

use clap::Parser;

use crate::cli::Cli;
use crate::telemetry::LogConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    watch::run(cli).await
}
