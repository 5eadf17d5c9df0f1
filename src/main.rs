use clap::Parser;

use wa_gateway::modules::{config, logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    let app_config = config::resolve(cli)?;

    let _guard = logger::init_logger(&app_config);
    config::ensure_directories(&app_config)?;

    wa_gateway::run(app_config).await
}
