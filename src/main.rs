use clap::Parser;

use datamaster_collector_lib::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    datamaster_collector_lib::run(Cli::parse()).await
}
