mod runner;

use std::path::PathBuf;

use clap::Parser;
use loadmesh_core::config::SlaveConfig;

#[derive(Debug, Parser)]
#[command(name = "loadmesh-slave", about = "Registers with a loadmesh master and executes assigned tasks")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the config's master_address, e.g. "127.0.0.1:7070".
    #[arg(long)]
    master: Option<String>,

    #[arg(long)]
    slave_id: Option<String>,

    /// Repeatable: --capability http --capability grpc
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Repeatable: --label region=us-east
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    #[arg(long)]
    log_level: Option<String>,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("label `{raw}` must be in key=value form"))?;
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = SlaveConfig::load(cli.config.as_deref()).expect("failed to load config");

    if let Some(master) = cli.master {
        config.master_address = master;
    }
    if let Some(slave_id) = cli.slave_id {
        config.slave_id = Some(slave_id);
    }
    if !cli.capabilities.is_empty() {
        config.capabilities = cli.capabilities;
    }
    for (key, value) in cli.labels {
        config.labels.insert(key, value);
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    runner::run(config).await;
}
