use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forge_throttle::config::ThrottleConfig;
use forge_throttle::ratelimit::presets;

/// Operator tool for the forge throttling layer.
#[derive(Parser, Debug)]
#[command(name = "forge-throttle", version, about)]
struct Cli {
    /// YAML configuration file, overridable with FORGE_THROTTLE__* variables
    #[arg(short, long, env = "FORGE_THROTTLE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count one request for a key against a single tier
    Check { tier: String, key: String },
    /// Count one request for a key against every tier
    CheckAll { key: String },
    /// Show a key's counter in a tier without consuming quota
    Status { tier: String, key: String },
    /// Clear a key's counter in a tier
    Reset { tier: String, key: String },
    /// List the built-in presets
    Presets,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresetView {
    name: &'static str,
    window_secs: u64,
    max_requests: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Command::Presets = cli.command {
        let views: Vec<PresetView> = presets::ALL
            .iter()
            .map(|p| PresetView {
                name: p.name,
                window_secs: p.window.as_secs(),
                max_requests: p.max_requests,
            })
            .collect();
        return print_json(&views);
    }

    let config = ThrottleConfig::load(cli.config.as_deref())?;
    info!(tiers = config.tiers.len(), "Configuration loaded");

    let limiter = config.build_limiter().await?;

    let outcome = match &cli.command {
        Command::Check { tier, key } => {
            let decision = limiter.limiter(tier)?.check_key(key).await;
            print_json(&decision)
        }
        Command::CheckAll { key } => {
            let decision = limiter.check_all_for_key(key).await?;
            print_json(&decision)
        }
        Command::Status { tier, key } => {
            let status = limiter.limiter(tier)?.status_for_key(key).await?;
            print_json(&status)
        }
        Command::Reset { tier, key } => {
            limiter.limiter(tier)?.reset_for_key(key).await?;
            info!(tier = %tier, key = %key, "Counter reset");
            print_json(&serde_json::json!({ "tier": tier, "key": key, "reset": true }))
        }
        Command::Presets => Ok(()),
    };

    limiter.close();
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
