use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info};
use partymic::RelayServerConfig;
use partymic::relay::RelayServer;

/// Signaling relay for PartyMic: one room per party channel, every publish
/// fanned out to the other members of the room.
#[derive(Debug, Parser)]
#[command(name = "partymic-relay", version)]
struct Args {
    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    if let Err(e) = run(Args::parse()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => RelayServerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let server = RelayServer::bind(&config)
            .await
            .with_context(|| format!("binding {}", config.bind_addr))?;
        tokio::select! {
            result = server.run() => result.context("relay server stopped"),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                Ok(())
            }
        }
    })
}
