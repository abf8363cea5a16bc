use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info};
use partymic::audio::EffectKind;
use partymic::media::device::{CpalMicrophone, CpalPlaybackSink};
use partymic::media::webrtc::WebRtcPeerFactory;
use partymic::relay::WebSocketRelay;
use partymic::{AgentConfig, ListenerAgent, SessionPolicy, SingerAgent};
use tokio::sync::watch;

// Usage:
//   partymic-relay --bind 0.0.0.0:8080
//   partymic listen --relay ws://host:8080 --party 42
//   partymic sing --relay ws://host:8080 --party 42 --gain 1.5 --reverb

#[derive(Debug, Parser)]
#[command(name = "partymic", version, about = "Use this device as a party microphone")]
struct Cli {
    /// Relay server URL
    #[arg(short, long, global = true, default_value = "ws://127.0.0.1:8080")]
    relay: String,

    /// Party to join, overriding the config file
    #[arg(short, long, global = true)]
    party: Option<String>,

    /// JSON agent config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture the microphone and send it to the party's listener
    Sing {
        /// Microphone gain, 0 to 2
        #[arg(short, long, default_value_t = 1.0)]
        gain: f32,
        /// Add the room reverb
        #[arg(long)]
        reverb: bool,
        /// Start muted
        #[arg(long)]
        muted: bool,
    },
    /// Answer singers and play them on this device
    Listen {
        /// Allow several guests to sing at once
        #[arg(long)]
        per_guest: bool,
    },
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

    if let Err(e) = run(Cli::parse()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(party) = cli.party {
        config.party_id = party.into();
    }
    anyhow::ensure!(
        !config.party_id.as_str().is_empty(),
        "a party id is required (--party or config)"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let relay = Arc::new(
            WebSocketRelay::connect(&cli.relay)
                .await
                .with_context(|| format!("connecting to {}", cli.relay))?,
        );
        let peers = Arc::new(WebRtcPeerFactory::new(config.ice_servers.clone()));

        match cli.command {
            Command::Sing {
                gain,
                reverb,
                muted,
            } => {
                let agent = SingerAgent::new(config, relay, Arc::new(CpalMicrophone::new()), peers);
                spawn_status_logger(agent.status());
                let mut session = agent.start().await?;
                session.set_gain(gain);
                session.set_muted(muted);
                if reverb {
                    session.set_effect(EffectKind::Reverb);
                }

                let mut state = session.state_watch();
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Stopping"),
                    _ = state.wait_for(|s| s.is_terminal()) => {}
                }
                let end = session.stop().await;
                info!("Session ended: {end:?}");
            }
            Command::Listen { per_guest } => {
                if per_guest {
                    config.session_policy = SessionPolicy::PerGuest;
                }
                let agent =
                    ListenerAgent::new(config, relay, peers, Arc::new(CpalPlaybackSink::new()));
                spawn_status_logger(agent.status());
                let mut handle = agent.listen().await?;
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                info!("Stopping");
                handle.stop().await;
            }
        }
        Ok(())
    })
}

fn spawn_status_logger(mut status: watch::Receiver<String>) {
    tokio::spawn(async move {
        info!("Status: {}", *status.borrow_and_update());
        while status.changed().await.is_ok() {
            info!("Status: {}", *status.borrow_and_update());
        }
    });
}
