//! PIERCE command-line front end.
//!
//! Lists remote-play capable consoles on the account and runs a full
//! negotiation against one of them, printing the punched local ports.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use pierce_core::{ConsoleKind, PortKind, Session, SessionConfig};

/// PIERCE - session negotiation and UDP hole punching for remote play
#[derive(Parser)]
#[command(name = "pierce")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// OAuth2 bearer token (defaults to $PSN_TOKEN)
    #[arg(long, env = "PSN_TOKEN", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List remote-play capable consoles on the account
    Devices {
        /// Console platform
        #[arg(long, default_value = "ps5")]
        platform: String,

        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Negotiate a session and punch the control and data flows
    Connect {
        /// Console device UID (64 hex characters)
        #[arg(long)]
        duid: String,

        /// Console platform
        #[arg(long, default_value = "ps5")]
        platform: String,
    },
}

fn parse_platform(platform: &str) -> anyhow::Result<ConsoleKind> {
    match platform.to_ascii_lowercase().as_str() {
        "ps4" => Ok(ConsoleKind::Ps4),
        "ps5" => Ok(ConsoleKind::Ps5),
        other => bail!("unknown platform '{other}', expected ps4 or ps5"),
    }
}

fn parse_duid(duid: &str) -> anyhow::Result<[u8; 32]> {
    hex::decode(duid)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .context("device UID must be 64 hex characters")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Devices { platform, json } => {
            let kind = parse_platform(&platform)?;
            let devices =
                pierce_core::list_devices(&cli.token, kind, &SessionConfig::default()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for device in &devices {
                    println!(
                        "{}  {}  remote play {}",
                        hex::encode(device.device_uid),
                        device.name,
                        if device.remoteplay_enabled { "enabled" } else { "disabled" },
                    );
                }
                if devices.is_empty() {
                    println!("no {} consoles registered", kind.platform());
                }
            }
        }

        Commands::Connect { duid, platform } => {
            let kind = parse_platform(&platform)?;
            let device_uid = parse_duid(&duid)?;

            let mut session = Session::init(&cli.token, SessionConfig::default())?;
            session.create().await.context("creating session")?;
            println!("session {} created", session.session_id());

            session
                .start(device_uid, kind)
                .await
                .context("starting session")?;
            println!("console joined");

            let ctrl = session
                .punch_hole(PortKind::Ctrl)
                .await
                .context("punching control flow")?;
            println!(
                "control flow punched: local port {}",
                ctrl.local_addr()?.port()
            );

            let data = session
                .punch_hole(PortKind::Data)
                .await
                .context("punching data flow")?;
            println!("data flow punched: local port {}", data.local_addr()?.port());

            session.fini().await;
        }
    }

    Ok(())
}
