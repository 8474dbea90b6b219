//! Stateline client binary
//!
//! Joins a server as a player, optionally pushes field updates, and prints
//! the authoritative state of the room as it changes.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use stateline::{ClientConfig, ClientSession, QuicDialer, SessionEvent};
use stateline_crypto::{decode_key, key_from_env, CipherAlgorithm};
use stateline_net::TransportConfig;
use stateline_state::{FieldMap, Value};
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Stateline client - game state sync client")]
struct Args {
    /// Server address to connect to
    server: SocketAddr,

    /// Player identity, also used as the bearer token
    #[arg(short, long)]
    player: String,

    /// Session key (base64 encoded); falls back to $STATELINE_KEY
    #[arg(short, long)]
    key: Option<String>,

    /// Cipher algorithm to use
    #[arg(short = 'a', long, value_enum, default_value = "aes-256-gcm")]
    cipher: CipherAlgorithm,

    /// Field updates to push after connecting, as name=integer pairs
    #[arg(long = "set", value_name = "FIELD=VALUE")]
    sets: Vec<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,
}

fn parse_fields(sets: &[String]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for set in sets {
        let (name, value) = set
            .split_once('=')
            .ok_or_else(|| anyhow!("expected FIELD=VALUE, got {set:?}"))?;
        let value = value
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(value.to_string()));
        fields.insert(name, value);
    }
    Ok(fields)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_filter().into()),
        )
        .init();

    let encoded = args
        .key
        .clone()
        .or_else(key_from_env)
        .context("no session key: pass --key or set $STATELINE_KEY")?;
    let key = decode_key(&encoded).context("invalid session key")?;

    let mut config = ClientConfig::new(args.player.clone());
    config.cipher = args.cipher;

    let dialer = QuicDialer::new(args.server, TransportConfig::default())?;
    let (session, mut handle) = ClientSession::new(Box::new(dialer), &key, config)?;

    if !args.sets.is_empty() {
        let fields = parse_fields(&args.sets)?;
        handle
            .updates
            .send(fields)
            .map_err(|_| anyhow!("session closed before update was sent"))?;
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = handle.events.recv().await {
            match event {
                SessionEvent::State { player_id, snapshot } => {
                    println!("[{player_id} v{}] {:?}", snapshot.version, snapshot.fields);
                }
                SessionEvent::Link(state) => info!(?state, "link state changed"),
            }
        }
    });

    let result = session.run().await;
    printer.abort();
    result
}
