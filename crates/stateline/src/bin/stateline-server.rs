//! Stateline server binary

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use stateline::{PlayerIdToken, Server, ServerConfig};
use stateline_crypto::{decode_key, encode_key, generate_key, CipherAlgorithm};
use stateline_net::{QuicListener, TransportConfig};
use stateline_store::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

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
#[command(author, version, about = "Stateline server - authoritative game state sync")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: SocketAddr,

    /// Session key (base64 encoded); generated and printed when omitted
    #[arg(short, long)]
    key: Option<String>,

    /// Cipher algorithm to use
    #[arg(short = 'a', long, value_enum, default_value = "aes-256-gcm")]
    cipher: CipherAlgorithm,

    /// Room all sessions on this listener join
    #[arg(short, long, default_value = "lobby")]
    room: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
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

    let key = match &args.key {
        Some(encoded) => decode_key(encoded).context("invalid --key")?,
        None => {
            let key = generate_key(args.cipher);
            println!("session key: {}", encode_key(&key));
            key
        }
    };

    let config = ServerConfig {
        cipher: args.cipher,
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(
        config,
        key,
        Arc::new(MemoryStore::new()),
        Arc::new(PlayerIdToken),
    ));

    let listener = QuicListener::bind(args.bind, &TransportConfig::default())?;
    info!(addr = %listener.local_addr()?, room = args.room, "listening");

    loop {
        let (transport, remote) = listener.accept().await?;
        info!(%remote, "connection accepted");
        let server = Arc::clone(&server);
        let room = args.room.clone();
        tokio::spawn(async move {
            if let Err(e) = server.handle_session(transport, &room).await {
                error!(%remote, error = %e, "session failed");
            }
        });
    }
}
