use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use meshcall_crypto::SoftwareKeyStore;
use meshcall_node::{
    CallDecision, CallHandler, CallId, CallState, IncomingCall, MediaEngine, NodeConfig,
    ProtocolError, Service,
};

#[derive(Parser)]
#[command(name = "meshcall", about = "Encrypted peer-to-peer calls on the local network")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database password
    #[arg(long, env = "MESHCALL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Signaling port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Listen address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Encrypted database file, overrides config
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for calls and pings until Ctrl-C
    Run,
    /// Print the fingerprint of this node's identity
    Fingerprint,
    /// Print this node's contact in exchange format
    ExportContact,
    /// Add a contact from its exchange JSON
    ImportContact { json: String },
    /// Ping every contact and print the results
    Ping,
    /// Call a contact by name
    Call { name: String },
}

/// Asks on the terminal whether to take a call.
struct ConsoleHandler;

#[async_trait]
impl CallHandler for ConsoleHandler {
    async fn incoming_call(&self, call: &IncomingCall) -> CallDecision {
        let who = call
            .contact_name
            .clone()
            .unwrap_or_else(|| call.public_key.fingerprint());
        println!("Incoming call from {who}. Accept? [y/N]");

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(_) if line.trim().eq_ignore_ascii_case("y") => CallDecision::Accept,
            _ => CallDecision::Decline,
        }
    }

    async fn call_state_changed(&self, id: CallId, state: CallState) {
        info!(call = %id, ?state, "call state");
    }
}

/// Stand-in media engine: signaling runs, no audio is carried.
struct SignalingOnlyMedia;

#[async_trait]
impl MediaEngine for SignalingOnlyMedia {
    async fn create_offer(&self, call: CallId) -> Result<String, ProtocolError> {
        Ok(format!("v=0\r\no=- {} 0 IN IP6 ::\r\ns=meshcall\r\n", call.as_u128() as u64))
    }

    async fn create_answer(&self, call: CallId, _offer: &str) -> Result<String, ProtocolError> {
        Ok(format!("v=0\r\no=- {} 0 IN IP6 ::\r\ns=meshcall\r\n", call.as_u128() as u64))
    }

    async fn apply_answer(&self, _call: CallId, answer: &str) -> Result<(), ProtocolError> {
        if answer.starts_with("v=0") {
            Ok(())
        } else {
            Err(ProtocolError::Media("answer is not a session description".into()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall=info,meshcall_node=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", config_path.display()))?
    } else {
        NodeConfig::default()
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let password = args.password.unwrap_or_else(|| {
        warn!("no database password given, the database is sealed with an empty password");
        String::new()
    });

    let keystore = SoftwareKeyStore::open_or_create(&config.keystore_path).with_context(|| {
        format!("failed to open key store: {}", config.keystore_path.display())
    })?;

    let service = Service::start(
        config.clone(),
        &password,
        Arc::new(keystore),
        Arc::new(ConsoleHandler),
        Arc::new(SignalingOnlyMedia),
    )
    .await
    .with_context(|| format!("failed to open database: {}", config.database_path.display()))?;

    match args.command {
        Command::Run => run(&service).await?,
        Command::Fingerprint => println!("{}", service.fingerprint()),
        Command::ExportContact => println!("{}", service.export_contact().await?),
        Command::ImportContact { json } => {
            let contact = service
                .import_contact(&json)
                .await
                .context("failed to import contact")?;
            println!("added {} ({})", contact.name, contact.public_key.fingerprint());
        }
        Command::Ping => {
            service.ping_all().await.await.context("ping sweep failed")?;
            for contact in service.contacts().await {
                println!("{:<24} {:?}", contact.name, contact.state);
            }
        }
        Command::Call { name } => call(&service, &name).await?,
    }

    service.shutdown().await.context("failed to save database")?;
    Ok(())
}

async fn run(service: &Service) -> Result<()> {
    let addr = service.listen().await.context("failed to bind signaling port")?;
    info!(addr = %addr, fingerprint = %service.fingerprint(), "meshcall ready");

    if service.settings().await.automatic_status_updates {
        // runs in the background; results arrive as contact refreshes
        let _ = service.ping_all().await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    Ok(())
}

async fn call(service: &Service, name: &str) -> Result<()> {
    service.listen().await.context("failed to bind signaling port")?;
    let mut handle = service
        .dial(name)
        .await
        .with_context(|| format!("cannot call {name}"))?;
    info!(call = %handle.id, "calling {}", name);

    let state = tokio::select! {
        state = handle.finished() => state,
        _ = tokio::signal::ctrl_c() => {
            handle.hangup().await;
            handle.finished().await
        }
    };
    match state {
        CallState::Ended(reason) => info!(?reason, "call over"),
        other => bail!("call left in state {other:?}"),
    }
    Ok(())
}
