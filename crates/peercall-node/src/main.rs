use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use peercall_crypto::{IdentityKeyPair, KdfParams, PublicKey};
use peercall_node::address::collect_local_addresses;
use peercall_node::persistence::{load_store, save_store};
use peercall_node::{Contact, ContactDirectory, Node, NodeConfig, NodeEvent, NullMedia, StoreSnapshot};

const PASSWORD_ENV: &str = "PEERCALL_PASSWORD";

#[derive(Parser)]
#[command(name = "peercall", about = "Serverless encrypted call signaling")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the encrypted store, overrides config
    #[arg(long)]
    store: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// TCP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new identity and write an empty store
    Init {
        /// Replace an existing store
        #[arg(long)]
        force: bool,
    },
    /// Print this node's public key
    Identity,
    /// List local addresses to share with contacts
    Addresses,
    /// Add a contact to the store
    AddContact {
        name: String,
        /// Base64 public key
        key: String,
        /// IP, MAC or host name, optionally with :port
        addresses: Vec<String>,
    },
    /// Start the node and serve until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peercall=info,peercall_node=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        NodeConfig::load_from_file(Path::new(config_path))
            .with_context(|| format!("failed to load config: {}", config_path))?
    } else {
        NodeConfig::default()
    };
    if let Some(store) = args.store {
        config.store_path = store;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let store_path = PathBuf::from(&config.store_path);
    let kdf = KdfParams::default();

    match args.command {
        Command::Init { force } => {
            if store_path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to replace)", store_path.display());
            }
            let identity = IdentityKeyPair::generate();
            let snapshot = StoreSnapshot::new(&identity, &ContactDirectory::new());
            save_store(&store_path, &snapshot, &password()?, &kdf)?;
            println!("{}", identity.public_key());
        }
        Command::Identity => {
            let snapshot = open_store(&store_path, &kdf)?;
            println!("{}", snapshot.public_key);
        }
        Command::Addresses => {
            for entry in collect_local_addresses() {
                println!("{:<10} {}", entry.device, entry.address);
            }
        }
        Command::AddContact {
            name,
            key,
            addresses,
        } => {
            let key: PublicKey = key.parse().context("invalid public key")?;
            let password = password()?;
            let snapshot = load_store(&store_path, &password, &kdf)
                .with_context(|| format!("failed to open store: {}", store_path.display()))?;
            let (identity, contacts) = snapshot.restore()?;
            if !contacts.add(Contact::new(name.clone(), key, addresses)) {
                anyhow::bail!("a contact with this key already exists");
            }
            save_store(&store_path, &StoreSnapshot::new(&identity, &contacts), &password, &kdf)?;
            info!(contact = %name, "contact added");
        }
        Command::Run => run(config, &store_path, &kdf).await?,
    }

    Ok(())
}

async fn run(config: NodeConfig, store_path: &Path, kdf: &KdfParams) -> Result<()> {
    let password = password()?;
    let snapshot = load_store(store_path, &password, kdf)
        .with_context(|| format!("failed to open store: {}", store_path.display()))?;
    let (identity, contacts) = snapshot.restore()?;

    info!("PeerCall node starting");
    info!(
        host = %config.host,
        port = config.port,
        contacts = contacts.len(),
        block_unknown = config.block_unknown,
    );

    let (node, mut events) = Node::start(config, identity, contacts, Arc::new(NullMedia))
        .await
        .context("failed to start node")?;

    // Initial presence pass.
    node.probe_contacts().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    NodeEvent::IncomingCall { call_id, peer, name } => {
                        info!(call_id, caller = name.as_deref().unwrap_or("unknown"), key = %peer, "incoming call, no media attached, declining");
                        if let Err(e) = node.decline_call(call_id) {
                            warn!(call_id, "decline failed: {e}");
                        }
                    }
                    NodeEvent::CallState { call_id, state, .. } => {
                        info!(call_id, state = ?state, "call");
                    }
                    NodeEvent::ContactStatus { peer, state } => {
                        let name = node.contacts().get(&peer).map(|c| c.name).unwrap_or_default();
                        info!(contact = %name, state = ?state, "contact status");
                    }
                    NodeEvent::SuspiciousKeyChange { expected, got } => {
                        warn!(expected = %expected, got = %got, "suspicious key change");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    save_store(store_path, &node.snapshot(), &password, kdf)?;
    Ok(())
}

fn open_store(path: &Path, kdf: &KdfParams) -> Result<StoreSnapshot> {
    load_store(path, &password()?, kdf)
        .with_context(|| format!("failed to open store: {}", path.display()))
}

fn password() -> Result<String> {
    std::env::var(PASSWORD_ENV).with_context(|| format!("{PASSWORD_ENV} is not set"))
}
