//! Gatelink CLI - talk to an agent gateway from the terminal.
//!
//! This is the main binary entry point. See the `gatelink` library for the
//! protocol engine.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatelink::{
    ChatSession, ConnectionManager, ConnectionState, DeviceIdentity, EnqueueOutcome, EventKind,
    GatewayConfig, WsConnector,
};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long to wait for the handshake before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// CLI
#[derive(Parser)]
#[command(name = "gatelink")]
#[command(version)]
#[command(about = "Client for agent gateways")]
struct Cli {
    /// Gateway URL (overrides config and GATELINK_URL)
    #[arg(long, global = true)]
    url: Option<String>,
    /// Gateway token (overrides GATELINK_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print every event until interrupted
    Listen,
    /// Call one RPC method and print the response
    Call {
        /// Method name (e.g. "health")
        method: String,
        /// Params as JSON
        #[arg(long)]
        params: Option<String>,
    },
    /// Chat with an agent; one message per stdin line
    Chat {
        /// Session key (defaults to the gateway's main session)
        #[arg(long)]
        session: Option<String>,
        /// Print the last N history messages before chatting
        #[arg(long, default_value_t = 20)]
        history: u32,
    },
    /// Inspect or reset the device identity
    Device {
        /// Delete the identity; a new one is created on next use
        #[arg(long)]
        reset: bool,
    },
}

struct App {
    config: GatewayConfig,
    config_dir: std::path::PathBuf,
}

impl App {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = GatewayConfig::load()?;
        if let Some(url) = &cli.url {
            config.url.clone_from(url);
        }
        if let Some(token) = &cli.token {
            config.token = Some(token.clone());
        }
        Ok(Self {
            config,
            config_dir: GatewayConfig::config_dir()?,
        })
    }

    fn identity(&self) -> Arc<DeviceIdentity> {
        Arc::new(DeviceIdentity::new(self.config.identity_store(&self.config_dir)))
    }

    async fn connect(&self) -> Result<ConnectionManager> {
        let manager = ConnectionManager::new(
            self.config.manager_config(),
            Arc::new(WsConnector::new()),
            Some(self.identity()),
        );
        manager.connect();
        if !manager
            .wait_for_state(ConnectionState::Connected, CONNECT_TIMEOUT)
            .await
        {
            manager.disconnect();
            anyhow::bail!("Could not connect to {} within {}s", self.config.url, CONNECT_TIMEOUT.as_secs());
        }
        Ok(manager)
    }
}

async fn listen(app: &App) -> Result<()> {
    let manager = app.connect().await?;
    let _states = manager.on_state_change(|state| eprintln!("-- {}", state));
    let _events = manager.on_event(|event| {
        let payload = match &event.kind {
            EventKind::Agent(agent) => serde_json::to_string(agent).unwrap_or_default(),
            EventKind::Tick(tick) => format!("ts={}", tick.ts),
            EventKind::Shutdown(shutdown) => format!("reason={}", shutdown.reason),
            EventKind::Presence(value) => value.to_string(),
            EventKind::Other { payload, .. } => {
                payload.as_ref().map(ToString::to_string).unwrap_or_default()
            }
        };
        println!("{} {}", event.name(), payload);
    });

    tokio::signal::ctrl_c().await?;
    manager.disconnect();
    Ok(())
}

async fn call(app: &App, method: &str, params: Option<&str>) -> Result<()> {
    let params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--params is not valid JSON")?;
    let manager = app.connect().await?;
    let result = manager.request(method, params).await;
    manager.disconnect();
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn chat(app: &App, session: Option<String>, history: u32) -> Result<()> {
    let manager = app.connect().await?;
    let session_key = session
        .or_else(|| app.config.session_key.clone())
        .or_else(|| manager.session_defaults().and_then(|d| d.main_session_key))
        .unwrap_or_else(|| "main".to_string());

    let store = GatewayConfig::state_store(&app.config_dir);
    let (session, mut snapshots) = ChatSession::attach(&manager, store, session_key.as_str())?;
    eprintln!("-- session {}", session_key);

    if history > 0 {
        for message in session.history(Some(history)).await? {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("?");
            println!("[{}] {}", role, message_text(&message));
        }
    }

    let printer = tokio::spawn(async move {
        let mut printed = 0;
        while let Some(snapshot) = snapshots.recv().await {
            // Print only the new tail of the streaming content
            if snapshot.content.len() >= printed && snapshot.content.is_char_boundary(printed) {
                print!("{}", &snapshot.content[printed..]);
                let _ = std::io::stdout().flush();
            }
            printed = snapshot.content.len();
            if !snapshot.streaming {
                println!();
                printed = 0;
            }
        }
    });

    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(std::result::Result::ok) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line.trim() {
                    "" => {}
                    "/abort" => {
                        if !session.abort().await? {
                            eprintln!("-- nothing running");
                        }
                    }
                    "/queue" => {
                        for message in session.queued() {
                            eprintln!("-- {} {}", message.id, message.text);
                        }
                    }
                    text => match session.send(text).await {
                        Ok(EnqueueOutcome::Dispatched { .. }) => {}
                        Ok(EnqueueOutcome::Queued { position, .. }) => eprintln!("-- queued (#{})", position),
                        Err(e) => eprintln!("-- not sent: {e}"),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.detach();
    manager.disconnect();
    printer.abort();
    Ok(())
}

fn message_text(message: &serde_json::Value) -> String {
    match message.get("content") {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn device(app: &App, reset: bool) -> Result<()> {
    let identity = app.identity();
    if reset {
        identity.clear()?;
        println!("Device identity cleared.");
    }
    let device = identity.get_or_create()?;
    println!("id:         {}", device.id);
    println!("public key: {}", device.public_key_base64url());
    println!(
        "created:    {}",
        chrono::DateTime::from_timestamp_millis(device.created_at_ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    );
    let token = identity.device_token(&app.config.role);
    println!(
        "token:      {}",
        if token.is_some() { "stored" } else { "none" }
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let app = App::load(&cli)?;

    let rt = tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")?;
    match cli.command {
        Commands::Listen => rt.block_on(listen(&app)),
        Commands::Call { method, params } => rt.block_on(call(&app, &method, params.as_deref())),
        Commands::Chat { session, history } => rt.block_on(chat(&app, session, history)),
        Commands::Device { reset } => device(&app, reset),
    }
}
