use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vault_mcp_server::gateway::{Gateway, DEFAULT_PORT, DEFAULT_SUBMIT_TIMEOUT};
use vault_mcp_server::server::McpServer;
use vault_mcp_server::store::audit::ACTION_REMOVED;
use vault_mcp_server::store::AuditResult;
use vault_mcp_server::{dirs, Broker};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vault-mcp", about = "Local credential broker for AI agents", version)]
struct Cli {
    /// Data directory (default: ~/.vault-mcp or $VAULT_DATA_DIR)
    #[arg(long, env = "VAULT_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a credential via the local entry form
    Add {
        /// Pre-fill the site identifier
        #[arg(long)]
        site: Option<String>,
        /// Pre-fill the credential type: web_login or api_key
        #[arg(long = "type")]
        service_type: Option<String>,
    },
    /// List stored credentials (metadata only)
    List,
    /// Remove a credential
    Remove {
        /// Site identifier
        site: String,
    },
    /// Print audit entries and verify the hash chain
    Audit {
        /// Filter by site identifier
        site: Option<String>,
    },
    /// Run the entry-form dashboard in the foreground
    Dashboard {
        /// Port to bind on 127.0.0.1
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Run the MCP server on stdio
    Serve,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries command output (and MCP frames under `serve`); logs go
    // to stderr.
    let log_level = std::env::var("VAULT_LOG_LEVEL").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&log_level))
        .with_writer(std::io::stderr)
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => {
            dirs::ensure_private_dir(&dir)?;
            dir
        }
        None => dirs::data_dir()?,
    };
    let broker = Broker::open(&data_dir)?;

    match cli.command {
        Commands::Add { site, service_type } => {
            cmd_add(broker, site.as_deref(), service_type.as_deref()).await
        }
        Commands::List => cmd_list(broker).await,
        Commands::Remove { site } => cmd_remove(broker, &site).await,
        Commands::Audit { site } => cmd_audit(broker, site.as_deref()),
        Commands::Dashboard { port } => cmd_dashboard(broker, port).await,
        Commands::Serve => McpServer::new(broker).run().await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_add(broker: Broker, site: Option<&str>, service_type: Option<&str>) -> Result<()> {
    let (url, pending) = broker.begin_add(site, service_type).await?;

    println!("Opening the credential entry form:");
    println!("  {url}");
    if open::that(&url).is_err() {
        println!("(could not launch a browser — open the URL manually)");
    }

    match pending.wait().await {
        vault_mcp_server::gateway::AddResolution::Submitted(site_id) => {
            println!("✓ stored credential '{site_id}'");
            Ok(())
        }
        vault_mcp_server::gateway::AddResolution::Timeout => {
            anyhow::bail!("entry form was not submitted within the time limit")
        }
    }
}

async fn cmd_list(broker: Broker) -> Result<()> {
    let metas = broker.store.list().await;
    if metas.is_empty() {
        println!("(no credentials)");
        return Ok(());
    }

    for m in &metas {
        let state = if m.active { "active" } else { "inactive" };
        println!(
            "  {} — {} — {} — created {}",
            m.site_id,
            m.service_type,
            state,
            m.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    Ok(())
}

async fn cmd_remove(broker: Broker, site: &str) -> Result<()> {
    if !broker.store.remove(site).await? {
        anyhow::bail!("no credential for '{site}'");
    }
    broker
        .audit
        .append(ACTION_REMOVED, site, AuditResult::Success, None, None)
        .await?;
    println!("✓ removed {site}");
    Ok(())
}

fn cmd_audit(broker: Broker, site: Option<&str>) -> Result<()> {
    let entries = broker.audit.entries(site)?;
    if entries.is_empty() {
        println!("(no audit entries)");
    }
    for e in &entries {
        let ok = match e.result {
            AuditResult::Success => "ok",
            AuditResult::Failure => "FAIL",
        };
        let bot = e.bot_id.as_deref().unwrap_or("-");
        println!(
            "  {} [{}] {} site={} bot={} {}",
            e.event_id,
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.action,
            e.credential_id,
            bot,
            ok,
        );
    }

    let status = broker.audit.verify_chain()?;
    if status.valid {
        println!("chain: valid ({} entries)", status.total);
        Ok(())
    } else {
        let at = status.broken_at.unwrap_or_default();
        anyhow::bail!("chain: BROKEN at entry {at} of {}", status.total)
    }
}

async fn cmd_dashboard(broker: Broker, port: u16) -> Result<()> {
    let gateway = Gateway::start(
        broker.store.clone(),
        broker.audit.clone(),
        port,
        DEFAULT_SUBMIT_TIMEOUT,
    )
    .await?;

    println!("dashboard listening on http://127.0.0.1:{}", gateway.port());
    println!("  entry form: http://127.0.0.1:{}/add", gateway.port());
    tokio::signal::ctrl_c().await?;

    println!();
    println!("shutting down");
    Ok(())
}
