pub mod browser;
pub mod dirs;
pub mod gateway;
pub mod handlers;
pub mod keys;
pub mod protocol;
pub mod sanitize;
pub mod server;
pub mod store;
pub mod tools;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::OnceCell;

use browser::{CdpDriver, LoginDriver};
use gateway::Gateway;
use store::{AuditLog, CredentialStore};

/// Shared broker state threaded through the tool surface, the MCP serve loop,
/// and the CLI. Owns the store, the audit log, the browser-driver seam, and
/// the lazily-started entry-form gateway.
pub struct Broker {
    pub store: CredentialStore,
    pub audit: AuditLog,
    pub(crate) driver: Arc<dyn LoginDriver>,
    pub(crate) http: reqwest::Client,
    gateway: OnceCell<Gateway>,
    gateway_port: u16,
    submit_timeout: Duration,
    open_browser: bool,
}

impl Broker {
    /// Resolve the master key for `data_dir` and open the store and audit log.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let key = keys::obtain_key(data_dir)?;
        let store = CredentialStore::open(data_dir, key)?;
        let audit = AuditLog::open(data_dir)?;
        Ok(Self::new(store, audit))
    }

    pub fn new(store: CredentialStore, audit: AuditLog) -> Self {
        Self {
            store,
            audit,
            driver: Arc::new(CdpDriver::from_env()),
            http: reqwest::Client::new(),
            gateway: OnceCell::new(),
            gateway_port: gateway::DEFAULT_PORT,
            submit_timeout: gateway::DEFAULT_SUBMIT_TIMEOUT,
            open_browser: true,
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn LoginDriver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_gateway_port(mut self, port: u16) -> Self {
        self.gateway_port = port;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Whether `add` launches the operator's browser at the form URL.
    pub fn with_open_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    pub(crate) fn opens_browser(&self) -> bool {
        self.open_browser
    }

    /// The entry-form gateway, started on first use and alive for the rest of
    /// the process.
    pub async fn gateway(&self) -> Result<&Gateway> {
        self.gateway
            .get_or_try_init(|| async {
                Gateway::start(
                    self.store.clone(),
                    self.audit.clone(),
                    self.gateway_port,
                    self.submit_timeout,
                )
                .await
            })
            .await
    }
}
