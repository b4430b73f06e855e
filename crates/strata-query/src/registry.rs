use crate::error::{DataError, Result};
use crate::settings::{parse_timeouts, DriverSettings, Timeouts};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

/// Connection settings for one store client
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Store kind (mongodb, postgres, redis, mysql, ...)
    pub backend: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database name, or database index for redis
    pub database: Option<String>,
    pub timeouts: Timeouts,
    /// Extra driver options, rendered as URL query parameters
    pub options: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            timeouts: Timeouts::default(),
            options: HashMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Read `host`, `port`, `user`, `password`, `db` and `timeout` for a
    /// section, falling back to the `backend` base section per key.
    pub fn from_section(settings: &DriverSettings, backend: &str, section: &str) -> Result<Self> {
        let mut config = Self::new(backend);
        config.host = settings.value(backend, section, "host");
        config.port = settings.parsed(backend, section, "port")?;
        config.username = settings
            .value(backend, section, "user")
            .or_else(|| settings.value(backend, section, "username"));
        config.password = settings.value(backend, section, "password");
        config.database = settings
            .value(backend, section, "db")
            .or_else(|| settings.value(backend, section, "database"));
        if let Some(timeout) = settings.value(backend, section, "timeout") {
            config.timeouts = parse_timeouts(&timeout, Timeouts::default());
        }

        if config.host.is_none() {
            return Err(DataError::invalid_configuration(format!(
                "config section [{}] has no host",
                if section.is_empty() { backend } else { section }
            )));
        }
        debug!("resolved {} section {:?}: {}", backend, section, config.connection_string());
        Ok(config)
    }

    /// Full connection URL including credentials
    pub fn url(&self, scheme: &str) -> String {
        let mut url = format!("{}://", scheme);
        if let Some(username) = &self.username {
            url.push_str(&urlencoding::encode(username));
            if let Some(password) = &self.password {
                url.push(':');
                url.push_str(&urlencoding::encode(password));
            }
            url.push('@');
        } else if let Some(password) = &self.password {
            url.push_str(&format!(":{}@", urlencoding::encode(password)));
        }
        url.push_str(self.host.as_deref().unwrap_or("localhost"));
        if let Some(port) = self.port {
            url.push_str(&format!(":{}", port));
        }
        if let Some(database) = &self.database {
            url.push('/');
            url.push_str(&urlencoding::encode(database));
        }
        if !self.options.is_empty() {
            let mut options: Vec<_> = self.options.iter().collect();
            options.sort();
            let query = options
                .into_iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Connection string for display purposes (without password)
    pub fn connection_string(&self) -> String {
        let mut parts = vec![format!("{}://", self.backend)];

        if let Some(username) = &self.username {
            parts.push(format!("{}@", username));
        }

        if let Some(host) = &self.host {
            parts.push(host.clone());

            if let Some(port) = self.port {
                parts.push(format!(":{}", port));
            }
        }

        if let Some(database) = &self.database {
            parts.push(format!("/{}", database));
        }

        parts.join("")
    }
}

/// Lazily created, shared clients keyed by config section.
///
/// Concurrent first use of a key runs the initializer once; every caller
/// receives the same client. A failed initialization leaves the key empty
/// so the next caller retries.
pub struct ClientRegistry<C> {
    clients: RwLock<HashMap<String, Arc<OnceCell<Arc<C>>>>>,
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn cell(&self, key: &str) -> Arc<OnceCell<Arc<C>>> {
        if let Some(cell) = self.clients.read().await.get(key) {
            return cell.clone();
        }
        let mut clients = self.clients.write().await;
        clients
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Get the client for `key`, creating it with `init` on first use
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let cell = self.cell(key).await;
        let client = cell
            .get_or_try_init(|| async move {
                debug!("creating client for {}", key);
                init().await.map(Arc::new)
            })
            .await
            .map_err(|e| {
                warn!("client initialization for {} failed: {}", key, e);
                e
            })?;
        Ok(client.clone())
    }

    /// An already initialized client
    pub async fn get(&self, key: &str) -> Option<Arc<C>> {
        let clients = self.clients.read().await;
        clients.get(key).and_then(|cell| cell.get().cloned())
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<C>> {
        let mut clients = self.clients.write().await;
        clients
            .remove(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Initialized keys
    pub async fn keys(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut keys: Vec<String> = clients
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove and return every initialized client, for shutdown
    pub async fn drain(&self) -> Vec<(String, Arc<C>)> {
        let mut clients = self.clients.write().await;
        clients
            .drain()
            .filter_map(|(k, cell)| cell.get().cloned().map(|c| (k, c)))
            .collect()
    }
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
