//! Named driver connections.
//!
//! Each entry under `drivers.connections` names a connection, the driver that
//! opens it and its DSN. A `DriverRegistry` maps driver names to async
//! constructors; `connect_all` opens every configured connection and returns a
//! `ConnectionStore` that owns them, including the default one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use super::AppConfig;

/// Settings for a single named connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Registered driver name (e.g. "mysql", "postgres").
    pub driver: String,
    /// Connection string.
    pub dsn: String,
    /// Driver-specific options.
    pub options: HashMap<String, String>,
}

/// Driver connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriversConfig {
    /// Connection used when callers ask for the default.
    pub default: Option<String>,
    /// Connections keyed by name.
    pub connections: HashMap<String, DriverSettings>,
}

/// Errors raised while opening driver connections.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("No driver registered under '{0}'")]
    UnknownDriver(String),

    #[error("Connection '{name}' failed: {message}")]
    Connect { name: String, message: String },

    #[error("Default connection '{0}' is not configured")]
    MissingDefault(String),
}

/// Async constructor that opens one connection.
pub type DriverConstructor<C> = Arc<
    dyn Fn(String, DriverSettings, AppConfig) -> BoxFuture<'static, Result<C, DriverError>>
        + Send
        + Sync,
>;

/// Explicit table of driver name to constructor.
pub struct DriverRegistry<C> {
    constructors: HashMap<String, DriverConstructor<C>>,
}

impl<C> Default for DriverRegistry<C> {
    fn default() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }
}

impl<C: Clone + Send + 'static> DriverRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `driver`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, driver: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(String, DriverSettings, AppConfig) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<C, DriverError>> + Send + 'static,
    {
        let constructor: DriverConstructor<C> =
            Arc::new(move |name, settings, app| Box::pin(constructor(name, settings, app)));
        self.constructors.insert(driver.into(), constructor);
        self
    }

    pub fn is_registered(&self, driver: &str) -> bool {
        self.constructors.contains_key(driver)
    }

    /// Open every configured connection.
    ///
    /// Stops at the first failure unless `ignore_errors` is set, in which case
    /// failed connections are logged and skipped. The default connection, when
    /// named, must be among the opened ones.
    pub async fn connect_all(
        &self,
        drivers: &DriversConfig,
        app: &AppConfig,
        ignore_errors: bool,
    ) -> Result<ConnectionStore<C>, DriverError> {
        let mut connections = HashMap::new();

        // Sorted for deterministic connect order and logs
        let mut names: Vec<&String> = drivers.connections.keys().collect();
        names.sort();

        for name in names {
            let settings = &drivers.connections[name];
            let result = match self.constructors.get(&settings.driver) {
                Some(constructor) => {
                    constructor(name.clone(), settings.clone(), app.clone()).await
                }
                None => Err(DriverError::UnknownDriver(settings.driver.clone())),
            };

            match result {
                Ok(connection) => {
                    info!(connection = %name, driver = %settings.driver, "Driver connected");
                    connections.insert(name.clone(), connection);
                }
                Err(e) if ignore_errors => {
                    warn!(connection = %name, error = %e, "Driver connection skipped");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(ref default) = drivers.default {
            if !connections.contains_key(default) {
                return Err(DriverError::MissingDefault(default.clone()));
            }
        }

        Ok(ConnectionStore {
            connections,
            default: drivers.default.clone(),
        })
    }
}

/// Opened connections, owned by the composition root.
#[derive(Debug, Clone)]
pub struct ConnectionStore<C> {
    connections: HashMap<String, C>,
    default: Option<String>,
}

impl<C> ConnectionStore<C> {
    pub fn get(&self, name: &str) -> Option<&C> {
        self.connections.get(name)
    }

    /// The default connection, if one was configured.
    pub fn default_connection(&self) -> Option<&C> {
        self.default.as_deref().and_then(|name| self.connections.get(name))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
