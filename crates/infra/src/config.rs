//! Environment configuration for the stock services.
//!
//! | Variable                      | Default |
//! |-------------------------------|---------|
//! | `USE_PERSISTENT_STORES`       | `false` |
//! | `DATABASE_URL`                | none (required when persistent) |
//! | `DATABASE_MAX_CONNECTIONS`    | `10`    |
//! | `STOCK_TRANSACTION_TIMEOUT_MS`| unset (no timeout) |

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::{InMemoryStockStore, PostgresStockStore, StockStore, StoreError};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockConfig {
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Upper bound for a single allocator operation.
    pub transaction_timeout: Option<Duration>,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            transaction_timeout: None,
        }
    }
}

impl StockConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let use_persistent_stores = lookup("USE_PERSISTENT_STORES")
            .unwrap_or_else(|| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.parse::<u32>().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid DATABASE_MAX_CONNECTIONS, using {DEFAULT_MAX_CONNECTIONS}");
                DEFAULT_MAX_CONNECTIONS
            }),
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let transaction_timeout = lookup("STOCK_TRANSACTION_TIMEOUT_MS").and_then(|raw| match raw.parse::<u64>() {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                warn!(value = %raw, "invalid STOCK_TRANSACTION_TIMEOUT_MS, running without timeout");
                None
            }
        });

        Self {
            use_persistent_stores,
            database_url: lookup("DATABASE_URL"),
            max_connections,
            transaction_timeout,
        }
    }
}

/// Stock store selected by `config`: Postgres (connected and migrated) or
/// in-memory.
pub async fn connect_stock_store(config: &StockConfig) -> Result<Arc<dyn StockStore>, StoreError> {
    if !config.use_persistent_stores {
        info!("using in-memory stock store");
        return Ok(Arc::new(InMemoryStockStore::new()));
    }

    let Some(database_url) = config.database_url.as_deref() else {
        return Err(StoreError::Unavailable(
            "DATABASE_URL must be set when USE_PERSISTENT_STORES=true".to_string(),
        ));
    };
    let store = PostgresStockStore::connect(database_url, config.max_connections).await?;
    store.migrate().await?;
    info!(max_connections = config.max_connections, "using postgres stock store");
    Ok(Arc::new(store))
}
