//! Errors surfaced by the stock services.

use thiserror::Error;
use uuid::Uuid;

use stockroom_warehouse::InsufficientStock;

pub type StockResult<T> = Result<T, StockError>;

/// Failure of a stock operation.
///
/// `InsufficientStock` is the only business outcome. Everything else (store
/// outages, constraint violations, timeouts, failed worker tasks) is a
/// `System` error carrying a reference that is logged together with the
/// underlying cause.
#[derive(Debug, Error)]
pub enum StockError {
    #[error(transparent)]
    InsufficientStock(#[from] InsufficientStock),

    #[error("{context} (reference {reference})")]
    System {
        reference: Uuid,
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StockError {
    /// Wrap an unexpected failure, logging it under a fresh reference.
    pub fn system(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        let reference = Uuid::now_v7();
        let context = context.into();
        let source = source.into();
        tracing::error!(%reference, context = %context, error = ?source, "stock operation failed");
        Self::System {
            reference,
            context,
            source,
        }
    }

    pub fn reference(&self) -> Option<Uuid> {
        match self {
            Self::System { reference, .. } => Some(*reference),
            Self::InsufficientStock(_) => None,
        }
    }

    pub fn insufficient_stock(&self) -> Option<&InsufficientStock> {
        match self {
            Self::InsufficientStock(err) => Some(err),
            Self::System { .. } => None,
        }
    }
}

/// Attach a context string to any fallible call, turning its error into
/// `StockError::System`.
pub(crate) trait SystemContext<T> {
    fn system_context(self, context: &str) -> StockResult<T>;
}

impl<T, E> SystemContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn system_context(self, context: &str) -> StockResult<T> {
        self.map_err(|err| StockError::system(context, err))
    }
}
