use dpgate_dispatch::DispatchError;
use dpgate_ledger::LedgerError;
use dpgate_query::{budget::BudgetFormatError, DatasetId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    InvalidBudget(#[from] BudgetFormatError),
    #[error("user {user} does not have budget for making the query on dataset {dataset}")]
    InsufficientBudget { user: String, dataset: DatasetId },
    #[error("dataset {0} is unknown")]
    UnknownDataset(DatasetId),
    #[error("cannot make a query without data. dataset {0} not loaded")]
    NotLoaded(DatasetId),
    #[error("supplied engine {0} not available")]
    UnknownEngine(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl GatewayError {
    /// Admission and allocation rejections, as opposed to malformed input or
    /// engine failures.
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBudget { .. }
                | Self::Ledger(LedgerError::ExceedsDatasetTotal { .. })
                | Self::Ledger(LedgerError::NotFound { .. })
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Dispatch(err) if err.is_transport())
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
