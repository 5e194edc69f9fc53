use std::sync::Arc;

use dpgate_query::{budget::BudgetFormatError, Budget, DatasetId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    audit::{LedgerAuditSink, LedgerEvent, NoopLedgerSink},
    store::{Allocation, LedgerStore, StoreError, UserId},
};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum LedgerError {
    #[error("user {user} does not have any budget allocated on dataset {dataset}")]
    NotFound { user: UserId, dataset: DatasetId },
    #[error("user {user} already has allocated budget on dataset {dataset}")]
    AlreadyAllocated { user: UserId, dataset: DatasetId },
    #[error("not enough budget to allocate on dataset {dataset}: total {total}, allocated {allocated}, requested {requested}")]
    ExceedsDatasetTotal {
        dataset: DatasetId,
        total: Budget,
        allocated: Budget,
        requested: Budget,
    },
    #[error(transparent)]
    InvalidBudget(#[from] BudgetFormatError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Budget picture of one dataset across all users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetBudget {
    pub dataset: DatasetId,
    pub total: Budget,
    pub allocated: Budget,
    pub consumed: Budget,
    pub allocations: Vec<Allocation>,
}

/// Allocation and consumption rules over an external [`LedgerStore`].
///
/// Admission (`has_enough_budget`) and consumption (`add_consumed`) are
/// separate calls. Two concurrent queries by the same user on the same
/// dataset can both pass admission before either consumption lands; callers
/// that need a stronger guarantee must serialize per (user, dataset).
#[derive(Clone)]
pub struct BudgetLedger {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn LedgerAuditSink>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            audit: Arc::new(NoopLedgerSink),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn LedgerAuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn emit(&self, event: LedgerEvent) {
        let kind = event.kind();
        if let Err(err) = self.audit.emit(event) {
            warn!(event = kind, error = %err, "ledger audit sink failed");
        }
    }

    fn lookup(&self, user: &str, dataset: DatasetId) -> Result<Allocation, LedgerError> {
        self.store.allocation(user, dataset).map_err(|err| match err {
            StoreError::NotFound(_) => LedgerError::NotFound {
                user: user.to_owned(),
                dataset,
            },
            other => LedgerError::Store(other),
        })
    }

    fn allocated_total(&self, dataset: DatasetId) -> Result<(Budget, Budget), LedgerError> {
        let total = self.store.dataset_total(dataset)?;
        let allocated = self
            .store
            .dataset_allocations(dataset)?
            .iter()
            .map(|row| row.allocated)
            .sum();
        Ok((total, allocated))
    }

    pub fn get_allocated(&self, user: &str, dataset: DatasetId) -> Result<Budget, LedgerError> {
        Ok(self.lookup(user, dataset)?.allocated)
    }

    pub fn get_consumed(&self, user: &str, dataset: DatasetId) -> Result<Budget, LedgerError> {
        Ok(self.lookup(user, dataset)?.consumed)
    }

    pub fn allocate(&self, user: &str, dataset: DatasetId, budget: Budget) -> Result<(), LedgerError> {
        budget.validate()?;
        let (total, allocated) = self.allocated_total(dataset)?;
        if self.store.allocation(user, dataset).is_ok() {
            return Err(LedgerError::AlreadyAllocated {
                user: user.to_owned(),
                dataset,
            });
        }
        if !(allocated + budget).fits_within(&total) {
            return Err(LedgerError::ExceedsDatasetTotal {
                dataset,
                total,
                allocated,
                requested: budget,
            });
        }

        self.store
            .insert_allocation(Allocation::new(user, dataset, budget))
            .map_err(|err| match err {
                StoreError::Conflict(_) => LedgerError::AlreadyAllocated {
                    user: user.to_owned(),
                    dataset,
                },
                other => LedgerError::Store(other),
            })?;
        debug!(user, dataset, %budget, "allocated budget");
        self.emit(LedgerEvent::allocated(user, dataset, budget));
        Ok(())
    }

    pub fn patch(&self, user: &str, dataset: DatasetId, budget: Budget) -> Result<(), LedgerError> {
        budget.validate()?;
        let (total, allocated) = self.allocated_total(dataset)?;
        let previous = self.lookup(user, dataset)?.allocated;
        let others = allocated - previous;
        if !(others + budget).fits_within(&total) {
            return Err(LedgerError::ExceedsDatasetTotal {
                dataset,
                total,
                allocated: others,
                requested: budget,
            });
        }

        self.store.update_allocated(user, dataset, budget)?;
        debug!(user, dataset, %previous, %budget, "patched budget");
        self.emit(LedgerEvent::patched(user, dataset, previous, budget));
        Ok(())
    }

    pub fn delete(&self, user: &str, dataset: DatasetId) -> Result<(), LedgerError> {
        let removed = self
            .store
            .delete_allocation(user, dataset)
            .map_err(|err| match err {
                StoreError::NotFound(_) => LedgerError::NotFound {
                    user: user.to_owned(),
                    dataset,
                },
                other => LedgerError::Store(other),
            })?;
        self.emit(LedgerEvent::deleted(
            user,
            dataset,
            removed.allocated,
            removed.consumed,
        ));
        Ok(())
    }

    /// Adds `spent` to the user's consumed budget. Not checked against the
    /// allocation; admission happens earlier through [`Self::has_enough_budget`].
    pub fn add_consumed(
        &self,
        user: &str,
        dataset: DatasetId,
        spent: Budget,
        query: Option<&[u8]>,
    ) -> Result<Budget, LedgerError> {
        let consumed = self.lookup(user, dataset)?.consumed + spent;
        self.store.update_consumed(user, dataset, consumed)?;
        debug!(user, dataset, %spent, total = %consumed, "consumed budget");
        self.emit(LedgerEvent::consumed(user, dataset, spent, consumed, query));
        Ok(consumed)
    }

    /// `requested <= allocated - consumed`, component-wise after rounding.
    /// Any lookup failure answers `false`.
    pub fn has_enough_budget(&self, user: &str, dataset: DatasetId, requested: &Budget) -> bool {
        match self.store.allocation(user, dataset) {
            Ok(row) => requested.fits_within(&(row.allocated - row.consumed)),
            Err(err) => {
                debug!(user, dataset, error = %err, "admission lookup failed");
                false
            }
        }
    }

    pub fn remaining(&self, user: &str, dataset: DatasetId) -> Result<Budget, LedgerError> {
        let row = self.lookup(user, dataset)?;
        Ok(row.allocated.remaining(&row.consumed))
    }

    pub fn user_budgets(&self, user: &str) -> Result<Vec<Allocation>, LedgerError> {
        Ok(self.store.user_allocations(user)?)
    }

    pub fn dataset_budget(&self, dataset: DatasetId) -> Result<DatasetBudget, LedgerError> {
        let total = self.store.dataset_total(dataset)?;
        let allocations = self.store.dataset_allocations(dataset)?;
        Ok(DatasetBudget {
            dataset,
            total,
            allocated: allocations.iter().map(|row| row.allocated).sum(),
            consumed: allocations.iter().map(|row| row.consumed).sum(),
            allocations,
        })
    }
}
