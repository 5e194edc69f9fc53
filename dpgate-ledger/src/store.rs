use std::collections::{BTreeMap, HashMap};

use dpgate_query::{Budget, DatasetId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User handle as issued by the authority.
pub type UserId = String;

/// One user's share of one dataset's budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub user: UserId,
    pub dataset: DatasetId,
    pub allocated: Budget,
    pub consumed: Budget,
}

impl Allocation {
    pub fn new(user: impl Into<UserId>, dataset: DatasetId, allocated: Budget) -> Self {
        Self {
            user: user.into(),
            dataset,
            allocated,
            consumed: Budget::zero(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("ledger store backend failure: {0}")]
    Backend(String),
}

/// Persistence for dataset totals and per-user allocations. Implementations
/// serialize writes to a single (user, dataset) row; the ledger adds the
/// consistency rules on top.
pub trait LedgerStore: Send + Sync {
    fn dataset_total(&self, dataset: DatasetId) -> Result<Budget, StoreError>;
    fn allocation(&self, user: &str, dataset: DatasetId) -> Result<Allocation, StoreError>;
    fn insert_allocation(&self, allocation: Allocation) -> Result<(), StoreError>;
    fn update_allocated(&self, user: &str, dataset: DatasetId, allocated: Budget)
        -> Result<(), StoreError>;
    fn update_consumed(&self, user: &str, dataset: DatasetId, consumed: Budget)
        -> Result<(), StoreError>;
    fn delete_allocation(&self, user: &str, dataset: DatasetId) -> Result<Allocation, StoreError>;
    fn dataset_allocations(&self, dataset: DatasetId) -> Result<Vec<Allocation>, StoreError>;
    fn user_allocations(&self, user: &str) -> Result<Vec<Allocation>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    datasets: HashMap<DatasetId, Budget>,
    allocations: BTreeMap<(UserId, DatasetId), Allocation>,
}

fn allocation_key(user: &str, dataset: DatasetId) -> String {
    format!("allocation for user {user} on dataset {dataset}")
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the total budget of a dataset.
    pub fn register_dataset(&self, dataset: DatasetId, total: Budget) {
        self.tables.write().datasets.insert(dataset, total);
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn dataset_total(&self, dataset: DatasetId) -> Result<Budget, StoreError> {
        self.tables
            .read()
            .datasets
            .get(&dataset)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("dataset {dataset}")))
    }

    fn allocation(&self, user: &str, dataset: DatasetId) -> Result<Allocation, StoreError> {
        self.tables
            .read()
            .allocations
            .get(&(user.to_owned(), dataset))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(allocation_key(user, dataset)))
    }

    fn insert_allocation(&self, allocation: Allocation) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.datasets.contains_key(&allocation.dataset) {
            return Err(StoreError::NotFound(format!("dataset {}", allocation.dataset)));
        }
        let key = (allocation.user.clone(), allocation.dataset);
        if tables.allocations.contains_key(&key) {
            return Err(StoreError::Conflict(allocation_key(&key.0, key.1)));
        }
        tables.allocations.insert(key, allocation);
        Ok(())
    }

    fn update_allocated(
        &self,
        user: &str,
        dataset: DatasetId,
        allocated: Budget,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let row = tables
            .allocations
            .get_mut(&(user.to_owned(), dataset))
            .ok_or_else(|| StoreError::NotFound(allocation_key(user, dataset)))?;
        row.allocated = allocated;
        Ok(())
    }

    fn update_consumed(
        &self,
        user: &str,
        dataset: DatasetId,
        consumed: Budget,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let row = tables
            .allocations
            .get_mut(&(user.to_owned(), dataset))
            .ok_or_else(|| StoreError::NotFound(allocation_key(user, dataset)))?;
        row.consumed = consumed;
        Ok(())
    }

    fn delete_allocation(&self, user: &str, dataset: DatasetId) -> Result<Allocation, StoreError> {
        self.tables
            .write()
            .allocations
            .remove(&(user.to_owned(), dataset))
            .ok_or_else(|| StoreError::NotFound(allocation_key(user, dataset)))
    }

    fn dataset_allocations(&self, dataset: DatasetId) -> Result<Vec<Allocation>, StoreError> {
        let tables = self.tables.read();
        if !tables.datasets.contains_key(&dataset) {
            return Err(StoreError::NotFound(format!("dataset {dataset}")));
        }
        Ok(tables
            .allocations
            .values()
            .filter(|row| row.dataset == dataset)
            .cloned()
            .collect())
    }

    fn user_allocations(&self, user: &str) -> Result<Vec<Allocation>, StoreError> {
        Ok(self
            .tables
            .read()
            .allocations
            .range((user.to_owned(), DatasetId::MIN)..=(user.to_owned(), DatasetId::MAX))
            .map(|(_, row)| row.clone())
            .collect())
    }
}
