//! Privacy budget ledger.
//!
//! Tracks, per dataset, a total budget and, per (user, dataset), an allocated
//! and a consumed budget. Allocation never pushes the sum of allocations past
//! the dataset total; consumption is admitted only while the requested budget
//! fits in what the user has left.

pub mod audit;
pub mod ledger;
pub mod store;

pub use crate::audit::{
    query_fingerprint, CompositeLedgerSink, InMemoryLedgerSink, LedgerAuditSink, LedgerEvent,
    NoopLedgerSink, TracingLedgerSink,
};
pub use crate::ledger::{BudgetLedger, DatasetBudget, LedgerError};
pub use crate::store::{Allocation, InMemoryLedgerStore, LedgerStore, StoreError, UserId};
