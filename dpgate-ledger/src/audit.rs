use std::{sync::Arc, time::SystemTime};

use dpgate_query::{Budget, DatasetId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::UserId;

/// Hex blake3 digest used to tie a consumption entry to the query that
/// spent it.
pub fn query_fingerprint(query: &[u8]) -> String {
    blake3::hash(query).to_hex().to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Allocated {
        ts: SystemTime,
        user: UserId,
        dataset: DatasetId,
        budget: Budget,
    },
    Patched {
        ts: SystemTime,
        user: UserId,
        dataset: DatasetId,
        previous: Budget,
        budget: Budget,
    },
    Deleted {
        ts: SystemTime,
        user: UserId,
        dataset: DatasetId,
        allocated: Budget,
        consumed: Budget,
    },
    Consumed {
        ts: SystemTime,
        user: UserId,
        dataset: DatasetId,
        spent: Budget,
        total_consumed: Budget,
        query_fingerprint: Option<String>,
    },
}

impl LedgerEvent {
    pub fn allocated(user: &str, dataset: DatasetId, budget: Budget) -> Self {
        Self::Allocated {
            ts: SystemTime::now(),
            user: user.to_owned(),
            dataset,
            budget,
        }
    }

    pub fn patched(user: &str, dataset: DatasetId, previous: Budget, budget: Budget) -> Self {
        Self::Patched {
            ts: SystemTime::now(),
            user: user.to_owned(),
            dataset,
            previous,
            budget,
        }
    }

    pub fn deleted(user: &str, dataset: DatasetId, allocated: Budget, consumed: Budget) -> Self {
        Self::Deleted {
            ts: SystemTime::now(),
            user: user.to_owned(),
            dataset,
            allocated,
            consumed,
        }
    }

    pub fn consumed(
        user: &str,
        dataset: DatasetId,
        spent: Budget,
        total_consumed: Budget,
        query: Option<&[u8]>,
    ) -> Self {
        Self::Consumed {
            ts: SystemTime::now(),
            user: user.to_owned(),
            dataset,
            spent,
            total_consumed,
            query_fingerprint: query.map(query_fingerprint),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allocated { .. } => "allocated",
            Self::Patched { .. } => "patched",
            Self::Deleted { .. } => "deleted",
            Self::Consumed { .. } => "consumed",
        }
    }

    pub fn key(&self) -> (&str, DatasetId) {
        match self {
            Self::Allocated { user, dataset, .. }
            | Self::Patched { user, dataset, .. }
            | Self::Deleted { user, dataset, .. }
            | Self::Consumed { user, dataset, .. } => (user.as_str(), *dataset),
        }
    }
}

pub trait LedgerAuditSink: Send + Sync {
    fn emit(&self, event: LedgerEvent) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopLedgerSink;

impl LedgerAuditSink for NoopLedgerSink {
    fn emit(&self, _event: LedgerEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every event in memory; handy for tests and the CLI summary.
#[derive(Debug, Default)]
pub struct InMemoryLedgerSink {
    events: Mutex<Vec<LedgerEvent>>,
}

impl InMemoryLedgerSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl LedgerAuditSink for InMemoryLedgerSink {
    fn emit(&self, event: LedgerEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Writes each event as a structured `tracing` record.
#[derive(Clone, Debug, Default)]
pub struct TracingLedgerSink;

impl LedgerAuditSink for TracingLedgerSink {
    fn emit(&self, event: LedgerEvent) -> anyhow::Result<()> {
        let (user, dataset) = event.key();
        match &event {
            LedgerEvent::Allocated { budget, .. } => {
                info!(user, dataset, %budget, "budget allocated");
            }
            LedgerEvent::Patched { previous, budget, .. } => {
                info!(user, dataset, %previous, %budget, "budget patched");
            }
            LedgerEvent::Deleted { allocated, consumed, .. } => {
                info!(user, dataset, %allocated, %consumed, "allocation deleted");
            }
            LedgerEvent::Consumed {
                spent,
                total_consumed,
                query_fingerprint,
                ..
            } => {
                info!(
                    user,
                    dataset,
                    %spent,
                    %total_consumed,
                    query = query_fingerprint.as_deref().unwrap_or("-"),
                    "budget consumed"
                );
            }
        }
        Ok(())
    }
}

/// Fan-out sink for emitting to multiple audit backends.
pub struct CompositeLedgerSink {
    sinks: Vec<Arc<dyn LedgerAuditSink>>,
}

impl CompositeLedgerSink {
    pub fn new(sinks: Vec<Arc<dyn LedgerAuditSink>>) -> Self {
        Self { sinks }
    }
}

impl LedgerAuditSink for CompositeLedgerSink {
    fn emit(&self, event: LedgerEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.emit(event.clone())?;
        }
        Ok(())
    }
}
