//! The fixpoint driver
//!
//! A [`Percolator`] repeatedly claims the most urgent stale operation and
//! runs it until nothing is left, an interrupt is observed, or the
//! iteration cap is hit. Any number of percolators may share one store; the
//! store's atomic claim is the only coordination between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::engine::Engine;
use crate::error::Result;
use crate::operation::OperationId;

/// Requests that a running percolation stop after its current operation
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Statistics for one `percolate` run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub operations: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub interrupted: bool,
    pub limit_reached: bool,
}

impl Summary {
    pub fn percolation_time(&self) -> Duration {
        self.ended_at - self.started_at
    }
}

pub struct Percolator {
    engine: Engine,
    interrupt: InterruptHandle,
}

impl Percolator {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            interrupt: InterruptHandle::default(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Claim one stale operation and run it. `None` when nothing is eligible.
    pub async fn acquire_and_perform(&self) -> Result<Option<OperationId>> {
        match self.engine.claim_next().await? {
            Some(doc) => Ok(Some(self.engine.run_claimed(doc).await?)),
            None => Ok(None),
        }
    }

    /// Percolate under the configured iteration cap.
    pub async fn percolate(&self) -> Result<Summary> {
        self.percolate_with_limit(self.engine.config().percolation_limit)
            .await
    }

    /// Run operations until none is stale, an interrupt arrives, or `limit`
    /// operations have run. A pending interrupt from an earlier run is
    /// cleared first.
    pub async fn percolate_with_limit(&self, limit: Option<usize>) -> Result<Summary> {
        self.interrupt.reset();
        let started_at = Utc::now();
        log::info!("Percolation started");

        let mut operations = 0;
        let mut interrupted = false;
        let mut limit_reached = false;
        loop {
            if self.interrupt.is_interrupted() {
                log::info!("Percolation interrupted after {} operations", operations);
                interrupted = true;
                break;
            }
            if limit.is_some_and(|limit| operations >= limit) {
                limit_reached = true;
                break;
            }
            match self.acquire_and_perform().await? {
                Some(_) => operations += 1,
                None => break,
            }
        }

        let summary = Summary {
            operations,
            started_at,
            ended_at: Utc::now(),
            interrupted,
            limit_reached,
        };
        log::info!(
            "Percolation finished: {} operations in {} ms",
            summary.operations,
            summary.percolation_time().num_milliseconds()
        );
        Ok(summary)
    }
}
