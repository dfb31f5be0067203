// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Background Loops
//!
//! Two periodic drivers around the [`Orchestrator`]:
//!
//! - [`SettlementPoller`] runs a settlement tick every `SETTLEMENT_TICK_SECS`
//!   (default 60 s).
//! - [`AttestationSweeper`] re-attests successful claims lacking a record
//!   every `ATTESTATION_SWEEP_SECS` (default 600 s).
//!
//! Both stop on the shared `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::Orchestrator;
use crate::error::ErrorKind;

/// Sleep for `interval`, returning `false` if shutdown was requested.
async fn wait_or_shutdown(interval: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.cancelled() => false,
    }
}

pub struct SettlementPoller {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl SettlementPoller {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run until the token is cancelled.
    ///
    /// ```rust,ignore
    /// tokio::spawn(poller.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Settlement poller starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.poll_step().await;

            if !wait_or_shutdown(self.interval, &shutdown).await {
                break;
            }
        }
        info!("Settlement poller shutting down");
    }

    async fn poll_step(&self) {
        match self.orchestrator.process_pending().await {
            Ok(report) => {
                debug!(processed = report.processed, "Settlement tick complete");
            }
            Err(e) if e.kind() == ErrorKind::Busy => {
                debug!("Settlement tick skipped, previous tick still running");
            }
            Err(e) => {
                error!(error = %e, "Settlement tick aborted");
            }
        }
    }
}

pub struct AttestationSweeper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl AttestationSweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Attestation sweeper starting");

        loop {
            if !wait_or_shutdown(self.interval, &shutdown).await {
                break;
            }
            if let Err(e) = self.orchestrator.sweep_attestations().await {
                warn!(error = %e, "Attestation sweep aborted");
            }
        }
        info!("Attestation sweeper shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_false_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!wait_or_shutdown(Duration::from_secs(3600), &token).await);
    }

    #[tokio::test]
    async fn wait_returns_true_after_interval() {
        let token = CancellationToken::new();
        assert!(wait_or_shutdown(Duration::from_millis(5), &token).await);
    }
}
