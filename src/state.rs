// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::attestation::{AttestationLedger, AttestationRecorder, ReceiptLogger};
use crate::blockchain::{ChainRail, EphemeralKey};
use crate::config::AppConfig;
use crate::engine::{ClaimMachine, CompanionManager, Orchestrator};
use crate::error::SettlementResult;
use crate::lock::{DistributedLock, RedbLockStore};
use crate::providers::{PriceBook, PriceSource, QuoteSwapProvider, StaticPrices};
use crate::storage::{FileStore, WorkDatabase};

/// Executor id written into run receipts.
pub const EXECUTOR_ID: &str = "claim-settlement-server";

/// External systems the engine talks to.
pub struct Collaborators {
    pub quotes: Arc<dyn QuoteSwapProvider>,
    pub price_feed: Option<Arc<dyn PriceSource>>,
    pub rail: Arc<dyn ChainRail>,
    pub ledger: Option<Arc<dyn AttestationLedger>>,
    /// Funds native gas on sessions whose deposit is an ERC-20 token.
    pub gas_sponsor: Option<EphemeralKey>,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<FileStore>,
    pub work_db: Arc<WorkDatabase>,
    pub machine: Arc<ClaimMachine>,
    pub companion: Arc<CompanionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub recorder: AttestationRecorder,
    /// Present only when an attestation ledger is configured.
    pub receipts: Option<Arc<ReceiptLogger>>,
}

impl AppState {
    /// Open the stores under `config.data_dir` and wire the engine.
    pub fn build(config: &AppConfig, collaborators: Collaborators) -> SettlementResult<Self> {
        let storage = Arc::new(FileStore::open(&config.data_dir)?);
        let work_db = Arc::new(WorkDatabase::open(&storage.paths().work_db())?);
        let lock = DistributedLock::new(
            Arc::new(RedbLockStore::new(work_db.clone())),
            config.lock_ttl,
        );
        let prices = Arc::new(PriceBook::new(
            StaticPrices::new(config.static_prices.clone()),
            collaborators.price_feed,
        ));

        let recorder =
            AttestationRecorder::new(storage.clone(), lock.clone(), collaborators.ledger.clone());
        let machine = Arc::new(ClaimMachine::new(
            storage.clone(),
            work_db.clone(),
            lock.clone(),
            collaborators.quotes.clone(),
            prices.clone(),
            recorder.clone(),
            config.intent_max_age,
        ));
        let mut companion = CompanionManager::new(
            storage.clone(),
            work_db.clone(),
            lock,
            machine.clone(),
            collaborators.rail,
            collaborators.quotes,
            prices,
            config.companion.clone(),
        );
        if let Some(sponsor) = collaborators.gas_sponsor {
            companion = companion.with_gas_sponsor(sponsor);
        }
        let companion = Arc::new(companion);
        let orchestrator = Arc::new(Orchestrator::new(
            work_db.clone(),
            machine.clone(),
            companion.clone(),
            recorder.clone(),
        ));
        let receipts = collaborators.ledger.map(|ledger| {
            Arc::new(ReceiptLogger::new(
                storage.clone(),
                work_db.clone(),
                ledger,
                EXECUTOR_ID,
            ))
        });

        Ok(Self {
            storage,
            work_db,
            machine,
            companion,
            orchestrator,
            recorder,
            receipts,
        })
    }
}
