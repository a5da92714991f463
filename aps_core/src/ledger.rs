//! Single-writer ledger worker.
//!
//! Spawns a thread that owns the [`PendingLedger`] and applies commands one
//! at a time in arrival order, so recording a new dose and reconciling
//! history can never interleave. Callers talk to it through a crossbeam
//! channel and block on a one-shot reply.
//!
//! Each `LedgerWorker` owns exactly one thread, shut down and joined when the
//! worker is dropped.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use aps_traits::Clock;
use chrono::{DateTime, Utc};
use crossbeam_channel as xch;
use uuid::Uuid;

use crate::error::ApsError;
use crate::reconcile::{PendingLedger, ReconcileReport, Resolution};
use crate::types::{PumpHistoryEvent, UnfinalizedDose};

/// How often an idle worker checks the shutdown flag.
const POLL: Duration = Duration::from_millis(50);

type Reply<T> = xch::Sender<Result<T, ApsError>>;

enum Command {
    Record(UnfinalizedDose, Reply<Uuid>),
    Reconcile(Vec<PumpHistoryEvent>, Reply<ReconcileReport>),
    Resolve(Uuid, Resolution, Reply<()>),
    Drain(Reply<Vec<UnfinalizedDose>>),
    Snapshot(Reply<PendingLedger>),
}

pub struct LedgerWorker {
    tx: Option<xch::Sender<Command>>,
    /// Milliseconds since the epoch of the last committed reconciliation, 0 if none.
    last_reconciled: Arc<AtomicI64>,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

fn stopped() -> ApsError {
    ApsError::Ledger("ledger worker stopped".into())
}

impl LedgerWorker {
    pub fn spawn<C: Clock + Send + 'static>(mut ledger: PendingLedger, clock: C) -> Self {
        let (tx, rx) = xch::unbounded::<Command>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let last_reconciled = Arc::new(AtomicI64::new(0));
        let last_clone = last_reconciled.clone();

        let join_handle = std::thread::spawn(move || {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    tracing::debug!("ledger worker received shutdown signal");
                    break;
                }
                let cmd = match rx.recv_timeout(POLL) {
                    Ok(cmd) => cmd,
                    Err(xch::RecvTimeoutError::Timeout) => continue,
                    Err(xch::RecvTimeoutError::Disconnected) => break,
                };
                let now = clock.now();
                // A dropped reply receiver only means the caller stopped waiting.
                match cmd {
                    Command::Record(dose, reply) => {
                        let _ = reply.send(ledger.record(dose));
                    }
                    Command::Reconcile(events, reply) => {
                        let res = ledger.reconcile(&events, now);
                        if res.is_ok() {
                            let pruned = ledger.prune(now);
                            if pruned > 0 {
                                tracing::debug!(pruned, "expired mappings dropped");
                            }
                            last_clone.store(now.timestamp_millis(), Ordering::Relaxed);
                        }
                        let _ = reply.send(res);
                    }
                    Command::Resolve(uuid, resolution, reply) => {
                        let _ = reply.send(ledger.resolve_uncertain(uuid, resolution));
                    }
                    Command::Drain(reply) => {
                        let _ = reply.send(Ok(ledger.drain_finalized(now)));
                    }
                    Command::Snapshot(reply) => {
                        let _ = reply.send(Ok(ledger.clone()));
                    }
                }
            }
            tracing::trace!("ledger worker exiting cleanly");
        });

        Self {
            tx: Some(tx),
            last_reconciled,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ApsError> {
        let tx = self.tx.as_ref().ok_or_else(stopped)?;
        let (reply_tx, reply_rx) = xch::bounded(1);
        tx.send(make(reply_tx)).map_err(|_| stopped())?;
        reply_rx.recv().map_err(|_| stopped())?
    }

    pub fn record(&self, dose: UnfinalizedDose) -> Result<Uuid, ApsError> {
        self.call(|r| Command::Record(dose, r))
    }

    pub fn reconcile(&self, events: Vec<PumpHistoryEvent>) -> Result<ReconcileReport, ApsError> {
        self.call(|r| Command::Reconcile(events, r))
    }

    pub fn resolve(&self, uuid: Uuid, resolution: Resolution) -> Result<(), ApsError> {
        self.call(|r| Command::Resolve(uuid, resolution, r))
    }

    pub fn drain_finalized(&self) -> Result<Vec<UnfinalizedDose>, ApsError> {
        self.call(Command::Drain)
    }

    /// Copy of the ledger as of the last applied command.
    pub fn snapshot(&self) -> Result<PendingLedger, ApsError> {
        self.call(Command::Snapshot)
    }

    pub fn last_reconciled(&self) -> Option<DateTime<Utc>> {
        match self.last_reconciled.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

impl Drop for LedgerWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Disconnect so a blocked recv returns immediately.
        self.tx.take();
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("ledger worker joined"),
                Err(e) => tracing::warn!(?e, "ledger worker panicked during shutdown"),
            }
        }
    }
}
