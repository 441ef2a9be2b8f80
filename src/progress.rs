//! Cancellation and progress reporting for long-running pipeline phases.
//!
//! Phases never block on a consumer: updates go out over an `mpsc` channel
//! and are dropped silently once the receiving end has hung up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

/// Cooperative cancellation flag shared between the signal handler and the
/// pipeline. Phases poll it between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Fingerprinting,
    Merging,
    Maintenance,
    Scanning,
}

impl Phase {
    /// Full display name for progress output.
    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Fingerprinting => "Fingerprinting",
            Phase::Merging => "Building search tree",
            Phase::Maintenance => "Rebalancing search tree",
            Phase::Scanning => "Searching for duplicates",
        }
    }
}

/// Progress update sent from a running phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseUpdate {
    Started { phase: Phase, total: Option<u64> },
    Progress { phase: Phase, current: u64 },
    Finished { phase: Phase, cancelled: bool },
}

/// Sending half of a progress channel. A default reporter discards everything.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<mpsc::Sender<PhaseUpdate>>,
}

impl Reporter {
    pub fn new(tx: mpsc::Sender<PhaseUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn started(&self, phase: Phase, total: Option<u64>) {
        self.send(PhaseUpdate::Started { phase, total });
    }

    pub fn progress(&self, phase: Phase, current: u64) {
        self.send(PhaseUpdate::Progress { phase, current });
    }

    pub fn finished(&self, phase: Phase, cancelled: bool) {
        self.send(PhaseUpdate::Finished { phase, cancelled });
    }

    fn send(&self, update: PhaseUpdate) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        }
    }
}
