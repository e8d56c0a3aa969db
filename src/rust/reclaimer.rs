use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::memory::{MemoryStats, TensorMemory};
use crate::model_store::ModelStore;

/// Default cadence of the background reclaim task.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of completed inferences between count-triggered reclaims.
pub const DEFAULT_RECLAIM_EVERY: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimTrigger {
    Interval,
    InferenceCount,
    Manual,
}

impl fmt::Display for ReclaimTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval => write!(f, "interval"),
            Self::InferenceCount => write!(f, "inference-count"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Memory snapshot taken around one reclaim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub trigger: ReclaimTrigger,
    pub before: MemoryStats,
    pub after: MemoryStats,
    pub freed_buffers: usize,
    /// Whether the loaded model's engine was asked to release its caches
    pub engine_reclaimed: bool,
}

/// Releases cached tensor buffers on a timer and after every Nth inference.
///
/// Reclaiming only touches buffers parked outside any call, so it never waits
/// on an in-flight forward pass. When attached to a [`ModelStore`] it also
/// asks the loaded model's engine to release its own caches; the model handle
/// itself is never dropped.
#[derive(Debug)]
pub struct MemoryReclaimer {
    memory: Arc<TensorMemory>,
    store: Option<Arc<ModelStore>>,
    every_n: u64,
    completed: AtomicU64,
    reclaims: AtomicU64,
}

impl MemoryReclaimer {
    /// `every_n == 0` disables the count trigger.
    pub fn new(memory: Arc<TensorMemory>, every_n: u64) -> Arc<Self> {
        Self::build(memory, None, every_n)
    }

    /// Like [`MemoryReclaimer::new`], also reclaiming the engine behind `store`.
    pub fn with_store(
        memory: Arc<TensorMemory>,
        store: Arc<ModelStore>,
        every_n: u64,
    ) -> Arc<Self> {
        Self::build(memory, Some(store), every_n)
    }

    fn build(memory: Arc<TensorMemory>, store: Option<Arc<ModelStore>>, every_n: u64) -> Arc<Self> {
        Arc::new(Self {
            memory,
            store,
            every_n,
            completed: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        })
    }

    pub fn reclaim(&self) -> ReclaimReport {
        self.reclaim_with(ReclaimTrigger::Manual)
    }

    /// Counts one completed inference and reclaims when the threshold is hit.
    pub fn record_inference(&self) -> Option<ReclaimReport> {
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if self.every_n > 0 && completed % self.every_n == 0 {
            Some(self.reclaim_with(ReclaimTrigger::InferenceCount))
        } else {
            None
        }
    }

    pub fn completed_inferences(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Acquire)
    }

    pub fn memory(&self) -> &Arc<TensorMemory> {
        &self.memory
    }

    /// Spawns the timer-driven reclaim loop on the current tokio runtime.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let reclaimer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reclaimer.reclaim_with(ReclaimTrigger::Interval);
            }
        })
    }

    fn reclaim_with(&self, trigger: ReclaimTrigger) -> ReclaimReport {
        let before = self.memory.stats();
        let freed_buffers = self.memory.pool().drain();
        let engine_reclaimed = self.reclaim_engine();
        let after = self.memory.stats();
        self.reclaims.fetch_add(1, Ordering::AcqRel);

        if freed_buffers > 0 || engine_reclaimed {
            info!(
                "Reclaimed tensor memory ({}): before [{}], after [{}], engine caches released: {}",
                trigger, before, after, engine_reclaimed
            );
        } else {
            debug!("Reclaim pass ({}) found nothing cached: [{}]", trigger, after);
        }

        ReclaimReport {
            trigger,
            before,
            after,
            freed_buffers,
            engine_reclaimed,
        }
    }

    fn reclaim_engine(&self) -> bool {
        match self.store.as_ref().map(|store| store.handle()) {
            Some(Ok(handle)) => {
                handle.backend().reclaim();
                true
            }
            _ => false,
        }
    }
}
