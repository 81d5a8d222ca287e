//! One cancellable polling task per match

use crate::error::{MatchmakingError, Result};
use crate::ingestion::poller::{IngestionJob, TickOutcome};
use crate::matches::state::MatchStateKind;
use crate::matches::store::MatchStore;
use crate::types::MatchId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

type TaskMap = Arc<Mutex<HashMap<MatchId, Tracked>>>;

struct Tracked {
    /// Distinguishes a restarted task from the one it replaced
    generation: u64,
    handle: JoinHandle<()>,
}

/// Drop the entry for `match_id` only if it still belongs to `generation`
fn release(registry: &Mutex<HashMap<MatchId, Tracked>>, match_id: MatchId, generation: u64) {
    if let Ok(mut tasks) = registry.lock() {
        if tasks.get(&match_id).is_some_and(|t| t.generation == generation) {
            tasks.remove(&match_id);
        }
    }
}

pub struct IngestionScheduler {
    job: Arc<IngestionJob>,
    period: Duration,
    tasks: TaskMap,
    generations: AtomicU64,
}

impl IngestionScheduler {
    pub fn new(job: Arc<IngestionJob>, period: Duration) -> Self {
        Self {
            job,
            period: period.max(Duration::from_millis(1)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    pub fn job(&self) -> &Arc<IngestionJob> {
        &self.job
    }

    /// Start polling `match_id`. A match that is already tracked keeps its
    /// existing task.
    pub fn start(&self, match_id: MatchId) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("ingestion tasks"))?;
        if tasks.get(&match_id).is_some_and(|t| !t.handle.is_finished()) {
            debug!("Ingestion for match {} already running", match_id);
            return Ok(());
        }

        let job = self.job.clone();
        let registry = self.tasks.clone();
        let period = self.period;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(period));
            while ticks.next().await.is_some() {
                match job.tick(match_id).await {
                    Ok(TickOutcome::Continue) => {}
                    Ok(TickOutcome::Done) => break,
                    Err(e) => warn!("Ingestion tick for match {} failed: {}", match_id, e),
                }
            }
            debug!("Ingestion for match {} stopped", match_id);
            release(&registry, match_id, generation);
        });
        tasks.insert(match_id, Tracked { generation, handle });
        info!("Started ingestion for match {}", match_id);
        Ok(())
    }

    /// Cancel polling for one match. Returns whether a task was running.
    pub fn stop(&self, match_id: MatchId) -> bool {
        let handle = self
            .tasks
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&match_id))
            .map(|t| t.handle);
        match handle {
            Some(handle) => {
                handle.abort();
                info!("Stopped ingestion for match {}", match_id);
                true
            }
            None => false,
        }
    }

    pub fn is_tracking(&self, match_id: MatchId) -> bool {
        self.tasks
            .lock()
            .map(|t| t.get(&match_id).is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn tracked(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Pick up every warming-up or live match, e.g. after a restart
    pub fn resume(&self, store: &dyn MatchStore) -> Result<usize> {
        let mut resumed = 0;
        for state in [MatchStateKind::Warmup, MatchStateKind::Live] {
            for m in store.list_by_state(state)? {
                self.start(m.id)?;
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!("Resumed ingestion for {} match(es)", resumed);
        }
        Ok(resumed)
    }

    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, tracked) in tasks.drain() {
                tracked.handle.abort();
            }
        }
    }
}

impl Drop for IngestionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
