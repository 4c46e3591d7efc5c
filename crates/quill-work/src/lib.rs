//! Cooperative work scheduler.
//!
//! Long-running node operations (archive transfers, checkpoint writing,
//! chain verification, replay) are expressed as [`Work`] units. The
//! scheduler runs units whose dependencies have succeeded, retries units
//! that report transient failures, and cancels whole subtrees on abort.
//! Composition is explicit: either a dependency edge between registered
//! units or a [`WorkSequence`] that owns an ordered child list.
//!
//! Work units hold no shared mutable state with one another beyond what
//! their owner passes in; progress is driven entirely by the enclosing
//! event loop awaiting [`WorkScheduler::run_until_done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type WorkId = u64;

/// Result of one execution attempt of a work unit.
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// Work completed successfully.
    Success,
    /// Work observed its cancellation token and stopped.
    Aborted,
    /// Transient failure; run again after the given delay.
    Retry { delay: Duration },
    /// Permanent failure.
    Failed(String),
}

/// Lifecycle state of a registered work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Running,
    Success,
    Failed,
    /// A dependency failed or was aborted, so this unit will never run.
    Blocked,
    Aborted,
}

/// Execution context handed to a running work unit.
#[derive(Clone)]
pub struct WorkContext {
    pub id: WorkId,
    pub attempt: u32,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn is_aborting(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A unit of schedulable work.
///
/// `run` performs one attempt. `reset` is invoked before a retry attempt so
/// the unit can discard partial output. `abort` is invoked when the unit is
/// torn down mid-flight; implementations close streams and delete scratch
/// files but must not touch durable state.
#[async_trait]
pub trait Work: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, ctx: WorkContext) -> WorkOutcome;

    async fn reset(&mut self) {}

    async fn abort(&mut self) -> bool {
        true
    }
}

struct WorkEntry {
    name: String,
    deps: Vec<WorkId>,
    retries_left: u32,
    attempts: u32,
    last_error: Option<String>,
    cancel: CancellationToken,
    work: Option<Box<dyn Work + Send>>,
}

struct WorkCompletion {
    id: WorkId,
    outcome: WorkOutcome,
    work: Box<dyn Work + Send>,
    attempt: u32,
}

/// Scheduler for work units with dependency edges and bounded retries.
pub struct WorkScheduler {
    max_concurrency: usize,
    retry_delay: Duration,
    next_id: WorkId,
    entries: HashMap<WorkId, WorkEntry>,
    states: HashMap<WorkId, WorkState>,
    dependents: HashMap<WorkId, Vec<WorkId>>,
}

impl Default for WorkScheduler {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(50))
    }
}

impl WorkScheduler {
    pub fn new(max_concurrency: usize, retry_delay: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            retry_delay,
            next_id: 1,
            entries: HashMap::new(),
            states: HashMap::new(),
            dependents: HashMap::new(),
        }
    }

    /// Register a work unit. It becomes runnable once every id in `deps`
    /// has succeeded; `retries` bounds how many times a `Retry` outcome is
    /// honoured before the unit fails.
    pub fn add_work(
        &mut self,
        work: Box<dyn Work + Send>,
        deps: Vec<WorkId>,
        retries: u32,
    ) -> WorkId {
        let id = self.next_id;
        self.next_id += 1;

        let name = work.name().to_string();
        self.entries.insert(
            id,
            WorkEntry {
                name: name.clone(),
                deps: deps.clone(),
                retries_left: retries,
                attempts: 0,
                last_error: None,
                cancel: CancellationToken::new(),
                work: Some(work),
            },
        );
        self.states.insert(id, WorkState::Pending);
        for dep in deps {
            self.dependents.entry(dep).or_default().push(id);
        }

        debug!(work_id = id, name = %name, "registered work");
        id
    }

    pub fn state(&self, id: WorkId) -> Option<WorkState> {
        self.states.get(&id).copied()
    }

    pub fn last_error(&self, id: WorkId) -> Option<String> {
        self.entries.get(&id).and_then(|e| e.last_error.clone())
    }

    /// True when every registered unit has reached a terminal state.
    pub fn all_done(&self) -> bool {
        self.states.values().all(|s| {
            matches!(
                s,
                WorkState::Success | WorkState::Failed | WorkState::Blocked | WorkState::Aborted
            )
        })
    }

    /// True when every registered unit succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.states.values().all(|s| matches!(s, WorkState::Success))
    }

    /// Request abort of a pending or running unit and block its dependents.
    pub fn abort(&mut self, id: WorkId) -> bool {
        match self.states.get(&id).copied() {
            Some(WorkState::Pending) => {
                if let Some(entry) = self.entries.get(&id) {
                    entry.cancel.cancel();
                }
                self.states.insert(id, WorkState::Aborted);
                self.block_dependents(id);
                true
            }
            Some(WorkState::Running) => {
                if let Some(entry) = self.entries.get(&id) {
                    entry.cancel.cancel();
                }
                // The running attempt observes the token and reports Aborted.
                true
            }
            _ => false,
        }
    }

    pub fn abort_all(&mut self) {
        let ids: Vec<WorkId> = self.entries.keys().copied().collect();
        for id in ids {
            self.abort(id);
        }
    }

    /// Drive all registered work to completion.
    ///
    /// Concurrency is bounded; between suspension points the current-thread
    /// event loop is free to run other tasks, which is what makes the whole
    /// scheduler deterministic under a single-threaded runtime.
    pub async fn run_until_done(&mut self) {
        let (tx, mut rx) = mpsc::channel::<WorkCompletion>(64);
        let mut running: HashSet<WorkId> = HashSet::new();
        let mut queue: VecDeque<WorkId> = self.ready_ids().into();
        let mut queued: HashSet<WorkId> = queue.iter().copied().collect();

        loop {
            while running.len() < self.max_concurrency {
                let Some(id) = queue.pop_front() else { break };
                queued.remove(&id);
                if running.contains(&id) || !self.deps_satisfied(id) {
                    continue;
                }
                let Some(entry) = self.entries.get_mut(&id) else {
                    continue;
                };
                if entry.cancel.is_cancelled() {
                    self.states.insert(id, WorkState::Aborted);
                    self.block_dependents(id);
                    continue;
                }
                let Some(mut work) = entry.work.take() else {
                    continue;
                };
                entry.attempts += 1;
                let attempt = entry.attempts;
                let cancel = entry.cancel.clone();
                let completion_tx = tx.clone();

                self.states.insert(id, WorkState::Running);
                running.insert(id);

                tokio::spawn(async move {
                    if attempt > 1 {
                        work.reset().await;
                    }
                    let outcome = work
                        .run(WorkContext {
                            id,
                            attempt,
                            cancel: cancel.clone(),
                        })
                        .await;
                    let outcome = if cancel.is_cancelled() {
                        work.abort().await;
                        WorkOutcome::Aborted
                    } else {
                        outcome
                    };
                    let _ = completion_tx
                        .send(WorkCompletion {
                            id,
                            outcome,
                            work,
                            attempt,
                        })
                        .await;
                });
            }

            if running.is_empty() && queue.is_empty() {
                break;
            }

            let Some(completion) = rx.recv().await else { break };
            running.remove(&completion.id);
            let id = completion.id;

            match completion.outcome {
                WorkOutcome::Success => {
                    self.states.insert(id, WorkState::Success);
                    self.store_work(id, completion.work);
                    for ready in self.ready_ids() {
                        if !running.contains(&ready) && queued.insert(ready) {
                            queue.push_back(ready);
                        }
                    }
                }
                WorkOutcome::Aborted => {
                    self.states.insert(id, WorkState::Aborted);
                    self.store_work(id, completion.work);
                    self.block_dependents(id);
                }
                WorkOutcome::Retry { delay } => {
                    let entry = self.entries.get_mut(&id).expect("entry exists");
                    if entry.retries_left == 0 {
                        warn!(work_id = id, name = %entry.name, "out of retries");
                        self.states.insert(id, WorkState::Failed);
                        self.store_work(id, completion.work);
                        self.block_dependents(id);
                        continue;
                    }
                    entry.retries_left -= 1;
                    entry.work = Some(completion.work);
                    self.states.insert(id, WorkState::Pending);
                    let delay = if delay.is_zero() {
                        self.retry_delay
                    } else {
                        delay
                    };
                    tokio::time::sleep(delay).await;
                    if queued.insert(id) {
                        queue.push_back(id);
                    }
                }
                WorkOutcome::Failed(err) => {
                    warn!(work_id = id, attempt = completion.attempt, error = %err, "work failed");
                    self.states.insert(id, WorkState::Failed);
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.last_error = Some(err);
                    }
                    self.store_work(id, completion.work);
                    self.block_dependents(id);
                }
            }
        }
    }

    fn store_work(&mut self, id: WorkId, work: Box<dyn Work + Send>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.work = Some(work);
        }
    }

    fn ready_ids(&self) -> Vec<WorkId> {
        let mut ids: Vec<WorkId> = self
            .entries
            .keys()
            .filter(|id| matches!(self.states.get(id), Some(WorkState::Pending)))
            .filter(|id| self.deps_satisfied(**id))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn deps_satisfied(&self, id: WorkId) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };
        entry
            .deps
            .iter()
            .all(|dep| matches!(self.states.get(dep), Some(WorkState::Success)))
    }

    fn block_dependents(&mut self, id: WorkId) {
        if let Some(children) = self.dependents.get(&id).cloned() {
            for child in children {
                if matches!(self.states.get(&child), Some(WorkState::Pending)) {
                    self.states.insert(child, WorkState::Blocked);
                    self.block_dependents(child);
                }
            }
        }
    }
}

/// Helper that chains work units so each depends on the previous one.
#[derive(Default)]
pub struct WorkSequence {
    last: Option<WorkId>,
    ids: Vec<WorkId>,
}

impl WorkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        scheduler: &mut WorkScheduler,
        work: Box<dyn Work + Send>,
        retries: u32,
    ) -> WorkId {
        let deps = self.last.into_iter().collect();
        let id = scheduler.add_work(work, deps, retries);
        self.last = Some(id);
        self.ids.push(id);
        id
    }

    pub fn ids(&self) -> &[WorkId] {
        &self.ids
    }

    pub fn last_id(&self) -> Option<WorkId> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Order {
        seq: AtomicU32,
        log: std::sync::Mutex<Vec<(String, u32)>>,
    }

    struct RecordingWork {
        name: String,
        order: Arc<Order>,
        fail_times: u32,
        permanent_fail: bool,
    }

    impl RecordingWork {
        fn new(name: &str, order: Arc<Order>) -> Self {
            Self {
                name: name.to_string(),
                order,
                fail_times: 0,
                permanent_fail: false,
            }
        }
    }

    #[async_trait]
    impl Work for RecordingWork {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
            if self.permanent_fail {
                return WorkOutcome::Failed("boom".to_string());
            }
            if self.fail_times > 0 {
                self.fail_times -= 1;
                return WorkOutcome::Retry {
                    delay: Duration::from_millis(1),
                };
            }
            let n = self.order.seq.fetch_add(1, Ordering::SeqCst);
            self.order.log.lock().unwrap().push((self.name.clone(), n));
            WorkOutcome::Success
        }
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let order = Arc::new(Order::default());
        let mut scheduler = WorkScheduler::default();
        let mut seq = WorkSequence::new();
        for name in ["a", "b", "c"] {
            seq.push(
                &mut scheduler,
                Box::new(RecordingWork::new(name, order.clone())),
                0,
            );
        }
        scheduler.run_until_done().await;
        assert!(scheduler.all_succeeded());

        let log = order.log.lock().unwrap().clone();
        let names: Vec<&str> = log.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let order = Arc::new(Order::default());
        let mut scheduler = WorkScheduler::default();
        let mut work = RecordingWork::new("flaky", order.clone());
        work.fail_times = 2;
        let id = scheduler.add_work(Box::new(work), vec![], 3);
        scheduler.run_until_done().await;
        assert_eq!(scheduler.state(id), Some(WorkState::Success));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let order = Arc::new(Order::default());
        let mut scheduler = WorkScheduler::default();
        let mut work = RecordingWork::new("flaky", order.clone());
        work.fail_times = 5;
        let id = scheduler.add_work(Box::new(work), vec![], 1);
        scheduler.run_until_done().await;
        assert_eq!(scheduler.state(id), Some(WorkState::Failed));
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let order = Arc::new(Order::default());
        let mut scheduler = WorkScheduler::default();
        let mut bad = RecordingWork::new("bad", order.clone());
        bad.permanent_fail = true;
        let bad_id = scheduler.add_work(Box::new(bad), vec![], 0);
        let child_id = scheduler.add_work(
            Box::new(RecordingWork::new("child", order.clone())),
            vec![bad_id],
            0,
        );
        let grandchild_id = scheduler.add_work(
            Box::new(RecordingWork::new("grandchild", order.clone())),
            vec![child_id],
            0,
        );
        scheduler.run_until_done().await;
        assert_eq!(scheduler.state(bad_id), Some(WorkState::Failed));
        assert_eq!(scheduler.state(child_id), Some(WorkState::Blocked));
        assert_eq!(scheduler.state(grandchild_id), Some(WorkState::Blocked));
        assert_eq!(scheduler.last_error(bad_id).as_deref(), Some("boom"));
        assert!(scheduler.all_done());
        assert!(!scheduler.all_succeeded());
    }

    #[tokio::test]
    async fn test_abort_pending() {
        let order = Arc::new(Order::default());
        let mut scheduler = WorkScheduler::default();
        let a = scheduler.add_work(
            Box::new(RecordingWork::new("a", order.clone())),
            vec![],
            0,
        );
        let b = scheduler.add_work(
            Box::new(RecordingWork::new("b", order.clone())),
            vec![a],
            0,
        );
        assert!(scheduler.abort(a));
        scheduler.run_until_done().await;
        assert_eq!(scheduler.state(a), Some(WorkState::Aborted));
        assert_eq!(scheduler.state(b), Some(WorkState::Blocked));
    }
}
