use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;

use crate::config::PoolConfig;
use crate::dispatch::Handler;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::Frame;
use crate::wire::session::{Session, SessionId};

pub mod worker;

pub use worker::{WorkItem, Worker};

pub const INITIAL_SIZE: usize = 2;
const SUBMIT_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub enum PoolError {
    NoWorkers,
    SpawnFailed { worker_id: usize, source: io::Error },
    JoinFailed { worker_id: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkers => write!(f, "worker pool has no active workers"),
            Self::SpawnFailed { worker_id, source } => {
                write!(f, "failed to spawn worker {worker_id}: {source}")
            }
            Self::JoinFailed { worker_id } => write!(f, "worker {worker_id} thread panicked"),
        }
    }
}

impl std::error::Error for PoolError {}

struct WorkerSlot {
    worker: Arc<Worker>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerSlot>,
    retired: Vec<(usize, JoinHandle<()>)>,
    sessions: HashMap<SessionId, Arc<Session>>,
    next_worker_id: usize,
}

/// Elastic set of workers shared by every connection.
///
/// Workers stay in insertion order; selection prefers the first idle worker
/// and otherwise the one with the fewest pending items. Shrinking retires the
/// least busy worker and moves its queue to the next least busy survivor.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    handler: Arc<dyn Handler>,
    logger: Arc<Logger>,
    idle_wait: Duration,
    active: AtomicBool,
    target_size: AtomicUsize,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn Handler>, logger: Arc<Logger>, idle_wait: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            handler,
            logger,
            idle_wait,
            active: AtomicBool::new(false),
            target_size: AtomicUsize::new(INITIAL_SIZE),
        }
    }

    pub fn from_config(config: PoolConfig, handler: Arc<dyn Handler>, logger: Arc<Logger>) -> Self {
        Self::new(handler, logger, Duration::from_millis(config.idle_wait_ms.max(1)))
    }

    /// Starts the pool. `0` uses the remembered target size.
    pub fn activate(&self, size: usize) -> Result<(), PoolError> {
        self.active.store(true, Ordering::SeqCst);
        let size = if size == 0 {
            self.target_size()
        } else {
            size
        };
        self.set_size(size)
    }

    /// Ignores `0`. Before activation only the target is remembered.
    pub fn set_size(&self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Ok(());
        }
        self.target_size.store(size, Ordering::SeqCst);
        if !self.is_active() {
            return Ok(());
        }

        let mut state = self.state.lock().expect("worker pool lock poisoned");
        let current = state.workers.len();

        if size > current {
            self.logger.log(
                LogLevel::Info,
                Some("pools"),
                "Starting additional workers",
                Some(json!({"current": current, "adding": size - current})),
            );
            for _ in current..size {
                self.add_worker(&mut state)?;
            }
        } else if size < current {
            self.logger.log(
                LogLevel::Info,
                Some("pools"),
                "Stopping workers",
                Some(json!({"current": current, "removing": current - size})),
            );
            for _ in size..current {
                self.remove_worker(&mut state);
            }
        }

        Ok(())
    }

    /// The first worker with nothing pending, else the least busy one.
    pub fn worker(&self) -> Option<Arc<Worker>> {
        let state = self.state.lock().expect("worker pool lock poisoned");
        select_least_busy(&state.workers).map(|index| Arc::clone(&state.workers[index].worker))
    }

    /// Hands `frame` to a worker, retrying when the chosen one was retired
    /// in the meantime.
    pub fn submit(&self, session: Arc<Session>, frame: Frame) -> Result<usize, PoolError> {
        session.request_started();
        let mut item = WorkItem::new(Arc::clone(&session), frame);
        for _ in 0..SUBMIT_ATTEMPTS {
            let Some(worker) = self.worker() else {
                break;
            };
            match worker.enqueue(item) {
                Ok(()) => return Ok(worker.id()),
                Err(rejected) => item = rejected,
            }
        }
        session.request_finished();
        Err(PoolError::NoWorkers)
    }

    pub fn add_session(&self, session: Arc<Session>) {
        let mut state = self.state.lock().expect("worker pool lock poisoned");
        for slot in &state.workers {
            slot.worker.add_session(&session);
        }
        state.sessions.insert(session.id(), session);
    }

    pub fn remove_session(&self, session_id: SessionId) {
        let mut state = self.state.lock().expect("worker pool lock poisoned");
        for slot in &state.workers {
            slot.worker.remove_session(session_id);
        }
        state.sessions.remove(&session_id);
    }

    /// Stops every worker and joins all threads. Queued items are dropped.
    pub fn terminate(&self) -> Result<(), PoolError> {
        self.active.store(false, Ordering::SeqCst);

        let (workers, retired) = {
            let mut state = self.state.lock().expect("worker pool lock poisoned");
            state.sessions.clear();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.retired),
            )
        };

        let dropped = workers
            .iter()
            .map(|slot| slot.worker.pending_count())
            .sum::<usize>();
        for slot in &workers {
            slot.worker.deactivate();
        }

        let mut result = Ok(());
        let threads = workers
            .into_iter()
            .map(|slot| (slot.worker.id(), slot.thread))
            .chain(retired);
        for (worker_id, thread) in threads {
            if thread.join().is_err() {
                result = Err(PoolError::JoinFailed { worker_id });
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some("pools"),
            "Worker pool terminated",
            Some(json!({"dropped_items": dropped})),
        );
        result
    }

    pub fn size(&self) -> usize {
        self.state
            .lock()
            .expect("worker pool lock poisoned")
            .workers
            .len()
    }

    pub fn target_size(&self) -> usize {
        self.target_size.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_pending(&self) -> usize {
        self.state
            .lock()
            .expect("worker pool lock poisoned")
            .workers
            .iter()
            .map(|slot| slot.worker.pending_count())
            .sum()
    }

    fn add_worker(&self, state: &mut PoolState) -> Result<(), PoolError> {
        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;

        let (worker, thread) = Worker::spawn(
            worker_id,
            Arc::clone(&self.handler),
            Arc::clone(&self.logger),
            self.idle_wait,
        )
        .map_err(|source| PoolError::SpawnFailed { worker_id, source })?;

        // Sessions opened before this worker existed must be servable too.
        for session in state.sessions.values() {
            worker.add_session(session);
        }
        state.workers.push(WorkerSlot { worker, thread });
        Ok(())
    }

    fn remove_worker(&self, state: &mut PoolState) {
        let Some(index) = select_least_busy(&state.workers) else {
            return;
        };
        let slot = state.workers.remove(index);
        slot.worker.deactivate();

        let moved = match select_least_busy(&state.workers) {
            Some(next) => slot.worker.drain_into(&state.workers[next].worker),
            None => 0,
        };
        self.logger.log(
            LogLevel::Debug,
            Some("pools"),
            "Retired worker",
            Some(json!({"worker_id": slot.worker.id(), "migrated_items": moved})),
        );
        state.retired.push((slot.worker.id(), slot.thread));
    }
}

fn select_least_busy(workers: &[WorkerSlot]) -> Option<usize> {
    select_by_pending(workers.iter().map(|slot| slot.worker.pending_count()))
}

fn select_by_pending(pending: impl IntoIterator<Item = usize>) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, waiting) in pending.into_iter().enumerate() {
        if waiting == 0 {
            return Some(index);
        }
        if best.map_or(true, |(_, lowest)| waiting < lowest) {
            best = Some((index, waiting));
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, Instant};

    use super::{select_by_pending, PoolError, WorkerPool, INITIAL_SIZE};
    use crate::dispatch::Handler;
    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::wire::codec::{Codec, CodecConfig, Frame, WireCodec};
    use crate::wire::envelope::{Envelope, MessageKind};
    use crate::wire::session::tests::{recording_session, RecordingSink};
    use crate::wire::session::{AuthState, Session};

    /// Answers PING with PONG. DIRECT_QUERY "slow" blocks until the gate opens.
    #[derive(Default)]
    struct GatedHandler {
        open: Mutex<bool>,
        changed: Condvar,
        gate_everything: bool,
    }

    impl GatedHandler {
        fn gating_everything() -> Self {
            Self {
                gate_everything: true,
                ..Self::default()
            }
        }

        fn release(&self) {
            *self.open.lock().expect("gate lock poisoned") = true;
            self.changed.notify_all();
        }

        fn wait_open(&self) {
            let mut open = self.open.lock().expect("gate lock poisoned");
            while !*open {
                open = self.changed.wait(open).expect("gate lock poisoned");
            }
        }
    }

    impl Handler for GatedHandler {
        fn handle(&self, _session: &Session, request: &Envelope) -> Vec<Envelope> {
            let slow = request.kind == MessageKind::DirectQuery && request.payload_str() == Some("slow");
            if self.gate_everything || slow {
                self.wait_open();
            }
            match request.kind {
                MessageKind::Ping => vec![Envelope::pong(request.id)],
                _ => vec![Envelope::success(request.id)],
            }
        }
    }

    fn frame(envelope: &Envelope) -> Frame {
        WireCodec::new(CodecConfig::default())
            .encode(envelope)
            .expect("envelope should encode")
    }

    fn pool(handler: Arc<GatedHandler>) -> WorkerPool {
        let (logger, _) = memory_logger(LogLevel::Error);
        WorkerPool::new(handler, logger, Duration::from_millis(50))
    }

    fn session() -> (Arc<Session>, Arc<RecordingSink>) {
        recording_session(AuthState::Authenticated {
            user: "noauth".to_owned(),
        })
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn selection_prefers_first_idle_then_minimum() {
        assert_eq!(select_by_pending([3, 0, 0, 1]), Some(1));
        assert_eq!(select_by_pending([3, 2, 5, 2]), Some(1));
        assert_eq!(select_by_pending([4]), Some(0));
        assert_eq!(select_by_pending(Vec::new()), None);
    }

    #[test]
    fn set_size_before_activation_only_remembers_target() {
        let pool = pool(Arc::new(GatedHandler::default()));
        assert_eq!(pool.target_size(), INITIAL_SIZE);

        pool.set_size(3).expect("set_size should succeed");
        pool.set_size(0).expect("zero is ignored");
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.target_size(), 3);
        assert!(pool.worker().is_none());

        pool.activate(0).expect("activate should succeed");
        assert!(pool.is_active());
        assert_eq!(pool.size(), 3);
        pool.terminate().expect("terminate should join workers");
    }

    #[test]
    fn growing_serves_existing_sessions_on_every_worker() {
        let handler = Arc::new(GatedHandler::gating_everything());
        let pool = pool(Arc::clone(&handler));
        pool.activate(1).expect("activate should succeed");
        let (session, sink) = session();
        pool.add_session(Arc::clone(&session));

        pool.set_size(4).expect("grow should succeed");
        assert_eq!(pool.size(), 4);

        let mut used_workers = HashSet::new();
        for id in 0..40 {
            let worker_id = pool
                .submit(Arc::clone(&session), frame(&Envelope::new(id, MessageKind::Ping)))
                .expect("submit should succeed");
            used_workers.insert(worker_id);
        }
        assert_eq!(used_workers.len(), 4);
        assert_eq!(session.in_flight(), 40);

        handler.release();
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 40));
        assert!(wait_until(Duration::from_secs(5), || session.in_flight() == 0));
        {
            let state = pool.state.lock().expect("worker pool lock poisoned");
            assert!(state.workers.iter().all(|slot| slot.worker.session_count() == 1));
        }
        pool.terminate().expect("terminate should join workers");
    }

    #[test]
    fn shrinking_keeps_every_queued_request() {
        let handler = Arc::new(GatedHandler::gating_everything());
        let pool = pool(Arc::clone(&handler));
        pool.activate(3).expect("activate should succeed");
        let (session, sink) = session();
        pool.add_session(Arc::clone(&session));

        for id in 0..9 {
            pool.submit(Arc::clone(&session), frame(&Envelope::new(id, MessageKind::Ping)))
                .expect("submit should succeed");
        }
        assert_eq!(pool.total_pending(), 9);

        pool.set_size(1).expect("shrink should succeed");
        assert_eq!(pool.size(), 1);
        assert_eq!(sink.len(), 0);

        handler.release();
        assert!(wait_until(Duration::from_secs(5), || sink.len() == 9));
        let ids = sink
            .envelopes()
            .into_iter()
            .map(|e| e.id)
            .collect::<HashSet<_>>();
        assert_eq!(ids, (0..9).collect::<HashSet<_>>());
        assert!(wait_until(Duration::from_secs(5), || pool.total_pending() == 0));

        pool.terminate().expect("terminate should join workers");
    }

    #[test]
    fn slow_request_does_not_block_other_worker() {
        let handler = Arc::new(GatedHandler::default());
        let pool = pool(Arc::clone(&handler));
        pool.activate(2).expect("activate should succeed");
        let (session, sink) = session();
        pool.add_session(Arc::clone(&session));

        let slow_worker = pool
            .submit(
                Arc::clone(&session),
                frame(&Envelope::new(1, MessageKind::DirectQuery).with_payload("slow")),
            )
            .expect("submit should succeed");
        let ping_worker = pool
            .submit(Arc::clone(&session), frame(&Envelope::new(2, MessageKind::Ping)))
            .expect("submit should succeed");
        assert_ne!(slow_worker, ping_worker);

        assert!(wait_until(Duration::from_secs(2), || sink.len() == 1));
        assert_eq!(sink.envelopes()[0], Envelope::pong(2));

        handler.release();
        assert!(wait_until(Duration::from_secs(2), || sink.len() == 2));
        pool.terminate().expect("terminate should join workers");
    }

    #[test]
    fn removed_session_frames_get_no_response() {
        let pool = pool(Arc::new(GatedHandler::default()));
        pool.activate(2).expect("activate should succeed");
        let (session, sink) = session();
        pool.add_session(Arc::clone(&session));
        pool.remove_session(session.id());

        pool.submit(Arc::clone(&session), frame(&Envelope::new(1, MessageKind::Ping)))
            .expect("submit should succeed");
        assert!(wait_until(Duration::from_secs(2), || pool.total_pending() == 0));
        assert!(wait_until(Duration::from_secs(2), || session.in_flight() == 0));
        assert_eq!(sink.len(), 0);
        pool.terminate().expect("terminate should join workers");
    }

    #[test]
    fn terminated_pool_rejects_work() {
        let pool = pool(Arc::new(GatedHandler::default()));
        pool.activate(2).expect("activate should succeed");
        pool.terminate().expect("terminate should join workers");

        assert!(!pool.is_active());
        assert_eq!(pool.size(), 0);
        let (session, _) = session();
        let err = pool
            .submit(Arc::clone(&session), frame(&Envelope::new(1, MessageKind::Ping)))
            .expect_err("no workers left");
        assert!(matches!(err, PoolError::NoWorkers));
        assert_eq!(session.in_flight(), 0);
    }
}
