use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::dispatch::Handler;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{Codec, Frame};
use crate::wire::session::{Session, SessionId};

/// A received frame together with the session it arrived on.
pub struct WorkItem {
    pub session: Arc<Session>,
    pub frame: Frame,
}

impl WorkItem {
    pub fn new(session: Arc<Session>, frame: Frame) -> Self {
        Self { session, frame }
    }
}

type SessionCodec = Arc<Mutex<Box<dyn Codec>>>;

/// One request-processing thread with its own queue and codec clones.
///
/// `pending` counts queued plus in-flight items. It is read without
/// synchronization by the pool when balancing, so it is only approximate.
pub struct Worker {
    id: usize,
    queue: Mutex<VecDeque<WorkItem>>,
    wake: Condvar,
    pending: AtomicUsize,
    active: AtomicBool,
    codecs: Mutex<HashMap<SessionId, SessionCodec>>,
    handler: Arc<dyn Handler>,
    logger: Arc<Logger>,
    idle_wait: Duration,
}

impl Worker {
    pub(super) fn new(
        id: usize,
        handler: Arc<dyn Handler>,
        logger: Arc<Logger>,
        idle_wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            pending: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            codecs: Mutex::new(HashMap::new()),
            handler,
            logger,
            idle_wait,
        })
    }

    pub fn spawn(
        id: usize,
        handler: Arc<dyn Handler>,
        logger: Arc<Logger>,
        idle_wait: Duration,
    ) -> io::Result<(Arc<Self>, JoinHandle<()>)> {
        let worker = Self::new(id, handler, logger, idle_wait);
        let runner = Arc::clone(&worker);
        let thread = thread::Builder::new()
            .name(format!("graphwire-worker-{id}"))
            .spawn(move || runner.run())?;
        Ok((worker, thread))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.codecs.lock().expect("worker codecs lock poisoned").len()
    }

    pub fn add_session(&self, session: &Session) {
        self.codecs
            .lock()
            .expect("worker codecs lock poisoned")
            .insert(session.id(), Arc::new(Mutex::new(session.codec_clone())));
    }

    pub fn remove_session(&self, session_id: SessionId) {
        self.codecs
            .lock()
            .expect("worker codecs lock poisoned")
            .remove(&session_id);
    }

    /// Queues `item` and wakes the thread. A deactivated worker hands the
    /// item back.
    pub fn enqueue(&self, item: WorkItem) -> Result<(), WorkItem> {
        let mut queue = self.queue.lock().expect("worker queue lock poisoned");
        if !self.is_active() {
            return Err(item);
        }
        queue.push_back(item);
        self.pending.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        self.wake.notify_one();
        Ok(())
    }

    /// Moves every queued, not yet started item to `target` in order.
    /// Returns how many items moved.
    pub fn drain_into(&self, target: &Worker) -> usize {
        let drained = {
            let mut queue = self.queue.lock().expect("worker queue lock poisoned");
            queue.drain(..).collect::<Vec<_>>()
        };
        let moved = drained.len();
        self.pending.fetch_sub(moved, Ordering::Relaxed);

        let mut target_queue = target.queue.lock().expect("worker queue lock poisoned");
        target_queue.extend(drained);
        target.pending.fetch_add(moved, Ordering::Relaxed);
        drop(target_queue);

        target.wake.notify_one();
        moved
    }

    /// Stops the run loop after its current batch. Queued items stay in the
    /// queue for `drain_into`.
    pub fn deactivate(&self) {
        let queue = self.queue.lock().expect("worker queue lock poisoned");
        self.active.store(false, Ordering::SeqCst);
        drop(queue);
        self.wake.notify_all();
    }

    fn run(&self) {
        self.logger.log(
            LogLevel::Debug,
            Some("pools::worker"),
            "Worker started",
            Some(json!({"worker_id": self.id})),
        );

        let mut batch = Vec::new();
        loop {
            {
                let mut queue = self.queue.lock().expect("worker queue lock poisoned");
                if queue.is_empty() && self.is_active() {
                    queue = self
                        .wake
                        .wait_timeout(queue, self.idle_wait)
                        .expect("worker queue lock poisoned")
                        .0;
                }
                if !self.is_active() {
                    break;
                }
                batch.extend(queue.drain(..));
            }

            for item in batch.drain(..) {
                let session = Arc::clone(&item.session);
                self.process(item);
                session.request_finished();
                self.pending.fetch_sub(1, Ordering::Relaxed);
            }
        }

        self.logger.log(
            LogLevel::Debug,
            Some("pools::worker"),
            "Worker stopped",
            Some(json!({"worker_id": self.id})),
        );
    }

    fn process(&self, item: WorkItem) {
        let session_id = item.session.id();
        let codec = self
            .codecs
            .lock()
            .expect("worker codecs lock poisoned")
            .get(&session_id)
            .cloned();
        let Some(codec) = codec else {
            self.logger.log(
                LogLevel::Debug,
                Some("pools::worker"),
                "Skipping frame of removed session",
                Some(json!({"worker_id": self.id, "session_id": session_id.to_string()})),
            );
            return;
        };
        let mut codec = codec.lock().expect("session codec lock poisoned");

        let request = match codec.decode(&item.frame) {
            Ok(request) => request,
            Err(err) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("pools::worker"),
                    "Failed to decode frame",
                    Some(json!({
                        "worker_id": self.id,
                        "session_id": session_id.to_string(),
                        "error": err.to_string(),
                    })),
                );
                return;
            }
        };

        for response in self.handler.handle(&item.session, &request) {
            if let Err(err) = item.session.send(&mut **codec, &response) {
                self.logger.log(
                    LogLevel::Error,
                    Some("pools::worker"),
                    "Failed to send response",
                    Some(json!({
                        "worker_id": self.id,
                        "session_id": session_id.to_string(),
                        "id": response.id,
                        "error": err.to_string(),
                    })),
                );
            }
        }
    }
}
