//! The service policy: what happens to a message once it is delivered.
//!
//! `handle` returns a `Result` so decorators can compose over failures:
//! [`Statistics`] counts them, [`Filter`] prevents them, and [`Retry`] is
//! the only component permitted to swallow intermediate ones (up to its
//! bound).

use crate::message::TypedPayload;
use protocol::error::CommError;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes one delivered message. `handler` is the application callback a
/// pass-through service forwards to; richer services may route, defer, or
/// drop instead.
pub trait Service<M> {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError>;
}

/// Messages that can expose a routing key (e.g. a type id).
pub trait Routable {
    fn route_key(&self) -> Option<u32> {
        None
    }
}

impl Routable for Vec<u8> {}
impl Routable for Value {}

impl Routable for TypedPayload {
    fn route_key(&self) -> Option<u32> {
        Some(self.type_id)
    }
}

/// Pass-through: every message goes straight to the handler.
pub struct NoneService;

impl<M> Service<M> for NoneService {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        handler(msg);
        Ok(())
    }
}

type RouteHandler<M> = Box<dyn FnMut(&M) -> Result<(), CommError> + Send>;

/// Routes messages by their [`Routable::route_key`] to registered handlers;
/// unmatched messages fall back to the pipeline handler. The route table is
/// behind a lock so routes can be added while the pipeline runs.
pub struct SimpleRouter<M> {
    routes: Arc<Mutex<FxHashMap<u32, RouteHandler<M>>>>,
}

impl<M: Routable> SimpleRouter<M> {
    pub fn new() -> SimpleRouter<M> {
        SimpleRouter {
            routes: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub fn add_route(
        &self,
        key: u32,
        handler: impl FnMut(&M) -> Result<(), CommError> + Send + 'static,
    ) {
        self.routes
            .lock()
            .expect("router lock poisoned")
            .insert(key, Box::new(handler));
    }

    pub fn remove_route(&self, key: u32) {
        self.routes
            .lock()
            .expect("router lock poisoned")
            .remove(&key);
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().expect("router lock poisoned").len()
    }

    /// A second handle onto the same route table, e.g. for registering
    /// routes from outside the pipeline.
    pub fn handle_clone(&self) -> SimpleRouter<M> {
        SimpleRouter {
            routes: self.routes.clone(),
        }
    }
}

impl<M: Routable> Default for SimpleRouter<M> {
    fn default() -> Self {
        SimpleRouter::new()
    }
}

impl<M: Routable> Service<M> for SimpleRouter<M> {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        if let Some(key) = msg.route_key() {
            let mut routes = self.routes.lock().expect("router lock poisoned");
            if let Some(route) = routes.get_mut(&key) {
                return route(&msg);
            }
        }
        handler(msg);
        Ok(())
    }
}

struct AsyncShared<M> {
    state: Mutex<AsyncState<M>>,
    wakeup: Condvar,
    queue_capacity: usize,
}

struct AsyncState<M> {
    queue: VecDeque<M>,
    stopping: bool,
    dropped: u64,
    processed: u64,
}

/// Defers execution to a worker thread draining a bounded FIFO. Enqueueing
/// into a full queue fails fast with `Overflow` - the queue never blocks
/// the pipeline. The worker handler is fixed at construction because the
/// per-call handler cannot outlive the pipeline turn.
pub struct AsyncService<M> {
    shared: Arc<AsyncShared<M>>,
    worker: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> AsyncService<M> {
    pub fn new(
        queue_capacity: usize,
        mut worker_handler: impl FnMut(M) + Send + 'static,
    ) -> AsyncService<M> {
        let shared = Arc::new(AsyncShared {
            state: Mutex::new(AsyncState {
                queue: VecDeque::with_capacity(queue_capacity),
                stopping: false,
                dropped: 0,
                processed: 0,
            }),
            wakeup: Condvar::new(),
            queue_capacity,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || loop {
            let mut state = worker_shared.state.lock().expect("async queue lock poisoned");
            while state.queue.is_empty() && !state.stopping {
                state = worker_shared
                    .wakeup
                    .wait(state)
                    .expect("async queue lock poisoned");
            }
            let Some(msg) = state.queue.pop_front() else {
                // empty and stopping
                return;
            };
            state.processed += 1;
            drop(state);
            worker_handler(msg);
        });

        AsyncService {
            shared,
            worker: Some(worker),
        }
    }

    /// Asks the worker to finish the queued messages and join.
    pub fn stop_worker(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("async queue lock poisoned");
            state.stopping = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("async service worker panicked");
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("async queue lock poisoned")
            .queue
            .len()
    }

    pub fn processed(&self) -> u64 {
        self.shared
            .state
            .lock()
            .expect("async queue lock poisoned")
            .processed
    }

    pub fn dropped(&self) -> u64 {
        self.shared
            .state
            .lock()
            .expect("async queue lock poisoned")
            .dropped
    }
}

impl<M> Drop for AsyncService<M> {
    fn drop(&mut self) {
        {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            state.stopping = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

impl<M: Send + 'static> Service<M> for AsyncService<M> {
    fn handle(&mut self, msg: M, _handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        let mut state = self.shared.state.lock().expect("async queue lock poisoned");
        if state.stopping {
            return Err(CommError::Invalid);
        }
        if state.queue.len() >= self.shared.queue_capacity {
            state.dropped += 1;
            return Err(CommError::Overflow);
        }
        state.queue.push_back(msg);
        drop(state);
        self.shared.wakeup.notify_one();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStats {
    pub handled: u64,
    pub failed: u64,
    pub total_duration_us: u64,
}

/// Counts handled and failed messages and the time spent in the base
/// service, forwarding results unchanged.
pub struct Statistics<S> {
    base: S,
    stats: ServiceStats,
}

impl<S> Statistics<S> {
    pub fn new(base: S) -> Statistics<S> {
        Statistics {
            base,
            stats: ServiceStats::default(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ServiceStats::default();
    }
}

impl<M, S: Service<M>> Service<M> for Statistics<S> {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        let started = Instant::now();
        let result = self.base.handle(msg, handler);
        self.stats.total_duration_us += started.elapsed().as_micros() as u64;
        self.stats.handled += 1;
        if result.is_err() {
            self.stats.failed += 1;
        }
        result
    }
}

/// Gates messages on a predicate; filtered messages succeed silently.
pub struct Filter<S, P> {
    base: S,
    predicate: P,
    passed: u64,
    filtered: u64,
}

impl<S, P> Filter<S, P> {
    pub fn new(base: S, predicate: P) -> Filter<S, P> {
        Filter {
            base,
            predicate,
            passed: 0,
            filtered: 0,
        }
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn filtered(&self) -> u64 {
        self.filtered
    }
}

impl<M, S: Service<M>, P: FnMut(&M) -> bool> Service<M> for Filter<S, P> {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        if !(self.predicate)(&msg) {
            self.filtered += 1;
            return Ok(());
        }
        self.passed += 1;
        self.base.handle(msg, handler)
    }
}

/// Retries the base service up to `max_retries` extra attempts, optionally
/// sleeping between attempts. Needs `M: Clone` to replay the message.
pub struct Retry<S> {
    base: S,
    max_retries: u32,
    delay: Option<Duration>,
    retries: u64,
}

impl<S> Retry<S> {
    pub fn new(base: S, max_retries: u32) -> Retry<S> {
        Retry {
            base,
            max_retries,
            delay: None,
            retries: 0,
        }
    }

    pub fn with_delay(base: S, max_retries: u32, delay: Duration) -> Retry<S> {
        Retry {
            delay: Some(delay),
            ..Retry::new(base, max_retries)
        }
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }
}

impl<M: Clone, S: Service<M>> Service<M> for Retry<S> {
    fn handle(&mut self, msg: M, handler: &mut dyn FnMut(M)) -> Result<(), CommError> {
        let mut last_error = CommError::Invalid;
        for attempt in 0..=self.max_retries {
            match self.base.handle(msg.clone(), handler) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    last_error = error;
                    if attempt < self.max_retries {
                        self.retries += 1;
                        debug!("attempt {} failed ({}), retrying", attempt + 1, error);
                        if let Some(delay) = self.delay {
                            std::thread::sleep(delay);
                        }
                    }
                }
            }
        }
        Err(last_error)
    }
}
