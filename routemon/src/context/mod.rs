use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::task;

/// A spawned long-lived role. Aborted on drop unless detached.
#[derive(Debug)]
pub struct Task<T> {
    join_handle: task::JoinHandle<T>,
    detached: bool,
}

impl<T> Task<T> {
    pub fn spawn<Fut>(future: Fut) -> Task<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        Fut::Output: Send + 'static,
    {
        Task {
            join_handle: task::spawn(future),
            detached: false,
        }
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub async fn join(self) {
        let mut task = self;
        task.detached = true;
        let _ = (&mut task.join_handle).await;
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.join_handle.abort();
        }
    }
}

/// Cooperative shutdown flag shared by every module; checked at each
/// suspension point.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A module's liveness beacon: the unix time of its last unit of work.
/// Written by the owning task, read lock-free by the supervisor.
#[derive(Debug, Clone)]
pub struct LastAction(Arc<AtomicI64>);

impl LastAction {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(unix_now())))
    }

    pub fn touch(&self) {
        self.0.store(unix_now(), Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for LastAction {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
