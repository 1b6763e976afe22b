use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::store::{RequestLog, RequestLogRepository};

/// Fire-and-forget access-log queue.
///
/// `submit` never blocks the response path: records land in a bounded queue
/// drained by a background writer. On overflow the oldest pending record is
/// dropped and counted. Persistence failures are logged and swallowed.
pub struct AccessLogger {
    queue: Mutex<VecDeque<RequestLog>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl AccessLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a record, dropping the oldest pending one when full.
    pub fn submit(&self, record: RequestLog) {
        {
            let mut queue = self.queue.lock().expect("access log lock poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_dropped_access_logs_total").increment(1);
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("access log lock poisoned").len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<RequestLog> {
        self.queue.lock().expect("access log lock poisoned").pop_front()
    }

    /// Spawn the writer. On shutdown the remaining queue is drained before
    /// the task exits; the engine issues one more `flush` after in-flight
    /// requests have completed, so the store must stay open until then.
    pub fn spawn_writer(
        self: &Arc<Self>,
        repo: RequestLogRepository,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let logger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = logger.notify.notified() => {
                        logger.flush(&repo).await;
                    }
                    _ = shutdown.changed() => {
                        logger.flush(&repo).await;
                        debug!("Access log writer stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Persist everything currently queued.
    pub async fn flush(&self, repo: &RequestLogRepository) {
        while let Some(record) = self.pop() {
            if let Err(e) = repo.append(&record).await {
                warn!(error = %e, "Failed to persist access log record");
            }
        }
    }
}
