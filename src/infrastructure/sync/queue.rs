//! Serialized task queue for the shared file-system characteristics.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

/// FIFO gate: tasks run one at a time, in the order they queued.
#[derive(Clone, Default)]
pub struct SyncQueue {
    gate: Arc<Mutex<()>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut, T>(&self, label: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _turn = self.gate.lock().await;
        trace!("{} running", label);
        let out = task().await;
        trace!("{} done", label);
        out
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_tasks_never_overlap() {
        let queue = SyncQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = {
            let (queue, log) = (queue.clone(), log.clone());
            tokio::spawn(async move {
                queue
                    .run("list", || async {
                        log.lock().unwrap().push("list start");
                        sleep(Duration::from_millis(50)).await;
                        log.lock().unwrap().push("list end");
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(queue.is_busy());

        queue
            .run("download", || async {
                log.lock().unwrap().push("download");
            })
            .await;
        first.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["list start", "list end", "download"]
        );
    }
}
