//! Polling dispatch loops.
//!
//! A [`Dispatcher`] repeatedly claims from a [`WorkSource`] and hands each
//! claimed item to a [`WorkHandler`]. Claims are atomic in the store, so any
//! number of dispatchers, in any number of processes, can poll the same
//! source.

use crate::api::WorkerApi;
use crate::monitor::DispatchMonitor;
use async_trait::async_trait;
use hive_core::{HiveError, HiveResult, PlanningRequest, Task};
use hive_store::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Attempts at handing back a claimed item before giving up on it.
const RELEASE_ATTEMPTS: u32 = 3;

/// Something work can be claimed from.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// What a claim yields.
    type Item: Clone + Send;

    /// Label used in logs and metrics.
    fn name(&self) -> String;

    /// Atomically claim the next eligible item, if any.
    async fn claim(&self) -> HiveResult<Option<Self::Item>>;

    /// Hand back an item whose handler failed with `error`, so it does not
    /// stay claimed by a live process.
    async fn release(&self, item: Self::Item, error: &HiveError) -> HiveResult<()>;
}

/// Processes claimed items.
#[async_trait]
pub trait WorkHandler<T: Send>: Send + Sync {
    /// Process one claimed item. An error hands the item back to its source.
    async fn handle(&self, item: T) -> HiveResult<()>;
}

/// Pending planning requests, claimed for one planning agent.
#[derive(Debug, Clone)]
pub struct PlanningSource {
    store: TaskStore,
    agent_id: String,
}

impl PlanningSource {
    /// Claims for planning agent `agent_id`.
    pub fn new(store: TaskStore, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl WorkSource for PlanningSource {
    type Item = PlanningRequest;

    fn name(&self) -> String {
        format!("planning:{}", self.agent_id)
    }

    async fn claim(&self) -> HiveResult<Option<PlanningRequest>> {
        self.store.claim_next_planning_request(&self.agent_id).await
    }

    async fn release(&self, item: PlanningRequest, _error: &HiveError) -> HiveResult<()> {
        self.store
            .release_planning_request(item.id, &self.agent_id)
            .await?;
        Ok(())
    }
}

/// Ready tasks matching a worker's capabilities.
#[derive(Clone)]
pub struct TaskSource {
    api: WorkerApi,
}

impl TaskSource {
    /// Claims as the worker behind `api`.
    pub fn new(api: WorkerApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl WorkSource for TaskSource {
    type Item = Task;

    fn name(&self) -> String {
        format!("tasks:{}", self.api.identity().id)
    }

    async fn claim(&self) -> HiveResult<Option<Task>> {
        self.api.claim_next().await
    }

    async fn release(&self, item: Task, error: &HiveError) -> HiveResult<()> {
        self.api
            .release(item.id, &format!("handler failed: {error}"))
            .await?;
        Ok(())
    }
}

/// Poll loop over one source.
pub struct Dispatcher<S: WorkSource> {
    source: S,
    poll_interval: Duration,
    monitor: Arc<DispatchMonitor>,
}

impl<S: WorkSource> Dispatcher<S> {
    /// Poll `source` every `poll_interval` while idle.
    pub fn new(source: S, poll_interval: Duration, monitor: Arc<DispatchMonitor>) -> Self {
        Self {
            source,
            poll_interval,
            monitor,
        }
    }

    /// The source being polled.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Claim at most one item and handle it. Returns whether anything was
    /// claimed.
    pub async fn poll_once<H>(&self, handler: &H) -> HiveResult<bool>
    where
        H: WorkHandler<S::Item>,
    {
        let name = self.source.name();
        match self.source.claim().await? {
            Some(item) => {
                self.monitor.record_claim(&name).await;
                if let Err(e) = handler.handle(item.clone()).await {
                    warn!(source = %name, error = %e, "Handler failed, releasing claimed item");
                    self.release(item, &e).await;
                    return Err(e);
                }
                Ok(true)
            }
            None => {
                self.monitor.record_idle(&name).await;
                debug!(source = %name, "Nothing to claim");
                Ok(false)
            }
        }
    }

    /// Hand `item` back to the source, retrying transient store errors.
    async fn release(&self, item: S::Item, cause: &HiveError) {
        let name = self.source.name();
        let mut attempt = 1;
        loop {
            match self.source.release(item.clone(), cause).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < RELEASE_ATTEMPTS => {
                    warn!(source = %name, attempt, error = %e, "Release failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    error!(source = %name, error = %e, "Claimed item could not be released");
                    self.monitor.record_error(&name, &e).await;
                    return;
                }
            }
        }
    }

    /// Poll until `shutdown` turns `true` (or its sender goes away).
    ///
    /// After a successful claim the next poll starts immediately; an idle
    /// poll or a transient error waits `poll_interval`. A fatal error stops
    /// the loop and is returned.
    pub async fn run<H>(&self, handler: &H, mut shutdown: watch::Receiver<bool>) -> HiveResult<()>
    where
        H: WorkHandler<S::Item>,
    {
        let name = self.source.name();
        info!(source = %name, interval_ms = self.poll_interval.as_millis() as u64, "Dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once(handler).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    error!(source = %name, error = %e, "Dispatcher stopping on fatal error");
                    self.monitor.record_error(&name, &e).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Dispatch cycle failed, retrying next poll");
                    self.monitor.record_error(&name, &e).await;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(source = %name, "Dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedSource {
        script: Mutex<VecDeque<HiveResult<Option<u32>>>>,
        /// Outcomes of successive release calls; exhausted means `Ok`.
        release_script: Mutex<VecDeque<HiveResult<()>>>,
        released: Mutex<Vec<(u32, String)>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<HiveResult<Option<u32>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                release_script: Mutex::new(VecDeque::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WorkSource for ScriptedSource {
        type Item = u32;

        fn name(&self) -> String {
            "scripted".into()
        }

        async fn claim(&self) -> HiveResult<Option<u32>> {
            self.script.lock().await.pop_front().unwrap_or(Ok(None))
        }

        async fn release(&self, item: u32, error: &HiveError) -> HiveResult<()> {
            self.released.lock().await.push((item, error.to_string()));
            self.release_script.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    /// Fails on the listed items, records the rest.
    #[derive(Default)]
    struct Flaky {
        fail_on: Vec<u32>,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl WorkHandler<u32> for Flaky {
        async fn handle(&self, item: u32) -> HiveResult<()> {
            if self.fail_on.contains(&item) {
                return Err(HiveError::PoolExhausted { timeout_ms: 5 });
            }
            self.seen.lock().await.push(item);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl WorkHandler<u32> for Recorder {
        async fn handle(&self, item: u32) -> HiveResult<()> {
            self.seen.lock().await.push(item);
            Ok(())
        }
    }

    fn dispatcher(script: Vec<HiveResult<Option<u32>>>) -> Dispatcher<ScriptedSource> {
        Dispatcher::new(
            ScriptedSource::new(script),
            Duration::from_millis(5),
            Arc::new(DispatchMonitor::new()),
        )
    }

    #[tokio::test]
    async fn test_poll_once_reports_claims() {
        let d = dispatcher(vec![Ok(Some(7))]);
        let handler = Recorder::default();
        assert!(d.poll_once(&handler).await.unwrap());
        assert!(!d.poll_once(&handler).await.unwrap());
        assert_eq!(*handler.seen.lock().await, vec![7]);

        let metrics = d.monitor.loop_metrics("scripted").await.unwrap();
        assert_eq!(metrics.claims, 1);
        assert_eq!(metrics.idle_polls, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_releases_its_item() {
        let d = dispatcher(vec![Ok(Some(1)), Ok(Some(2))]);
        let handler = Flaky {
            fail_on: vec![1],
            ..Default::default()
        };

        let err = d.poll_once(&handler).await.unwrap_err();
        assert!(matches!(err, HiveError::PoolExhausted { .. }));
        assert!(d.poll_once(&handler).await.unwrap());

        let released = d.source().released.lock().await.clone();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, 1);
        assert!(released[0].1.contains("pool"));
        assert_eq!(*handler.seen.lock().await, vec![2]);
    }

    #[tokio::test]
    async fn test_release_retries_transient_errors_then_gives_up() {
        let d = dispatcher(vec![Ok(Some(1)), Ok(Some(2))]);
        d.source().release_script.lock().await.extend([
            Err(HiveError::StoreBusy("locked".into())),
            Ok(()),
            Err(HiveError::StoreBusy("locked".into())),
            Err(HiveError::StoreBusy("locked".into())),
            Err(HiveError::StoreBusy("locked".into())),
        ]);
        let handler = Flaky {
            fail_on: vec![1, 2],
            ..Default::default()
        };

        // Second attempt succeeds.
        d.poll_once(&handler).await.unwrap_err();
        assert_eq!(d.source().released.lock().await.len(), 2);

        // Every attempt fails: the handler error is still what surfaces.
        let err = d.poll_once(&handler).await.unwrap_err();
        assert!(matches!(err, HiveError::PoolExhausted { .. }));
        let released = d.source().released.lock().await.clone();
        assert_eq!(released.len(), 2 + RELEASE_ATTEMPTS as usize);
        assert!(released.iter().skip(2).all(|(item, _)| *item == 2));

        let metrics = d.monitor.loop_metrics("scripted").await.unwrap();
        assert_eq!(metrics.errors, 1);
        assert!(metrics.last_error.unwrap().contains("locked"));
    }

    #[tokio::test]
    async fn test_run_survives_transient_errors_and_stops_on_fatal() {
        let d = dispatcher(vec![
            Ok(Some(1)),
            Err(HiveError::PoolExhausted { timeout_ms: 1 }),
            Ok(None),
            Ok(Some(2)),
            Err(HiveError::StoreCorruption("bad row".into())),
            Ok(Some(3)),
        ]);
        let handler = Recorder::default();
        let (_tx, rx) = watch::channel(false);

        let err = d.run(&handler, rx).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(*handler.seen.lock().await, vec![1, 2]);

        let metrics = d.monitor.loop_metrics("scripted").await.unwrap();
        assert_eq!(metrics.errors, 2);
        assert!(metrics.last_error.unwrap().contains("bad row"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let d = dispatcher(vec![]);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let handler = Recorder::default();
            d.run(&handler, rx).await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_when_shutdown_sender_dropped() {
        let d = dispatcher(vec![]);
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let handler = Recorder::default();
        let result = tokio::time::timeout(Duration::from_secs(2), d.run(&handler, rx)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
