#![allow(dead_code)]
// Shared helpers for the end-to-end scenarios. These tests need a live
// store: set REDIS_URL to enable them, otherwise they skip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::application::worker::{JobContext, ProcessError, Processor};
use conveyor_core::application::Queue;
use conveyor_core::domain::{Job, QueueOptions};
use conveyor_core::port::{SystemTimeProvider, TimeProvider};
use conveyor_infra_redis::{open_queue_with, StoreConnection};

pub struct TestContext {
    pub queue: Arc<Queue>,
    pub conn: StoreConnection,
}

/// Open a uniquely named queue against REDIS_URL, or skip the test.
pub async fn open(name_hint: &str) -> Option<TestContext> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping end-to-end scenario");
        return None;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conveyor=info")),
        )
        .try_init();

    let name = format!("{}-{}", name_hint, uuid::Uuid::new_v4());
    let conn = StoreConnection::connect(&url)
        .await
        .expect("store connection");
    let queue = open_queue_with(
        conn.clone(),
        &name,
        QueueOptions::default(),
        Arc::new(SystemTimeProvider),
    )
    .expect("queue");
    Some(TestContext {
        queue: Arc::new(queue),
        conn,
    })
}

impl TestContext {
    /// Best-effort cleanup so test queues do not accumulate.
    pub async fn teardown(&self) {
        let _ = self.queue.obliterate(true).await;
    }
}

pub fn now_millis() -> i64 {
    SystemTimeProvider.now_millis()
}

/// Records processed job names (with completion wall times) in order.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(String, i64)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.seen.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Processor for Recorder {
    async fn process(
        &self,
        job: Job,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, ProcessError> {
        self.seen
            .lock()
            .unwrap()
            .push((job.name.clone(), now_millis()));
        Ok(serde_json::json!({ "done": job.name }))
    }
}

/// Fails every processing with the given message.
pub struct AlwaysFails(pub &'static str);

#[async_trait]
impl Processor for AlwaysFails {
    async fn process(
        &self,
        _job: Job,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, ProcessError> {
        Err(ProcessError::failed(self.0))
    }
}

/// Never returns; used to simulate crashed or wedged workers.
pub struct Hangs;

#[async_trait]
impl Processor for Hangs {
    async fn process(
        &self,
        _job: Job,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, ProcessError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(serde_json::Value::Null)
    }
}

/// Poll until the condition holds or the timeout elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Async variant for store-backed conditions.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition().await
}
