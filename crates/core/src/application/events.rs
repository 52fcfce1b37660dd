// Queue events observer - reads the capped stream and re-emits to subscribers

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::application::worker::constants::{
    ERROR_RECOVERY_SLEEP_DURATION, EVENT_BLOCK_MS, EVENT_READ_COUNT,
};
use crate::application::worker::{shutdown_channel, ShutdownSender};
use crate::domain::QueueEvent;
use crate::port::store::QueueStore;

/// Observer over a queue's lifecycle events. Independent of workers; owns a
/// consumer cursor into the events stream and re-emits entries to explicit
/// subscription handles.
pub struct QueueEvents {
    tx: broadcast::Sender<QueueEvent>,
    shutdown: ShutdownSender,
    reader: Option<JoinHandle<()>>,
}

impl QueueEvents {
    /// Start reading events after the current end of the stream.
    pub fn run(store: Arc<dyn QueueStore>) -> Self {
        Self::run_from(store, "$")
    }

    /// Start reading from a stored cursor (exclusive).
    pub fn run_from(store: Arc<dyn QueueStore>, cursor: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        let (shutdown, mut token) = shutdown_channel();
        let sender = tx.clone();
        let mut cursor = cursor.into();

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.wait() => break,
                    result = store.read_events(&cursor, EVENT_BLOCK_MS, EVENT_READ_COUNT) => {
                        match result {
                            Ok(events) => {
                                for event in events {
                                    cursor = event.id.clone();
                                    // Dropped receivers are fine; subscribers come and go
                                    let _ = sender.send(event);
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Event stream read failed");
                                tokio::select! {
                                    _ = token.wait() => break,
                                    _ = tokio::time::sleep(ERROR_RECOVERY_SLEEP_DURATION) => {}
                                }
                            }
                        }
                    }
                }
            }
            info!("Queue events reader stopped");
        });

        Self {
            tx,
            shutdown,
            reader: Some(reader),
        }
    }

    /// A subscription handle. Each handle receives every event from the
    /// moment it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Stop the reader and wait for it to finish.
    pub async fn close(mut self) {
        self.shutdown.shutdown();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}
