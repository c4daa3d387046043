//! Pool of dedicated publisher channels.
//!
//! Broker channels must not be written from several tasks at once. Each pooled
//! channel is owned by one background worker that drains an unbounded queue and
//! performs the writes sequentially; callers only enqueue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{BasicProperties, BrokerChannel, BrokerConnection};
use crate::error::{BrokerError, TransportError};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by a `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called once after the queue has been drained on stop.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs one `BackgroundRunnable` on its own tokio task, fed by an unbounded queue.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Mutex<Option<mpsc::UnboundedSender<R::Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. Must be called inside a tokio runtime.
    pub fn start(mut runnable: R) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<R::Task>();

        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                runnable.run(task).await;
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::PublisherClosed` once the worker is stopped.
    pub fn submit(&self, task: R::Task) -> Result<(), TransportError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).map_err(|_| TransportError::PublisherClosed),
            None => Err(TransportError::PublisherClosed),
        }
    }

    /// Closes the queue and waits until every queued task has run.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Publishable / ChannelWriter
// ---------------------------------------------------------------------------

/// One queued broker write.
#[derive(Debug, Clone)]
pub struct Publishable {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Writes publishables to one broker channel.
struct ChannelWriter {
    channel: Arc<dyn BrokerChannel>,
}

#[async_trait]
impl BackgroundRunnable for ChannelWriter {
    type Task = Publishable;

    async fn run(&mut self, task: Publishable) {
        let result = self
            .channel
            .basic_publish(&task.exchange, &task.routing_key, task.properties, task.body)
            .await;
        if let Err(e) = result {
            warn!(
                channel = self.channel.id(),
                exchange = %task.exchange,
                routing_key = %task.routing_key,
                error = %e,
                "publish failed"
            );
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(channel = self.channel.id(), error = %e, "publisher channel close failed");
        }
    }
}

// ---------------------------------------------------------------------------
// PublisherPool
// ---------------------------------------------------------------------------

/// Fixed set of publisher channels selected round robin.
///
/// Ordering is preserved per channel, not across the pool.
pub struct PublisherPool {
    workers: Vec<BackgroundWorker<ChannelWriter>>,
    next: AtomicUsize,
}

impl PublisherPool {
    /// Opens `size` channels on `connection`, clamped to `[1, channel_max]`.
    ///
    /// # Errors
    ///
    /// Returns the broker error if a channel cannot be opened.
    pub async fn new(
        connection: &Arc<dyn BrokerConnection>,
        size: usize,
    ) -> Result<Self, BrokerError> {
        let size = size.clamp(1, usize::from(connection.channel_max().max(1)));
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let channel = connection.create_channel().await?;
            workers.push(BackgroundWorker::start(ChannelWriter { channel }));
        }
        debug!(size, "publisher pool started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hands `publishable` to the next channel in round-robin order.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::PublisherClosed` after `stop`.
    pub fn enqueue(&self, publishable: Publishable) -> Result<(), TransportError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].submit(publishable)
    }

    /// Stops every worker after its queued writes have been performed.
    pub async fn stop(&self) {
        for worker in &self.workers {
            worker.stop().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::broker::{BrokerConnector, ConsumeOptions, MemoryBroker, QueueDeclareOptions};
    use crate::config::BrokerConnectionConfig;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            tokio::task::yield_now().await;
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn publishable(body: &'static [u8]) -> Publishable {
        Publishable {
            exchange: String::new(),
            routing_key: "out".to_string(),
            properties: BasicProperties::default(),
            body: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn stop_drains_queued_tasks() {
        let run_count = Arc::new(AtomicU32::new(0));
        let shutdown_called = Arc::new(AtomicU32::new(0));
        let worker = BackgroundWorker::start(CountingRunnable {
            run_count: Arc::clone(&run_count),
            shutdown_called: Arc::clone(&shutdown_called),
        });

        for i in 0..100 {
            worker.submit(i).unwrap();
        }
        worker.stop().await;

        assert_eq!(run_count.load(Ordering::SeqCst), 100);
        assert_eq!(shutdown_called.load(Ordering::SeqCst), 1);
        assert!(matches!(worker.submit(1), Err(TransportError::PublisherClosed)));
    }

    #[tokio::test]
    async fn pool_size_is_clamped_to_channel_max() {
        let broker = MemoryBroker::with_channel_max(2);
        let connection = broker
            .connect(&BrokerConnectionConfig::default())
            .await
            .unwrap();
        let pool = PublisherPool::new(&connection, 16).await.unwrap();
        assert_eq!(pool.size(), 2);

        let empty = PublisherPool::new(&broker.connect(&BrokerConnectionConfig::default()).await.unwrap(), 0)
            .await
            .unwrap();
        assert_eq!(empty.size(), 1);
    }

    #[tokio::test]
    async fn enqueued_messages_reach_the_broker() {
        let broker = MemoryBroker::new();
        let connection = broker
            .connect(&BrokerConnectionConfig::default())
            .await
            .unwrap();
        let consumer = connection.create_channel().await.unwrap();
        consumer
            .queue_declare("out", QueueDeclareOptions::default())
            .await
            .unwrap();
        let (_tag, mut rx) = consumer
            .basic_consume("out", ConsumeOptions { no_ack: true })
            .await
            .unwrap();

        let pool = PublisherPool::new(&connection, 3).await.unwrap();
        for _ in 0..9 {
            pool.enqueue(publishable(b"x")).unwrap();
        }
        pool.stop().await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 9);
        assert!(matches!(
            pool.enqueue(publishable(b"late")),
            Err(TransportError::PublisherClosed)
        ));
    }
}
