//! Memory broker
//!
//! Records live in a queue inside the process and are lost on shutdown

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;

use super::CompletionBroker;
use super::CompletionRecord;
use super::Error;
use super::Result;

/// An in-memory broker
#[derive(Clone, Debug, Default)]
pub struct Memory {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Published, not yet consumed records
    records: Mutex<VecDeque<CompletionRecord>>,

    /// Wakes a waiting consumer
    published: Notify,

    /// Set once by `close`
    closed: AtomicBool,
}

impl Memory {
    /// Create a new empty Memory broker
    pub fn new() -> Self {
        Self::default()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBroker for Memory {
    async fn publish(&self, record: &CompletionRecord, deadline: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut records = timeout_at(deadline, self.inner.records.lock())
            .await
            .map_err(|_| Error::Timeout)?;

        records.push_back(record.clone());
        drop(records);

        self.inner.published.notify_one();

        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken) -> Result<CompletionRecord> {
        loop {
            // register interest before looking, so a publish in between is not missed
            let published = self.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if self.is_closed() {
                return Err(Error::Closed);
            }

            if let Some(record) = self.inner.records.lock().await.pop_front() {
                return Ok(record);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Canceled),
                () = &mut published => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.published.notify_waiters();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(key: &str, value: &str) -> CompletionRecord {
        CompletionRecord {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn consumes_in_publish_order() {
        let broker = Memory::new();
        let cancel = CancellationToken::new();

        broker.publish(&record("9", "5"), deadline()).await.unwrap();
        broker.publish(&record("9", "6"), deadline()).await.unwrap();

        assert_eq!(record("9", "5"), broker.consume(&cancel).await.unwrap());
        assert_eq!(record("9", "6"), broker.consume(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_up_on_publish() {
        let broker = Memory::new();
        let cancel = CancellationToken::new();

        let consumer = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.consume(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(&record("1", "2"), deadline()).await.unwrap();

        let consumed = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(record("1", "2"), consumed);
    }

    #[tokio::test]
    async fn cancel_stops_a_waiting_consumer() {
        let broker = Memory::new();
        let cancel = CancellationToken::new();

        let consumer = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.consume(&cancel).await })
        };

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let broker = Memory::new();
        let cancel = CancellationToken::new();

        broker.close().await.unwrap();
        broker.close().await.unwrap();

        assert!(matches!(
            broker.publish(&record("9", "5"), deadline()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(broker.consume(&cancel).await, Err(Error::Closed)));
    }
}
