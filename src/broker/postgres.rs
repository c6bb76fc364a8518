//! Postgres broker
//!
//! A topic is an append-only table of records spread over a fixed number of
//! partitions, consumed through per-partition offsets of a consumer group.
//! Records with the same key always land on the same partition.
//!
//! Records every group has consumed are pruned now and then. A group
//! provisioned later starts from what is left.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;

use super::CompletionBroker;
use super::CompletionRecord;
use super::Config;
use super::Error;
use super::Result;

/// Minimum time between two prunes of a consumer
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Postgres broker
#[derive(Clone, Debug)]
pub struct Postgres {
    /// Pool of connections, shared with the storage
    connection_pool: PgPool,

    /// Name of the topic
    topic: Arc<str>,

    /// Consumer group of this process
    group_id: Arc<str>,

    /// Number of partitions of the topic as provisioned
    partitions: i32,

    /// Pause between empty reads
    poll_interval: Duration,

    /// Set once by `close`
    closed: Arc<AtomicBool>,

    /// Earliest time of the next prune
    next_prune: Arc<Mutex<Instant>>,
}

impl Postgres {
    /// Create the topic and the consumer group offsets when missing
    ///
    /// An existing topic is used as-is, even when it was created with another
    /// partition count.
    ///
    /// # Errors
    ///
    /// Will return `Err` when the topic can not be created or read back
    pub async fn provision(connection_pool: PgPool, config: &Config) -> Result<Self> {
        let provisioning_error = |err: sqlx::Error| Error::Provisioning {
            topic: config.topic.clone(),
            reason: err.to_string(),
        };

        let created = sqlx::query(
            r"
            INSERT INTO broker_topics (name, partitions, replication_factor)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            ",
        )
        .bind(&config.topic)
        .bind(config.partitions)
        .bind(config.replication_factor)
        .execute(&connection_pool)
        .await
        .map_err(provisioning_error)?
        .rows_affected()
            > 0;

        let partitions = sqlx::query_scalar::<_, i32>(
            r"
            SELECT partitions
            FROM broker_topics
            WHERE name = $1
            ",
        )
        .bind(&config.topic)
        .fetch_one(&connection_pool)
        .await
        .map_err(provisioning_error)?;

        if created {
            tracing::info!(topic = %config.topic, partitions, "Broker topic created");
        } else if partitions == config.partitions {
            tracing::info!(topic = %config.topic, "Broker topic already exists");
        } else {
            tracing::warn!(
                topic = %config.topic,
                partitions,
                configured_partitions = config.partitions,
                "Broker topic already exists with a different partition count"
            );
        }

        sqlx::query(
            r"
            INSERT INTO broker_offsets (topic, group_id, partition_id)
            SELECT $1, $2, partition_id
            FROM generate_series(0, $3 - 1) AS partition_id
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(&config.topic)
        .bind(&config.group_id)
        .bind(partitions)
        .execute(&connection_pool)
        .await
        .map_err(provisioning_error)?;

        Ok(Self {
            connection_pool,
            topic: Arc::from(config.topic.as_str()),
            group_id: Arc::from(config.group_id.as_str()),
            partitions,
            poll_interval: config.poll_interval,
            closed: Arc::new(AtomicBool::new(false)),
            next_prune: Arc::new(Mutex::new(Instant::now())),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the oldest unread record of the group, committing it in the same statement
    async fn take_next(&self) -> Result<Option<CompletionRecord>> {
        let record = sqlx::query_as::<_, (String, String)>(
            r"
            WITH next AS (
                SELECT r.record_offset, r.partition_id, r.record_key, r.record_value
                FROM broker_records r
                JOIN broker_offsets o
                    ON o.topic = r.topic
                    AND o.partition_id = r.partition_id
                    AND o.group_id = $2
                WHERE r.topic = $1
                    AND r.record_offset > o.committed_offset
                ORDER BY r.record_offset
                LIMIT 1
                FOR UPDATE OF o SKIP LOCKED
            )
            UPDATE broker_offsets o
            SET committed_offset = next.record_offset, updated_at = timezone('utc', now())
            FROM next
            WHERE o.topic = $1
                AND o.group_id = $2
                AND o.partition_id = next.partition_id
            RETURNING next.record_key, next.record_value
            ",
        )
        .bind(&*self.topic)
        .bind(&*self.group_id)
        .fetch_optional(&self.connection_pool)
        .await
        .map_err(connection_error)?;

        Ok(record.map(|(key, value)| CompletionRecord { key, value }))
    }

    /// Delete the records of the topic that every consumer group has taken
    ///
    /// Returns the number of deleted records.
    ///
    /// # Errors
    ///
    /// Will return `Err` when the records can not be deleted
    pub async fn prune(&self) -> Result<u64> {
        let pruned = sqlx::query(
            r"
            DELETE FROM broker_records r
            USING (
                SELECT partition_id, MIN(committed_offset) AS low_watermark
                FROM broker_offsets
                WHERE topic = $1
                GROUP BY partition_id
            ) o
            WHERE r.topic = $1
                AND r.partition_id = o.partition_id
                AND r.record_offset <= o.low_watermark
            ",
        )
        .bind(&*self.topic)
        .execute(&self.connection_pool)
        .await
        .map_err(connection_error)?
        .rows_affected();

        Ok(pruned)
    }

    /// Prune at most once per interval, failures only cost disk space
    async fn prune_when_due(&self) {
        let now = Instant::now();
        let due = match self.next_prune.lock() {
            Ok(mut next_prune) if *next_prune <= now => {
                *next_prune = now + PRUNE_INTERVAL;
                true
            }
            _ => false,
        };

        if !due {
            return;
        }

        match self.prune().await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(topic = %self.topic, pruned, "Consumed broker records pruned"),
            Err(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "Could not prune broker records");
            }
        }
    }

    /// Wait a poll interval, or less when canceled
    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Canceled),
            () = tokio::time::sleep(self.poll_interval) => Ok(()),
        }
    }
}

#[async_trait]
impl CompletionBroker for Postgres {
    // Offsets come from one sequence, and a group skips everything at or
    // below the offset it took last. Records have to be committed in offset
    // order, which holds for a single producer publishing one at a time.
    async fn publish(&self, record: &CompletionRecord, deadline: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let insert = sqlx::query(
            r"
            INSERT INTO broker_records (topic, partition_id, record_key, record_value)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(&*self.topic)
        .bind(partition_for(&record.key, self.partitions))
        .bind(&record.key)
        .bind(&record.value)
        .execute(&self.connection_pool);

        timeout_at(deadline, insert)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(connection_error)?;

        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken) -> Result<CompletionRecord> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            if self.is_closed() {
                return Err(Error::Closed);
            }

            let next = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Canceled),
                next = self.take_next() => next,
            };

            match next {
                Ok(Some(record)) => return Ok(record),
                Ok(None) => {
                    // caught up, a good moment to clean up behind all groups
                    self.prune_when_due().await;
                    self.pause(cancel).await?;
                }
                Err(err) => {
                    // back off before handing the failure to the caller, who retries right away
                    self.pause(cancel).await?;

                    return Err(err);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(topic = %self.topic, "Broker closed");
        }

        Ok(())
    }
}

/// Stable partition of a key, FNV-1a over its bytes
fn partition_for(key: &str, partitions: i32) -> i32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    });

    let partitions = u32::try_from(partitions.max(1)).unwrap_or(1);

    // always below `partitions`, which came from an i32
    i32::try_from(hash % partitions).unwrap_or(0)
}

/// Convert `SQLx` to broker connection error
fn connection_error<E>(err: E) -> Error
where
    E: std::error::Error,
{
    Error::Connection(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_partition() {
        assert_eq!(partition_for("9", 8), partition_for("9", 8));
        assert!((0..8).contains(&partition_for("123456789", 8)));
        assert_eq!(0, partition_for("9", 1));
    }

    #[test]
    fn keys_spread_over_partitions() {
        let used = (0..64)
            .map(|user| partition_for(&user.to_string(), 4))
            .collect::<std::collections::HashSet<_>>();

        assert!(used.len() > 1);
    }
}
