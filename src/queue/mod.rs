//! The queue engine.
//!
//! A [`Queue`] owns one connection to the database and one table. Any number
//! of processes can open a `Queue` on the same table; they coordinate only
//! through conditional single-row updates, so there is no lock to hold and no
//! broker to run.

use std::time::Duration;

use serde::Serialize;
use snafu::ResultExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{QueueOptions, Timing},
    connection::Connection,
    error::{Error, SerializationSnafu, StorageSnafu},
    message::{
        Message, MessageId, MessageRow, MessageState, ReleaseOptions, SubmitOptions,
    },
};

mod boost;
mod reserve;
mod schema;

use boost::Boost;

/// Longest accepted submit/release delay. SQLite's date functions stop at the
/// year 9999 and yield NULL past it, which would make the message visible
/// immediately.
pub const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn delay_seconds(delay: Option<Duration>) -> Result<Option<f64>, Error> {
    match delay {
        Some(delay) if delay > MAX_DELAY => Err(Error::invalid_parameter(format!(
            "delay of {}s exceeds the maximum of {}s",
            delay.as_secs(),
            MAX_DELAY.as_secs()
        ))),
        delay => Ok(delay.map(|d| d.as_secs_f64())),
    }
}

pub struct Queue {
    name: String,
    table: String,
    timing: Timing,
    conn: Connection,
    boost: Boost,
    shutdown: Option<CancellationToken>,
}

impl Queue {
    /// Opens a connection to `url` and binds it to the queue called `name`.
    ///
    /// This does not touch the table; call [`Queue::set_up`] once (e.g. from
    /// a deploy step) before workers start reserving.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        options: QueueOptions,
    ) -> Result<Self, Error> {
        let name = name.into();
        let table = options.table_name_for(&name)?;
        let timing = options.timing()?;

        let conn = Connection::open(url).await?;

        Ok(Self {
            name,
            table,
            boost: Boost::new(&timing),
            timing,
            conn,
            shutdown: None,
        })
    }

    /// Lets `token` interrupt blocking reservations. A cancelled wait returns
    /// `Ok(None)` like a timeout.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// SQL predicate matching rows whose schedule allows delivery now.
    fn visible(&self) -> String {
        format!(
            "(scheduled IS NULL OR scheduled <= {})",
            self.conn.dialect().timestamp(None)
        )
    }

    /// Serializes `payload` and adds it to the queue in `ready` state.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn submit<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
        options: SubmitOptions,
    ) -> Result<MessageId, Error> {
        let delay = delay_seconds(options.delay)?;
        let payload = serde_json::to_string(payload).context(SerializationSnafu)?;

        let scheduled = match delay {
            Some(_) => self.conn.dialect().timestamp(Some("$2")),
            None => "NULL".to_owned(),
        };

        let sql = format!(
            r#"INSERT INTO "{}" (payload, state, failures, scheduled) VALUES ($1, '{}', 0, {scheduled})"#,
            self.table,
            MessageState::Ready,
        );

        let dialect = self.conn.dialect();
        let id = dialect
            .insert_returning_id(self.conn.get_mut(), &sql, &payload, delay)
            .await
            .context(StorageSnafu)?
            .ok_or_else(|| Error::NothingInserted {
                table: self.table.clone(),
            })?;

        tracing::debug!(id, ?delay, "Submitted message");

        Ok(MessageId::new(id))
    }

    /// Puts a reserved message back to `ready`, counting a failure.
    ///
    /// Without a delay the message is visible again immediately.
    #[tracing::instrument(skip(self, options), fields(queue = %self.name))]
    pub async fn release(&mut self, id: &MessageId, options: ReleaseOptions) -> Result<(), Error> {
        let delay = delay_seconds(options.delay)?;

        let scheduled = match delay {
            Some(_) => self.conn.dialect().timestamp(Some("$2")),
            None => "NULL".to_owned(),
        };

        let sql = format!(
            r#"
            UPDATE "{}"
            SET state = '{}', failures = failures + 1, scheduled = {scheduled}
            WHERE id = $1 AND state = '{}'
            "#,
            self.table,
            MessageState::Ready,
            MessageState::Reserved,
        );

        let mut query = sqlx::query(&sql).bind(id.get());
        if let Some(delay) = delay {
            query = query.bind(delay);
        }

        let result = query
            .execute(self.conn.get_mut())
            .await
            .context(StorageSnafu)?;

        if result.rows_affected() == 0 {
            tracing::warn!("Release ignored, message is not reserved");
        }

        Ok(())
    }

    /// Marks a message as failed. Failed messages are never reserved again but
    /// stay in the table for inspection.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn abort(&mut self, id: &MessageId) -> Result<(), Error> {
        let sql = format!(
            r#"UPDATE "{}" SET state = '{}' WHERE id = $1 AND state <> '{}'"#,
            self.table,
            MessageState::Failed,
            MessageState::Failed,
        );

        let result = sqlx::query(&sql)
            .bind(id.get())
            .execute(self.conn.get_mut())
            .await
            .context(StorageSnafu)?;

        if result.rows_affected() == 0 {
            tracing::warn!("Abort ignored, message does not exist or already failed");
        }

        Ok(())
    }

    /// Deletes a message. Returns `true` only if this call removed it.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn finish(&mut self, id: &MessageId) -> Result<bool, Error> {
        self.delete(id).await
    }

    async fn delete(&mut self, id: &MessageId) -> Result<bool, Error> {
        let result = sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = $1"#, self.table))
            .bind(id.get())
            .execute(self.conn.get_mut())
            .await
            .context(StorageSnafu)?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns up to `limit` messages that could be reserved right now, oldest
    /// first, without reserving them.
    pub async fn peek(&mut self, limit: u32) -> Result<Vec<Message>, Error> {
        let sql = format!(
            r#"
            SELECT id, payload, failures FROM "{}"
            WHERE state = '{}' AND {}
            ORDER BY id ASC
            LIMIT $1
            "#,
            self.table,
            MessageState::Ready,
            self.visible(),
        );

        let mut stream = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(i64::from(limit))
            .fetch(self.conn.get_mut());

        let mut messages = Vec::new();

        while let Some(row) = stream.next().await.transpose().context(StorageSnafu)? {
            messages.push(row.into());
        }

        Ok(messages)
    }

    pub async fn count_ready(&mut self) -> Result<u64, Error> {
        self.count(MessageState::Ready).await
    }

    pub async fn count_reserved(&mut self) -> Result<u64, Error> {
        self.count(MessageState::Reserved).await
    }

    pub async fn count_failed(&mut self) -> Result<u64, Error> {
        self.count(MessageState::Failed).await
    }

    async fn count(&mut self, state: MessageState) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(&format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE state = $1"#,
            self.table
        ))
        .bind(state.as_ref())
        .fetch_one(self.conn.get_mut())
        .await
        .context(StorageSnafu)?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_queue() -> (Queue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());

        let mut queue = Queue::connect("unit", &url, QueueOptions::default())
            .await
            .unwrap();
        queue.set_up().await.unwrap();

        (queue, dir)
    }

    #[tokio::test]
    async fn test_submit_assigns_increasing_ids() {
        let (mut queue, _dir) = setup_queue().await;

        let first = queue.submit("a", SubmitOptions::default()).await.unwrap();
        let second = queue.submit("b", SubmitOptions::default()).await.unwrap();

        assert!(second > first);
        assert_eq!(queue.count_ready().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_peek_orders_by_id_and_skips_scheduled() {
        let (mut queue, _dir) = setup_queue().await;

        let first = queue.submit(&1, SubmitOptions::default()).await.unwrap();
        queue
            .submit(
                &2,
                SubmitOptions::builder()
                    .delay(Duration::from_secs(60))
                    .build(),
            )
            .await
            .unwrap();
        let third = queue.submit(&3, SubmitOptions::default()).await.unwrap();

        let peeked = queue.peek(10).await.unwrap();
        let ids: Vec<_> = peeked.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, third]);

        let limited = queue.peek(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].payload_as::<i32>().unwrap(), 1);

        assert_eq!(queue.count_ready().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_abort_is_terminal() {
        let (mut queue, _dir) = setup_queue().await;

        let id = queue.submit("doomed", SubmitOptions::default()).await.unwrap();
        queue.abort(&id).await.unwrap();

        assert_eq!(queue.count_ready().await.unwrap(), 0);
        assert_eq!(queue.count_failed().await.unwrap(), 1);
        assert!(queue.peek(10).await.unwrap().is_empty());

        // Releasing a failed message does not bring it back.
        queue.release(&id, ReleaseOptions::default()).await.unwrap();
        assert_eq!(queue.count_failed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_clears_messages() {
        let (mut queue, _dir) = setup_queue().await;

        queue.submit("x", SubmitOptions::default()).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(queue.count_ready().await.unwrap(), 0);
        queue.submit("y", SubmitOptions::default()).await.unwrap();
        assert_eq!(queue.count_ready().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_rejected() {
        let (mut queue, _dir) = setup_queue().await;
        let too_long = Duration::from_secs(400_000_000_000);

        let submitted = queue
            .submit("never", SubmitOptions::builder().delay(too_long).build())
            .await;
        assert!(matches!(submitted, Err(Error::InvalidParameter { .. })));
        assert_eq!(queue.count_ready().await.unwrap(), 0);

        let id = queue.submit("once", SubmitOptions::default()).await.unwrap();
        let message = queue
            .wait_and_reserve(Some(Duration::ZERO))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, id);

        let released = queue
            .release(&id, ReleaseOptions::builder().delay(too_long).build())
            .await;
        assert!(matches!(released, Err(Error::InvalidParameter { .. })));
        assert_eq!(queue.count_reserved().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_longest_delay_stays_hidden() {
        let (mut queue, _dir) = setup_queue().await;

        queue
            .submit("later", SubmitOptions::builder().delay(MAX_DELAY).build())
            .await
            .unwrap();

        assert!(queue
            .wait_and_reserve(Some(Duration::ZERO))
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.count_ready().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_up_is_idempotent() {
        let (mut queue, _dir) = setup_queue().await;

        queue.submit("kept", SubmitOptions::default()).await.unwrap();
        queue.set_up().await.unwrap();

        assert_eq!(queue.count_ready().await.unwrap(), 1);
    }
}
