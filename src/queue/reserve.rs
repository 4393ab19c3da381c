use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{is_missing_table, Error},
    message::{Message, MessageRow, MessageState},
};

use super::Queue;

impl Queue {
    /// Waits up to `timeout` (default: the queue's `defaultTimeout`) for a
    /// visible message and reserves it.
    ///
    /// The message stays in the table; the caller must [`finish`](Queue::finish),
    /// [`release`](Queue::release) or [`abort`](Queue::abort) it. Returns
    /// `Ok(None)` when the timeout expires or the shutdown token fires.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn wait_and_reserve(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        self.reserve(timeout).await
    }

    /// Like [`wait_and_reserve`](Queue::wait_and_reserve), but deletes the
    /// message before returning it, so a failure while processing loses it.
    ///
    /// Reserving and deleting are two statements. If the delete removes
    /// nothing the message is left `reserved` (nothing reclaims it) and `None`
    /// is returned.
    #[tracing::instrument(skip(self), fields(queue = %self.name))]
    pub async fn wait_and_take(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, Error> {
        let Some(message) = self.reserve(timeout).await? else {
            return Ok(None);
        };

        if !self.delete(&message.id).await? {
            tracing::warn!(
                id = %message.id,
                "Reserved message could not be deleted and is left reserved"
            );
            return Ok(None);
        }

        Ok(Some(message))
    }

    async fn reserve(&mut self, timeout: Option<Duration>) -> Result<Option<Message>, Error> {
        let timeout = timeout.unwrap_or(self.timing.default_timeout);
        // `None` when the timeout is too long to represent: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);

        self.conn.ensure_alive().await?;

        loop {
            if self.is_shutting_down() {
                return Ok(None);
            }

            match self.try_reserve().await {
                Ok(Some(message)) => {
                    self.boost.record_reservation(Instant::now());
                    tracing::debug!(id = %message.id, "Reserved message");
                    return Ok(Some(message));
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!("Lost queue connection while polling: {e}");
                    self.conn.reconnect().await?;
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            let mut interval = self.boost.interval_at(now);

            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(None);
                }
                interval = interval.min(deadline - now);
            }

            if !sleep(self.shutdown.as_ref(), interval).await {
                return Ok(None);
            }
        }
    }

    /// One poll: find the oldest visible message and try to flip it to
    /// `reserved`.
    ///
    /// The update repeats every condition of the select, so when several
    /// workers pick the same row only one of them changes it. The others see
    /// zero affected rows and poll again.
    async fn try_reserve(&mut self) -> Result<Option<Message>, Error> {
        #[cfg(test)]
        self.conn.check_statement_faults()?;

        let visible = self.visible();

        let select = format!(
            r#"
            SELECT id, payload, failures FROM "{}"
            WHERE state = '{}' AND {visible}
            ORDER BY id ASC
            LIMIT 1
            "#,
            self.table,
            MessageState::Ready,
        );

        let row: Option<MessageRow> = sqlx::query_as(&select)
            .fetch_optional(self.conn.get_mut())
            .await
            .map_err(|e| self.poll_error(e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let update = format!(
            r#"UPDATE "{}" SET state = '{}' WHERE id = $1 AND state = '{}' AND {visible}"#,
            self.table,
            MessageState::Reserved,
            MessageState::Ready,
        );

        let result = sqlx::query(&update)
            .bind(row.id)
            .execute(self.conn.get_mut())
            .await
            .map_err(|e| self.poll_error(e))?;

        if result.rows_affected() != 1 {
            tracing::debug!(id = row.id, "Message was reserved by another worker");
            return Ok(None);
        }

        Ok(Some(row.into()))
    }

    fn poll_error(&self, e: sqlx::Error) -> Error {
        if is_missing_table(&e) {
            Error::table_not_found(&self.table, &self.name)
        } else {
            e.into()
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }
}

/// Returns `false` if the shutdown token fired before `duration` elapsed.
async fn sleep(shutdown: Option<&CancellationToken>, duration: Duration) -> bool {
    match shutdown {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(duration) => true,
            }
        }
        None => {
            tokio::time::sleep(duration).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::QueueOptions, message::SubmitOptions};

    async fn setup_queue() -> (Queue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("reserve.db").display());

        let options = QueueOptions::builder()
            .poll_interval(0.05)
            .boost_poll_interval(0.01)
            .build();

        let mut queue = Queue::connect("reserve", &url, options).await.unwrap();
        queue.set_up().await.unwrap();

        (queue, dir)
    }

    #[tokio::test]
    async fn test_wait_resumes_after_dropped_connection() {
        let (mut queue, _dir) = setup_queue().await;
        let id = queue.submit("survivor", SubmitOptions::default()).await.unwrap();

        queue.conn.faults.statements = true;

        let message = queue
            .wait_and_reserve(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.id, id);
        assert!(!queue.conn.faults.statements);
        assert_eq!(queue.count_reserved().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_reserves() {
        let (mut queue, _dir) = setup_queue().await;
        let id = queue.submit("forever", SubmitOptions::default()).await.unwrap();

        let message = queue
            .wait_and_reserve(Some(Duration::MAX))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.id, id);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_honors_shutdown() {
        let (queue, _dir) = setup_queue().await;
        let token = CancellationToken::new();
        let mut queue = queue.with_shutdown(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let result = queue.wait_and_reserve(Some(Duration::MAX)).await.unwrap();
        assert!(result.is_none());
    }
}
