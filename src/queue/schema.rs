use snafu::ResultExt;

use crate::error::{Error, SetupSnafu, StorageSnafu};

use super::Queue;

impl Queue {
    /// Creates the queue table and its `(state, scheduled)` index unless they
    /// already exist. Existing rows are left alone.
    #[tracing::instrument(skip(self), fields(queue = %self.name, table = %self.table))]
    pub async fn set_up(&mut self) -> Result<(), Error> {
        let columns = self.conn.dialect().columns();
        let table = &self.table;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" ({columns})"#
        ))
        .execute(self.conn.get_mut())
        .await
        .context(SetupSnafu { table })?;

        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_state_scheduled" ON "{table}" (state, scheduled)"#
        ))
        .execute(self.conn.get_mut())
        .await
        .context(SetupSnafu { table })?;

        tracing::info!("Queue table ready");

        Ok(())
    }

    /// Drops the table with every message in it and creates it again.
    #[tracing::instrument(skip(self), fields(queue = %self.name, table = %self.table))]
    pub async fn flush(&mut self) -> Result<(), Error> {
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, self.table))
            .execute(self.conn.get_mut())
            .await
            .context(StorageSnafu)?;

        tracing::warn!("Dropped queue table");

        self.set_up().await
    }
}
