//! Per-backend SQL differences.
//!
//! Everything else the queue issues is plain SQL understood by every supported
//! backend (both accept `$n` placeholders and double-quoted identifiers).

use sqlx::AnyConnection;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Picks the dialect from the driver's backend name.
    pub fn detect(backend: &str) -> Result<Self, Error> {
        match backend.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(Error::UnsupportedBackend {
                backend: backend.to_owned(),
            }),
        }
    }

    /// SQL expression for the current time, shifted forward by the number of
    /// seconds bound to `offset` when given.
    ///
    /// SQLite timestamps are stored as millisecond-precision text so they
    /// compare correctly as strings.
    pub fn timestamp(&self, offset: Option<&str>) -> String {
        match (self, offset) {
            (Self::Sqlite, None) => "strftime('%Y-%m-%d %H:%M:%f', 'now')".to_owned(),
            (Self::Sqlite, Some(param)) => {
                format!(
                    "strftime('%Y-%m-%d %H:%M:%f', 'now', '+' || printf('%.3f', {param}) || ' seconds')"
                )
            }
            (Self::Postgres, None) => "NOW()".to_owned(),
            (Self::Postgres, Some(param)) => format!("NOW() + make_interval(secs => {param})"),
        }
    }

    /// Runs an `INSERT` statement and returns the id of the new row, or `None`
    /// when nothing was inserted.
    ///
    /// `sql` binds the payload as `$1` and, when `delay` is set, the delay in
    /// seconds as `$2`.
    pub async fn insert_returning_id(
        &self,
        conn: &mut AnyConnection,
        sql: &str,
        payload: &str,
        delay: Option<f64>,
    ) -> Result<Option<i64>, sqlx::Error> {
        match self {
            Self::Sqlite => {
                let mut query = sqlx::query(sql).bind(payload);
                if let Some(delay) = delay {
                    query = query.bind(delay);
                }

                let result = query.execute(&mut *conn).await?;
                if result.rows_affected() == 0 {
                    return Ok(None);
                }

                // The Any driver does not carry SQLite's rowid in the query
                // result, so read it back on the same connection.
                let id = sqlx::query_scalar::<_, i64>("SELECT last_insert_rowid()")
                    .fetch_one(&mut *conn)
                    .await?;

                Ok(Some(id))
            }
            Self::Postgres => {
                let sql = format!("{sql} RETURNING id");

                let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(payload);
                if let Some(delay) = delay {
                    query = query.bind(delay);
                }

                query.fetch_optional(&mut *conn).await
            }
        }
    }

    /// Column definitions for the queue table.
    pub(crate) fn columns(&self) -> &'static str {
        match self {
            Self::Sqlite => {
                "
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                state VARCHAR(255) NOT NULL,
                failures INTEGER NOT NULL DEFAULT 0,
                scheduled DATETIME NULL
                "
            }
            Self::Postgres => {
                "
                id BIGSERIAL PRIMARY KEY,
                payload TEXT NOT NULL,
                state VARCHAR(255) NOT NULL,
                failures BIGINT NOT NULL DEFAULT 0,
                scheduled TIMESTAMPTZ NULL
                "
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    #[test]
    fn test_detect() {
        assert_eq!(Dialect::detect("SQLite").unwrap(), Dialect::Sqlite);
        assert_eq!(Dialect::detect("PostgreSQL").unwrap(), Dialect::Postgres);
        assert!(matches!(
            Dialect::detect("MySQL"),
            Err(Error::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn test_timestamp_expressions() {
        assert_eq!(Dialect::Postgres.timestamp(None), "NOW()");
        assert_eq!(
            Dialect::Postgres.timestamp(Some("$2")),
            "NOW() + make_interval(secs => $2)"
        );
        assert!(Dialect::Sqlite
            .timestamp(Some("$1"))
            .contains("'+' || printf('%.3f', $1) || ' seconds'"));
    }

    #[tokio::test]
    async fn test_sqlite_insert_returns_new_row_id() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ids.db").display());
        let mut conn = Connection::open(&url).await.unwrap();

        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)")
            .execute(conn.get_mut())
            .await
            .unwrap();

        let dialect = conn.dialect();
        let sql = "INSERT INTO items (name) VALUES ($1)";

        let first = dialect
            .insert_returning_id(conn.get_mut(), sql, "a", None)
            .await
            .unwrap();
        let second = dialect
            .insert_returning_id(conn.get_mut(), sql, "b", None)
            .await
            .unwrap();

        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));
    }
}
