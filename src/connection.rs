use std::str::FromStr;

use snafu::ResultExt;
use sqlx::{
    any::{install_default_drivers, AnyConnectOptions},
    AnyConnection, ConnectOptions, Connection as _,
};

use crate::{
    dialect::Dialect,
    error::{Error, StorageSnafu},
};

/// A single database connection that can re-establish itself.
///
/// Workers sit idle between polls for long stretches, long enough for servers
/// and proxies to drop the socket. [`Connection::ensure_alive`] is called before
/// every wait loop to catch that.
pub struct Connection {
    options: AnyConnectOptions,
    conn: AnyConnection,
    dialect: Dialect,
    #[cfg(test)]
    pub(crate) faults: Faults,
}

/// Failures injected by tests. A reconnect clears them.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Faults {
    pub ping: bool,
    pub statements: bool,
}

impl Connection {
    pub async fn open(url: &str) -> Result<Self, Error> {
        install_default_drivers();

        let options = AnyConnectOptions::from_str(url).context(StorageSnafu)?;
        let conn = options.connect().await.context(StorageSnafu)?;
        let dialect = Dialect::detect(conn.backend_name())?;

        tracing::debug!(?dialect, "opened queue connection");

        Ok(Self {
            options,
            conn,
            dialect,
            #[cfg(test)]
            faults: Faults::default(),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn get_mut(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }

    /// Pings the server and reconnects if the ping fails.
    pub async fn ensure_alive(&mut self) -> Result<(), Error> {
        if let Err(e) = self.ping().await {
            tracing::warn!("Queue connection is not responding, reconnecting: {e}");
            self.reconnect().await?;
        }

        Ok(())
    }

    pub async fn reconnect(&mut self) -> Result<(), Error> {
        let conn = self.options.connect().await.context(StorageSnafu)?;

        self.conn = conn;
        #[cfg(test)]
        {
            self.faults = Faults::default();
        }

        tracing::info!("Re-established queue connection");

        Ok(())
    }

    async fn ping(&mut self) -> Result<(), sqlx::Error> {
        #[cfg(test)]
        fail_if(self.faults.ping)?;

        self.conn.ping().await
    }

    /// Fails the way a dropped socket would while statement faults are set.
    #[cfg(test)]
    pub(crate) fn check_statement_faults(&self) -> Result<(), sqlx::Error> {
        fail_if(self.faults.statements)
    }
}

#[cfg(test)]
fn fail_if(broken: bool) -> Result<(), sqlx::Error> {
    if broken {
        return Err(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection reset",
        )));
    }

    Ok(())
}
