//! A message queue stored in one relational database table.
//!
//! Producers [`submit`](Queue::submit) JSON payloads; workers block in
//! [`wait_and_reserve`](Queue::wait_and_reserve) and then
//! [`finish`](Queue::finish), [`release`](Queue::release) or
//! [`abort`](Queue::abort) what they got. Delivery is at-least-once and
//! roughly FIFO. SQLite and PostgreSQL are supported.
//!
//! ```no_run
//! # async fn demo() -> Result<(), tableq::Error> {
//! use tableq::{Queue, QueueOptions, SubmitOptions};
//!
//! let mut queue = Queue::connect("emails", "sqlite://queue.db?mode=rwc", QueueOptions::default()).await?;
//! queue.set_up().await?;
//!
//! queue.submit(&serde_json::json!({ "to": "ops@example.com" }), SubmitOptions::default()).await?;
//!
//! if let Some(message) = queue.wait_and_reserve(None).await? {
//!     // ... send the email ...
//!     queue.finish(&message.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod message;
pub mod queue;

pub use config::{Config, QueueOptions};
pub use error::Error;
pub use message::{Message, MessageId, MessageState, ReleaseOptions, SubmitOptions};
pub use queue::{Queue, MAX_DELAY};

/// Installs the global tracing subscriber, filtered by `TABLEQ_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("TABLEQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
