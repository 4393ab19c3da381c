use std::time::Duration;

use serde::Deserialize;
use tableq::{Config, Message, Queue, ReleaseOptions};
use tokio_util::sync::CancellationToken;

/// Give up on a message after this many failed attempts.
const MAX_FAILURES: u64 = 3;

#[derive(Deserialize)]
struct Task {
    name: String,
    #[serde(default)]
    fail: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tableq::init_tracing()?;

    let config = Config::load()?;
    let queue_name = std::env::args().nth(1).unwrap_or_else(|| "demo".to_owned());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                shutdown.cancel();
            }
        }
    });

    let mut queue = Queue::connect(&queue_name, config.database_url(), config.queue_options())
        .await?
        .with_shutdown(shutdown.clone());
    queue.set_up().await?;

    tracing::info!(queue = queue.name(), "Worker started");

    while !shutdown.is_cancelled() {
        let Some(message) = queue.wait_and_reserve(None).await? else {
            continue;
        };

        match process(&message) {
            Ok(()) => {
                queue.finish(&message.id).await?;
            }
            Err(e) if message.failures + 1 >= MAX_FAILURES => {
                tracing::error!(id = %message.id, "Giving up on message: {e}");
                queue.abort(&message.id).await?;
            }
            Err(e) => {
                let backoff = Duration::from_secs(2u64.pow(message.failures as u32));
                tracing::warn!(id = %message.id, ?backoff, "Retrying message: {e}");
                queue
                    .release(&message.id, ReleaseOptions::builder().delay(backoff).build())
                    .await?;
            }
        }
    }

    Ok(())
}

fn process(message: &Message) -> eyre::Result<()> {
    let task: Task = message.payload_as()?;

    if task.fail {
        eyre::bail!("task {} asked to fail", task.name);
    }

    tracing::info!(id = %message.id, task = %task.name, "Processed task");

    Ok(())
}
