use std::time::Duration;

use clap::{Parser, Subcommand};
use tableq::{Config, Queue, SubmitOptions};

#[derive(Parser)]
#[command(name = "tableq", about = "Manage table-backed message queues", version)]
struct Cli {
    /// Database URL, e.g. sqlite://queue.db?mode=rwc or postgres://localhost/app
    #[arg(long, global = true, env = "TABLEQ_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the queue table if it does not exist
    Setup {
        /// Queue name
        queue: String,
    },

    /// Drop and recreate the queue table (destroys all messages)
    Flush {
        /// Queue name
        queue: String,
    },

    /// Submit a JSON payload
    Submit {
        /// Queue name
        queue: String,

        /// Payload, as JSON
        payload: String,

        /// Seconds before the message becomes visible
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Show the next messages that would be reserved
    Peek {
        /// Queue name
        queue: String,

        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Print message counts per state
    Stats {
        /// Queue name
        queue: String,
    },
}

impl Command {
    fn queue(&self) -> &str {
        match self {
            Self::Setup { queue }
            | Self::Flush { queue }
            | Self::Submit { queue, .. }
            | Self::Peek { queue, .. }
            | Self::Stats { queue } => queue,
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tableq::init_tracing()?;

    let cli = Cli::parse();
    let config = Config::load()?;

    let url = cli
        .database_url
        .as_deref()
        .unwrap_or_else(|| config.database_url());

    let mut queue = Queue::connect(cli.command.queue(), url, config.queue_options()).await?;

    match cli.command {
        Command::Setup { .. } => {
            queue.set_up().await?;
            println!("Queue table {} is set up", queue.table_name());
        }
        Command::Flush { .. } => {
            queue.flush().await?;
            println!("Flushed queue table {}", queue.table_name());
        }
        Command::Submit { payload, delay, .. } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let delay = delay.map(Duration::try_from_secs_f64).transpose()?;

            let id = queue
                .submit(&payload, SubmitOptions::builder().maybe_delay(delay).build())
                .await?;
            println!("{id}");
        }
        Command::Peek { limit, .. } => {
            let mut out = Vec::new();
            for message in queue.peek(limit).await? {
                out.push(serde_json::json!({
                    "id": message.id.to_string(),
                    "payload": message.payload_as::<serde_json::Value>()?,
                    "failures": message.failures,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Stats { .. } => {
            let stats = serde_json::json!({
                "queue": queue.name(),
                "table": queue.table_name(),
                "ready": queue.count_ready().await?,
                "reserved": queue.count_reserved().await?,
                "failed": queue.count_failed().await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
