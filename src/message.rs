//! Message types and lifecycle states.
//!
//! Every message is one row in the queue table. Rows move through three
//! states:
//!
//! 1. `ready` after submission (possibly hidden until its `scheduled` time)
//! 2. `reserved` once a worker claims it
//! 3. `failed` when a worker aborts it, which is terminal
//!
//! Finishing a reserved message deletes the row; releasing it puts it back to
//! `ready` with its failure counter incremented.

use std::{fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::Error;

/// Value of the `state` column.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum MessageState {
    /// Waiting to be reserved (subject to its schedule)
    Ready,
    /// Claimed by exactly one worker
    Reserved,
    /// Aborted by a worker and kept for inspection
    Failed,
}

/// Identifier of a message, the auto-increment id of its row.
///
/// Displays and parses as the decimal row id, which is the form handed to
/// other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| Error::InvalidMessageId {
                value: s.to_owned(),
            })
    }
}

/// A message handed out by the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: MessageId,
    /// JSON-encoded payload exactly as submitted
    pub payload: Bytes,
    /// How many times the message was released after a failed attempt
    pub failures: u64,
}

impl Message {
    /// Decodes the JSON payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub payload: String,
    pub failures: i64,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId(row.id),
            payload: Bytes::from(row.payload),
            failures: row.failures.max(0) as u64,
        }
    }
}

/// Options for [`Queue::submit`](crate::Queue::submit).
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct SubmitOptions {
    /// Keep the message invisible for this long after submission.
    pub delay: Option<Duration>,
}

/// Options for [`Queue::release`](crate::Queue::release).
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct ReleaseOptions {
    /// Backoff before the released message becomes visible again.
    pub delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        assert_eq!(MessageState::Ready.as_ref(), "ready");
        assert_eq!(MessageState::Reserved.to_string(), "reserved");
        assert_eq!("failed".parse::<MessageState>().unwrap(), MessageState::Failed);
        assert!("done".parse::<MessageState>().is_err());
    }

    #[test]
    fn test_message_id_parse() {
        let id: MessageId = "42".parse().unwrap();
        assert_eq!(id, MessageId::new(42));
        assert_eq!(id.to_string(), "42");

        assert!(matches!(
            "abc".parse::<MessageId>(),
            Err(Error::InvalidMessageId { .. })
        ));
    }

    #[test]
    fn test_payload_decode() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Mail {
            to: String,
            retries: u32,
        }

        let msg = Message::from(MessageRow {
            id: 7,
            payload: r#"{"to":"ops@example.com","retries":2}"#.to_owned(),
            failures: 1,
        });

        assert_eq!(msg.id, MessageId::new(7));
        assert_eq!(msg.failures, 1);
        assert_eq!(
            msg.payload_as::<Mail>().unwrap(),
            Mail {
                to: "ops@example.com".to_owned(),
                retries: 2,
            }
        );
        assert!(matches!(
            msg.payload_as::<Vec<u8>>(),
            Err(Error::Serialization { .. })
        ));
    }
}
