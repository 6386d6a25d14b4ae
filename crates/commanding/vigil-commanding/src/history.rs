//! Command history: acknowledgement publishing and per-command subscriptions.

use crate::types::{CommandId, SubscriptionId, Value};
use crate::{Result, VerifyError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Key prefix of verifier acknowledgements, followed by `_<stage>`
pub const VERIFIER_KEY_PREFIX: &str = "Verifier";
/// Key of the final command outcome
pub const COMMAND_COMPLETE_KEY: &str = "CommandComplete";
pub const STATUS_SUFFIX: &str = "_Status";
pub const TIME_SUFFIX: &str = "_Time";
pub const MESSAGE_SUFFIX: &str = "_Message";

/// Acknowledgement key of a verifier stage
pub fn verifier_key(stage: &str) -> String {
    format!("{VERIFIER_KEY_PREFIX}_{stage}")
}

/// Attribute carrying the status of `CommandComplete`
pub fn command_complete_status_key() -> String {
    format!("{COMMAND_COMPLETE_KEY}{STATUS_SUFFIX}")
}

/// Status carried by an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Pending,
    Scheduled,
    Ok,
    Nok,
    Timeout,
    Cancelled,
    Disabled,
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckStatus::Pending => "PENDING",
            AckStatus::Scheduled => "SCHEDULED",
            AckStatus::Ok => "OK",
            AckStatus::Nok => "NOK",
            AckStatus::Timeout => "TIMEOUT",
            AckStatus::Cancelled => "CANCELLED",
            AckStatus::Disabled => "DISABLED",
        })
    }
}

/// Sink for acknowledgements
pub trait CommandHistoryPublisher: Send + Sync {
    fn publish_ack(
        &self,
        cmd_id: &CommandId,
        key: &str,
        time: DateTime<Utc>,
        status: AckStatus,
        message: Option<&str>,
    );

    /// Record the command as failed
    fn command_failed(&self, cmd_id: &CommandId, time: DateTime<Utc>, reason: &str) {
        self.publish_ack(cmd_id, COMMAND_COMPLETE_KEY, time, AckStatus::Nok, Some(reason));
    }
}

/// Receiver of command-history attribute changes
pub trait CommandHistoryConsumer: Send + Sync {
    fn updated_command(&self, cmd_id: &CommandId, change_time: DateTime<Utc>, key: &str, value: &Value);
}

/// Per-command subscription to history changes
pub trait CommandHistorySubscriptions: Send + Sync {
    /// Fails with [`VerifyError::InvalidCommandId`] for unknown commands
    fn subscribe_command(
        &self,
        cmd_id: &CommandId,
        consumer: Arc<dyn CommandHistoryConsumer>,
    ) -> Result<SubscriptionId>;

    fn unsubscribe_command(&self, cmd_id: &CommandId, subscription: SubscriptionId);
}

/// Acknowledgement as recorded by [`InMemoryCommandHistory`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRecord {
    pub key: String,
    pub status: AckStatus,
    pub time: DateTime<Utc>,
    pub message: Option<String>,
}

#[derive(Default)]
struct CommandRecord {
    acks: Vec<AckRecord>,
    attributes: Vec<(String, Value)>,
}

type Subscribers = Vec<(SubscriptionId, Arc<dyn CommandHistoryConsumer>)>;

/// In-process command history.
///
/// Acknowledgements are stored and replayed to subscribers as
/// `<key>_Status`, `<key>_Time` and, when present, `<key>_Message`
/// attributes. Consumers are called with no lock held.
#[derive(Default)]
pub struct InMemoryCommandHistory {
    records: RwLock<HashMap<CommandId, CommandRecord>>,
    subscribers: RwLock<HashMap<CommandId, Subscribers>>,
    next_id: AtomicU64,
}

impl InMemoryCommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a command known, so it can be subscribed to
    pub fn add_command(&self, cmd_id: &CommandId) {
        self.records.write().entry(cmd_id.clone()).or_default();
    }

    /// Publish an arbitrary attribute change
    pub fn publish_attribute(&self, cmd_id: &CommandId, key: &str, value: Value, time: DateTime<Utc>) {
        self.records
            .write()
            .entry(cmd_id.clone())
            .or_default()
            .attributes
            .push((key.to_string(), value.clone()));
        self.dispatch(cmd_id, time, &[(key.to_string(), value)]);
    }

    /// Every acknowledgement recorded for the command, in publish order
    pub fn acks(&self, cmd_id: &CommandId) -> Vec<AckRecord> {
        self.records
            .read()
            .get(cmd_id)
            .map(|r| r.acks.clone())
            .unwrap_or_default()
    }

    /// Statuses published under one key, in publish order
    pub fn ack_statuses(&self, cmd_id: &CommandId, key: &str) -> Vec<AckStatus> {
        self.acks(cmd_id)
            .into_iter()
            .filter(|ack| ack.key == key)
            .map(|ack| ack.status)
            .collect()
    }

    /// Latest `CommandComplete` acknowledgement
    pub fn completion(&self, cmd_id: &CommandId) -> Option<AckRecord> {
        self.acks(cmd_id)
            .into_iter()
            .rev()
            .find(|ack| ack.key == COMMAND_COMPLETE_KEY)
    }

    /// Latest value of an attribute
    pub fn attribute(&self, cmd_id: &CommandId, key: &str) -> Option<Value> {
        self.records.read().get(cmd_id).and_then(|r| {
            r.attributes
                .iter()
                .rev()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        })
    }

    pub fn subscriber_count(&self, cmd_id: &CommandId) -> usize {
        self.subscribers.read().get(cmd_id).map_or(0, Vec::len)
    }

    fn dispatch(&self, cmd_id: &CommandId, time: DateTime<Utc>, changes: &[(String, Value)]) {
        let consumers: Vec<_> = self
            .subscribers
            .read()
            .get(cmd_id)
            .map(|subs| subs.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default();
        for consumer in consumers {
            for (key, value) in changes {
                consumer.updated_command(cmd_id, time, key, value);
            }
        }
    }
}

impl CommandHistoryPublisher for InMemoryCommandHistory {
    fn publish_ack(
        &self,
        cmd_id: &CommandId,
        key: &str,
        time: DateTime<Utc>,
        status: AckStatus,
        message: Option<&str>,
    ) {
        trace!(command = %cmd_id, key, %status, "Publishing ack");
        let mut changes = vec![
            (format!("{key}{STATUS_SUFFIX}"), Value::String(status.to_string())),
            (format!("{key}{TIME_SUFFIX}"), Value::Timestamp(time)),
        ];
        if let Some(message) = message {
            changes.push((format!("{key}{MESSAGE_SUFFIX}"), Value::String(message.to_string())));
        }
        {
            let mut records = self.records.write();
            let record = records.entry(cmd_id.clone()).or_default();
            record.acks.push(AckRecord {
                key: key.to_string(),
                status,
                time,
                message: message.map(str::to_string),
            });
            record.attributes.extend(changes.iter().cloned());
        }
        self.dispatch(cmd_id, time, &changes);
    }
}

impl CommandHistorySubscriptions for InMemoryCommandHistory {
    fn subscribe_command(
        &self,
        cmd_id: &CommandId,
        consumer: Arc<dyn CommandHistoryConsumer>,
    ) -> Result<SubscriptionId> {
        if !self.records.read().contains_key(cmd_id) {
            return Err(VerifyError::InvalidCommandId(cmd_id.to_string()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(cmd_id.clone())
            .or_default()
            .push((id, consumer));
        debug!(command = %cmd_id, subscription = %id, "Subscribed to command history");
        Ok(id)
    }

    fn unsubscribe_command(&self, cmd_id: &CommandId, subscription: SubscriptionId) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(cmd_id) {
            subs.retain(|(id, _)| *id != subscription);
            if subs.is_empty() {
                subscribers.remove(cmd_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Value)>>,
    }

    impl CommandHistoryConsumer for Recorder {
        fn updated_command(&self, _cmd_id: &CommandId, _time: DateTime<Utc>, key: &str, value: &Value) {
            self.seen.lock().push((key.to_string(), value.clone()));
        }
    }

    fn cmd() -> CommandId {
        CommandId::new("/sc/PING", "ops", 7, Utc::now())
    }

    #[test]
    fn test_subscribe_unknown_command_fails() {
        let history = InMemoryCommandHistory::new();
        let result = history.subscribe_command(&cmd(), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(VerifyError::InvalidCommandId(_))));
    }

    #[test]
    fn test_ack_fans_out_as_attributes() {
        let history = InMemoryCommandHistory::new();
        let id = cmd();
        history.add_command(&id);
        let recorder = Arc::new(Recorder::default());
        history.subscribe_command(&id, recorder.clone()).unwrap();

        let now = Utc::now();
        history.publish_ack(&id, "Verifier_Execution", now, AckStatus::Pending, None);
        history.command_failed(&id, now, "Verifier Execution result: NOK");

        let keys: Vec<_> = recorder.seen.lock().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                "Verifier_Execution_Status",
                "Verifier_Execution_Time",
                "CommandComplete_Status",
                "CommandComplete_Time",
                "CommandComplete_Message",
            ]
        );
        assert_eq!(
            history.attribute(&id, &command_complete_status_key()),
            Some(Value::from("NOK"))
        );
        let completion = history.completion(&id).unwrap();
        assert_eq!(completion.status, AckStatus::Nok);
        assert_eq!(completion.message.as_deref(), Some("Verifier Execution result: NOK"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let history = InMemoryCommandHistory::new();
        let id = cmd();
        history.add_command(&id);
        let recorder = Arc::new(Recorder::default());
        let subscription = history.subscribe_command(&id, recorder.clone()).unwrap();
        history.unsubscribe_command(&id, subscription);
        assert_eq!(history.subscriber_count(&id), 0);

        history.publish_attribute(&id, "Acknowledge_Sent_Status", "OK".into(), Utc::now());
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(
            history.attribute(&id, "Acknowledge_Sent_Status"),
            Some(Value::from("OK"))
        );
    }

    #[test]
    fn test_keys() {
        assert_eq!(verifier_key("Complete"), "Verifier_Complete");
        assert_eq!(command_complete_status_key(), "CommandComplete_Status");
        assert_eq!(AckStatus::Nok.to_string(), "NOK");
    }
}
