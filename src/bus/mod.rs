//! Structured message passing between bees.
//!
//! Every sanctioned inter-bee exchange goes through [`MessageBus::send`]:
//! the message is persisted with `sender_cli_used = true`, composed into
//! the fixed wire block the bees are prompted against, and handed to the
//! injector for delivery into the recipient's pane. Messages that appear
//! in the store without that flag were produced some other way and are
//! flagged as protocol violations by the supervisor.
//!
//! Broadcasts (`to = all`) are expanded at send time into one message
//! per concrete recipient sharing a conversation ID; the store never
//! holds a `to_bee = all` row. Delivery is at-least-once per recipient
//! and partial failure is allowed, with each recipient's outcome logged
//! independently.

use chrono::{SecondsFormat, Utc};

use crate::config::HiveConfig;
use crate::injector::{Injector, SendOptions};
use crate::models::{BeeName, Message, MessagePriority, MessageType, NewMessage};
use crate::store::Store;
use crate::{Error, Result};

/// Parameters for one bus send.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub from: BeeName,
    pub to: BeeName,
    pub message_type: MessageType,
    pub subject: Option<String>,
    pub content: String,
    pub task_id: Option<String>,
    pub priority: MessagePriority,
    pub reply_to: Option<i64>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

impl Outbound {
    pub fn new(
        from: BeeName,
        to: BeeName,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            message_type,
            subject: None,
            content: content.into(),
            task_id: None,
            priority: MessagePriority::Normal,
            reply_to: None,
            expires_at: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of one bus send.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Delivery {
    /// Persisted message IDs, one per recipient
    pub message_ids: Vec<i64>,
    /// Set for broadcasts; shared by all copies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Recipients whose pane delivery failed, with the logged outcome
    pub failed: Vec<(BeeName, String)>,
}

impl Delivery {
    /// The single message ID of a non-broadcast send.
    pub fn message_id(&self) -> i64 {
        self.message_ids.first().copied().unwrap_or(0)
    }
}

/// The protocol-level message facility, built atop store + injector.
pub struct MessageBus {
    store: Store,
    injector: Injector,
    config: HiveConfig,
}

impl MessageBus {
    pub fn new(store: Store, injector: Injector, config: &HiveConfig) -> Self {
        Self {
            store,
            injector,
            config: config.clone(),
        }
    }

    /// Send a message, expanding broadcasts.
    ///
    /// For a single recipient a transport failure is returned as an
    /// error after the message row is persisted (the row stays
    /// unprocessed; the caller decides about retries). For a broadcast,
    /// per-recipient failures are collected in the returned [`Delivery`].
    pub fn send(&mut self, out: &Outbound) -> Result<Delivery> {
        if out.from == BeeName::All {
            return Err(Error::InvalidName("all is not a valid sender".into()));
        }
        if out.content.trim().is_empty() {
            return Err(Error::InvalidInput(
                "message content must not be empty".into(),
            ));
        }
        if !self.config.accepts_message_type(&out.message_type) {
            return Err(Error::InvalidInput(format!(
                "message type not accepted: {}",
                out.message_type
            )));
        }

        let broadcast = out.to == BeeName::All;
        let recipients: Vec<BeeName> = if broadcast {
            BeeName::REAL
                .iter()
                .copied()
                .filter(|bee| *bee != out.from)
                .collect()
        } else {
            if !out.to.is_real() {
                return Err(Error::InvalidName(format!(
                    "{} cannot receive messages",
                    out.to
                )));
            }
            vec![out.to]
        };

        let conversation_id = if broadcast {
            Some(uuid::Uuid::new_v4().to_string())
        } else {
            None
        };

        let mut delivery = Delivery {
            message_ids: Vec::new(),
            conversation_id: conversation_id.clone(),
            failed: Vec::new(),
        };

        for recipient in recipients {
            let message_id = self.store.enqueue_message(&NewMessage {
                from_bee: out.from,
                to_bee: recipient,
                message_type: out.message_type.clone(),
                subject: out.subject.clone(),
                content: out.content.clone(),
                task_id: out.task_id.clone(),
                priority: out.priority,
                sender_cli_used: true,
                conversation_id: conversation_id.clone(),
                reply_to: out.reply_to,
                expires_at: out.expires_at,
            })?;
            delivery.message_ids.push(message_id);

            let payload = compose_wire_payload(out);
            let opts = SendOptions {
                message_type: Some(out.message_type.as_str().to_string()),
                sender: Some(out.from.as_str().to_string()),
                metadata: Some(serde_json::json!({
                    "to_bee": recipient.as_str(),
                    "subject": out.subject,
                    "task_id": out.task_id,
                    "message_id": message_id,
                })),
                dry_run: false,
            };

            match self.injector.send(recipient, &payload, &opts) {
                Ok(_) => {
                    self.store.touch_activity(recipient)?;
                }
                Err(Error::Transport(e)) => {
                    delivery.failed.push((recipient, e.outcome().to_string()));
                    if !broadcast {
                        // The row stays persisted and unprocessed; the
                        // classified error is surfaced to the caller.
                        return Err(Error::Transport(e));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        if out.from.is_real() {
            self.store.touch_activity(out.from)?;
        }

        Ok(delivery)
    }

    /// Fetch a bee's queue. The messages are not consumed; the caller
    /// acknowledges each with [`MessageBus::ack`].
    pub fn receive(
        &mut self,
        bee: BeeName,
        include_processed: bool,
        max: Option<usize>,
    ) -> Result<Vec<Message>> {
        if !bee.is_real() {
            return Err(Error::InvalidName(format!("{bee} has no message queue")));
        }
        let messages = self.store.dequeue_messages(bee, include_processed, max)?;
        self.store.touch_activity(bee)?;
        Ok(messages)
    }

    /// Acknowledge a message. Idempotent.
    pub fn ack(&mut self, message_id: i64) -> Result<()> {
        self.store.mark_processed(message_id)
    }
}

/// Compose the fixed wire block delivered into the recipient's pane.
/// The exact markup is load-bearing: the bees' role prompts teach them
/// to parse this fence.
pub(crate) fn compose_wire_payload(out: &Outbound) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!(
        "## 📨 MESSAGE FROM {sender}\n\
         \n\
         **Type:** {message_type}\n\
         **Subject:** {subject}\n\
         **Task ID:** {task_id}\n\
         **Timestamp:** {timestamp}\n\
         \n\
         **Content:**\n\
         {content}\n\
         \n\
         ---\n",
        sender = out.from.as_str().to_uppercase(),
        message_type = out.message_type,
        subject = out.subject.as_deref().unwrap_or("N/A"),
        task_id = out.task_id.as_deref().unwrap_or("N/A"),
        timestamp = timestamp,
        content = out.content,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;

    #[test]
    fn test_send_persists_and_injects() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        let delivery = bus
            .send(
                &Outbound::new(
                    BeeName::Queen,
                    BeeName::Developer,
                    MessageType::Instruction,
                    "implement the login flow",
                )
                .subject("Login"),
            )
            .unwrap();
        assert_eq!(delivery.message_ids.len(), 1);
        assert!(delivery.failed.is_empty());

        let store = env.open_store();
        let msg = store.get_message(delivery.message_id()).unwrap();
        assert_eq!(msg.from_bee, BeeName::Queen);
        assert_eq!(msg.to_bee, BeeName::Developer);
        assert!(msg.sender_cli_used);
        assert!(!msg.processed);

        let sends = env.mux.sends_to("beehive:1");
        assert_eq!(sends.len(), 1);
        assert!(sends[0].starts_with("## 📨 MESSAGE FROM QUEEN"));
        assert!(sends[0].contains("**Type:** instruction"));
        assert!(sends[0].contains("**Subject:** Login"));
        assert!(sends[0].contains("implement the login flow"));
        assert!(sends[0].trim_end().ends_with("---"));
    }

    #[test]
    fn test_wire_payload_format() {
        let out = Outbound::new(
            BeeName::System,
            BeeName::Queen,
            MessageType::TaskUpdate,
            "task done",
        )
        .task("T1");
        let payload = compose_wire_payload(&out);

        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines[0], "## 📨 MESSAGE FROM SYSTEM");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "**Type:** task_update");
        assert_eq!(lines[3], "**Subject:** N/A");
        assert_eq!(lines[4], "**Task ID:** T1");
        assert!(lines[5].starts_with("**Timestamp:** "));
        assert_eq!(lines[6], "");
        assert_eq!(lines[7], "**Content:**");
        assert_eq!(lines[8], "task done");
        assert_eq!(lines[9], "");
        assert_eq!(lines[10], "---");
    }

    #[test]
    fn test_per_pair_ordering() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        for content in ["first", "second", "third"] {
            bus.send(&Outbound::new(
                BeeName::Queen,
                BeeName::Qa,
                MessageType::Info,
                content,
            ))
            .unwrap();
        }

        let sends = env.mux.sends_to("beehive:2");
        assert_eq!(sends.len(), 3);
        assert!(sends[0].contains("first"));
        assert!(sends[1].contains("second"));
        assert!(sends[2].contains("third"));
    }

    #[test]
    fn test_broadcast_from_real_bee_excludes_sender() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        let delivery = bus
            .send(&Outbound::new(
                BeeName::Queen,
                BeeName::All,
                MessageType::Notification,
                "refresh",
            ))
            .unwrap();

        // N-1 copies for a real-bee sender
        assert_eq!(delivery.message_ids.len(), 3);
        let conversation = delivery.conversation_id.clone().unwrap();

        let store = env.open_store();
        for id in &delivery.message_ids {
            let msg = store.get_message(*id).unwrap();
            assert_ne!(msg.to_bee, BeeName::Queen);
            assert_eq!(msg.conversation_id.as_ref(), Some(&conversation));
        }
        // Queen's own pane got nothing
        assert!(env.mux.sends_to("beehive:0").is_empty());
    }

    #[test]
    fn test_broadcast_from_system_reaches_everyone() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        let delivery = bus
            .send(&Outbound::new(
                BeeName::System,
                BeeName::All,
                MessageType::Notification,
                "refresh",
            ))
            .unwrap();

        // N copies for a synthetic sender, one injector call each
        assert_eq!(delivery.message_ids.len(), 4);
        for pane in ["beehive:0", "beehive:1", "beehive:2", "beehive:3"] {
            assert_eq!(env.mux.sends_to(pane).len(), 1);
        }

        let log = env.open_store().recent_injections(10).unwrap();
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_broadcast_partial_failure() {
        let env = TestEnv::new();
        env.mux.fail_pane("beehive:2");
        let mut bus = env.bus();

        let delivery = bus
            .send(&Outbound::new(
                BeeName::System,
                BeeName::All,
                MessageType::Notification,
                "refresh",
            ))
            .unwrap();

        assert_eq!(delivery.message_ids.len(), 4);
        assert_eq!(delivery.failed.len(), 1);
        assert_eq!(delivery.failed[0].0, BeeName::Qa);
        assert_eq!(delivery.failed[0].1, "pane_not_found");

        // The other three panes were still attempted and delivered.
        assert_eq!(env.mux.sends_to("beehive:0").len(), 1);
        assert_eq!(env.mux.sends_to("beehive:3").len(), 1);
    }

    #[test]
    fn test_transport_failure_persists_message() {
        let env = TestEnv::new();
        env.mux.fail_pane("beehive:1");
        let mut bus = env.bus();

        let err = bus
            .send(&Outbound::new(
                BeeName::System,
                BeeName::Developer,
                MessageType::Info,
                "hello",
            ))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        // Message row persisted, unprocessed; outcome logged; no retry.
        let store = env.open_store();
        let pending = store
            .dequeue_messages(BeeName::Developer, false, None)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].processed);

        let log = store.recent_injections(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, "pane_not_found");
    }

    #[test]
    fn test_send_rejects_bad_input() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        assert!(bus
            .send(&Outbound::new(
                BeeName::All,
                BeeName::Queen,
                MessageType::Info,
                "hi",
            ))
            .is_err());

        assert!(bus
            .send(&Outbound::new(
                BeeName::Queen,
                BeeName::Beekeeper,
                MessageType::Info,
                "hi",
            ))
            .is_err());

        assert!(bus
            .send(&Outbound::new(
                BeeName::Queen,
                BeeName::Developer,
                MessageType::Info,
                "   ",
            ))
            .is_err());
    }

    #[test]
    fn test_custom_type_needs_config() {
        let env = TestEnv::new();
        let mut bus = env.bus();
        assert!(bus
            .send(&Outbound::new(
                BeeName::Queen,
                BeeName::Developer,
                MessageType::parse("escalation"),
                "hi",
            ))
            .is_err());

        let mut config = env.config.clone();
        config.extra_message_types = vec!["escalation".to_string()];
        let mut bus = MessageBus::new(env.open_store(), env.injector(), &config);
        bus.send(&Outbound::new(
            BeeName::Queen,
            BeeName::Developer,
            MessageType::parse("escalation"),
            "hi",
        ))
        .unwrap();
    }

    #[test]
    fn test_receive_and_ack() {
        let env = TestEnv::new();
        let mut bus = env.bus();

        let delivery = bus
            .send(&Outbound::new(
                BeeName::Queen,
                BeeName::Developer,
                MessageType::Request,
                "please",
            ))
            .unwrap();

        let inbox = bus.receive(BeeName::Developer, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_id, delivery.message_id());

        bus.ack(delivery.message_id()).unwrap();
        assert!(bus.receive(BeeName::Developer, false, None).unwrap().is_empty());

        // Idempotent ack
        bus.ack(delivery.message_id()).unwrap();

        // Still visible with include_processed
        let all = bus.receive(BeeName::Developer, true, None).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].processed);
    }

    #[test]
    fn test_send_updates_last_activity() {
        let env = TestEnv::new();
        let before = {
            let store = env.open_store();
            (
                store.get_state(BeeName::Queen).unwrap().last_activity,
                store.get_state(BeeName::Developer).unwrap().last_activity,
            )
        };

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut bus = env.bus();
        bus.send(&Outbound::new(
            BeeName::Queen,
            BeeName::Developer,
            MessageType::Info,
            "ping",
        ))
        .unwrap();

        let store = env.open_store();
        assert!(store.get_state(BeeName::Queen).unwrap().last_activity > before.0);
        assert!(store.get_state(BeeName::Developer).unwrap().last_activity > before.1);
    }

    #[test]
    fn test_receive_respects_max() {
        let env = TestEnv::new();
        let mut bus = env.bus();
        for i in 0..5 {
            bus.send(&Outbound::new(
                BeeName::Queen,
                BeeName::Developer,
                MessageType::Info,
                format!("message {i}"),
            ))
            .unwrap();
        }
        let limited = bus.receive(BeeName::Developer, false, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
