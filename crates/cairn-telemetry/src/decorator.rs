//! Record decoration
//!
//! Fills in the context a capture call cannot know on its own: actor,
//! session, device, channel, producer and group correlation.

use chrono::Utc;
use uuid::Uuid;

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::events::{Context, CorrelationData, EventType, ProducerData, TelemetryRecord, TELEMETRY_VERSION};
use crate::session::SessionContext;

/// Default actor type for records that do not set one
const DEFAULT_ACTOR_TYPE: &str = "User";

/// Default environment for records that do not set one
const DEFAULT_ENV: &str = "app";

/// Correlation type used for the active group
const GROUP_CORRELATION_TYPE: &str = "group";

/// Record rendered for the raw event table
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedEvent {
    /// Serialized record
    pub event: String,
    pub event_type: EventType,
    /// Local time the row was prepared, epoch millis
    pub timestamp: i64,
    pub priority: i64,
}

/// Decorates records with device and producer context
#[derive(Debug, Clone)]
pub struct TelemetryDecorator {
    device_id: String,
    producer: ProducerData,
    default_channel: String,
}

impl TelemetryDecorator {
    pub fn new(config: &TelemetryConfig, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            producer: ProducerData {
                id: config.producer_id.clone(),
                pid: config.producer_pid.clone(),
                ver: config.producer_version.clone(),
            },
            default_channel: config.default_channel.clone(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Attach actor, session, device, channel and correlation context
    ///
    /// `min_allowed_offset` is the collector clock skew in millis; it is
    /// added to the event timestamp.
    pub fn decorate(
        &self,
        mut record: TelemetryRecord,
        actor_id: &str,
        session_id: &str,
        group_id: Option<&str>,
        min_allowed_offset: i64,
        channel_id: Option<&str>,
    ) -> TelemetryRecord {
        if record.ets <= 0 {
            record.ets = Utc::now().timestamp_millis();
        }
        record.ets += min_allowed_offset;

        if record.mid.is_empty() {
            record.mid = format!("{}:{}", record.eid(), Uuid::new_v4());
        }
        if record.ver.is_empty() {
            record.ver = TELEMETRY_VERSION.to_string();
        }

        if record.actor.id.is_empty() {
            record.actor.id = actor_id.to_string();
        }
        if record.actor.kind.is_empty() {
            record.actor.kind = DEFAULT_ACTOR_TYPE.to_string();
        }

        self.patch_context(&mut record.context, session_id, channel_id);

        if let Some(gid) = group_id {
            let already_correlated = record
                .context
                .cdata
                .iter()
                .any(|c| c.kind == GROUP_CORRELATION_TYPE && c.id == gid);
            if !already_correlated {
                record
                    .context
                    .cdata
                    .push(CorrelationData::new(gid, GROUP_CORRELATION_TYPE));
            }
        }

        record
    }

    /// Decorate from a resolved session context
    pub fn decorate_with(
        &self,
        record: TelemetryRecord,
        session: &SessionContext,
        min_allowed_offset: i64,
    ) -> TelemetryRecord {
        self.decorate(
            record,
            &session.actor_id,
            &session.session_id,
            session.group_id.as_deref(),
            min_allowed_offset,
            session.channel_id.as_deref(),
        )
    }

    /// Render the storage form of a decorated record
    pub fn prepare(&self, record: &TelemetryRecord, priority: i64) -> Result<PreparedEvent> {
        Ok(PreparedEvent {
            event: serde_json::to_string(record)?,
            event_type: record.eid(),
            timestamp: Utc::now().timestamp_millis(),
            priority,
        })
    }

    /// Bare context for hosts that build records outside this crate
    pub fn build_context(&self, session_id: &str, channel_id: Option<&str>) -> Context {
        let mut context = Context::default();
        self.patch_context(&mut context, session_id, channel_id);
        context
    }

    fn patch_context(&self, context: &mut Context, session_id: &str, channel_id: Option<&str>) {
        context.sid = session_id.to_string();
        context.did = self.device_id.clone();
        context.channel = channel_id
            .filter(|c| !c.is_empty())
            .unwrap_or(self.default_channel.as_str())
            .to_string();
        if context.pdata.is_none() {
            context.pdata = Some(self.producer.clone());
        }
        if context.env.is_empty() {
            context.env = DEFAULT_ENV.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, InterruptData};

    fn decorator() -> TelemetryDecorator {
        TelemetryDecorator::new(&TelemetryConfig::default(), "device-1")
    }

    fn interrupt() -> TelemetryRecord {
        TelemetryRecord::new(EventData::Interrupt(InterruptData {
            kind: "background".to_string(),
            pageid: "player".to_string(),
        }))
    }

    #[test]
    fn test_decorate_fills_context() {
        let record = decorator().decorate(interrupt(), "user-1", "session-1", None, 0, Some("channel-7"));

        assert_eq!(record.actor.id, "user-1");
        assert_eq!(record.actor.kind, "User");
        assert_eq!(record.context.sid, "session-1");
        assert_eq!(record.context.did, "device-1");
        assert_eq!(record.context.channel, "channel-7");
        assert_eq!(record.context.env, "app");
        assert_eq!(record.context.pdata.as_ref().unwrap().id, "cairn.app");
        assert!(record.mid.starts_with("INTERRUPT:"));
        assert!(record.context.cdata.is_empty());
    }

    #[test]
    fn test_group_is_correlated_once() {
        let decorator = decorator();
        let record = decorator.decorate(interrupt(), "u", "s", Some("group-1"), 0, None);
        let record = decorator.decorate(record, "u", "s", Some("group-1"), 0, None);

        assert_eq!(record.context.cdata, vec![CorrelationData::new("group-1", "group")]);
        assert_eq!(record.context.channel, "in.cairn");
    }

    #[test]
    fn test_offset_shifts_timestamp() {
        let mut record = interrupt();
        record.ets = 1_000;

        let record = decorator().decorate(record, "u", "s", None, 250, None);
        assert_eq!(record.ets, 1_250);
    }

    #[test]
    fn test_existing_actor_is_kept() {
        let mut record = interrupt();
        record.actor.id = "system".to_string();
        record.actor.kind = "System".to_string();

        let record = decorator().decorate(record, "user-1", "s", None, 0, None);
        assert_eq!(record.actor.id, "system");
        assert_eq!(record.actor.kind, "System");
    }

    #[test]
    fn test_prepare_renders_row() {
        let decorator = decorator();
        let record = decorator.decorate(interrupt(), "u", "s", None, 0, None);
        let prepared = decorator.prepare(&record, 1).unwrap();

        assert_eq!(prepared.event_type, EventType::Interrupt);
        assert_eq!(prepared.priority, 1);
        let parsed: TelemetryRecord = serde_json::from_str(&prepared.event).unwrap();
        assert_eq!(parsed, record);
    }
}
