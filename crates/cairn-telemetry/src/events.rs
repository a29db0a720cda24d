//! Telemetry event data structures
//!
//! A [`TelemetryRecord`] is the canonical envelope persisted and synced. The
//! kind tag travels as `eid` and the kind payload as `edata`; both are carried
//! by the closed [`EventData`] union so a record can never disagree with its tag.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Schema version of records produced by this crate
pub const TELEMETRY_VERSION: &str = "3.0";

/// Event kind, serialized as the `eid` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Audit,
    Interact,
    Impression,
    Start,
    End,
    Error,
    Log,
    Share,
    Feedback,
    Interrupt,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Audit => "AUDIT",
            EventType::Interact => "INTERACT",
            EventType::Impression => "IMPRESSION",
            EventType::Start => "START",
            EventType::End => "END",
            EventType::Error => "ERROR",
            EventType::Log => "LOG",
            EventType::Share => "SHARE",
            EventType::Feedback => "FEEDBACK",
            EventType::Interrupt => "INTERRUPT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed the action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Producer of the event (`context.pdata`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerData {
    pub id: String,
    pub pid: String,
    pub ver: String,
}

/// One entry of the correlation list (`context.cdata`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationData {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl CorrelationData {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

/// Hierarchy summary, up to four levels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rollup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l4: Option<String>,
}

/// Where the event happened and on whose behalf
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdata: Option<ProducerData>,
    pub env: String,
    pub sid: String,
    pub did: String,
    pub cdata: Vec<CorrelationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<Rollup>,
    /// Base path used to build deep links back into the app
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deeplink_base_path: Option<String>,
}

/// Object the event is about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollup: Option<Rollup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditData {
    pub props: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractData {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub id: String,
    pub pageid: String,
    pub pos: Vec<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<InteractExtra>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractExtra {
    pub values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Visit {
    pub objid: String,
    pub objtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpressionData {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    pub pageid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub visits: Vec<Visit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dspec: Option<BTreeMap<String, Value>>,
    pub loc: String,
    pub mode: String,
    pub duration: u64,
    pub pageid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndData {
    #[serde(rename = "type")]
    pub kind: String,
    pub mode: String,
    pub duration: u64,
    pub pageid: String,
    pub summary: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorData {
    pub err: String,
    pub errtype: String,
    pub stacktrace: String,
    pub pageid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogData {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub message: String,
    pub pageid: String,
    pub params: Vec<Value>,
}

/// Direction of a share: received (`In`) or sent (`Out`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareDirection {
    In,
    #[default]
    Out,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareOrigin {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParams {
    pub transfers: u64,
    pub size: u64,
}

/// One transferred item in a share event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub origin: ShareOrigin,
    pub id: String,
    pub ver: String,
    pub params: TransferParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareData {
    pub dir: ShareDirection,
    #[serde(rename = "type")]
    pub kind: String,
    pub items: Vec<ShareItem>,
}

impl ShareData {
    /// Total number of transferred units across items
    pub fn total_transfers(&self) -> u64 {
        self.items.iter().map(|item| item.params.transfers).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackData {
    pub rating: f32,
    pub commentid: String,
    pub commenttxt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptData {
    #[serde(rename = "type")]
    pub kind: String,
    pub pageid: String,
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Audit(AuditData),
    Interact(InteractData),
    Impression(ImpressionData),
    Start(StartData),
    End(EndData),
    Error(ErrorData),
    Log(LogData),
    Share(ShareData),
    Feedback(FeedbackData),
    Interrupt(InterruptData),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::Audit(_) => EventType::Audit,
            EventData::Interact(_) => EventType::Interact,
            EventData::Impression(_) => EventType::Impression,
            EventData::Start(_) => EventType::Start,
            EventData::End(_) => EventType::End,
            EventData::Error(_) => EventType::Error,
            EventData::Log(_) => EventType::Log,
            EventData::Share(_) => EventType::Share,
            EventData::Feedback(_) => EventType::Feedback,
            EventData::Interrupt(_) => EventType::Interrupt,
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            EventData::Audit(d) => serde_json::to_value(d),
            EventData::Interact(d) => serde_json::to_value(d),
            EventData::Impression(d) => serde_json::to_value(d),
            EventData::Start(d) => serde_json::to_value(d),
            EventData::End(d) => serde_json::to_value(d),
            EventData::Error(d) => serde_json::to_value(d),
            EventData::Log(d) => serde_json::to_value(d),
            EventData::Share(d) => serde_json::to_value(d),
            EventData::Feedback(d) => serde_json::to_value(d),
            EventData::Interrupt(d) => serde_json::to_value(d),
        }
    }

    fn from_value(eid: EventType, edata: Value) -> serde_json::Result<Self> {
        // A record without edata is still a valid record of its kind
        let edata = if edata.is_null() {
            Value::Object(Default::default())
        } else {
            edata
        };

        Ok(match eid {
            EventType::Audit => EventData::Audit(serde_json::from_value(edata)?),
            EventType::Interact => EventData::Interact(serde_json::from_value(edata)?),
            EventType::Impression => EventData::Impression(serde_json::from_value(edata)?),
            EventType::Start => EventData::Start(serde_json::from_value(edata)?),
            EventType::End => EventData::End(serde_json::from_value(edata)?),
            EventType::Error => EventData::Error(serde_json::from_value(edata)?),
            EventType::Log => EventData::Log(serde_json::from_value(edata)?),
            EventType::Share => EventData::Share(serde_json::from_value(edata)?),
            EventType::Feedback => EventData::Feedback(serde_json::from_value(edata)?),
            EventType::Interrupt => EventData::Interrupt(serde_json::from_value(edata)?),
        })
    }
}

/// Canonical telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRecord", into = "WireRecord")]
pub struct TelemetryRecord {
    pub ver: String,
    /// Event timestamp, epoch millis
    pub ets: i64,
    /// Unique message id
    pub mid: String,
    pub actor: Actor,
    pub context: Context,
    pub object: Option<TelemetryObject>,
    pub tags: Vec<String>,
    pub edata: EventData,
}

impl TelemetryRecord {
    /// New undecorated record timestamped now
    pub fn new(edata: EventData) -> Self {
        Self {
            ver: TELEMETRY_VERSION.to_string(),
            ets: Utc::now().timestamp_millis(),
            mid: String::new(),
            actor: Actor::default(),
            context: Context::default(),
            object: None,
            tags: Vec::new(),
            edata,
        }
    }

    pub fn eid(&self) -> EventType {
        self.edata.event_type()
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.context.env = env.into();
        self
    }

    pub fn with_object(mut self, object: Option<TelemetryObject>) -> Self {
        self.object = object;
        self
    }

    pub fn with_rollup(mut self, rollup: Option<Rollup>) -> Self {
        self.context.rollup = rollup;
        self
    }

    pub fn with_correlation(mut self, cdata: Vec<CorrelationData>) -> Self {
        self.context.cdata = cdata;
        self
    }

    /// Share payload, if this is a share record
    pub fn as_share(&self) -> Option<&ShareData> {
        match &self.edata {
            EventData::Share(share) => Some(share),
            _ => None,
        }
    }
}

/// On-the-wire shape: tag and payload side by side
#[derive(Serialize, Deserialize)]
struct WireRecord {
    eid: EventType,
    #[serde(default)]
    ets: i64,
    #[serde(default)]
    ver: String,
    #[serde(default)]
    mid: String,
    #[serde(default)]
    actor: Actor,
    #[serde(default)]
    context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<TelemetryObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default)]
    edata: Value,
}

impl TryFrom<WireRecord> for TelemetryRecord {
    type Error = serde_json::Error;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            edata: EventData::from_value(wire.eid, wire.edata)?,
            ver: wire.ver,
            ets: wire.ets,
            mid: wire.mid,
            actor: wire.actor,
            context: wire.context,
            object: wire.object,
            tags: wire.tags,
        })
    }
}

impl From<TelemetryRecord> for WireRecord {
    fn from(record: TelemetryRecord) -> Self {
        Self {
            eid: record.eid(),
            // Payload structs only have string keys, so this cannot fail
            edata: record.edata.to_value().unwrap_or_default(),
            ets: record.ets,
            ver: record.ver,
            mid: record.mid,
            actor: record.actor,
            context: record.context,
            object: record.object,
            tags: record.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_serializes_tag_and_payload() {
        let record = TelemetryRecord::new(EventData::Interact(InteractData {
            kind: "TOUCH".to_string(),
            subtype: "play-clicked".to_string(),
            pageid: "player".to_string(),
            ..Default::default()
        }))
        .with_env("home");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["eid"], "INTERACT");
        assert_eq!(value["edata"]["type"], "TOUCH");
        assert_eq!(value["edata"]["subtype"], "play-clicked");
        assert_eq!(value["context"]["env"], "home");
        assert!(value.get("object").is_none());
    }

    #[test]
    fn test_raw_json_without_edata_parses() {
        let record: TelemetryRecord =
            serde_json::from_value(json!({"eid": "INTERRUPT", "ets": 5})).unwrap();

        assert_eq!(record.eid(), EventType::Interrupt);
        assert_eq!(record.ets, 5);
        assert_eq!(record.edata, EventData::Interrupt(InterruptData::default()));
    }

    #[test]
    fn test_unknown_eid_is_rejected() {
        let result = serde_json::from_value::<TelemetryRecord>(json!({"eid": "CLICK"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_must_match_kind() {
        let result = serde_json::from_value::<TelemetryRecord>(json!({
            "eid": "SHARE",
            "edata": {"items": "not-a-list"}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_share_total_transfers() {
        let share = ShareData {
            dir: ShareDirection::In,
            kind: "File".to_string(),
            items: vec![
                ShareItem {
                    params: TransferParams { transfers: 3, size: 10 },
                    ..Default::default()
                },
                ShareItem {
                    params: TransferParams { transfers: 4, size: 0 },
                    ..Default::default()
                },
            ],
        };
        assert_eq!(share.total_transfers(), 7);

        let record = TelemetryRecord::new(EventData::Share(share));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["edata"]["dir"], "In");
        assert_eq!(value["edata"]["items"][1]["params"]["transfers"], 4);
    }
}
