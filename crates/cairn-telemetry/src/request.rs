//! Typed capture requests
//!
//! Each telemetry kind has its own request struct; [`TelemetryRequest`] closes
//! over them so capture can validate once at the boundary and build a
//! [`TelemetryRecord`] without guessing at field shapes.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, TelemetryError};
use crate::events::{
    Actor, AuditData, CorrelationData, EndData, ErrorData, EventData, FeedbackData,
    ImpressionData, InteractData, InteractExtra, InterruptData, LogData, Rollup, ShareData,
    ShareDirection, ShareItem, ShareOrigin, StartData, TelemetryObject, TelemetryRecord,
    TransferParams, Visit,
};

#[derive(Debug, Clone, Default)]
pub struct AuditRequest {
    pub env: String,
    pub actor: Option<Actor>,
    pub current_state: Option<String>,
    pub updated_properties: Vec<String>,
    pub object: Option<TelemetryObject>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct InteractRequest {
    pub kind: String,
    pub subtype: String,
    pub id: String,
    pub page_id: String,
    pub pos: Vec<BTreeMap<String, String>>,
    pub value_map: BTreeMap<String, Value>,
    pub env: String,
    pub object: Option<TelemetryObject>,
    pub rollup: Option<Rollup>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct ImpressionRequest {
    pub kind: String,
    pub subtype: String,
    pub page_id: String,
    pub uri: Option<String>,
    pub visits: Vec<Visit>,
    pub env: String,
    pub object: Option<TelemetryObject>,
    pub rollup: Option<Rollup>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub kind: String,
    pub device_specification: Option<BTreeMap<String, Value>>,
    pub loc: String,
    pub mode: String,
    pub duration: u64,
    pub page_id: String,
    pub env: String,
    pub object: Option<TelemetryObject>,
    pub rollup: Option<Rollup>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct EndRequest {
    pub kind: String,
    pub mode: String,
    pub duration: u64,
    pub page_id: String,
    pub summary: Vec<Value>,
    pub env: String,
    pub object: Option<TelemetryObject>,
    pub rollup: Option<Rollup>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorRequest {
    pub error_code: String,
    pub error_type: String,
    pub stacktrace: String,
    pub page_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogRequest {
    pub kind: String,
    pub level: String,
    pub message: String,
    pub page_id: String,
    pub params: Vec<Value>,
    pub env: String,
    pub actor_type: Option<String>,
}

/// One item of a share request
#[derive(Debug, Clone, Default)]
pub struct ShareItemRequest {
    pub kind: String,
    pub origin: String,
    pub identifier: String,
    pub pkg_version: String,
    pub transfer_count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ShareRequest {
    pub dir: ShareDirection,
    pub kind: String,
    pub items: Vec<ShareItemRequest>,
    pub env: String,
    pub object: Option<TelemetryObject>,
    pub rollup: Option<Rollup>,
    pub correlation: Vec<CorrelationData>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackRequest {
    pub rating: f32,
    pub comments: String,
    pub env: String,
    pub object: Option<TelemetryObject>,
}

#[derive(Debug, Clone, Default)]
pub struct InterruptRequest {
    pub kind: String,
    pub page_id: String,
}

/// Capture request for any telemetry kind
#[derive(Debug, Clone)]
pub enum TelemetryRequest {
    Audit(AuditRequest),
    Interact(InteractRequest),
    Impression(ImpressionRequest),
    Start(StartRequest),
    End(EndRequest),
    Error(ErrorRequest),
    Log(LogRequest),
    Share(ShareRequest),
    Feedback(FeedbackRequest),
    Interrupt(InterruptRequest),
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TelemetryError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

impl TelemetryRequest {
    /// Check the fields every record of this kind must carry
    pub fn validate(&self) -> Result<()> {
        match self {
            TelemetryRequest::Audit(req) => require("audit.env", &req.env),
            TelemetryRequest::Interact(req) => {
                require("interact.type", &req.kind)?;
                require("interact.env", &req.env)
            }
            TelemetryRequest::Impression(req) => {
                require("impression.type", &req.kind)?;
                require("impression.page_id", &req.page_id)
            }
            TelemetryRequest::Start(req) => require("start.type", &req.kind),
            TelemetryRequest::End(req) => require("end.type", &req.kind),
            TelemetryRequest::Error(req) => require("error.error_code", &req.error_code),
            TelemetryRequest::Log(req) => {
                require("log.level", &req.level)?;
                require("log.message", &req.message)
            }
            TelemetryRequest::Share(req) => {
                if req.items.is_empty() {
                    return Err(TelemetryError::Validation(
                        "share must carry at least one item".to_string(),
                    ));
                }
                req.items
                    .iter()
                    .try_for_each(|item| require("share.item.identifier", &item.identifier))
            }
            TelemetryRequest::Feedback(req) => {
                if !(0.0..=5.0).contains(&req.rating) {
                    return Err(TelemetryError::Validation(format!(
                        "feedback rating {} outside 0..=5",
                        req.rating
                    )));
                }
                Ok(())
            }
            TelemetryRequest::Interrupt(req) => require("interrupt.type", &req.kind),
        }
    }

    /// Build the undecorated record for this request
    pub fn into_record(self) -> TelemetryRecord {
        match self {
            TelemetryRequest::Audit(req) => {
                let mut record = TelemetryRecord::new(EventData::Audit(AuditData {
                    props: req.updated_properties,
                    state: req.current_state,
                }))
                .with_env(req.env)
                .with_object(req.object)
                .with_correlation(req.correlation);
                if let Some(actor) = req.actor {
                    record.actor = actor;
                }
                record
            }
            TelemetryRequest::Interact(req) => {
                let extra = (!req.value_map.is_empty()).then(|| InteractExtra {
                    values: req.value_map,
                });
                TelemetryRecord::new(EventData::Interact(InteractData {
                    kind: req.kind,
                    subtype: req.subtype,
                    id: req.id,
                    pageid: req.page_id,
                    pos: req.pos,
                    extra,
                }))
                .with_env(req.env)
                .with_object(req.object)
                .with_rollup(req.rollup)
                .with_correlation(req.correlation)
            }
            TelemetryRequest::Impression(req) => {
                TelemetryRecord::new(EventData::Impression(ImpressionData {
                    kind: req.kind,
                    subtype: req.subtype,
                    pageid: req.page_id,
                    uri: req.uri,
                    visits: req.visits,
                }))
                .with_env(req.env)
                .with_object(req.object)
                .with_rollup(req.rollup)
                .with_correlation(req.correlation)
            }
            TelemetryRequest::Start(req) => TelemetryRecord::new(EventData::Start(StartData {
                kind: req.kind,
                dspec: req.device_specification,
                loc: req.loc,
                mode: req.mode,
                duration: req.duration,
                pageid: req.page_id,
            }))
            .with_env(req.env)
            .with_object(req.object)
            .with_rollup(req.rollup)
            .with_correlation(req.correlation),
            TelemetryRequest::End(req) => TelemetryRecord::new(EventData::End(EndData {
                kind: req.kind,
                mode: req.mode,
                duration: req.duration,
                pageid: req.page_id,
                summary: req.summary,
            }))
            .with_env(req.env)
            .with_object(req.object)
            .with_rollup(req.rollup)
            .with_correlation(req.correlation),
            TelemetryRequest::Error(req) => TelemetryRecord::new(EventData::Error(ErrorData {
                err: req.error_code,
                errtype: req.error_type,
                stacktrace: req.stacktrace,
                pageid: req.page_id,
            })),
            TelemetryRequest::Log(req) => {
                let mut record = TelemetryRecord::new(EventData::Log(LogData {
                    kind: req.kind,
                    level: req.level,
                    message: req.message,
                    pageid: req.page_id,
                    params: req.params,
                }))
                .with_env(req.env);
                if let Some(actor_type) = req.actor_type {
                    record.actor.kind = actor_type;
                }
                record
            }
            TelemetryRequest::Share(req) => {
                let items = req
                    .items
                    .into_iter()
                    .map(|item| ShareItem {
                        kind: item.kind,
                        origin: ShareOrigin {
                            id: item.origin,
                            kind: "Device".to_string(),
                        },
                        id: item.identifier,
                        ver: item.pkg_version,
                        params: TransferParams {
                            transfers: item.transfer_count,
                            size: item.size,
                        },
                    })
                    .collect();
                TelemetryRecord::new(EventData::Share(ShareData {
                    dir: req.dir,
                    kind: req.kind,
                    items,
                }))
                .with_env(req.env)
                .with_object(req.object)
                .with_rollup(req.rollup)
                .with_correlation(req.correlation)
            }
            TelemetryRequest::Feedback(req) => {
                let commentid = req
                    .object
                    .as_ref()
                    .map(|object| object.id.clone())
                    .unwrap_or_default();
                TelemetryRecord::new(EventData::Feedback(FeedbackData {
                    rating: req.rating,
                    commentid,
                    commenttxt: req.comments,
                }))
                .with_env(req.env)
                .with_object(req.object)
            }
            TelemetryRequest::Interrupt(req) => {
                TelemetryRecord::new(EventData::Interrupt(InterruptData {
                    kind: req.kind,
                    pageid: req.page_id,
                }))
            }
        }
    }
}
