//! Staged export and import
//!
//! Both flows are a fixed chain of [`Stage`]s, each taking the context and
//! handing it on to the next. The chain stops at the first failing stage and
//! reports which one it was.

pub mod export;
pub mod import;
pub mod manifest;

use async_trait::async_trait;
use std::time::Instant;

use crate::error::{Result, TelemetryError};

pub use export::{ExportContext, ExportResponse, ExportTelemetryRequest};
pub use import::{ImportContext, ImportTelemetryRequest};
pub use manifest::ExportManifest;

/// One step of a pipeline
#[async_trait]
pub trait Stage<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: C) -> Result<C>;
}

/// Ordered chain of stages
pub struct Pipeline<C: Send> {
    label: &'static str,
    stages: Vec<Box<dyn Stage<C>>>,
}

impl<C: Send> Pipeline<C> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: impl Stage<C> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order, stopping at the first failure
    pub async fn run(&self, mut ctx: C) -> Result<C> {
        let started = Instant::now();
        for (index, stage) in self.stages.iter().enumerate() {
            tracing::debug!(pipeline = self.label, stage = stage.name(), index, "running stage");
            ctx = stage.run(ctx).await.map_err(|e| {
                tracing::warn!(pipeline = self.label, stage = stage.name(), error = %e, "stage failed");
                TelemetryError::Stage {
                    stage: stage.name(),
                    source: Box::new(e),
                }
            })?;
        }

        tracing::debug!(
            pipeline = self.label,
            stages = self.stages.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(ctx)
    }
}
