//! Event handlers wired into the worker's dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use sprintforge_events::{Event, EventHandler, HandlerDispatcher, ProjectEvent};

/// Writes every delivered event to the structured log.
pub struct AuditLogHandler;

#[async_trait]
impl EventHandler<ProjectEvent> for AuditLogHandler {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, event: &ProjectEvent) -> anyhow::Result<()> {
        info!(
            event_type = event.event_type(),
            version = event.version(),
            project_id = %event.project_id(),
            occurred_at = %event.occurred_at(),
            "project event delivered"
        );
        Ok(())
    }
}

pub fn build_dispatcher() -> HandlerDispatcher<ProjectEvent> {
    let mut dispatcher = HandlerDispatcher::new();
    dispatcher.register("*", Arc::new(AuditLogHandler));
    dispatcher
}
