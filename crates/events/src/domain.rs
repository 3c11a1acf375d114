//! Project-management domain events.
//!
//! Command handlers record these in the outbox inside the same transaction as
//! the state change they describe. Names are dotted and stable because they
//! are persisted as the outbox `event_type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sprintforge_core::{ProjectId, SprintId, TaskId, UserId};

use crate::Event;

/// Workflow column a task sits in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectEvent {
    ProjectCreated {
        project_id: ProjectId,
        name: String,
        owner_id: UserId,
        occurred_at: DateTime<Utc>,
    },
    TaskCreated {
        project_id: ProjectId,
        task_id: TaskId,
        title: String,
        occurred_at: DateTime<Utc>,
    },
    TaskAssigned {
        project_id: ProjectId,
        task_id: TaskId,
        assignee_id: UserId,
        occurred_at: DateTime<Utc>,
    },
    TaskStatusChanged {
        project_id: ProjectId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        occurred_at: DateTime<Utc>,
    },
    SprintStarted {
        project_id: ProjectId,
        sprint_id: SprintId,
        ends_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    SprintCompleted {
        project_id: ProjectId,
        sprint_id: SprintId,
        completed_tasks: u32,
        occurred_at: DateTime<Utc>,
    },
    MemberInvited {
        project_id: ProjectId,
        email: String,
        invited_by: UserId,
        occurred_at: DateTime<Utc>,
    },
}

impl ProjectEvent {
    /// Project the event belongs to; handlers use it for routing and dedup keys.
    pub fn project_id(&self) -> ProjectId {
        match self {
            ProjectEvent::ProjectCreated { project_id, .. }
            | ProjectEvent::TaskCreated { project_id, .. }
            | ProjectEvent::TaskAssigned { project_id, .. }
            | ProjectEvent::TaskStatusChanged { project_id, .. }
            | ProjectEvent::SprintStarted { project_id, .. }
            | ProjectEvent::SprintCompleted { project_id, .. }
            | ProjectEvent::MemberInvited { project_id, .. } => *project_id,
        }
    }
}

impl Event for ProjectEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProjectEvent::ProjectCreated { .. } => "project.created",
            ProjectEvent::TaskCreated { .. } => "project.task.created",
            ProjectEvent::TaskAssigned { .. } => "project.task.assigned",
            ProjectEvent::TaskStatusChanged { .. } => "project.task.status_changed",
            ProjectEvent::SprintStarted { .. } => "project.sprint.started",
            ProjectEvent::SprintCompleted { .. } => "project.sprint.completed",
            ProjectEvent::MemberInvited { .. } => "project.member.invited",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProjectEvent::ProjectCreated { occurred_at, .. }
            | ProjectEvent::TaskCreated { occurred_at, .. }
            | ProjectEvent::TaskAssigned { occurred_at, .. }
            | ProjectEvent::TaskStatusChanged { occurred_at, .. }
            | ProjectEvent::SprintStarted { occurred_at, .. }
            | ProjectEvent::SprintCompleted { occurred_at, .. }
            | ProjectEvent::MemberInvited { occurred_at, .. } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_are_namespaced_under_project() {
        let ev = ProjectEvent::TaskAssigned {
            project_id: ProjectId::new(),
            task_id: TaskId::new(),
            assignee_id: UserId::new(),
            occurred_at: Utc::now(),
        };
        assert_eq!(ev.event_type(), "project.task.assigned");
        assert!(ev.event_type().starts_with("project."));
    }

    #[test]
    fn project_id_is_exposed_for_every_variant() {
        let project_id = ProjectId::new();
        let ev = ProjectEvent::SprintCompleted {
            project_id,
            sprint_id: SprintId::new(),
            completed_tasks: 7,
            occurred_at: Utc::now(),
        };
        assert_eq!(ev.project_id(), project_id);
    }
}
