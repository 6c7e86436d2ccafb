use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Executing,
    Terminated,
    Aborted,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executing => "EXECUTING",
            Self::Terminated => "TERMINATED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

impl FromStr for InstanceStatus {
    type Err = InstanceStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTING" => Ok(Self::Executing),
            "TERMINATED" => Ok(Self::Terminated),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(InstanceStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InstanceStatus`] string.
#[derive(Debug, Clone)]
pub struct InstanceStatusParseError(pub String);

impl fmt::Display for InstanceStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid instance status: {:?}", self.0)
    }
}

impl std::error::Error for InstanceStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling discipline of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    Default,
    Priority,
}

impl fmt::Display for QueueDiscipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Priority => "priority",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueDiscipline {
    type Err = QueueDisciplineParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "priority" => Ok(Self::Priority),
            other => Err(QueueDisciplineParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`QueueDiscipline`] string.
#[derive(Debug, Clone)]
pub struct QueueDisciplineParseError(pub String);

impl fmt::Display for QueueDisciplineParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid queue scheduler: {:?}", self.0)
    }
}

impl std::error::Error for QueueDisciplineParseError {}

// ---------------------------------------------------------------------------

/// What a schedule does when an instance it launched terminates with errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OnFailureBehavior {
    Continue,
    Suspend,
}

impl fmt::Display for OnFailureBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Continue => "CONTINUE",
            Self::Suspend => "SUSPEND",
        };
        f.write_str(s)
    }
}

impl FromStr for OnFailureBehavior {
    type Err = OnFailureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTINUE" => Ok(Self::Continue),
            "SUSPEND" => Ok(Self::Suspend),
            other => Err(OnFailureParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OnFailureBehavior`] string.
#[derive(Debug, Clone)]
pub struct OnFailureParseError(pub String);

impl fmt::Display for OnFailureParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid onfailure behavior: {:?}", self.0)
    }
}

impl std::error::Error for OnFailureParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow template row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub workflow_id: i64,
    pub workflow_name: String,
    pub workflow_xml: String,
    pub workflow_group: String,
    pub workflow_comment: String,
    pub workflow_lastcommit: Option<String>,
}

/// A workflow instance row. The savepoint column holds the authoritative
/// XML record of the instance's execution history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceRow {
    pub workflow_instance_id: i64,
    pub node_name: String,
    pub workflow_id: i64,
    pub workflow_schedule_id: Option<i64>,
    pub workflow_instance_host: Option<String>,
    pub workflow_instance_start: DateTime<Utc>,
    pub workflow_instance_end: Option<DateTime<Utc>>,
    pub workflow_instance_status: InstanceStatus,
    pub workflow_instance_errors: i32,
    pub workflow_instance_savepoint: Option<String>,
}

/// A named execution queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueRow {
    pub queue_id: i64,
    pub queue_name: String,
    pub queue_concurrency: i32,
    pub queue_scheduler: QueueDiscipline,
    pub queue_dynamic: bool,
}

/// A retry schedule definition. The XML body lists `<level>` elements.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RetryScheduleRow {
    pub schedule_id: i64,
    pub schedule_name: String,
    pub schedule_xml: String,
}

/// A recurring workflow launch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowScheduleRow {
    pub workflow_schedule_id: i64,
    pub node_name: String,
    pub workflow_id: i64,
    pub workflow_schedule: String,
    pub workflow_schedule_onfailure: OnFailureBehavior,
    pub workflow_schedule_user: Option<String>,
    pub workflow_schedule_host: Option<String>,
    pub workflow_schedule_active: bool,
    pub workflow_schedule_comment: String,
}

/// A notification subscription target.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationRow {
    pub notification_id: i64,
    pub notification_type_id: i64,
    pub notification_name: String,
    pub notification_subscribe_all: bool,
    pub notification_parameters: String,
}

/// A notification plugin type. The plugin binary on disk is named after
/// `notification_type_name`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationTypeRow {
    pub notification_type_id: i64,
    pub notification_type_name: String,
    pub notification_type_description: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_display_roundtrip() {
        let variants = [
            InstanceStatus::Executing,
            InstanceStatus::Terminated,
            InstanceStatus::Aborted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InstanceStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn instance_status_invalid() {
        assert!("RUNNING".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn queue_discipline_display_roundtrip() {
        let variants = [QueueDiscipline::Default, QueueDiscipline::Priority];
        for v in &variants {
            let s = v.to_string();
            let parsed: QueueDiscipline = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn queue_discipline_invalid() {
        assert!("fifo".parse::<QueueDiscipline>().is_err());
    }

    #[test]
    fn onfailure_display_roundtrip() {
        let variants = [OnFailureBehavior::Continue, OnFailureBehavior::Suspend];
        for v in &variants {
            let s = v.to_string();
            let parsed: OnFailureBehavior = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn onfailure_invalid() {
        assert!("HALT".parse::<OnFailureBehavior>().is_err());
    }
}
