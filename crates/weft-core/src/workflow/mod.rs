//! Workflow templates: parsing, validation, parameter checking and CRUD.
//!
//! A template is an XML document: `<workflow>` with `<parameters>` and
//! `<subjobs>` children; jobs nest recursively through their own
//! `<subjobs>`. Validation runs at load/create time so a stored workflow
//! is always structurally sound.

use sqlx::PgPool;

use weft_db::queries::{notifications as notification_db, workflows as workflow_db};

use crate::error::{EngineError, ErrorCode, Result};
use crate::xml::{Document, NodeId};
use crate::xpath;

pub const WORKFLOW_NAME_MAX_LEN: usize = 64;

/// A loaded workflow template.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub group: String,
    pub comment: String,
    pub doc: Document,
    /// Subscribed notification ids.
    pub notifications: Vec<i64>,
}

impl Workflow {
    /// Build a template from raw XML, without a database identity.
    /// Validates the document.
    pub fn from_xml(name: impl Into<String>, xml: &str) -> Result<Self> {
        let name = name.into();
        if !check_name(&name) {
            return Err(EngineError::invalid_parameter(
                "Workflow",
                format!("invalid workflow name {name:?}"),
            ));
        }
        let doc = Document::parse(xml)?;
        validate_document(&doc)?;
        Ok(Self {
            id: 0,
            name,
            group: String::new(),
            comment: String::new(),
            doc,
            notifications: Vec::new(),
        })
    }

    /// Load a template (and its notification subscriptions) by name.
    pub async fn load(pool: &PgPool, name: &str) -> Result<Self> {
        let row = workflow_db::get_workflow_by_name(pool, name)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::unknown_workflow(name))?;

        let notifications = workflow_db::list_workflow_notifications(pool, row.workflow_id)
            .await
            .map_err(db_err)?;

        let doc = Document::parse(&row.workflow_xml)?;

        Ok(Self {
            id: row.workflow_id,
            name: row.workflow_name,
            group: row.workflow_group,
            comment: row.workflow_comment,
            doc,
            notifications,
        })
    }

    /// Load a template by id.
    pub async fn load_by_id(pool: &PgPool, id: i64) -> Result<Self> {
        let row = workflow_db::get_workflow(pool, id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::unknown_workflow(id))?;

        let notifications = workflow_db::list_workflow_notifications(pool, row.workflow_id)
            .await
            .map_err(db_err)?;

        let doc = Document::parse(&row.workflow_xml)?;

        Ok(Self {
            id: row.workflow_id,
            name: row.workflow_name,
            group: row.workflow_group,
            comment: row.workflow_comment,
            doc,
            notifications,
        })
    }

    /// The declared parameter names, in document order.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(parameters) = self.doc.first_child_named(self.doc.root(), "parameters") {
            for p in self.doc.children_named(parameters, "parameter") {
                if let Some(name) = self.doc.attr(p, "name") {
                    names.push(name.to_owned());
                }
            }
        }
        names
    }

    /// Check the supplied launch parameters against the template: every
    /// name must be declared, and the count must match exactly.
    pub fn check_input_parameters(&self, parameters: &[(String, String)]) -> Result<()> {
        let declared = self.parameter_names();

        for (name, _) in parameters {
            if !declared.iter().any(|d| d == name) {
                return Err(EngineError::new(
                    "Workflow",
                    format!("unknown parameter: {name}"),
                    ErrorCode::InvalidWorkflowParameters,
                ));
            }
        }

        if declared.len() != parameters.len() {
            return Err(EngineError::new(
                "Workflow",
                format!(
                    "invalid number of parameters, workflow expects {}, but {} are given",
                    declared.len(),
                    parameters.len()
                ),
                ErrorCode::InvalidWorkflowParameters,
            ));
        }

        Ok(())
    }
}

/// Workflow names: `[A-Za-z0-9_-]{1,64}`.
pub fn check_name(name: &str) -> bool {
    if name.is_empty() || name.len() > WORKFLOW_NAME_MAX_LEN {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Structural validation of a workflow document.
///
/// Rejects unknown task types, BINARY tasks without a path, SCRIPT tasks
/// without a name or script body, empty jobs, and malformed expression
/// attributes.
pub fn validate_document(doc: &Document) -> Result<()> {
    for node in doc.descendant_elements(doc.root()) {
        match doc.name(node) {
            Some("task") => validate_task(doc, node)?,
            Some("job") => {
                let task_count = doc
                    .first_child_named(node, "tasks")
                    .map(|tasks| doc.children_named(tasks, "task").len())
                    .unwrap_or(0);
                if task_count == 0 {
                    return Err(EngineError::invalid_parameter(
                        "Workflow",
                        "a job cannot be empty",
                    ));
                }
                for attr in ["loop", "condition", "iteration-condition"] {
                    if let Some(expr) = doc.attr(node, attr) {
                        xpath::parse(expr)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_task(doc: &Document, task: NodeId) -> Result<()> {
    let task_type = doc.attr(task, "type").unwrap_or("BINARY");
    match task_type {
        "BINARY" => {
            if doc.attr(task, "path").map(str::is_empty).unwrap_or(true) {
                return Err(EngineError::invalid_parameter(
                    "Workflow",
                    "binary task must have a non-empty 'path' attribute",
                ));
            }
        }
        "SCRIPT" => {
            if doc.attr(task, "name").map(str::is_empty).unwrap_or(true) {
                return Err(EngineError::invalid_parameter(
                    "Workflow",
                    "script task must have a non-empty 'name' attribute",
                ));
            }
            let Some(script) = doc.first_child_named(task, "script") else {
                return Err(EngineError::invalid_parameter(
                    "Workflow",
                    "script tasks must have a script node",
                ));
            };
            let has_value = doc.first_child_named(script, "value").is_some();
            if doc.text(script).trim().is_empty() && !has_value {
                return Err(EngineError::invalid_parameter(
                    "Workflow",
                    "script cannot be empty",
                ));
            }
        }
        other => {
            return Err(EngineError::invalid_parameter(
                "Workflow",
                format!("invalid type attribute value {other:?}, must be 'BINARY' or 'SCRIPT'"),
            ));
        }
    }

    // Expression attributes inside inputs must at least parse.
    for input in doc.children_named(task, "input") {
        for value in doc.children_named(input, "value") {
            if let Some(select) = doc.attr(value, "select") {
                xpath::parse(select)?;
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Task attribute model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    /// An on-disk executable.
    Binary { path: String },
    /// An inline script; the body is written out and executed.
    Script { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParametersMode {
    Cmdline,
    Env,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMethod {
    Text,
    Xml,
}

/// Parsed attributes of a `<task>` node.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub parameters_mode: ParametersMode,
    pub output_method: OutputMethod,
    pub merge_stderr: bool,
    pub use_agent: bool,
    pub user: Option<String>,
    pub host: Option<String>,
    pub wd: Option<String>,
    pub retry_schedule: Option<String>,
    pub retry_retval_on_error: Option<i32>,
    pub queue: String,
    pub queue_priority: i64,
}

impl TaskSpec {
    pub fn from_node(doc: &Document, task: NodeId) -> Result<Self> {
        let task_type = match doc.attr(task, "type").unwrap_or("BINARY") {
            "BINARY" => TaskType::Binary {
                path: doc.attr(task, "path").unwrap_or_default().to_owned(),
            },
            "SCRIPT" => TaskType::Script {
                name: doc.attr(task, "name").unwrap_or_default().to_owned(),
            },
            other => {
                return Err(EngineError::new(
                    "Task",
                    format!("unknown task type: {other}"),
                    ErrorCode::UnknownType,
                ));
            }
        };

        let parameters_mode = match doc.attr(task, "parameters-mode").unwrap_or("CMDLINE") {
            "ENV" => ParametersMode::Env,
            _ => ParametersMode::Cmdline,
        };

        let output_method = match doc.attr(task, "output-method").unwrap_or("TEXT") {
            "XML" => OutputMethod::Xml,
            _ => OutputMethod::Text,
        };

        let retry_retval_on_error = match doc.attr(task, "retry_retval_on_error") {
            Some(v) => Some(v.parse().map_err(|_| {
                EngineError::invalid_parameter(
                    "Task",
                    format!("retry_retval_on_error is not an integer: {v:?}"),
                )
            })?),
            None => None,
        };

        let queue_priority = doc
            .attr(task, "queue_priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            task_type,
            parameters_mode,
            output_method,
            merge_stderr: attr_flag(doc, task, "merge-stderr"),
            use_agent: attr_flag(doc, task, "use-agent"),
            user: doc.attr(task, "user").map(str::to_owned),
            host: doc.attr(task, "host").map(str::to_owned),
            wd: doc.attr(task, "wd").map(str::to_owned),
            retry_schedule: doc.attr(task, "retry_schedule").map(str::to_owned),
            retry_retval_on_error,
            queue: doc
                .attr(task, "queue")
                .unwrap_or("default")
                .to_owned(),
            queue_priority,
        })
    }

    /// The name a task is addressed by: its binary path or script name.
    pub fn label(&self) -> &str {
        match &self.task_type {
            TaskType::Binary { path } => path,
            TaskType::Script { name } => name,
        }
    }
}

fn attr_flag(doc: &Document, node: NodeId, name: &str) -> bool {
    matches!(doc.attr(node, name), Some("yes") | Some("true") | Some("1"))
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// Create a workflow template. Validates the name and document, rejects
/// duplicates, and auto-subscribes `subscribe_all` notifications.
pub async fn create(
    pool: &PgPool,
    name: &str,
    xml: &str,
    group: &str,
    comment: &str,
) -> Result<i64> {
    create_edit_check(name, xml)?;

    if workflow_db::workflow_name_exists(pool, name)
        .await
        .map_err(db_err)?
    {
        return Err(EngineError::new(
            "Workflow",
            "workflow name already exists",
            ErrorCode::WorkflowAlreadyExists,
        ));
    }

    let id = workflow_db::insert_workflow(pool, name, xml, group, comment, None)
        .await
        .map_err(db_err)?;

    // Notifications flagged subscribe-all attach to every new workflow.
    let auto = notification_db::list_subscribe_all(pool)
        .await
        .map_err(db_err)?;
    for notification_id in auto {
        workflow_db::subscribe_notification(pool, id, notification_id)
            .await
            .map_err(db_err)?;
    }

    Ok(id)
}

/// Edit a workflow template in place.
pub async fn edit(
    pool: &PgPool,
    id: i64,
    name: &str,
    xml: &str,
    group: &str,
    comment: &str,
) -> Result<()> {
    create_edit_check(name, xml)?;

    let rows = workflow_db::update_workflow(pool, id, name, xml, group, comment)
        .await
        .map_err(db_err)?;
    if rows == 0 {
        return Err(EngineError::unknown_workflow(id));
    }
    Ok(())
}

/// Delete a workflow and its dependent rows.
pub async fn delete(pool: &PgPool, id: i64) -> Result<()> {
    let deleted = workflow_db::delete_workflow(pool, id).await.map_err(db_err)?;
    if !deleted {
        return Err(EngineError::unknown_workflow(id));
    }
    Ok(())
}

/// Subscribe a workflow to a notification.
pub async fn subscribe_notification(
    pool: &PgPool,
    workflow_id: i64,
    notification_id: i64,
) -> Result<()> {
    let exists = notification_db::get_notification(pool, notification_id)
        .await
        .map_err(db_err)?
        .is_some();
    if !exists {
        return Err(EngineError::new(
            "Workflow",
            "notification id not found",
            ErrorCode::UnknownNotification,
        ));
    }
    workflow_db::subscribe_notification(pool, workflow_id, notification_id)
        .await
        .map_err(db_err)
}

/// Unsubscribe a workflow from a notification.
pub async fn unsubscribe_notification(
    pool: &PgPool,
    workflow_id: i64,
    notification_id: i64,
) -> Result<()> {
    let rows = workflow_db::unsubscribe_notification(pool, workflow_id, notification_id)
        .await
        .map_err(db_err)?;
    if rows == 0 {
        return Err(EngineError::new(
            "Workflow",
            "workflow was not subscribed to this notification",
            ErrorCode::UnknownNotification,
        ));
    }
    Ok(())
}

fn create_edit_check(name: &str, xml: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::invalid_parameter(
            "Workflow",
            "workflow name cannot be empty",
        ));
    }
    if !check_name(name) {
        return Err(EngineError::invalid_parameter(
            "Workflow",
            "invalid workflow name",
        ));
    }
    let doc = Document::parse(xml)?;
    validate_document(&doc)
}

fn db_err(err: anyhow::Error) -> EngineError {
    EngineError::new("DB", format!("{err:#}"), ErrorCode::DbError)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const VALID: &str = r#"<workflow><parameters><parameter name="target"/></parameters><subjobs><job><tasks><task type="BINARY" path="/bin/echo"/></tasks></job></subjobs></workflow>"#;

    #[test]
    fn name_rules() {
        assert!(check_name("build-nightly_2"));
        assert!(!check_name(""));
        assert!(!check_name("has space"));
        assert!(!check_name(&"x".repeat(65)));
        assert!(check_name(&"x".repeat(64)));
    }

    #[test]
    fn valid_template_parses() {
        let wf = Workflow::from_xml("demo", VALID).unwrap();
        assert_eq!(wf.parameter_names(), vec!["target"]);
    }

    #[test]
    fn empty_job_rejected() {
        let xml = r#"<workflow><subjobs><job><tasks/></job></subjobs></workflow>"#;
        let err = Workflow::from_xml("demo", xml).unwrap_err();
        assert!(err.message.contains("empty"));
    }

    #[test]
    fn binary_task_requires_path() {
        let xml = r#"<workflow><subjobs><job><tasks><task type="BINARY"/></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());

        let xml = r#"<workflow><subjobs><job><tasks><task type="BINARY" path=""/></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());
    }

    #[test]
    fn script_task_requires_name_and_body() {
        let xml = r#"<workflow><subjobs><job><tasks><task type="SCRIPT" name="s"/></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());

        let xml = r#"<workflow><subjobs><job><tasks><task type="SCRIPT" name="s"><script>   </script></task></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());

        let xml = r#"<workflow><subjobs><job><tasks><task type="SCRIPT" name="s"><script>#!/bin/sh
echo hi</script></task></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_ok());
    }

    #[test]
    fn unknown_type_rejected() {
        let xml = r#"<workflow><subjobs><job><tasks><task type="PYTHON" path="x"/></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());
    }

    #[test]
    fn malformed_condition_rejected() {
        let xml = r#"<workflow><subjobs><job condition="count("><tasks><task path="/bin/true"/></tasks></job></subjobs></workflow>"#;
        assert!(Workflow::from_xml("demo", xml).is_err());
    }

    #[test]
    fn parameter_check_exact_match() {
        let wf = Workflow::from_xml("demo", VALID).unwrap();

        let ok = vec![("target".to_owned(), "prod".to_owned())];
        assert!(wf.check_input_parameters(&ok).is_ok());

        // Missing parameter.
        let err = wf.check_input_parameters(&[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidWorkflowParameters);

        // Misnamed parameter.
        let bad = vec![("traget".to_owned(), "prod".to_owned())];
        let err = wf.check_input_parameters(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidWorkflowParameters);

        // Extra parameter.
        let extra = vec![
            ("target".to_owned(), "prod".to_owned()),
            ("more".to_owned(), "x".to_owned()),
        ];
        let err = wf.check_input_parameters(&extra).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidWorkflowParameters);
    }

    #[test]
    fn task_spec_defaults() {
        let doc = Document::parse(r#"<task path="/bin/echo"/>"#).unwrap();
        let spec = TaskSpec::from_node(&doc, doc.root()).unwrap();
        assert_eq!(spec.task_type, TaskType::Binary { path: "/bin/echo".into() });
        assert_eq!(spec.parameters_mode, ParametersMode::Cmdline);
        assert_eq!(spec.output_method, OutputMethod::Text);
        assert!(!spec.merge_stderr);
        assert_eq!(spec.queue, "default");
        assert_eq!(spec.queue_priority, 0);
    }

    #[test]
    fn task_spec_full() {
        let doc = Document::parse(
            r#"<task type="SCRIPT" name="collect" parameters-mode="ENV" output-method="XML" merge-stderr="yes" use-agent="yes" user="batch" host="worker-1" wd="/tmp" retry_schedule="slow" retry_retval_on_error="75" queue="heavy" queue_priority="9"><script>echo</script></task>"#,
        )
        .unwrap();
        let spec = TaskSpec::from_node(&doc, doc.root()).unwrap();
        assert_eq!(spec.task_type, TaskType::Script { name: "collect".into() });
        assert_eq!(spec.parameters_mode, ParametersMode::Env);
        assert_eq!(spec.output_method, OutputMethod::Xml);
        assert!(spec.merge_stderr);
        assert!(spec.use_agent);
        assert_eq!(spec.user.as_deref(), Some("batch"));
        assert_eq!(spec.host.as_deref(), Some("worker-1"));
        assert_eq!(spec.wd.as_deref(), Some("/tmp"));
        assert_eq!(spec.retry_schedule.as_deref(), Some("slow"));
        assert_eq!(spec.retry_retval_on_error, Some(75));
        assert_eq!(spec.queue, "heavy");
        assert_eq!(spec.queue_priority, 9);
        assert_eq!(spec.label(), "collect");
    }
}
