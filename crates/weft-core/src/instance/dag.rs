//! The live state of one workflow instance.
//!
//! The savepoint document is the authoritative record: every status
//! change, resolved input and attempt outcome is written into it as it
//! happens. Alongside it, flat arenas of job and task slots (indices, not
//! pointers) drive the DAG evaluation. The engine serialises all access
//! through a per-instance mutex; nothing here is concurrent.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::error::{EngineError, Result};
use crate::process::{ExitKind, TaskOutcome};
use crate::retry::RetrySchedules;
use crate::workflow::{OutputMethod, ParametersMode, TaskSpec, Workflow};
use crate::xml::{Document, NodeId};
use crate::xpath::{FunctionProvider, Item, Value, XPathEval};

/// Task savepoint states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Executing,
    /// Failed, waiting for the retry timer.
    WaitingRetry,
    /// Final: ran and was reaped.
    Terminated { success: bool },
    Skipped,
    Aborted,
}

impl TaskState {
    fn savepoint_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::WaitingRetry | Self::Terminated { .. } => "TERMINATED",
            Self::Skipped => "SKIPPED",
            Self::Aborted => "ABORTED",
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, Self::Terminated { .. } | Self::Skipped | Self::Aborted)
    }

    fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Executing | Self::WaitingRetry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    Done { failed: bool },
}

#[derive(Debug)]
pub struct JobSlot {
    node: NodeId,
    parent: Option<usize>,
    tasks: Vec<usize>,
    state: JobState,
    on_failure_continue: bool,
}

#[derive(Debug)]
pub struct TaskSlot {
    pub node: NodeId,
    pub job: usize,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub retry_count: u32,
    /// Resolved at job start, reused across retries.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub script_body: Option<String>,
    /// Attempt id of the currently running process, for kill routing.
    pub running_attempt: Option<u64>,
}

/// What the engine must do after a state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Enqueue {
        task_index: usize,
        queue: String,
        priority: i64,
    },
    ScheduleRetry {
        task_index: usize,
        delay: Duration,
    },
}

/// Final disposition of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceDisposition {
    Terminated,
    Aborted,
}

pub struct WorkflowInstance {
    pub id: i64,
    pub workflow_name: String,
    savepoint: Document,
    jobs: Vec<JobSlot>,
    jobs_by_node: HashMap<NodeId, usize>,
    tasks: Vec<TaskSlot>,
    pub errors: i32,
    cancelling: bool,
    /// Set when the final savepoint write failed.
    pub engine_error: bool,
}

impl WorkflowInstance {
    /// Build the instance from a template: copy the document, bind
    /// parameters, and schedule the initially runnable jobs.
    pub fn build(
        id: i64,
        workflow: &Workflow,
        parameters: &[(String, String)],
        retries: &RetrySchedules,
    ) -> Result<(Self, Vec<Action>)> {
        let mut savepoint = workflow.doc.clone();
        let root = savepoint.root();
        savepoint.set_attr(root, "id", &id.to_string());
        savepoint.set_attr(root, "name", &workflow.name);
        savepoint.set_attr(root, "status", "EXECUTING");
        savepoint.set_attr(root, "start_time", &now_ts());
        savepoint.set_attr(root, "errors", "0");

        // Bind launch parameters into the savepoint so evqGetParameter can
        // resolve them.
        if let Some(params_node) = savepoint.first_child_named(root, "parameters") {
            for p in savepoint.children_named(params_node, "parameter") {
                let name = savepoint.attr(p, "name").unwrap_or_default().to_owned();
                if let Some((_, value)) = parameters.iter().find(|(n, _)| *n == name) {
                    savepoint.set_text(p, value.clone());
                }
            }
        }

        let mut instance = Self {
            id,
            workflow_name: workflow.name.clone(),
            savepoint,
            jobs: Vec::new(),
            jobs_by_node: HashMap::new(),
            tasks: Vec::new(),
            errors: 0,
            cancelling: false,
            engine_error: false,
        };

        let mut actions = Vec::new();
        let root = instance.savepoint.root();
        if let Some(subjobs) = instance.savepoint.first_child_named(root, "subjobs") {
            instance.start_subjobs(None, subjobs, retries, &mut actions);
        }

        Ok((instance, actions))
    }

    /// Rebuild an instance from a persisted savepoint and re-schedule
    /// tasks that were queued or executing when the engine stopped.
    pub fn resume(id: i64, savepoint_xml: &str, retries: &RetrySchedules) -> Result<(Self, Vec<Action>)> {
        let savepoint = Document::parse(savepoint_xml)?;
        let root = savepoint.root();
        let workflow_name = savepoint.attr(root, "name").unwrap_or_default().to_owned();

        let mut instance = Self {
            id,
            workflow_name,
            savepoint,
            jobs: Vec::new(),
            jobs_by_node: HashMap::new(),
            tasks: Vec::new(),
            errors: 0,
            cancelling: false,
            engine_error: false,
        };

        let mut actions = Vec::new();
        let root = instance.savepoint.root();
        if let Some(subjobs) = instance.savepoint.first_child_named(root, "subjobs") {
            instance.recover_subjobs(None, subjobs, &mut actions)?;
            // Jobs whose parent completed before the crash but which never
            // started are picked up by the (idempotent) normal path.
            instance.start_subjobs(None, subjobs, retries, &mut actions);
            let completed: Vec<usize> = instance
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| match j.state {
                    JobState::Done { failed: false } => true,
                    JobState::Done { failed: true } => j.on_failure_continue,
                    JobState::Running => false,
                })
                .map(|(i, _)| i)
                .collect();
            for job_idx in completed {
                if let Some(subjobs) = instance
                    .savepoint
                    .first_child_named(instance.jobs[job_idx].node, "subjobs")
                {
                    instance.start_subjobs(Some(job_idx), subjobs, retries, &mut actions);
                }
            }
        }

        let persisted_errors: i32 = instance
            .savepoint
            .attr(root, "errors")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let failed_tasks = instance
            .tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.state,
                    TaskState::Terminated { success: false } | TaskState::Aborted
                )
            })
            .count() as i32;
        instance.errors = persisted_errors.max(failed_tasks);

        Ok((instance, actions))
    }

    // -- accessors -----------------------------------------------------------

    /// Serialize the savepoint, refreshing the error counter on the root
    /// so a restart can recount it.
    pub fn savepoint_xml(&mut self) -> String {
        let root = self.savepoint.root();
        self.savepoint.set_attr(root, "errors", &self.errors.to_string());
        self.savepoint.to_xml()
    }

    pub fn task(&self, index: usize) -> &TaskSlot {
        &self.tasks[index]
    }

    pub fn task_mut(&mut self, index: usize) -> &mut TaskSlot {
        &mut self.tasks[index]
    }

    pub fn cancelling(&self) -> bool {
        self.cancelling
    }

    /// Attempt ids of running tasks, optionally filtered by task label.
    pub fn running_attempts(&self, label: Option<&str>) -> Vec<u64> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Executing)
            .filter(|t| label.map(|l| t.spec.label() == l).unwrap_or(true))
            .filter_map(|t| t.running_attempt)
            .collect()
    }

    /// The instance is finished when no task can still run or retry.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| !t.state.is_active())
    }

    /// Terminal disposition; only meaningful once [`Self::is_finished`].
    pub fn disposition(&self) -> InstanceDisposition {
        if self.cancelling {
            InstanceDisposition::Aborted
        } else {
            InstanceDisposition::Terminated
        }
    }

    /// Stamp the terminal state into the savepoint root.
    pub fn seal(&mut self) {
        let root = self.savepoint.root();
        let status = match self.disposition() {
            InstanceDisposition::Terminated => "TERMINATED",
            InstanceDisposition::Aborted => "ABORTED",
        };
        self.savepoint.set_attr(root, "status", status);
        self.savepoint.set_attr(root, "end_time", &now_ts());
        self.savepoint.set_attr(root, "errors", &self.errors.to_string());
        if self.engine_error {
            self.savepoint.set_attr(root, "engine_error", "yes");
        }
    }

    /// Flag the savepoint with a shutdown marker (node stopping while the
    /// instance was still live).
    pub fn mark_shutdown(&mut self) {
        self.cancelling = true;
        let root = self.savepoint.root();
        self.savepoint.set_attr(root, "shutdown", "yes");
        for idx in 0..self.tasks.len() {
            if self.tasks[idx].state.is_active() {
                self.set_task_state(idx, TaskState::Aborted);
            }
        }
    }

    // -- scheduling ----------------------------------------------------------

    /// Evaluate the jobs under a `<subjobs>` element and enqueue the tasks
    /// of every runnable job. Idempotent: jobs that already carry state
    /// are left alone, so recovery can re-walk the tree safely.
    fn start_subjobs(
        &mut self,
        parent: Option<usize>,
        subjobs_node: NodeId,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        if self.cancelling {
            return;
        }

        let job_nodes = self.savepoint.children_named(subjobs_node, "job");
        for job_node in job_nodes {
            if self.job_already_touched(job_node) {
                continue;
            }

            // Condition gates the whole subtree.
            if let Some(condition) = self.savepoint.attr(job_node, "condition").map(str::to_owned) {
                match self.evaluate(&condition, job_node) {
                    Ok(value) if !value.truthy() => {
                        self.mark_subtree_skipped(job_node, "Condition evaluated to false");
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.record_job_error(job_node, &e.to_string());
                        continue;
                    }
                }
            }

            // A loop clones the job once per context node.
            if let Some(loop_expr) = self.savepoint.attr(job_node, "loop").map(str::to_owned) {
                let contexts = match self.evaluate(&loop_expr, job_node) {
                    Ok(Value::Seq(items)) => items,
                    Ok(_) => {
                        self.record_job_error(job_node, "loop expression must select nodes");
                        continue;
                    }
                    Err(e) => {
                        self.record_job_error(job_node, &e.to_string());
                        continue;
                    }
                };

                let base_index = self.savepoint.child_index(job_node).unwrap_or(0);
                let mut clones = Vec::with_capacity(contexts.len());
                for (i, context) in contexts.iter().enumerate() {
                    let clone =
                        self.savepoint
                            .clone_subtree(job_node, subjobs_node, base_index + 1 + i);
                    self.savepoint.remove_attr(clone, "loop");
                    self.savepoint.set_attr(clone, "context-id", &i.to_string());
                    // Copy the context into the clone so it survives
                    // savepoint persistence and restart.
                    let ctx_el = self.savepoint.append_element(clone, "context");
                    match context {
                        Item::Node(node) => {
                            let copy = *node;
                            self.savepoint.clone_subtree(copy, ctx_el, 0);
                        }
                        Item::Attr { node, name } => {
                            let value = self
                                .savepoint
                                .attr(*node, name)
                                .unwrap_or_default()
                                .to_owned();
                            self.savepoint.append_text(ctx_el, value);
                        }
                    }
                    clones.push(clone);
                }
                self.savepoint.detach(job_node);

                for clone in clones {
                    self.start_single_job(parent, clone, true, retries, actions);
                }
                continue;
            }

            self.start_single_job(parent, job_node, false, retries, actions);
        }
    }

    fn start_single_job(
        &mut self,
        parent: Option<usize>,
        job_node: NodeId,
        in_loop: bool,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        // Each loop iteration re-checks its own gate.
        if in_loop {
            if let Some(cond) = self
                .savepoint
                .attr(job_node, "iteration-condition")
                .map(str::to_owned)
            {
                match self.evaluate(&cond, job_node) {
                    Ok(value) if !value.truthy() => {
                        self.mark_subtree_skipped(job_node, "Iteration condition evaluated to false");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.record_job_error(job_node, &e.to_string());
                        return;
                    }
                }
            }
        }

        let on_failure_continue = self.savepoint.attr(job_node, "on-failure") == Some("CONTINUE");
        let job_index = self.jobs.len();
        self.jobs.push(JobSlot {
            node: job_node,
            parent,
            tasks: Vec::new(),
            state: JobState::Running,
            on_failure_continue,
        });
        self.jobs_by_node.insert(job_node, job_index);

        let task_nodes = self
            .savepoint
            .first_child_named(job_node, "tasks")
            .map(|tasks| self.savepoint.children_named(tasks, "task"))
            .unwrap_or_default();

        for task_node in task_nodes {
            match self.prepare_task(job_index, task_node) {
                Ok(task_index) => {
                    self.jobs[job_index].tasks.push(task_index);
                    self.set_task_state(task_index, TaskState::Queued);
                    let spec = &self.tasks[task_index].spec;
                    actions.push(Action::Enqueue {
                        task_index,
                        queue: spec.queue.clone(),
                        priority: spec.queue_priority,
                    });
                }
                Err(e) => {
                    // Evaluation failures become failed attempts, routed
                    // through the same classifier as process failures.
                    let task_index = self.register_broken_task(job_index, task_node, &e);
                    self.jobs[job_index].tasks.push(task_index);
                    self.classify_failure(task_index, -1, retries, actions);
                }
            }
        }

        if self.jobs[job_index].tasks.is_empty() {
            // Nothing to run (validation prevents this for stored
            // workflows); fold the job immediately.
            self.finish_job(job_index, retries, actions);
        }
    }

    /// Parse the task spec and resolve its inputs against the savepoint.
    fn prepare_task(&mut self, job_index: usize, task_node: NodeId) -> Result<usize> {
        let spec = TaskSpec::from_node(&self.savepoint, task_node)?;

        let mut args = Vec::new();
        let mut env = Vec::new();
        for input_node in self.savepoint.children_named(task_node, "input") {
            let value = self.resolve_parts(input_node, task_node)?;
            match spec.parameters_mode {
                ParametersMode::Cmdline => args.push(value),
                ParametersMode::Env => {
                    let name = self
                        .savepoint
                        .attr(input_node, "name")
                        .unwrap_or_default()
                        .to_owned();
                    env.push((name, value));
                }
            }
        }

        let stdin = match self.savepoint.first_child_named(task_node, "stdin") {
            Some(stdin_node) => Some(self.resolve_parts(stdin_node, task_node)?),
            None => None,
        };

        let script_body = match self.savepoint.first_child_named(task_node, "script") {
            Some(script_node) => Some(self.resolve_parts(script_node, task_node)?),
            None => None,
        };

        let task_index = self.tasks.len();
        self.tasks.push(TaskSlot {
            node: task_node,
            job: job_index,
            spec,
            state: TaskState::Queued,
            retry_count: 0,
            args,
            env,
            stdin,
            script_body,
            running_attempt: None,
        });
        Ok(task_index)
    }

    /// Resolve the text-and-`<value select>` children of a node into one
    /// string, writing each evaluated value back into the savepoint.
    fn resolve_parts(&mut self, node: NodeId, context: NodeId) -> Result<String> {
        let mut resolved = String::new();
        for child in self.savepoint.children(node).to_vec() {
            match self.savepoint.name(child) {
                None => resolved.push_str(&self.savepoint.text(child)),
                Some("value") => {
                    let select = self
                        .savepoint
                        .attr(child, "select")
                        .unwrap_or_default()
                        .to_owned();
                    let value = self.evaluate(&select, context)?;
                    let text = value.as_string(&self.savepoint);
                    self.savepoint.set_text(child, text.clone());
                    resolved.push_str(&text);
                }
                Some(_) => {}
            }
        }
        Ok(resolved)
    }

    fn register_broken_task(&mut self, job_index: usize, task_node: NodeId, error: &EngineError) -> usize {
        let error_el = self.savepoint.append_element(task_node, "error");
        self.savepoint.set_text(error_el, error.to_string());

        // Fall back to a permissive spec so the classifier can still read
        // retry attributes.
        let spec = TaskSpec::from_node(&self.savepoint, task_node).unwrap_or(TaskSpec {
            task_type: crate::workflow::TaskType::Binary {
                path: String::new(),
            },
            parameters_mode: ParametersMode::Cmdline,
            output_method: OutputMethod::Text,
            merge_stderr: false,
            use_agent: false,
            user: None,
            host: None,
            wd: None,
            retry_schedule: None,
            retry_retval_on_error: None,
            queue: "default".to_owned(),
            queue_priority: 0,
        });

        let task_index = self.tasks.len();
        self.tasks.push(TaskSlot {
            node: task_node,
            job: job_index,
            spec,
            state: TaskState::Queued,
            retry_count: 0,
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            script_body: None,
            running_attempt: None,
        });
        task_index
    }

    fn job_already_touched(&self, job_node: NodeId) -> bool {
        if self.jobs_by_node.contains_key(&job_node) {
            return true;
        }
        if self.savepoint.attr(job_node, "status").is_some() {
            return true;
        }
        // A job whose tasks carry statuses was started before a restart.
        if let Some(tasks) = self.savepoint.first_child_named(job_node, "tasks") {
            if self
                .savepoint
                .children_named(tasks, "task")
                .iter()
                .any(|&t| self.savepoint.attr(t, "status").is_some())
            {
                return true;
            }
        }
        false
    }

    // -- outcome handling ----------------------------------------------------

    /// Mark a task as handed to the process manager.
    pub fn task_started(&mut self, task_index: usize, attempt_id: u64) {
        let node = self.tasks[task_index].node;
        self.set_task_state(task_index, TaskState::Executing);
        self.savepoint.set_attr(node, "started_at", &now_ts());
        self.tasks[task_index].running_attempt = Some(attempt_id);
    }

    /// Fold a reaped outcome into the savepoint and re-evaluate the DAG.
    pub fn on_outcome(
        &mut self,
        outcome: &TaskOutcome,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        let task_index = outcome.task_index;
        let node = self.tasks[task_index].node;
        self.tasks[task_index].running_attempt = None;

        // One attempt record: output, stderr, engine log, in temporal order.
        let retval = outcome.exit.code();
        let output_el = self.savepoint.append_element(node, "output");
        self.savepoint
            .set_attr(output_el, "retval", &retval.to_string());
        if let ExitKind::Signaled(signal) = outcome.exit {
            self.savepoint
                .set_attr(output_el, "exit_status", &format!("signal {signal}"));
        }
        self.savepoint.set_attr(
            output_el,
            "execution_time",
            &format!("{:.3}", outcome.execution_time.as_secs_f64()),
        );

        let mut xml_output_error = None;
        match self.tasks[task_index].spec.output_method {
            OutputMethod::Text => {
                self.savepoint.append_text(output_el, outcome.stdout.clone());
            }
            OutputMethod::Xml => match Document::parse(&outcome.stdout) {
                Ok(parsed) => {
                    let root = parsed.root();
                    self.savepoint.import_subtree(&parsed, root, output_el);
                }
                Err(e) => {
                    xml_output_error = Some(e.to_string());
                    self.savepoint.append_text(output_el, outcome.stdout.clone());
                }
            },
        }

        if !outcome.stderr.is_empty() {
            let stderr_el = self.savepoint.append_element(node, "stderr");
            self.savepoint.append_text(stderr_el, outcome.stderr.clone());
        }
        if !outcome.engine_log.is_empty() {
            let log_el = self.savepoint.append_element(node, "log");
            self.savepoint.append_text(log_el, outcome.engine_log.clone());
        }

        self.savepoint.set_attr(node, "retval", &retval.to_string());
        self.savepoint.set_attr(node, "ended_at", &now_ts());

        let killed = matches!(outcome.exit, ExitKind::Signaled(_));
        let success = retval == 0 && xml_output_error.is_none();

        if let Some(err) = xml_output_error {
            let error_el = self.savepoint.append_element(node, "error");
            self.savepoint
                .set_text(error_el, format!("invalid XML output: {err}"));
        }

        if success {
            self.set_task_state(task_index, TaskState::Terminated { success: true });
            self.check_job_completion(self.tasks[task_index].job, retries, actions);
        } else if killed || self.cancelling {
            // A killed task is aborted, never retried.
            self.errors += 1;
            self.set_task_state(task_index, TaskState::Aborted);
            self.check_job_completion(self.tasks[task_index].job, retries, actions);
        } else {
            self.classify_failure(task_index, retval, retries, actions);
        }
    }

    /// Route a failure through the retry/fatal classifier.
    fn classify_failure(
        &mut self,
        task_index: usize,
        retval: i32,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        let task = &self.tasks[task_index];
        let schedule = task
            .spec
            .retry_schedule
            .as_deref()
            .and_then(|name| retries.get(name));

        let retval_matches = task
            .spec
            .retry_retval_on_error
            .map(|expected| expected == retval)
            .unwrap_or(true);

        if !self.cancelling && retval_matches {
            if let Some(schedule) = schedule {
                if let Some(delay) = schedule.delay_for(task.retry_count) {
                    let node = task.node;
                    self.set_task_state(task_index, TaskState::WaitingRetry);
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    self.savepoint.set_attr(
                        node,
                        "retry_at",
                        &retry_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                    actions.push(Action::ScheduleRetry { task_index, delay });
                    return;
                }
            }
        }

        // Fatal.
        self.errors += 1;
        self.set_task_state(task_index, TaskState::Terminated { success: false });
        self.check_job_completion(self.tasks[task_index].job, retries, actions);
    }

    /// Requeue a task whose retry timer fired. Returns the enqueue action,
    /// or `None` when the retry was overtaken by cancellation.
    pub fn requeue_task(&mut self, task_index: usize) -> Option<Action> {
        if self.tasks[task_index].state != TaskState::WaitingRetry {
            return None;
        }
        if self.cancelling {
            self.errors += 1;
            self.set_task_state(task_index, TaskState::Aborted);
            return None;
        }

        let node = self.tasks[task_index].node;
        self.tasks[task_index].retry_count += 1;
        self.savepoint.remove_attr(node, "retry_at");
        self.savepoint.set_attr(
            node,
            "retry_times",
            &self.tasks[task_index].retry_count.to_string(),
        );
        self.set_task_state(task_index, TaskState::Queued);

        let spec = &self.tasks[task_index].spec;
        Some(Action::Enqueue {
            task_index,
            queue: spec.queue.clone(),
            priority: spec.queue_priority,
        })
    }

    /// A queued attempt was thrown away before running (cancellation,
    /// unknown queue). Counts as an aborted attempt.
    pub fn task_dropped(
        &mut self,
        task_index: usize,
        reason: &str,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        let node = self.tasks[task_index].node;
        let error_el = self.savepoint.append_element(node, "error");
        self.savepoint.set_text(error_el, reason.to_owned());
        self.errors += 1;
        self.set_task_state(task_index, TaskState::Aborted);
        self.check_job_completion(self.tasks[task_index].job, retries, actions);
    }

    /// Begin cancellation: no further task may be enqueued; waiting
    /// retries abort immediately.
    pub fn cancel(&mut self) {
        self.cancelling = true;
        for idx in 0..self.tasks.len() {
            if self.tasks[idx].state == TaskState::WaitingRetry {
                self.errors += 1;
                self.set_task_state(idx, TaskState::Aborted);
            }
        }
    }

    // -- job folding ---------------------------------------------------------

    fn check_job_completion(
        &mut self,
        job_index: usize,
        retries: &RetrySchedules,
        actions: &mut Vec<Action>,
    ) {
        if self.jobs[job_index].state != JobState::Running {
            return;
        }
        let all_final = self.jobs[job_index]
            .tasks
            .iter()
            .all(|&t| self.tasks[t].state.is_final());
        if !all_final {
            return;
        }
        self.finish_job(job_index, retries, actions);
    }

    fn finish_job(&mut self, job_index: usize, retries: &RetrySchedules, actions: &mut Vec<Action>) {
        let failed = self.jobs[job_index].tasks.iter().any(|&t| {
            matches!(
                self.tasks[t].state,
                TaskState::Terminated { success: false } | TaskState::Aborted
            )
        });
        self.jobs[job_index].state = JobState::Done { failed };

        if failed && !self.jobs[job_index].on_failure_continue {
            self.propagate_failure(job_index);
            return;
        }

        // Success (or tolerated failure): children become runnable.
        if !self.cancelling {
            let job_node = self.jobs[job_index].node;
            if let Some(subjobs) = self.savepoint.first_child_named(job_node, "subjobs") {
                self.start_subjobs(Some(job_index), subjobs, retries, actions);
            }
        }
    }

    /// Mark the failed job and its ancestors FAILED, stopping at the
    /// first ancestor that tolerates failure.
    fn propagate_failure(&mut self, job_index: usize) {
        let node = self.jobs[job_index].node;
        self.savepoint.set_attr(node, "status", "FAILED");

        let mut current = self.jobs[job_index].parent;
        while let Some(idx) = current {
            if self.jobs[idx].on_failure_continue {
                break;
            }
            self.jobs[idx].state = JobState::Done { failed: true };
            let node = self.jobs[idx].node;
            self.savepoint.set_attr(node, "status", "FAILED");
            current = self.jobs[idx].parent;
        }
    }

    fn mark_subtree_skipped(&mut self, job_node: NodeId, details: &str) {
        self.savepoint.set_attr(job_node, "status", "SKIPPED");
        self.savepoint.set_attr(job_node, "details", details);

        for node in self.savepoint.descendant_elements(job_node) {
            if self.savepoint.name(node) == Some("task") {
                self.savepoint.set_attr(node, "status", "SKIPPED");
            } else if self.savepoint.name(node) == Some("job") && node != job_node {
                self.savepoint.set_attr(node, "status", "SKIPPED");
            }
        }
    }

    fn record_job_error(&mut self, job_node: NodeId, message: &str) {
        self.errors += 1;
        self.savepoint.set_attr(job_node, "status", "ABORTED");
        let error_el = self.savepoint.append_element(job_node, "error");
        self.savepoint.set_text(error_el, message.to_owned());
    }

    fn set_task_state(&mut self, task_index: usize, state: TaskState) {
        let node = self.tasks[task_index].node;
        self.tasks[task_index].state = state;
        self.savepoint.set_attr(node, "status", state.savepoint_str());
    }

    // -- recovery ------------------------------------------------------------

    fn recover_subjobs(
        &mut self,
        parent: Option<usize>,
        subjobs_node: NodeId,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        for job_node in self.savepoint.children_named(subjobs_node, "job") {
            match self.savepoint.attr(job_node, "status") {
                Some("SKIPPED") | Some("FAILED") | Some("ABORTED") => continue,
                _ => {}
            }

            let task_nodes = self
                .savepoint
                .first_child_named(job_node, "tasks")
                .map(|tasks| self.savepoint.children_named(tasks, "task"))
                .unwrap_or_default();
            let started = task_nodes
                .iter()
                .any(|&t| self.savepoint.attr(t, "status").is_some());
            if !started {
                continue;
            }

            let on_failure_continue =
                self.savepoint.attr(job_node, "on-failure") == Some("CONTINUE");
            let job_index = self.jobs.len();
            self.jobs.push(JobSlot {
                node: job_node,
                parent,
                tasks: Vec::new(),
                state: JobState::Running,
                on_failure_continue,
            });
            self.jobs_by_node.insert(job_node, job_index);

            for task_node in task_nodes {
                let spec = TaskSpec::from_node(&self.savepoint, task_node)?;
                let retry_count = self
                    .savepoint
                    .attr(task_node, "retry_times")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                let status = self.savepoint.attr(task_node, "status").unwrap_or("QUEUED");
                let state = match status {
                    "SKIPPED" => TaskState::Skipped,
                    "ABORTED" => TaskState::Aborted,
                    "TERMINATED" => {
                        let retval: i32 = self
                            .savepoint
                            .attr(task_node, "retval")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(-1);
                        TaskState::Terminated { success: retval == 0 }
                    }
                    // QUEUED and EXECUTING re-run as a fresh attempt.
                    _ => TaskState::Queued,
                };

                // Inputs were resolved before the crash; the savepoint
                // carries the final values.
                let mut args = Vec::new();
                let mut env = Vec::new();
                for input_node in self.savepoint.children_named(task_node, "input") {
                    let value = self.savepoint.text(input_node);
                    match spec.parameters_mode {
                        ParametersMode::Cmdline => args.push(value),
                        ParametersMode::Env => {
                            let name = self
                                .savepoint
                                .attr(input_node, "name")
                                .unwrap_or_default()
                                .to_owned();
                            env.push((name, value));
                        }
                    }
                }
                let stdin = self
                    .savepoint
                    .first_child_named(task_node, "stdin")
                    .map(|n| self.savepoint.text(n));
                let script_body = self
                    .savepoint
                    .first_child_named(task_node, "script")
                    .map(|n| self.savepoint.text(n));

                let task_index = self.tasks.len();
                let queue = spec.queue.clone();
                let priority = spec.queue_priority;
                self.tasks.push(TaskSlot {
                    node: task_node,
                    job: job_index,
                    spec,
                    state,
                    retry_count,
                    args,
                    env,
                    stdin,
                    script_body,
                    running_attempt: None,
                });
                self.jobs[job_index].tasks.push(task_index);

                if state == TaskState::Queued {
                    self.set_task_state(task_index, TaskState::Queued);
                    actions.push(Action::Enqueue {
                        task_index,
                        queue,
                        priority,
                    });
                }
            }

            // Fold the job if everything already finished, and recurse
            // into children that may have started.
            let all_final = self.jobs[job_index]
                .tasks
                .iter()
                .all(|&t| self.tasks[t].state.is_final());
            if all_final {
                let failed = self.jobs[job_index].tasks.iter().any(|&t| {
                    matches!(
                        self.tasks[t].state,
                        TaskState::Terminated { success: false } | TaskState::Aborted
                    )
                });
                self.jobs[job_index].state = JobState::Done { failed };
            }

            if let Some(child_subjobs) = self.savepoint.first_child_named(job_node, "subjobs") {
                self.recover_subjobs(Some(job_index), child_subjobs, actions)?;
            }
        }
        Ok(())
    }

    // -- expression evaluation ----------------------------------------------

    fn evaluate(&self, expr: &str, context: NodeId) -> Result<Value> {
        let provider = InstanceFunctions { job_node: context };
        let eval = XPathEval::with_provider(&self.savepoint, &provider);
        eval.evaluate(expr, context)
    }
}

/// Engine-registered expression functions, resolved against the savepoint.
struct InstanceFunctions {
    job_node: NodeId,
}

impl InstanceFunctions {
    /// Find the last task whose label (path or name) matches, preferring
    /// tasks that already produced output.
    fn find_task(doc: &Document, label: &str) -> Option<NodeId> {
        let mut found = None;
        for node in doc.descendant_elements(doc.root()) {
            if doc.name(node) != Some("task") {
                continue;
            }
            let matches = doc.attr(node, "path") == Some(label)
                || doc.attr(node, "name") == Some(label);
            if matches {
                if doc.first_child_named(node, "output").is_some() {
                    found = Some(node);
                } else if found.is_none() {
                    found = Some(node);
                }
            }
        }
        found
    }

    /// The enclosing job element of the evaluation context.
    fn current_job(&self, doc: &Document) -> Option<NodeId> {
        let mut node = Some(self.job_node);
        while let Some(id) = node {
            if doc.name(id) == Some("job") {
                return Some(id);
            }
            node = doc.parent(id);
        }
        None
    }
}

impl FunctionProvider for InstanceFunctions {
    fn call(&self, name: &str, args: &[Value], doc: &Document) -> Option<crate::error::Result<Value>> {
        match name {
            "evqGetParameter" => {
                let name = args.first().map(|v| v.as_string(doc)).unwrap_or_default();
                let root = doc.root();
                let value = doc
                    .first_child_named(root, "parameters")
                    .and_then(|params| {
                        doc.children_named(params, "parameter")
                            .into_iter()
                            .find(|&p| doc.attr(p, "name") == Some(name.as_str()))
                    })
                    .map(|p| doc.text(p))
                    .unwrap_or_default();
                Some(Ok(Value::Str(value)))
            }
            "evqGetOutput" => {
                let label = args.first().map(|v| v.as_string(doc)).unwrap_or_default();
                let items = Self::find_task(doc, &label)
                    .and_then(|task| doc.children_named(task, "output").last().copied())
                    .map(|output| vec![Item::Node(output)])
                    .unwrap_or_default();
                Some(Ok(Value::Seq(items)))
            }
            "evqGetInput" => {
                let label = args.first().map(|v| v.as_string(doc)).unwrap_or_default();
                let items = Self::find_task(doc, &label)
                    .map(|task| {
                        doc.children_named(task, "input")
                            .into_iter()
                            .map(Item::Node)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Ok(Value::Seq(items)))
            }
            "evqGetContext" => {
                let items = self
                    .current_job(doc)
                    .and_then(|job| doc.first_child_named(job, "context"))
                    .map(|ctx| {
                        // Prefer the copied element; fall back to the
                        // container for text-only contexts.
                        match doc.child_elements(ctx).first() {
                            Some(&el) => vec![Item::Node(el)],
                            None => vec![Item::Node(ctx)],
                        }
                    })
                    .unwrap_or_default();
                Some(Ok(Value::Seq(items)))
            }
            "evqGetCurrentJob" => {
                let items = self
                    .current_job(doc)
                    .map(|job| vec![Item::Node(job)])
                    .unwrap_or_default();
                Some(Ok(Value::Seq(items)))
            }
            _ => None,
        }
    }
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
