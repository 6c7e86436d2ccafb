//! weft-core: the workflow execution engine.
//!
//! A workflow is an XML document describing a DAG of jobs and tasks. The
//! engine launches instances of it, binds task inputs through an XPath
//! dialect evaluated against the instance savepoint, runs tasks as child
//! processes under per-queue concurrency limits, retries failures along
//! named retry curves, and persists the savepoint at every terminal
//! transition. Supporting subsystems -- the events bus, the notification
//! dispatcher, the cron scheduler and the garbage collector -- live here
//! too and are wired together by [`runtime::Runtime`].

pub mod dblog;
pub mod error;
pub mod events;
pub mod gc;
pub mod instance;
pub mod notify;
pub mod process;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod schedule;
pub mod stats;
pub mod storage;
pub mod workflow;
pub mod xml;
pub mod xpath;
