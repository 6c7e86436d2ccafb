//! Query modules, one per entity family.

pub mod gc;
pub mod instances;
pub mod logs;
pub mod notifications;
pub mod queues;
pub mod schedules;
pub mod users;
pub mod workflows;
