//! Background reconciliation: one watchdog per entity kind, each feeding a
//! bounded worker pool.

pub mod pool;
pub mod reconcile;
pub mod watchdog;

pub use self::pool::{Submission, WorkerPool};
pub use self::reconcile::{
    BucketHandler, ComponentReconciler, MonitoringReconciler, ProbeError, Reconciler,
};
pub use self::watchdog::{Watchdog, WatchdogOptions};
