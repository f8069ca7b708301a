pub mod agent;
pub mod config;
pub mod event;
pub mod run;
pub mod store;
pub mod task;
pub mod work;
pub mod worker;

pub use config::{ConfigError, RunConfig, StoreKind};
pub use event::{event_queue, Event, EventReceiver, EventSender, WorkerLink};
pub use run::{RunPhase, RunStatus};
pub use store::{open_store, ProgressStore, StoreError};
pub use task::{Assignment, Report, TaskId, TaskSpace};
pub use work::{build_work, WorkArgs, WorkFn, WorkKind, WorkParams};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskReportRequest, TaskReportResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
