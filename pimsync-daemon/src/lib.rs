//! Sync orchestration daemon: session driver, pass scheduler, per-target
//! runners, and the runtime that ties them to a control socket.

mod error;
pub mod paths;
pub mod protocol;
pub mod runner;
mod runtime;
pub mod scheduler;
pub mod session;
pub mod status;

pub use error::DaemonError;
pub use protocol::{
    request_login, request_logout, request_status, request_stop, request_sync, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runner::{RunnerDeps, RunnerSettings, TargetRunner};
pub use runtime::{run, start_blocking};
pub use scheduler::{auto_sync_interval, Scheduler};
pub use session::{SessionDeps, SessionDriver, TargetSummary};
pub use status::{CriticalError, PassStatus, StatusErrorSink, StatusHandle, SyncState, TargetResult};
