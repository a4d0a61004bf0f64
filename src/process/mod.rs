/// Backend process supervision
/// Owns the one child process for the lifetime of the shell:
/// spawning, watching its output and exit, and stopping it on shutdown

pub mod output;
pub mod supervisor;

pub use output::{PortConflictDetector, DEFAULT_PORT_CONFLICT_PHRASES};
pub use supervisor::{
    BackendSupervisor, LaunchSpec, OutputStream, ProcessState, SupervisedProcess,
    SupervisorEvent,
};
