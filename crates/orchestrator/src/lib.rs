pub mod actions;
pub mod ingestion;
pub mod reconciler;
pub mod records;
pub mod registry;
pub mod service;
pub mod supervisor;

pub use actions::CreateProcessAction;
pub use ingestion::AssignmentIngestor;
pub use reconciler::ReconciliationLoop;
pub use records::{
    AssignmentRecord, AssignmentStatus, ClosingProcessRecord, ProcessRecordStatus,
};
pub use registry::AssignmentRegistry;
pub use service::AssignmentService;
pub use supervisor::{ProcessHandle, ProcessSupervisor, SharedProcessSet};
