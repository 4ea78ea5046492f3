use autoclose_execution::process::ClosingConfig;

/// Request for the supervisor to instantiate a closing process.
///
/// Queued by the registry; the consumer later reports the resulting process
/// id back through [`crate::registry::AssignmentRegistry::register_process`].
#[derive(Debug, Clone)]
pub struct CreateProcessAction {
    pub controller_id: String,
    pub process_config: ClosingConfig,
}
