pub mod barriers;
pub mod pending;
pub mod process;

pub use barriers::{check_barriers, BarrierConfig, BarrierTrigger};
pub use pending::{CloseReservation, PendingCloseLedger};
pub use process::{
    ClosingConfig, ClosingProcess, CloseType, ProcessEvent, ProcessOutcome, ProcessState,
};
