pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod position;
pub mod traits;

pub use config::AssignmentConfig;
pub use config_loader::ConfigLoader;
pub use error::{is_already_closed_message, VenueError};
pub use events::{AssignmentFillEvent, CloseOrderType, OrderSide, PositionSide, PositionSource};
pub use position::{OrderStatusReport, VenuePosition};
pub use traits::VenueClient;
