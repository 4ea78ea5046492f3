use thiserror::Error;

/// Venue rejection fragments that mean the position is already gone.
///
/// Connector-specific and fragile by nature; the structured
/// [`VenueError::PositionAlreadyClosed`] kind is preferred wherever the
/// connector can classify the rejection itself. Revisit this list when
/// porting to another venue.
const ALREADY_CLOSED_MESSAGES: &[&str] = &[
    "would not reduce position",
    "position not open",
    "position already closed",
];

/// Errors surfaced by the venue boundary.
#[derive(Error, Debug)]
pub enum VenueError {
    /// The venue rejected the order because the position no longer exists.
    #[error("position already closed")]
    PositionAlreadyClosed,

    /// The venue rejected the request for some other reason.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// The venue no longer knows the order id.
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// Transport-level failure; retryable.
    #[error("network error: {0}")]
    Network(String),
}

impl VenueError {
    /// Whether this error means the position is already closed and the
    /// closing attempt should be treated as a success.
    ///
    /// Combines the structured kind with the string-matching fallback for
    /// connectors that only hand back raw rejection text.
    #[must_use]
    pub fn is_position_already_closed(&self) -> bool {
        match self {
            Self::PositionAlreadyClosed => true,
            Self::Rejected(message) => is_already_closed_message(message),
            Self::UnknownOrder(_) | Self::Network(_) => false,
        }
    }
}

/// String-matching fallback for "position already closed" detection.
#[must_use]
pub fn is_already_closed_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ALREADY_CLOSED_MESSAGES
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_kind_is_success_signal() {
        assert!(VenueError::PositionAlreadyClosed.is_position_already_closed());
    }

    #[test]
    fn rejection_text_falls_back_to_string_matching() {
        let err = VenueError::Rejected("Order would not reduce position".to_string());
        assert!(err.is_position_already_closed());

        let err = VenueError::Rejected("insufficient margin".to_string());
        assert!(!err.is_position_already_closed());
    }

    #[test]
    fn network_errors_are_not_success_signals() {
        let err = VenueError::Network("timeout".to_string());
        assert!(!err.is_position_already_closed());
    }

    #[test]
    fn fallback_matching_is_case_insensitive() {
        assert!(is_already_closed_message("Position NOT open"));
        assert!(is_already_closed_message("position already closed (code 31)"));
        assert!(!is_already_closed_message("rate limited"));
    }
}
