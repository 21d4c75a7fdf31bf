use thiserror::Error;

/// Reasons a `register` request is refused. Reported to the requesting peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("pairing code is unknown or expired")]
    InvalidPairingCode,
    #[error("controller for this pairing code is no longer connected")]
    ControllerGone,
    #[error("connection is already registered")]
    AlreadyRegistered,
}

impl RegistrationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistrationError::InvalidPairingCode => "invalid_pairing_code",
            RegistrationError::ControllerGone => "controller_gone",
            RegistrationError::AlreadyRegistered => "already_registered",
        }
    }
}

/// Reasons a routed message is dropped. Not reported to the sender unless NACKs are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("destination agent is not connected")]
    UnknownDestination,
    #[error("message carries no destination agent")]
    MissingDestination,
    #[error("sender is not registered for this message")]
    NotRegistered,
    #[error("sender has no associated counterpart")]
    Unassociated,
    #[error("event is not relayed")]
    UnroutableEvent,
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::UnknownDestination => "unknown_destination",
            RouteError::MissingDestination => "missing_destination",
            RouteError::NotRegistered => "not_registered",
            RouteError::Unassociated => "unassociated",
            RouteError::UnroutableEvent => "unroutable_event",
        }
    }
}
