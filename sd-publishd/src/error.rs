use thiserror::Error;

/// Errors raised by the service controller
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A record with the same identifier is already registered.
    /// Expected when the discovery feed re-announces a service.
    #[error("duplicate service: {key} is already registered")]
    DuplicateService { key: String },

    #[error("controller action queue is closed")]
    QueueClosed,
}

/// Errors raised while handing a batch to the update transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid name {name}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("failed to encode update: {0}")]
    Encode(#[from] hickory_proto::error::ProtoError),

    #[error("update transport is closed")]
    Closed,
}

/// Failure reported for a submitted update once its response arrives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// Reply was not signed although the request was
    #[error("response not authenticated")]
    NotAuthenticated,

    #[error("record set already exists")]
    RecordSetExists,

    #[error("record set does not exist")]
    RecordSetMissing,

    #[error("network error: {0}")]
    Io(String),
}
