pub mod batch;
pub mod dns;

pub use batch::{
    Correlation, CorrelationId, OutstandingRequest, RecordData, RecordOperation, RecordType,
    UpdateBatch, UpdateMode, UpdateResponse, UpdateTransport,
};
