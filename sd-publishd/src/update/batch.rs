use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use chrono::{DateTime, Utc};
use hickory_proto::op::ResponseCode;
use crate::error::{TransportError, UpdateError};

/// Record types this daemon publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    AAAA,
    PTR,
    SRV,
    TXT,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::PTR => "PTR",
            RecordType::SRV => "SRV",
            RecordType::TXT => "TXT",
        };
        f.write_str(s)
    }
}

/// Type-specific record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    PTR(String),
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    TXT(Vec<String>),
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::AAAA(_) => RecordType::AAAA,
            RecordData::PTR(_) => RecordType::PTR,
            RecordData::SRV { .. } => RecordType::SRV,
            RecordData::TXT(_) => RecordType::TXT,
        }
    }
}

impl fmt::Display for RecordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordData::A(addr) => write!(f, "{}", addr),
            RecordData::AAAA(addr) => write!(f, "{}", addr),
            RecordData::PTR(name) => f.write_str(name),
            RecordData::SRV { priority, weight, port, target } => {
                write!(f, "{} {} {} {}", priority, weight, port, target)
            }
            RecordData::TXT(strings) => write!(f, "{:?}", strings),
        }
    }
}

/// One record inside an update batch.
/// `ttl` is only meaningful for upserts; `data` is optional for deletes,
/// where its absence removes the whole record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOperation {
    pub target: String,
    pub record_type: RecordType,
    pub ttl: Option<u32>,
    pub data: Option<RecordData>,
}

impl RecordOperation {
    pub fn upsert(target: impl Into<String>, ttl: u32, data: RecordData) -> Self {
        Self {
            target: target.into(),
            record_type: data.record_type(),
            ttl: Some(ttl),
            data: Some(data),
        }
    }

    pub fn delete_value(target: impl Into<String>, data: RecordData) -> Self {
        Self {
            target: target.into(),
            record_type: data.record_type(),
            ttl: None,
            data: Some(data),
        }
    }

    pub fn delete_set(target: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            target: target.into(),
            record_type,
            ttl: None,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Upsert,
    Delete,
}

/// Operations applied atomically by a single update message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBatch {
    pub mode: UpdateMode,
    pub operations: Vec<RecordOperation>,
}

impl UpdateBatch {
    pub fn upsert(operations: Vec<RecordOperation>) -> Self {
        Self { mode: UpdateMode::Upsert, operations }
    }

    pub fn delete(operations: Vec<RecordOperation>) -> Self {
        Self { mode: UpdateMode::Delete, operations }
    }

    /// Shortest TTL in the batch, used as the requested update lease
    pub fn shortest_ttl(&self) -> Option<u32> {
        self.operations.iter().filter_map(|op| op.ttl).min()
    }
}

/// Opaque handle matching a submitted update to its eventual response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u16);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A submitted update still waiting for its response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub id: CorrelationId,
    pub mode: UpdateMode,
    pub submitted_at: DateTime<Utc>,
}

/// Asynchronous outcome of a submitted update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResponse {
    pub id: CorrelationId,
    pub status: ResponseCode,
    pub error: Option<UpdateError>,
    /// Human-readable rendering of the reply, attached to warnings
    pub payload: String,
}

/// Traffic on the shared response channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Submitted(OutstandingRequest),
    Response(UpdateResponse),
}

/// Sends record updates to the authoritative name server.
///
/// `submit` must not block on the network: it queues the batch and returns
/// the handle under which the response will later appear on the response channel.
pub trait UpdateTransport: Send + Sync {
    fn submit(&self, batch: UpdateBatch) -> Result<CorrelationId, TransportError>;
}
