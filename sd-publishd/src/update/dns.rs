use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use anyhow::{Context, Result};
use chrono::Utc;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::rdata::opt::EdnsOption;
use hickory_proto::rr::rdata::{A, AAAA, PTR, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use shared::protocol::UPDATE_LEASE_OPTION;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::{DnsConfig, TsigKey};
use crate::error::{TransportError, UpdateError};
use super::batch::{
    Correlation, CorrelationId, OutstandingRequest, RecordData, RecordOperation, RecordType,
    UpdateBatch, UpdateMode, UpdateResponse, UpdateTransport,
};

const TSIG_FUDGE_SECS: u16 = 300;
const EDNS_MAX_PAYLOAD: u16 = 1232;
const RECV_BUFFER_LEN: usize = 4096;

/// Builds RFC 2136 UPDATE messages for one zone
pub struct UpdateMessageBuilder {
    zone: Name,
    signer: Option<TSigner>,
}

impl UpdateMessageBuilder {
    pub fn new(zone: &str, key: Option<&TsigKey>) -> Result<Self, TransportError> {
        let signer = key
            .map(|key| {
                TSigner::new(
                    key.secret.clone(),
                    TsigAlgorithm::HmacSha256,
                    to_name(&key.name)?,
                    TSIG_FUDGE_SECS,
                )
                .map_err(TransportError::from)
            })
            .transpose()?;

        Ok(Self {
            zone: to_name(zone)?,
            signer,
        })
    }

    pub fn is_signed(&self) -> bool {
        self.signer.is_some()
    }

    pub fn build(&self, id: u16, batch: &UpdateBatch) -> Result<Message, TransportError> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Update)
            .set_recursion_desired(false);

        // The zone section of an UPDATE reuses the question layout
        message.add_query(Query::query(self.zone.clone(), hickory_proto::rr::RecordType::SOA));

        for op in &batch.operations {
            message.add_name_server(to_record(op, batch.mode)?);
        }

        if let Some(lease) = batch.shortest_ttl() {
            let mut edns = Edns::new();
            edns.set_max_payload(EDNS_MAX_PAYLOAD);
            edns.options_mut()
                .insert(EdnsOption::Unknown(UPDATE_LEASE_OPTION, lease.to_be_bytes().to_vec()));
            message.set_edns(edns);
        }

        Ok(message)
    }

    pub fn encode(&self, id: u16, batch: &UpdateBatch) -> Result<Vec<u8>, TransportError> {
        let mut message = self.build(id, batch)?;
        if let Some(signer) = &self.signer {
            message.finalize(signer, Utc::now().timestamp() as u32)?;
        }
        Ok(message.to_vec()?)
    }
}

/// Update transport speaking DNS UPDATE over UDP to a single server.
///
/// Encoding happens on the submitting task; the socket belongs to a
/// background task so `submit` never waits on the network.
pub struct DnsUpdateTransport {
    builder: UpdateMessageBuilder,
    next_id: AtomicU16,
    outbound: mpsc::UnboundedSender<(CorrelationId, Vec<u8>)>,
    responses: mpsc::UnboundedSender<Correlation>,
}

impl DnsUpdateTransport {
    pub async fn connect(
        config: &DnsConfig,
        zone: &str,
        responses: mpsc::UnboundedSender<Correlation>,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let key = config.tsig_key()?;
        let builder = UpdateMessageBuilder::new(zone, key.as_ref())
            .with_context(|| format!("Failed to prepare updates for zone {}", zone))?;

        let server = config.server_addr();
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .context("Failed to bind update socket")?;
        socket
            .connect(server)
            .await
            .with_context(|| format!("Failed to connect update socket to {}", server))?;

        tracing::info!(
            "Sending updates for {} to {}{}",
            zone,
            server,
            if builder.is_signed() { " (TSIG)" } else { "" }
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_socket(
            socket,
            outbound_rx,
            responses.clone(),
            builder.is_signed(),
            cancel,
        ));

        let seed = (Utc::now().timestamp_subsec_nanos() & 0xffff) as u16;
        let transport = Self {
            builder,
            next_id: AtomicU16::new(seed),
            outbound,
            responses,
        };
        Ok((transport, handle))
    }
}

impl UpdateTransport for DnsUpdateTransport {
    fn submit(&self, batch: UpdateBatch) -> Result<CorrelationId, TransportError> {
        let id = CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let bytes = self.builder.encode(id.0, &batch)?;

        // Registered before the datagram leaves so the reply can never overtake it
        if self
            .responses
            .send(Correlation::Submitted(OutstandingRequest {
                id,
                mode: batch.mode,
                submitted_at: Utc::now(),
            }))
            .is_err()
        {
            tracing::debug!("Response correlator gone, {} will not be tracked", id);
        }

        if self.outbound.send((id, bytes)).is_err() {
            // Resolve the entry announced above so nobody waits on it
            let _ = self.responses.send(Correlation::Response(UpdateResponse {
                id,
                status: ResponseCode::ServFail,
                error: Some(UpdateError::Io("update socket closed".to_string())),
                payload: String::new(),
            }));
            return Err(TransportError::Closed);
        }
        tracing::debug!(
            "Queued {:?} update {} with {} records",
            batch.mode,
            id,
            batch.operations.len()
        );
        Ok(id)
    }
}

async fn run_socket(
    socket: UdpSocket,
    mut outbound: mpsc::UnboundedReceiver<(CorrelationId, Vec<u8>)>,
    responses: mpsc::UnboundedSender<Correlation>,
    signed: bool,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        tokio::select! {
            Some((id, bytes)) = outbound.recv() => {
                if let Err(e) = socket.send(&bytes).await {
                    tracing::warn!("Failed to send update {}: {}", id, e);
                    let _ = responses.send(Correlation::Response(UpdateResponse {
                        id,
                        status: ResponseCode::ServFail,
                        error: Some(UpdateError::Io(e.to_string())),
                        payload: String::new(),
                    }));
                }
            }

            received = socket.recv(&mut buf) => {
                match received {
                    Ok(len) => match Message::from_vec(&buf[..len]) {
                        Ok(message) => {
                            let _ = responses.send(Correlation::Response(classify(&message, signed)));
                        }
                        Err(e) => tracing::warn!("Discarding undecodable reply: {}", e),
                    },
                    Err(e) => tracing::warn!("Failed to receive update reply: {}", e),
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Update socket shutting down");
                break;
            }
        }
    }
}

/// Map a server reply onto the response taxonomy
pub fn classify(message: &Message, signed: bool) -> UpdateResponse {
    let status = message.response_code();
    let error = match status {
        ResponseCode::YXRRSet => Some(UpdateError::RecordSetExists),
        ResponseCode::NXRRSet => Some(UpdateError::RecordSetMissing),
        ResponseCode::NoError if signed && message.signature().is_empty() => {
            Some(UpdateError::NotAuthenticated)
        }
        _ => None,
    };

    UpdateResponse {
        id: CorrelationId(message.id()),
        status,
        error,
        payload: message.to_string(),
    }
}

/// Parse a presentation name label by label so instance names may contain
/// spaces. `\.` and `\\` inside a label stand for a literal dot and backslash.
pub fn to_name(name: &str) -> Result<Name, TransportError> {
    let labels = split_labels(name);

    let mut parsed = Name::from_labels(labels.iter().map(Vec::as_slice)).map_err(|e| {
        TransportError::InvalidName {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })?;
    parsed.set_fqdn(true);
    Ok(parsed)
}

fn split_labels(name: &str) -> Vec<Vec<u8>> {
    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut bytes = name.bytes();

    while let Some(b) = bytes.next() {
        match b {
            b'\\' => label.push(bytes.next().unwrap_or(b'\\')),
            b'.' => labels.push(std::mem::take(&mut label)),
            _ => label.push(b),
        }
    }
    // A trailing dot only marks the name absolute
    if !label.is_empty() {
        labels.push(label);
    }
    labels
}

fn wire_type(record_type: RecordType) -> hickory_proto::rr::RecordType {
    use hickory_proto::rr::RecordType as Wire;
    match record_type {
        RecordType::A => Wire::A,
        RecordType::AAAA => Wire::AAAA,
        RecordType::PTR => Wire::PTR,
        RecordType::SRV => Wire::SRV,
        RecordType::TXT => Wire::TXT,
    }
}

fn to_rdata(data: &RecordData) -> Result<RData, TransportError> {
    let rdata = match data {
        RecordData::A(addr) => RData::A(A::from(*addr)),
        RecordData::AAAA(addr) => RData::AAAA(AAAA::from(*addr)),
        RecordData::PTR(name) => RData::PTR(PTR(to_name(name)?)),
        RecordData::SRV { priority, weight, port, target } => {
            RData::SRV(SRV::new(*priority, *weight, *port, to_name(target)?))
        }
        RecordData::TXT(strings) => RData::TXT(TXT::new(strings.clone())),
    };
    Ok(rdata)
}

fn to_record(op: &RecordOperation, mode: UpdateMode) -> Result<Record, TransportError> {
    let name = to_name(&op.target)?;

    let record = match (mode, &op.data) {
        (UpdateMode::Upsert, Some(data)) => {
            Record::from_rdata(name, op.ttl.unwrap_or_default(), to_rdata(data)?)
        }
        // Delete one RR from a set
        (UpdateMode::Delete, Some(data)) => {
            let mut record = Record::from_rdata(name, 0, to_rdata(data)?);
            record.set_dns_class(DNSClass::NONE);
            record
        }
        // Delete the whole RRset
        (UpdateMode::Delete, None) => {
            let mut record = Record::with(name, wire_type(op.record_type), 0);
            record.set_dns_class(DNSClass::ANY);
            record
        }
        (UpdateMode::Upsert, None) => {
            return Err(TransportError::InvalidName {
                name: op.target.clone(),
                reason: format!("{} upsert without data", op.record_type),
            });
        }
    };
    Ok(record)
}
