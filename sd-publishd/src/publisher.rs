use std::sync::Arc;
use shared::types::ServiceRecord;
use crate::config::PublisherConfig;
use crate::error::TransportError;
use crate::host::HostAddresses;
use crate::update::{
    CorrelationId, RecordData, RecordOperation, RecordType, UpdateBatch, UpdateTransport,
};

/// Turns services and host addresses into update batches for the configured zone
#[derive(Clone)]
pub struct ServicePublisher {
    transport: Arc<dyn UpdateTransport>,
    settings: Arc<PublisherConfig>,
}

impl ServicePublisher {
    pub fn new(transport: Arc<dyn UpdateTransport>, settings: Arc<PublisherConfig>) -> Self {
        Self { transport, settings }
    }

    pub fn settings(&self) -> &PublisherConfig {
        &self.settings
    }

    /// Publish PTR, SRV and TXT for `record` as one batch, all sharing `ttl`
    pub fn publish(&self, record: &ServiceRecord, ttl: u32) -> Result<CorrelationId, TransportError> {
        let id = self.transport.submit(UpdateBatch::upsert(self.service_operations(record, ttl)))?;
        tracing::debug!("Publishing {} as {}", record, id);
        Ok(id)
    }

    /// Remove the PTR, SRV and TXT published for `record`
    pub fn unpublish(&self, record: &ServiceRecord) -> Result<CorrelationId, TransportError> {
        let id = self.transport.submit(UpdateBatch::delete(self.removal_operations(record)))?;
        tracing::debug!("Unpublishing {} as {}", record, id);
        Ok(id)
    }

    pub fn publish_addresses(
        &self,
        host: &HostAddresses,
        ttl: u32,
    ) -> Result<CorrelationId, TransportError> {
        let operations = host
            .records()
            .into_iter()
            .map(|data| RecordOperation::upsert(host.target.clone(), ttl, data))
            .collect();
        self.transport.submit(UpdateBatch::upsert(operations))
    }

    pub fn unpublish_addresses(&self, host: &HostAddresses) -> Result<CorrelationId, TransportError> {
        let operations = host
            .records()
            .into_iter()
            .map(|data| RecordOperation::delete_value(host.target.clone(), data))
            .collect();
        self.transport.submit(UpdateBatch::delete(operations))
    }

    fn service_operations(&self, record: &ServiceRecord, ttl: u32) -> Vec<RecordOperation> {
        let zone = &self.settings.zone;
        let host = &self.settings.hostname;
        let instance = record.instance_in_zone(zone, host);

        vec![
            RecordOperation::upsert(
                record.type_in_zone(zone),
                ttl,
                RecordData::PTR(instance.clone()),
            ),
            RecordOperation::upsert(
                instance.clone(),
                ttl,
                RecordData::SRV {
                    priority: self.settings.srv_priority,
                    weight: self.settings.srv_weight,
                    port: record.port(),
                    target: record.target(host, zone),
                },
            ),
            RecordOperation::upsert(instance, ttl, RecordData::TXT(record.txt())),
        ]
    }

    fn removal_operations(&self, record: &ServiceRecord) -> Vec<RecordOperation> {
        let zone = &self.settings.zone;
        let instance = record.instance_in_zone(zone, &self.settings.hostname);

        vec![
            RecordOperation::delete_set(instance.clone(), RecordType::SRV),
            // Other instances of the same type keep their PTR
            RecordOperation::delete_value(record.type_in_zone(zone), RecordData::PTR(instance.clone())),
            RecordOperation::delete_set(instance, RecordType::TXT),
        ]
    }
}
