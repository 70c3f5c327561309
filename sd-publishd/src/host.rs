use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use chrono::Utc;
use crate::config::HostConfig;
use crate::events::{Event, EventBus};
use crate::lease::{expiry, LeaseEntry, LeaseHandle};
use crate::publisher::ServicePublisher;
use crate::update::{CorrelationId, RecordData, RecordType};

/// Well-known public addresses used only to pick the outbound interface.
/// Nothing is sent to them.
const ROUTE_V4: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
const ROUTE_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    53,
);

/// The host's own address records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddresses {
    pub target: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl HostAddresses {
    /// Configured addresses, falling back to the addresses of the default route
    pub fn detect(config: &HostConfig, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ipv4: config.ipv4.or_else(|| match route_address(ROUTE_V4) {
                Some(IpAddr::V4(addr)) => Some(addr),
                _ => None,
            }),
            ipv6: config.ipv6.or_else(|| match route_address(ROUTE_V6) {
                Some(IpAddr::V6(addr)) => Some(addr),
                _ => None,
            }),
        }
    }

    pub fn records(&self) -> Vec<RecordData> {
        let mut records = Vec::new();
        if let Some(addr) = self.ipv4 {
            records.push(RecordData::A(addr));
        }
        if let Some(addr) = self.ipv6 {
            records.push(RecordData::AAAA(addr));
        }
        records
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Local address the kernel would use to reach `remote`
fn route_address(remote: SocketAddr) -> Option<IpAddr> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let result = UdpSocket::bind(local)
        .and_then(|socket| socket.connect(remote).map(|_| socket))
        .and_then(|socket| socket.local_addr());

    match result {
        Ok(addr) if !addr.ip().is_unspecified() => Some(addr.ip()),
        Ok(_) => None,
        Err(e) => {
            tracing::info!("Unable to determine address toward {}: {}", remote, e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEvent {
    Added(RecordType, IpAddr),
    Removed(RecordType, IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressEventKind {
    Added,
    Removed,
}

impl Event for AddressEvent {
    type Kind = AddressEventKind;

    fn kind(&self) -> AddressEventKind {
        match self {
            AddressEvent::Added(..) => AddressEventKind::Added,
            AddressEvent::Removed(..) => AddressEventKind::Removed,
        }
    }
}

/// Publishes A/AAAA for the host and keeps them leased
pub struct HostAddressController {
    addresses: HostAddresses,
    publisher: ServicePublisher,
    leases: LeaseHandle,
    events: EventBus<AddressEvent>,
}

impl HostAddressController {
    pub fn new(addresses: HostAddresses, publisher: ServicePublisher, leases: LeaseHandle) -> Self {
        Self {
            addresses,
            publisher,
            leases,
            events: EventBus::new(),
        }
    }

    #[cfg(test)]
    pub fn events_mut(&mut self) -> &mut EventBus<AddressEvent> {
        &mut self.events
    }

    pub fn publish(&self) -> Option<CorrelationId> {
        if self.addresses.is_empty() {
            tracing::warn!("No addresses known for {}, nothing to publish", self.addresses.target);
            return None;
        }

        let settings = self.publisher.settings();
        let id = match self.publisher.publish_addresses(&self.addresses, settings.ttl) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Failed to publish addresses of {}: {}", self.addresses.target, e);
                return None;
            }
        };

        self.leases
            .schedule(LeaseEntry::host(expiry(Utc::now(), settings.lease_time())));
        for event in self.address_events(AddressEvent::Added) {
            tracing::info!("Published {:?}", event);
            self.events.publish(&event);
        }
        Some(id)
    }

    pub fn unpublish(&self) -> Option<CorrelationId> {
        if self.addresses.is_empty() {
            return None;
        }

        match self.publisher.unpublish_addresses(&self.addresses) {
            Ok(id) => {
                for event in self.address_events(AddressEvent::Removed) {
                    self.events.publish(&event);
                }
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Failed to unpublish addresses of {}: {}", self.addresses.target, e);
                None
            }
        }
    }

    fn address_events(&self, make: fn(RecordType, IpAddr) -> AddressEvent) -> Vec<AddressEvent> {
        let mut events = Vec::new();
        if let Some(addr) = self.addresses.ipv4 {
            events.push(make(RecordType::A, IpAddr::V4(addr)));
        }
        if let Some(addr) = self.addresses.ipv6 {
            events.push(make(RecordType::AAAA, IpAddr::V6(addr)));
        }
        events
    }
}
