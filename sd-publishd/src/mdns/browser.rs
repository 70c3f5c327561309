use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::protocol::{MDNS_LOCAL_SUFFIX, META_QUERY_TYPE};
use shared::types::ServiceRecord;
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Added(ServiceRecord),
    Removed(ServiceRecord),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryEventKind {
    Added,
    Removed,
    Quit,
}

impl Event for DiscoveryEvent {
    type Kind = DiscoveryEventKind;

    fn kind(&self) -> DiscoveryEventKind {
        match self {
            DiscoveryEvent::Added(_) => DiscoveryEventKind::Added,
            DiscoveryEvent::Removed(_) => DiscoveryEventKind::Removed,
            DiscoveryEvent::Quit => DiscoveryEventKind::Quit,
        }
    }
}

/// Services seen so far, keyed by full mDNS instance name.
/// mdns-sd reports removals by name only, so the record comes from here.
pub struct FeedState {
    known: HashMap<String, ServiceRecord>,
    local_host: Option<String>,
    events: EventBus<DiscoveryEvent>,
}

impl FeedState {
    /// `local_host` restricts the feed to services announced by that host
    pub fn new(local_host: Option<String>) -> Self {
        Self {
            known: HashMap::new(),
            local_host: local_host.map(|h| h.to_ascii_lowercase()),
            events: EventBus::new(),
        }
    }

    pub fn events_mut(&mut self) -> &mut EventBus<DiscoveryEvent> {
        &mut self.events
    }

    #[cfg(test)]
    pub fn known(&self) -> usize {
        self.known.len()
    }

    /// A service was resolved (or re-announced) on the link
    pub fn resolved(&mut self, fullname: &str, host: &str, record: ServiceRecord) {
        if let Some(local) = &self.local_host {
            if strip_local(host).to_ascii_lowercase() != *local {
                tracing::trace!("Skipping {} announced by {}", fullname, host);
                return;
            }
        }

        match self.known.get(fullname) {
            Some(existing) if *existing == record => {
                tracing::trace!("Suppressing re-announcement of {}", fullname);
                return;
            }
            Some(existing) => {
                tracing::debug!("Service {} changed", fullname);
                let existing = existing.clone();
                self.events.publish(&DiscoveryEvent::Removed(existing));
            }
            None => {}
        }

        tracing::debug!("Resolved service: {}", fullname);
        self.known.insert(fullname.to_string(), record.clone());
        self.events.publish(&DiscoveryEvent::Added(record));
    }

    pub fn removed(&mut self, fullname: &str) {
        match self.known.remove(fullname) {
            Some(record) => {
                tracing::debug!("Service removed: {}", fullname);
                self.events.publish(&DiscoveryEvent::Removed(record));
            }
            None => tracing::trace!("Ignoring removal of unmirrored {}", fullname),
        }
    }

    pub fn quit(&self) {
        self.events.publish(&DiscoveryEvent::Quit);
    }
}

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of the receiver; flume::Receiver is Clone (multi-consumer).
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Browses every service type on the link and mirrors what it finds into
/// [`DiscoveryEvent`]s. One browse per type, each with its own receiver.
pub struct DiscoveryFeed {
    daemon: ServiceDaemon,
    state: FeedState,
}

impl DiscoveryFeed {
    pub fn new(daemon: ServiceDaemon, local_host: Option<String>) -> Self {
        Self {
            daemon,
            state: FeedState::new(local_host),
        }
    }

    pub fn events_mut(&mut self) -> &mut EventBus<DiscoveryEvent> {
        self.state.events_mut()
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Starting mDNS browser");

        let meta_receiver = self
            .daemon
            .browse(META_QUERY_TYPE)
            .context("Failed to start meta-query browse")?;

        let mut browsed_types = HashSet::new();
        let mut next_idx = 0usize;
        let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

        loop {
            tokio::select! {
                event = meta_receiver.recv_async() => {
                    // For the meta-query the instance name is the advertised type
                    let found = match event {
                        Ok(ServiceEvent::ServiceFound(_, fullname)) => Some(fullname),
                        Ok(ServiceEvent::ServiceResolved(info)) => Some(meta_type(&info)),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::error!("Meta-query receiver closed: {}", e);
                            break;
                        }
                    };
                    if let Some(service_type) = found {
                        if browsed_types.insert(service_type.clone()) {
                            tracing::info!("Discovered new service type: {}", service_type);
                            match self.daemon.browse(&service_type) {
                                Ok(receiver) => {
                                    type_futures.push(make_recv_future(next_idx, receiver));
                                    next_idx += 1;
                                }
                                Err(e) => {
                                    tracing::error!("Failed to browse {}: {}", service_type, e);
                                }
                            }
                        }
                    }
                }

                Some((idx, rx, result)) = type_futures.next() => {
                    match result {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            if let Some(record) = convert_service_info(&info) {
                                self.state.resolved(info.get_fullname(), info.get_hostname(), record);
                            }
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                            self.state.removed(&fullname);
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Ok(_) => {
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Err(e) => {
                            tracing::warn!("Receiver {} disconnected: {}", idx, e);
                        }
                    }
                }

                _ = cancel.cancelled() => {
                    tracing::info!("mDNS browser shutting down");
                    break;
                }
            }
        }

        self.state.quit();
        Ok(())
    }
}

/// Service type announced by a meta-query answer, e.g. "_http._tcp.local."
fn meta_type(info: &ServiceInfo) -> String {
    let fullname = info.get_fullname();
    fullname
        .strip_suffix(info.get_type())
        .map(|s| s.trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .map(|s| format!("{}{}", s, MDNS_LOCAL_SUFFIX))
        .unwrap_or_else(|| fullname.to_string())
}

/// "nas.local." -> "nas"
pub fn strip_local(name: &str) -> &str {
    name.strip_suffix(MDNS_LOCAL_SUFFIX)
        .or_else(|| name.strip_suffix(".local"))
        .unwrap_or(name)
        .trim_end_matches('.')
}

/// "fileserver._http._tcp.local." with type "_http._tcp.local." -> "fileserver"
pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
}

/// Convert an mdns-sd ServiceInfo to a ServiceRecord for the wide-area zone
fn convert_service_info(info: &ServiceInfo) -> Option<ServiceRecord> {
    let service_type = strip_local(info.get_type());
    if service_type.is_empty() || info.get_port() == 0 {
        tracing::debug!("Skipping incomplete service {}", info.get_fullname());
        return None;
    }

    let txt: Vec<String> = info
        .get_properties()
        .iter()
        .map(|prop| {
            let value = prop.val_str();
            if value.is_empty() {
                prop.key().to_string()
            } else {
                format!("{}={}", prop.key(), value)
            }
        })
        .collect();

    let record = ServiceRecord::new(
        instance_name(info.get_fullname(), info.get_type()),
        service_type,
        info.get_port(),
    )
    .with_hostname(strip_local(info.get_hostname()))
    .with_txt(txt);

    Some(record)
}
