use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::types::ServiceRecord;
use crate::events::{Event, EventBus};
use crate::host::HostAddresses;
use crate::publisher::ServicePublisher;

/// Registered identifiers and the generation they were registered under.
/// Published by the controller after every registry change.
pub type Membership = Arc<HashMap<String, u64>>;

/// A pending renewal. `record == None` is the host's own address lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    pub expires_at: DateTime<Utc>,
    pub record: Option<ServiceRecord>,
    /// Registry generation of `record`; a re-registered service gets a new one
    pub generation: u64,
}

impl LeaseEntry {
    pub fn service(record: ServiceRecord, generation: u64, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            record: Some(record),
            generation,
        }
    }

    pub fn host(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            record: None,
            generation: 0,
        }
    }
}

/// Renewal time for a lease of `lease_secs` starting at `now`
pub fn expiry(now: DateTime<Utc>, lease_secs: u32) -> DateTime<Utc> {
    now + Duration::seconds(i64::from(lease_secs))
}

#[derive(Debug)]
struct Scheduled {
    entry: LeaseEntry,
    seq: u64,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .expires_at
            .cmp(&other.entry.expires_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of lease entries by expiry; ties pop in insertion order
#[derive(Debug, Default)]
pub struct LeaseSchedule {
    heap: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

impl LeaseSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LeaseEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Scheduled { entry, seq }));
    }

    /// Pop the earliest entry if it expires at or before `now`
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<LeaseEntry> {
        match self.heap.peek() {
            Some(Reverse(next)) if next.entry.expires_at <= now => {
                self.heap.pop().map(|Reverse(s)| s.entry)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(s)| s.entry.expires_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Sending side of the scheduler's inbox
#[derive(Clone)]
pub struct LeaseHandle {
    tx: mpsc::UnboundedSender<LeaseEntry>,
}

impl LeaseHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LeaseEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, entry: LeaseEntry) {
        if self.tx.send(entry).is_err() {
            tracing::warn!("Lease scheduler is gone, renewal not scheduled");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Renewed(ServiceRecord),
    HostRenewed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseEventKind {
    Renewed,
    HostRenewed,
}

impl Event for LeaseEvent {
    type Kind = LeaseEventKind;

    fn kind(&self) -> LeaseEventKind {
        match self {
            LeaseEvent::Renewed(_) => LeaseEventKind::Renewed,
            LeaseEvent::HostRenewed => LeaseEventKind::HostRenewed,
        }
    }
}

/// Re-publishes records before their TTL runs out.
///
/// Owns the lease schedule exclusively. Wakes on a fixed interval, so a
/// renewal may run up to one interval after its entry expired.
pub struct LeaseScheduler {
    schedule: LeaseSchedule,
    inbox: mpsc::UnboundedReceiver<LeaseEntry>,
    membership: watch::Receiver<Membership>,
    publisher: ServicePublisher,
    host: Option<HostAddresses>,
    events: EventBus<LeaseEvent>,
}

impl LeaseScheduler {
    pub fn new(
        publisher: ServicePublisher,
        inbox: mpsc::UnboundedReceiver<LeaseEntry>,
        membership: watch::Receiver<Membership>,
    ) -> Self {
        Self {
            schedule: LeaseSchedule::new(),
            inbox,
            membership,
            publisher,
            host: None,
            events: EventBus::new(),
        }
    }

    /// Renew the host's address records whenever a host lease expires
    pub fn with_host(mut self, host: HostAddresses) -> Self {
        self.host = Some(host);
        self
    }

    #[cfg(test)]
    pub fn events_mut(&mut self) -> &mut EventBus<LeaseEvent> {
        &mut self.events
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.schedule.len()
    }

    /// One scheduler wake-up: take newly scheduled entries, then renew everything due.
    /// Returns the number of renewals submitted.
    ///
    /// Only entries due when the tick starts are renewed; their replacements
    /// wait for the next tick even when the lease time is zero.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        while let Ok(entry) = self.inbox.try_recv() {
            self.schedule.push(entry);
        }

        let mut due = Vec::new();
        while let Some(entry) = self.schedule.pop_due(now) {
            due.push(entry);
        }

        let mut renewed = 0;
        for entry in due {
            if self.renew(entry, now) {
                renewed += 1;
            }
        }
        renewed
    }

    fn renew(&mut self, entry: LeaseEntry, now: DateTime<Utc>) -> bool {
        let settings = self.publisher.settings();
        let ttl = settings.ttl;
        let next = expiry(now, settings.lease_time());

        let Some(record) = entry.record else {
            let Some(host) = &self.host else {
                tracing::debug!("Dropping host lease, no addresses are published");
                return false;
            };
            let result = self.publisher.publish_addresses(host, ttl);
            self.schedule.push(LeaseEntry::host(next));
            return match result {
                Ok(id) => {
                    tracing::debug!("Renewed addresses of {} as {}", host.target, id);
                    self.events.publish(&LeaseEvent::HostRenewed);
                    true
                }
                Err(e) => {
                    tracing::warn!("Failed to renew addresses of {}: {}", host.target, e);
                    false
                }
            };
        };

        let current = self.membership.borrow().get(&record.identifier()).copied();
        if current != Some(entry.generation) {
            tracing::debug!("Dropping stale lease for {}", record);
            return false;
        }

        let result = self.publisher.publish(&record, ttl);
        self.schedule
            .push(LeaseEntry::service(record.clone(), entry.generation, next));

        match result {
            Ok(id) => {
                tracing::debug!("Renewed {} as {}", record, id);
                self.events.publish(&LeaseEvent::Renewed(record));
                true
            }
            Err(e) => {
                tracing::warn!("Failed to renew {}: {}", record, e);
                false
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.publisher.settings().sleep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let renewed = self.tick(Utc::now());
                    if renewed > 0 {
                        tracing::info!("Renewed {} leases, {} pending", renewed, self.schedule.len());
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Lease scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use crate::config::PublisherConfig;
    use crate::update::batch::testing::RecordingTransport;

    struct Harness {
        scheduler: LeaseScheduler,
        leases: LeaseHandle,
        membership: watch::Sender<Membership>,
        transport: RecordingTransport,
        renewed: Arc<Mutex<Vec<LeaseEvent>>>,
    }

    fn harness(ttl: u32) -> Harness {
        let transport = RecordingTransport::new();
        let mut settings = PublisherConfig::new("browse.example.com", "test");
        settings.ttl = ttl;
        let publisher = ServicePublisher::new(Arc::new(transport.clone()), Arc::new(settings));

        let (leases, inbox) = LeaseHandle::channel();
        let (membership, membership_rx) = watch::channel(Membership::default());
        let mut scheduler = LeaseScheduler::new(publisher, inbox, membership_rx);

        let renewed = Arc::new(Mutex::new(Vec::new()));
        for kind in [LeaseEventKind::Renewed, LeaseEventKind::HostRenewed] {
            let renewed = renewed.clone();
            scheduler
                .events_mut()
                .subscribe(kind, move |e: &LeaseEvent| renewed.lock().unwrap().push(e.clone()));
        }

        Harness { scheduler, leases, membership, transport, renewed }
    }

    fn register(membership: &watch::Sender<Membership>, record: &ServiceRecord, generation: u64) {
        membership.send_modify(|m| {
            Arc::make_mut(m).insert(record.identifier(), generation);
        });
    }

    #[test]
    fn test_schedule_orders_by_expiry() {
        let now = Utc::now();
        let mut schedule = LeaseSchedule::new();
        for secs in [5, 1, 3] {
            schedule.push(LeaseEntry::service(
                ServiceRecord::new("s", "_x._tcp", secs as u16),
                0,
                expiry(now, secs),
            ));
        }

        assert_eq!(schedule.next_expiry(), Some(expiry(now, 1)));
        assert_eq!(schedule.pop_due(now), None);

        let later = expiry(now, 10);
        let ports: Vec<u16> = std::iter::from_fn(|| schedule.pop_due(later))
            .map(|e| e.record.unwrap().port())
            .collect();
        assert_eq!(ports, vec![1, 3, 5]);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_schedule_ties_pop_in_insertion_order() {
        let now = Utc::now();
        let mut schedule = LeaseSchedule::new();
        for port in [10, 20, 30] {
            schedule.push(LeaseEntry::service(ServiceRecord::new("s", "_x._tcp", port), 0, now));
        }
        let ports: Vec<u16> = std::iter::from_fn(|| schedule.pop_due(now))
            .map(|e| e.record.unwrap().port())
            .collect();
        assert_eq!(ports, vec![10, 20, 30]);
    }

    #[test]
    fn test_entry_due_exactly_now_is_renewed() {
        let mut h = harness(7200);
        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&h.membership, &record, 1);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(record.clone(), 1, now));

        assert_eq!(h.scheduler.tick(now), 1);
        assert_eq!(*h.renewed.lock().unwrap(), vec![LeaseEvent::Renewed(record)]);
        assert_eq!(h.transport.upserts(), 1);
        assert_eq!(h.scheduler.pending(), 1);
    }

    #[test]
    fn test_future_entry_waits() {
        let mut h = harness(7200);
        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&h.membership, &record, 1);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(record, 1, expiry(now, 4800)));

        assert_eq!(h.scheduler.tick(now), 0);
        assert_eq!(h.scheduler.pending(), 1);
        assert!(h.transport.batches().is_empty());
    }

    #[test]
    fn test_renewal_stops_after_delete() {
        // ttl 1 gives a lease time of 0, so every tick renews
        let mut h = harness(1);
        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&h.membership, &record, 1);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(record.clone(), 1, now));

        assert_eq!(h.scheduler.tick(now), 1);
        assert_eq!(h.scheduler.tick(now), 1);
        assert_eq!(h.renewed.lock().unwrap().len(), 2);

        h.membership.send_modify(|m| {
            Arc::make_mut(m).remove(&record.identifier());
        });

        assert_eq!(h.scheduler.tick(now), 0);
        assert_eq!(h.scheduler.tick(now), 0);
        assert_eq!(h.renewed.lock().unwrap().len(), 2);
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn test_zero_lease_renews_once_per_tick() {
        // ttl 1 gives a lease time of 0; the renewed entry is due again at once
        let h = harness(1);
        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&h.membership, &record, 1);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(record, 1, now));

        let mut scheduler = h.scheduler;
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let renewed = scheduler.tick(now);
            let _ = done_tx.send((renewed, scheduler.pending()));
        });

        let (renewed, pending) = done_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("tick did not finish");
        assert_eq!(renewed, 1);
        assert_eq!(pending, 1);
        assert_eq!(h.transport.upserts(), 1);
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let mut h = harness(7200);
        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&h.membership, &record, 2);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(record, 1, now));

        assert_eq!(h.scheduler.tick(now), 0);
        assert!(h.renewed.lock().unwrap().is_empty());
        assert!(h.transport.batches().is_empty());
    }

    #[test]
    fn test_host_lease_renews_addresses() {
        let mut h = harness(7200);
        h.scheduler = h.scheduler.with_host(HostAddresses {
            target: "test.browse.example.com".into(),
            ipv4: Some(Ipv4Addr::new(192, 0, 2, 10)),
            ipv6: None,
        });

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::host(now));

        assert_eq!(h.scheduler.tick(now), 1);
        assert_eq!(*h.renewed.lock().unwrap(), vec![LeaseEvent::HostRenewed]);
        assert_eq!(h.scheduler.pending(), 1);
    }

    #[test]
    fn test_failed_renewal_does_not_stop_others() {
        let mut h = harness(7200);
        let a = ServiceRecord::new("a", "_a._tcp", 1);
        let b = ServiceRecord::new("b", "_b._tcp", 2);
        register(&h.membership, &a, 1);
        register(&h.membership, &b, 1);

        let now = Utc::now();
        h.leases.schedule(LeaseEntry::service(a, 1, now));
        h.leases.schedule(LeaseEntry::service(b, 1, now));
        h.transport.set_failing(true);

        assert_eq!(h.scheduler.tick(now), 0);
        assert!(h.renewed.lock().unwrap().is_empty());
        // Both keep their lease for the next period
        assert_eq!(h.scheduler.pending(), 2);
    }

    #[tokio::test]
    async fn test_run_renews_on_tick() {
        let transport = RecordingTransport::new();
        let mut settings = PublisherConfig::new("browse.example.com", "test");
        settings.ttl = 1;
        settings.sleep_interval_secs = 1;
        let publisher = ServicePublisher::new(Arc::new(transport.clone()), Arc::new(settings));

        let (leases, inbox) = LeaseHandle::channel();
        let (membership, membership_rx) = watch::channel(Membership::default());
        let mut scheduler = LeaseScheduler::new(publisher, inbox, membership_rx);

        let (renewed_tx, mut renewed_rx) = mpsc::unbounded_channel();
        scheduler.events_mut().subscribe(LeaseEventKind::Renewed, move |e: &LeaseEvent| {
            let _ = renewed_tx.send(e.clone());
        });

        let record = ServiceRecord::new("ssh", "_ssh._tcp", 22);
        register(&membership, &record, 1);
        leases.schedule(LeaseEntry::service(record.clone(), 1, Utc::now()));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), renewed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, LeaseEvent::Renewed(record));
        assert!(transport.upserts() >= 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
