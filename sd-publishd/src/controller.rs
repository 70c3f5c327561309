use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use shared::types::ServiceRecord;
use crate::action::Action;
use crate::error::{ControllerError, TransportError};
use crate::events::{Event, EventBus};
use crate::lease::{expiry, LeaseEntry, LeaseHandle, Membership};
use crate::publisher::ServicePublisher;
use crate::update::CorrelationId;

/// Published services keyed by identifier
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, (ServiceRecord, u64)>,
    next_generation: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record`; an existing entry under the same identifier is kept
    pub fn add_service(&mut self, record: ServiceRecord) -> Result<u64, ControllerError> {
        let key = record.identifier();
        if self.services.contains_key(&key) {
            return Err(ControllerError::DuplicateService { key });
        }
        self.next_generation += 1;
        self.services.insert(key, (record, self.next_generation));
        Ok(self.next_generation)
    }

    pub fn delete_service(&mut self, record: &ServiceRecord) -> Option<ServiceRecord> {
        self.services.remove(&record.identifier()).map(|(record, _)| record)
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&ServiceRecord> {
        self.services.get(key).map(|(record, _)| record)
    }

    pub fn size(&self) -> usize {
        self.services.len()
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values().map(|(record, _)| record)
    }

    fn entries(&self) -> impl Iterator<Item = (&ServiceRecord, u64)> {
        self.services.values().map(|(record, generation)| (record, *generation))
    }

    fn membership(&self) -> Membership {
        Arc::new(
            self.services
                .iter()
                .map(|(key, (_, generation))| (key.clone(), *generation))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// `correlation` is `None` when the publish could not be submitted
    Added {
        record: ServiceRecord,
        correlation: Option<CorrelationId>,
    },
    Deleted(ServiceRecord),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerEventKind {
    Added,
    Deleted,
    Quit,
}

impl Event for ControllerEvent {
    type Kind = ControllerEventKind;

    fn kind(&self) -> ControllerEventKind {
        match self {
            ControllerEvent::Added { .. } => ControllerEventKind::Added,
            ControllerEvent::Deleted(_) => ControllerEventKind::Deleted,
            ControllerEvent::Quit => ControllerEventKind::Quit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Draining,
    Stopped,
}

/// Producer side of the action queue. Cheap to clone, usable from any task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Action>,
}

impl ControllerHandle {
    pub fn enqueue(&self, action: Action) -> Result<(), ControllerError> {
        self.tx.send(action).map_err(|_| ControllerError::QueueClosed)
    }

    pub fn add(&self, record: ServiceRecord) -> Result<(), ControllerError> {
        self.enqueue(Action::Add(record))
    }

    pub fn delete(&self, record: ServiceRecord) -> Result<(), ControllerError> {
        self.enqueue(Action::Delete(record))
    }

    pub fn quit(&self) -> Result<(), ControllerError> {
        self.enqueue(Action::Quit)
    }
}

/// Owns the registry. Every mutation arrives as an [`Action`] and is applied
/// by [`Controller::run`] on a single task.
pub struct Controller {
    registry: ServiceRegistry,
    rx: mpsc::UnboundedReceiver<Action>,
    publisher: ServicePublisher,
    leases: LeaseHandle,
    membership: watch::Sender<Membership>,
    events: EventBus<ControllerEvent>,
    state: ControllerState,
}

impl Controller {
    pub fn new(publisher: ServicePublisher, leases: LeaseHandle) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (membership, _) = watch::channel(Membership::default());

        let controller = Self {
            registry: ServiceRegistry::new(),
            rx,
            publisher,
            leases,
            membership,
            events: EventBus::new(),
            state: ControllerState::Running,
        };
        (controller, ControllerHandle { tx })
    }

    pub fn events_mut(&mut self) -> &mut EventBus<ControllerEvent> {
        &mut self.events
    }

    /// Read-only view of registered identifiers for the lease scheduler
    pub fn membership(&self) -> watch::Receiver<Membership> {
        self.membership.subscribe()
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn add_service(&mut self, record: ServiceRecord) -> Result<u64, ControllerError> {
        let generation = self.registry.add_service(record)?;
        self.membership.send_replace(self.registry.membership());
        Ok(generation)
    }

    pub fn delete_service(&mut self, record: &ServiceRecord) -> Option<ServiceRecord> {
        let removed = self.registry.delete_service(record);
        if removed.is_some() {
            self.membership.send_replace(self.registry.membership());
        }
        removed
    }

    /// Publish `record` and schedule its renewal `lease_time` from now
    pub fn publish(
        &self,
        record: &ServiceRecord,
        generation: u64,
    ) -> Result<CorrelationId, TransportError> {
        let settings = self.publisher.settings();
        let id = self.publisher.publish(record, settings.ttl)?;
        self.leases.schedule(LeaseEntry::service(
            record.clone(),
            generation,
            expiry(Utc::now(), settings.lease_time()),
        ));
        Ok(id)
    }

    pub fn unpublish(&self, record: &ServiceRecord) -> Result<CorrelationId, TransportError> {
        self.publisher.unpublish(record)
    }

    pub fn publish_all(&self) -> Vec<CorrelationId> {
        self.registry
            .entries()
            .filter_map(|(record, generation)| match self.publish(record, generation) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("Failed to publish {}: {}", record, e);
                    None
                }
            })
            .collect()
    }

    pub fn unpublish_all(&self) -> Vec<CorrelationId> {
        self.registry
            .records()
            .filter_map(|record| match self.unpublish(record) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("Failed to unpublish {}: {}", record, e);
                    None
                }
            })
            .collect()
    }

    pub fn process_action(&mut self, action: Action) {
        tracing::trace!("Processing {} action", action.name());
        match action {
            Action::Add(record) => self.process_add(record),
            Action::Delete(record) => self.process_delete(record),
            Action::Quit => self.process_quit(),
        }
    }

    fn process_add(&mut self, record: ServiceRecord) {
        let generation = match self.add_service(record.clone()) {
            Ok(generation) => generation,
            Err(e) => {
                tracing::debug!("Ignoring {}: {}", record, e);
                return;
            }
        };

        let correlation = match self.publish(&record, generation) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to publish {}: {}", record, e);
                None
            }
        };

        tracing::info!("Added {}", record);
        self.events.publish(&ControllerEvent::Added { record, correlation });
    }

    fn process_delete(&mut self, record: ServiceRecord) {
        if self.delete_service(&record).is_none() {
            tracing::debug!("Deleting unregistered {}", record);
        }
        // Best effort, the records may still exist from an earlier run
        if let Err(e) = self.unpublish(&record) {
            tracing::warn!("Failed to unpublish {}: {}", record, e);
        }

        tracing::info!("Deleted {}", record);
        self.events.publish(&ControllerEvent::Deleted(record));
    }

    fn process_quit(&mut self) {
        if self.state != ControllerState::Running {
            return;
        }

        self.state = ControllerState::Draining;
        let mut drained = 0;
        while let Ok(action) = self.rx.try_recv() {
            self.process_action(action);
            drained += 1;
        }

        let removed = self.unpublish_all();
        // Withdrawn records must not come back through a pending lease
        self.membership.send_replace(Membership::default());
        tracing::info!(
            "Controller quitting: drained {} actions, unpublished {} services",
            drained,
            removed.len()
        );

        self.events.publish(&ControllerEvent::Quit);
        self.state = ControllerState::Stopped;
    }

    /// Consume actions until a Quit has been processed.
    /// Dropping every handle is treated as a Quit.
    pub async fn run(mut self) -> ServiceRegistry {
        tracing::info!("Controller running");

        while self.state != ControllerState::Stopped {
            match self.rx.recv().await {
                Some(action) => self.process_action(action),
                None => {
                    tracing::info!("All controller handles dropped");
                    self.process_quit();
                }
            }
        }

        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::config::PublisherConfig;
    use crate::lease::LeaseScheduler;
    use crate::update::batch::testing::RecordingTransport;
    use crate::update::UpdateMode;

    struct Harness {
        controller: Controller,
        handle: ControllerHandle,
        transport: RecordingTransport,
        lease_rx: mpsc::UnboundedReceiver<LeaseEntry>,
        log: Arc<Mutex<Vec<ControllerEvent>>>,
    }

    fn harness() -> Harness {
        let transport = RecordingTransport::new();
        let settings = PublisherConfig::new("browse.example.com", "test");
        let publisher = ServicePublisher::new(Arc::new(transport.clone()), Arc::new(settings));
        let (leases, lease_rx) = LeaseHandle::channel();
        let (mut controller, handle) = Controller::new(publisher, leases);

        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            ControllerEventKind::Added,
            ControllerEventKind::Deleted,
            ControllerEventKind::Quit,
        ] {
            let log = log.clone();
            controller
                .events_mut()
                .subscribe(kind, move |e: &ControllerEvent| log.lock().unwrap().push(e.clone()));
        }

        Harness { controller, handle, transport, lease_rx, log }
    }

    fn ssh() -> ServiceRecord {
        ServiceRecord::new("Terminal Service", "_ssh._tcp", 22)
    }

    fn kinds(log: &Mutex<Vec<ControllerEvent>>) -> Vec<ControllerEventKind> {
        log.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ServiceRegistry::new();
        let a = ssh();
        let b = ServiceRecord::new("NOT SSH", "_ssh._tcp", 22).with_txt(["other"]);

        registry.add_service(a.clone()).unwrap();
        let err = registry.add_service(b).unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateService { ref key } if key == "_ssh._tcp-22"));

        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("_ssh._tcp-22"), Some(&a));
    }

    #[test]
    fn test_registry_delete() {
        let mut registry = ServiceRegistry::new();
        registry.add_service(ssh()).unwrap();

        assert_eq!(registry.delete_service(&ssh()), Some(ssh()));
        assert_eq!(registry.size(), 0);
        assert!(!registry.keys().contains(&"_ssh._tcp-22".to_string()));

        // Absent records are a no-op
        assert_eq!(registry.delete_service(&ssh()), None);
    }

    #[test]
    fn test_add_publishes_and_schedules_lease() {
        let mut h = harness();

        let before = Utc::now();
        h.controller.process_action(Action::Add(ssh()));
        let after = Utc::now();

        assert_eq!(h.controller.registry().keys(), vec!["_ssh._tcp-22".to_string()]);
        assert_eq!(h.transport.upserts(), 1);

        let entry = h.lease_rx.try_recv().unwrap();
        assert_eq!(entry.record, Some(ssh()));
        assert!(entry.expires_at >= expiry(before, 4800));
        assert!(entry.expires_at <= expiry(after, 4800));
        assert!((entry.expires_at - expiry(before, 4800)).num_seconds() < 1);
        assert!(h.lease_rx.try_recv().is_err());

        assert_eq!(
            *h.log.lock().unwrap(),
            vec![ControllerEvent::Added {
                record: ssh(),
                correlation: Some(CorrelationId(1)),
            }]
        );
    }

    #[test]
    fn test_duplicate_add_is_swallowed() {
        let mut h = harness();
        h.controller.process_action(Action::Add(ssh()));
        h.controller
            .process_action(Action::Add(ServiceRecord::new("NOT SSH", "_ssh._tcp", 22)));

        assert_eq!(h.controller.registry().size(), 1);
        assert_eq!(h.controller.registry().get("_ssh._tcp-22").unwrap().name(), "Terminal Service");
        assert_eq!(h.transport.upserts(), 1);
        assert_eq!(kinds(&h.log), vec![ControllerEventKind::Added]);
    }

    #[test]
    fn test_add_with_failing_transport() {
        let mut h = harness();
        h.transport.set_failing(true);
        h.controller.process_action(Action::Add(ssh()));

        assert_eq!(h.controller.registry().size(), 1);
        assert!(h.lease_rx.try_recv().is_err());
        assert_eq!(
            *h.log.lock().unwrap(),
            vec![ControllerEvent::Added { record: ssh(), correlation: None }]
        );
    }

    #[test]
    fn test_delete_unpublishes_and_updates_membership() {
        let mut h = harness();
        let membership = h.controller.membership();

        h.controller.process_action(Action::Add(ssh()));
        assert!(membership.borrow().contains_key("_ssh._tcp-22"));

        h.controller.process_action(Action::Delete(ssh()));
        assert_eq!(h.controller.registry().size(), 0);
        assert!(membership.borrow().is_empty());
        assert_eq!(h.transport.deletes(), 1);
        assert_eq!(
            kinds(&h.log),
            vec![ControllerEventKind::Added, ControllerEventKind::Deleted]
        );
    }

    #[test]
    fn test_delete_of_unknown_still_raises_event() {
        let mut h = harness();
        h.controller.process_action(Action::Delete(ssh()));

        assert_eq!(h.transport.deletes(), 1);
        assert_eq!(*h.log.lock().unwrap(), vec![ControllerEvent::Deleted(ssh())]);
    }

    #[test]
    fn test_generation_changes_on_readd() {
        let mut h = harness();
        let membership = h.controller.membership();

        h.controller.process_action(Action::Add(ssh()));
        let first = membership.borrow()["_ssh._tcp-22"];
        h.controller.process_action(Action::Delete(ssh()));
        h.controller.process_action(Action::Add(ssh()));
        let second = membership.borrow()["_ssh._tcp-22"];

        assert_ne!(first, second);
    }

    #[test]
    fn test_publish_all_and_unpublish_all() {
        let mut h = harness();
        h.controller.process_action(Action::Add(ssh()));
        h.controller
            .process_action(Action::Add(ServiceRecord::new("web", "_http._tcp", 80)));

        assert_eq!(h.controller.publish_all().len(), 2);
        assert_eq!(h.controller.unpublish_all().len(), 2);
        assert_eq!(h.transport.upserts(), 4);
        assert_eq!(h.transport.deletes(), 2);
    }

    #[test]
    fn test_quit_drains_queue_first() {
        let mut h = harness();
        for port in 1..=3 {
            h.handle.add(ServiceRecord::new("svc", "_x._tcp", port)).unwrap();
        }
        h.handle.delete(ServiceRecord::new("svc", "_x._tcp", 1)).unwrap();

        h.controller.process_action(Action::Quit);

        assert_eq!(h.controller.state(), ControllerState::Stopped);
        assert_eq!(
            kinds(&h.log),
            vec![
                ControllerEventKind::Added,
                ControllerEventKind::Added,
                ControllerEventKind::Added,
                ControllerEventKind::Deleted,
                ControllerEventKind::Quit,
            ]
        );

        // One delete from the action, two from unpublishing what is left
        let deletes: Vec<_> = h
            .transport
            .batches()
            .into_iter()
            .filter(|b| b.mode == UpdateMode::Delete)
            .collect();
        assert_eq!(deletes.len(), 3);
    }

    #[test]
    fn test_no_renewal_after_quit() {
        let mut h = harness();
        let settings = PublisherConfig::new("browse.example.com", "test");
        let publisher = ServicePublisher::new(Arc::new(h.transport.clone()), Arc::new(settings));

        h.controller.process_action(Action::Add(ssh()));
        h.controller.process_action(Action::Quit);
        assert_eq!(h.transport.upserts(), 1);
        assert_eq!(h.transport.deletes(), 1);

        let mut scheduler = LeaseScheduler::new(publisher, h.lease_rx, h.controller.membership());
        assert_eq!(scheduler.tick(expiry(Utc::now(), 10_000)), 0);
        assert_eq!(h.transport.upserts(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_after_quit() {
        let h = harness();
        let task = tokio::spawn(h.controller.run());

        h.handle.add(ssh()).unwrap();
        h.handle.quit().unwrap();

        let registry = task.await.unwrap();
        assert_eq!(registry.size(), 1);
        assert_eq!(
            kinds(&h.log),
            vec![ControllerEventKind::Added, ControllerEventKind::Quit]
        );
        assert!(h.handle.add(ssh()).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_when_handles_dropped() {
        let h = harness();
        let task = tokio::spawn(h.controller.run());
        drop(h.handle);

        task.await.unwrap();
        assert_eq!(kinds(&h.log), vec![ControllerEventKind::Quit]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_producers() {
        let h = harness();
        let task = tokio::spawn(h.controller.run());

        let (first_done, wait_first) = tokio::sync::oneshot::channel();

        let first = h.handle.clone();
        let producer_a = tokio::spawn(async move {
            for port in 1..=3 {
                first.add(ServiceRecord::new("a", "_x._tcp", port)).unwrap();
            }
            let _ = first_done.send(());
        });

        let second = h.handle.clone();
        let producer_b = tokio::spawn(async move {
            for port in 4..=6 {
                second.add(ServiceRecord::new("b", "_x._tcp", port)).unwrap();
            }
            wait_first.await.unwrap();
            second.quit().unwrap();
        });

        producer_a.await.unwrap();
        producer_b.await.unwrap();
        task.await.unwrap();

        let kinds = kinds(&h.log);
        assert_eq!(kinds.len(), 7);
        assert_eq!(
            kinds.iter().filter(|k| **k == ControllerEventKind::Added).count(),
            6
        );
        assert_eq!(kinds.last(), Some(&ControllerEventKind::Quit));
    }
}
