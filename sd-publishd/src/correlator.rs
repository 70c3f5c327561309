use std::collections::HashMap;
use hickory_proto::op::ResponseCode;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use crate::error::UpdateError;
use crate::update::{Correlation, CorrelationId, OutstandingRequest, UpdateMode, UpdateResponse};

/// What became of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Unsigned reply to a signed update
    Unauthenticated,
    /// Another publisher raced us on the same record set
    Conflict,
    Failed,
    Unexpected,
}

/// Asks a running correlator to report when nothing is outstanding
#[derive(Clone)]
pub struct SettleHandle {
    tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl SettleHandle {
    /// Resolves once every update submitted before the call has been answered.
    /// Returns false if the correlator stopped first.
    pub async fn settled(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.tx.send(done).is_err() {
            return false;
        }
        wait.await.is_ok()
    }
}

/// Matches update responses to outstanding requests.
///
/// The table is owned here; the transport announces submissions on the same
/// channel that later carries their responses.
pub struct ResponseCorrelator {
    outstanding: HashMap<CorrelationId, OutstandingRequest>,
    rx: mpsc::UnboundedReceiver<Correlation>,
    settle_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    settle_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl ResponseCorrelator {
    pub fn new() -> (Self, mpsc::UnboundedSender<Correlation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();
        let correlator = Self {
            outstanding: HashMap::new(),
            rx,
            settle_rx,
            settle_tx,
            waiters: Vec::new(),
        };
        (correlator, tx)
    }

    pub fn settle_handle(&self) -> SettleHandle {
        SettleHandle {
            tx: self.settle_tx.clone(),
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn handle(&mut self, message: Correlation) -> Option<Disposition> {
        let disposition = match message {
            Correlation::Submitted(request) => {
                self.outstanding.insert(request.id, request);
                None
            }
            Correlation::Response(response) => Some(self.resolve(response)),
        };
        if self.outstanding.is_empty() {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        disposition
    }

    /// Submissions are announced before `settled` is called, so they are
    /// already queued here; take them in before judging the table empty.
    fn settle(&mut self, waiter: oneshot::Sender<()>) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle(message);
        }
        if self.outstanding.is_empty() {
            let _ = waiter.send(());
        } else {
            tracing::debug!("Waiting on {} outstanding updates", self.outstanding.len());
            self.waiters.push(waiter);
        }
    }

    fn resolve(&mut self, response: UpdateResponse) -> Disposition {
        let Some(request) = self.outstanding.remove(&response.id) else {
            tracing::warn!(
                "Unexpected response {} ({}): {}",
                response.id,
                response.status,
                response.payload
            );
            return Disposition::Unexpected;
        };

        match (&response.error, request.mode) {
            (Some(UpdateError::NotAuthenticated), _) => {
                tracing::debug!("Update {} accepted, reply not signed", response.id);
                Disposition::Unauthenticated
            }
            (Some(UpdateError::RecordSetExists), UpdateMode::Upsert) => {
                tracing::info!("Update {}: record set already exists", response.id);
                Disposition::Conflict
            }
            (Some(UpdateError::RecordSetMissing), UpdateMode::Delete) => {
                tracing::info!("Update {}: record set does not exist", response.id);
                Disposition::Conflict
            }
            (Some(error), mode) => {
                tracing::warn!(
                    "{:?} update {} failed: {}: {}",
                    mode,
                    response.id,
                    error,
                    response.payload
                );
                Disposition::Failed
            }
            (None, _) if response.status != ResponseCode::NoError => {
                tracing::warn!(
                    "Unexpected response {} ({}): {}",
                    response.id,
                    response.status,
                    response.payload
                );
                Disposition::Unexpected
            }
            (None, mode) => {
                let elapsed = chrono::Utc::now() - request.submitted_at;
                tracing::debug!(
                    "{:?} update {} completed in {}ms",
                    mode,
                    response.id,
                    elapsed.num_milliseconds()
                );
                Disposition::Completed
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => {
                        self.handle(message);
                    }
                    None => break,
                },
                Some(waiter) = self.settle_rx.recv() => self.settle(waiter),
                _ = cancel.cancelled() => break,
            }
        }

        if !self.outstanding.is_empty() {
            tracing::warn!("{} updates never got a response", self.outstanding.len());
        }
        tracing::info!("Response correlator shutting down");
    }
}
