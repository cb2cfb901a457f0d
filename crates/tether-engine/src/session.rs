//! Per-session runtime: pending command correlation, the aggregation
//! pipeline and the outbound writer.
//!
//! Raw observer emissions go through a bounded channel into the pipeline
//! task, which owns both aggregators and is the only place their timers are
//! driven. Finished batches, events and console entries go through a second
//! bounded channel to the writer task, which stamps them into the buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tether_common::RelayError;
use tether_common::protocol::{
    ConsoleEntry, InputEvent, MutationRecord, OutboundEntry, RelayMessage, SemanticEvent, SessionId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::OutboundBuffer;
use crate::config::RelayConfig;
use crate::events::EventAggregator;
use crate::mutations::MutationAggregator;
use crate::recording::RecordingController;

pub(crate) type CommandOutcome = Result<serde_json::Value, RelayError>;

/// Raw emissions accepted from an observer.
#[derive(Debug)]
pub(crate) enum Ingest {
    Mutations(Vec<MutationRecord>),
    Input(Vec<InputEvent>),
    Console(ConsoleEntry),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Correlated requests awaiting a result. Once `closed` is set no new
/// request may register.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<CommandOutcome>>,
}

pub(crate) struct SessionRuntime {
    pub(crate) id: SessionId,
    buffer: Arc<Mutex<OutboundBuffer>>,
    recorder: Arc<Mutex<RecordingController>>,
    pending: Mutex<Pending>,
    ended: CancellationToken,
    link: mpsc::Sender<RelayMessage>,
    ingest: mpsc::Sender<Ingest>,
}

impl SessionRuntime {
    /// Build the runtime and spawn its pipeline and writer tasks. Both tasks
    /// end once the runtime is dropped.
    pub(crate) fn spawn(
        id: SessionId,
        config: &RelayConfig,
        link: mpsc::Sender<RelayMessage>,
    ) -> Self {
        let queue = config.relay.outbound_queue.max(1);
        let buffer = Arc::new(Mutex::new(OutboundBuffer::new(
            config.relay.buffer_capacity,
        )));
        let recorder = Arc::new(Mutex::new(RecordingController::new()));

        let (ingest_tx, ingest_rx) = mpsc::channel(queue);
        let (out_tx, out_rx) = mpsc::channel(queue);

        let pipeline = Pipeline {
            session_id: id.clone(),
            origin: Instant::now(),
            mutations: MutationAggregator::new(config.mutations.clone()),
            events: EventAggregator::new(config.events.clone()),
            out: out_tx,
        };
        tokio::spawn(pipeline.run(ingest_rx));
        tokio::spawn(write_outbound(
            id.clone(),
            out_rx,
            buffer.clone(),
            recorder.clone(),
        ));

        Self {
            id,
            buffer,
            recorder,
            pending: Mutex::new(Pending::default()),
            ended: CancellationToken::new(),
            link,
            ingest: ingest_tx,
        }
    }

    pub(crate) fn buffer(&self) -> MutexGuard<'_, OutboundBuffer> {
        lock(&self.buffer)
    }

    pub(crate) fn recorder(&self) -> MutexGuard<'_, RecordingController> {
        lock(&self.recorder)
    }

    fn ended_error(&self) -> RelayError {
        RelayError::NotActive(format!("session {} ended", self.id))
    }

    /// Register a correlated request before the command is sent. Fails once
    /// the session has been retired.
    pub(crate) fn register(
        &self,
        request_id: u64,
    ) -> Result<oneshot::Receiver<CommandOutcome>, RelayError> {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return Err(self.ended_error());
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(request_id, tx);
        Ok(rx)
    }

    pub(crate) fn forget(&self, request_id: u64) {
        lock(&self.pending).waiters.remove(&request_id);
    }

    /// Resolves once the session is retired.
    pub(crate) async fn ended(&self) {
        self.ended.cancelled().await
    }

    /// Deliver an observer's result. Results for requests that already timed
    /// out are dropped.
    pub(crate) fn complete(&self, request_id: u64, outcome: CommandOutcome) {
        let waiter = lock(&self.pending).waiters.remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(
                session_id = %self.id,
                request_id,
                "Dropping result for unknown or expired request"
            ),
        }
    }

    /// Close the session to new requests and fail every outstanding one,
    /// including callers still waiting for room on the link.
    pub(crate) fn fail_pending(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.waiters.drain().collect()
        };
        self.ended.cancel();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RelayError::NotActive(reason.to_string())));
        }
        count
    }

    pub(crate) async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.link
            .send(message)
            .await
            .map_err(|_| self.ended_error())
    }

    pub(crate) async fn ingest(&self, item: Ingest) -> Result<(), RelayError> {
        self.ingest
            .send(item)
            .await
            .map_err(|_| self.ended_error())
    }
}

struct Pipeline {
    session_id: SessionId,
    origin: Instant,
    mutations: MutationAggregator,
    events: EventAggregator,
    out: mpsc::Sender<OutboundEntry>,
}

impl Pipeline {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn instant_at(&self, millis: u64) -> Instant {
        self.origin + Duration::from_millis(millis)
    }

    fn next_deadline(&self) -> Option<u64> {
        match (self.mutations.deadline(), self.events.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Ingest>) {
        let out = self.out.clone();
        loop {
            let deadline = self.next_deadline();
            let wake = self.instant_at(deadline.unwrap_or(0));

            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else { break };
                    if !self.accept(item).await {
                        return;
                    }
                }
                _ = sleep_until(wake), if deadline.is_some() => {
                    let now = self.now();
                    self.mutations.poll(now);
                    let due = self.events.flush_due(now);
                    if !self.emit_events(due).await {
                        return;
                    }
                }
                permit = out.reserve(), if self.mutations.has_ready() => {
                    let Ok(permit) = permit else { return };
                    if let Some(batch) = self.mutations.pop_ready() {
                        permit.send(OutboundEntry::Mutations(batch));
                    }
                }
            }
        }

        // Observer gone: flush what is left so the tail is not lost.
        let now = self.now();
        self.mutations.flush(now);
        let rest = self.events.flush_all();
        if !self.emit_events(rest).await {
            return;
        }
        while let Some(batch) = self.mutations.pop_ready() {
            if self.out.send(OutboundEntry::Mutations(batch)).await.is_err() {
                return;
            }
        }
        trace!(session_id = %self.session_id, "Pipeline finished");
    }

    /// Returns false once the writer is gone.
    async fn accept(&mut self, item: Ingest) -> bool {
        match item {
            Ingest::Mutations(records) => {
                let now = self.now();
                self.mutations.poll(now);
                for record in records {
                    self.mutations.push(record, now);
                }
                true
            }
            Ingest::Input(events) => {
                for event in events {
                    let now = self.now();
                    let mut ready = self.events.flush_due(now);
                    ready.extend(self.events.push(event, now));
                    if !self.emit_events(ready).await {
                        return false;
                    }
                }
                true
            }
            Ingest::Console(entry) => self.out.send(OutboundEntry::Console(entry)).await.is_ok(),
        }
    }

    async fn emit_events(&self, events: Vec<SemanticEvent>) -> bool {
        for event in events {
            if self.out.send(OutboundEntry::Events(event)).await.is_err() {
                warn!(session_id = %self.session_id, "Outbound writer closed");
                return false;
            }
        }
        true
    }
}

async fn write_outbound(
    session_id: SessionId,
    mut rx: mpsc::Receiver<OutboundEntry>,
    buffer: Arc<Mutex<OutboundBuffer>>,
    recorder: Arc<Mutex<RecordingController>>,
) {
    while let Some(entry) = rx.recv().await {
        if let OutboundEntry::Mutations(batch) = &entry {
            lock(&recorder).note_batch(batch);
        }
        let channel = entry.channel();
        let seq = lock(&buffer).push(entry);
        trace!(session_id = %session_id, seq, ?channel, "Buffered outbound entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_common::ErrorKind;

    fn runtime() -> (SessionRuntime, mpsc::Receiver<RelayMessage>) {
        let (link_tx, link_rx) = mpsc::channel(1);
        let runtime = SessionRuntime::spawn("sess_t".into(), &RelayConfig::default(), link_tx);
        (runtime, link_rx)
    }

    #[tokio::test]
    async fn test_register_after_retire_is_not_active() {
        let (runtime, _link) = runtime();
        let waiting = runtime.register(1).unwrap();

        assert_eq!(runtime.fail_pending("session ended"), 1);
        assert_eq!(
            waiting.await.unwrap().unwrap_err().kind(),
            ErrorKind::NotActive
        );

        // A command that fetched the runtime before the retire must not
        // park a waiter nobody will complete.
        let err = runtime.register(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotActive);
        assert_eq!(runtime.fail_pending("session ended"), 0);
    }

    #[tokio::test]
    async fn test_ended_resolves_on_retire() {
        let (runtime, _link) = runtime();
        let runtime = Arc::new(runtime);

        let waiter = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.ended().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        runtime.fail_pending("killed");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ended() did not resolve")
            .unwrap();
    }
}
