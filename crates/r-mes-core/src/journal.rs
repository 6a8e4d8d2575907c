//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Ordered, retried append path for stock snapshots."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::time::Duration;

use r_mes_persistence::{NewEvent, PersistenceSink};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Appends events describing state that is already applied in memory.
///
/// Inventory adjustments carry absolute levels, so they are queued here instead
/// of gating the operation that caused them. Events are appended in submission
/// order; the head of the queue is retried every `retry_every` until the sink
/// takes it.
#[derive(Clone, Debug)]
pub struct EventJournal {
    tx: mpsc::UnboundedSender<NewEvent>,
}

impl EventJournal {
    pub fn spawn(
        sink: PersistenceSink,
        retry_every: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_journal(sink, rx, retry_every, shutdown));
        (Self { tx }, handle)
    }

    pub fn record(&self, event: NewEvent) {
        let event_id = event.event_id();
        if self.tx.send(event).is_err() {
            warn!(event_id = %event_id, "journal stopped; event dropped");
        }
    }

    pub fn record_all(&self, events: impl IntoIterator<Item = NewEvent>) {
        for event in events {
            self.record(event);
        }
    }
}

async fn run_journal(
    sink: PersistenceSink,
    mut rx: mpsc::UnboundedReceiver<NewEvent>,
    retry_every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut pending: VecDeque<NewEvent> = VecDeque::new();
    'journal: loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = rx.recv() => match event {
                Some(event) => pending.push_back(event),
                None => break,
            },
        }
        while let Some(event) = pending.front().cloned() {
            match sink.append(event).await {
                Ok(_) => {
                    pending.pop_front();
                }
                Err(err) => {
                    debug!(backlog = pending.len(), error = %err, "journal append failed; retrying");
                    tokio::select! {
                        _ = shutdown.recv() => break 'journal,
                        _ = tokio::time::sleep(retry_every) => {}
                    }
                    while let Ok(event) = rx.try_recv() {
                        pending.push_back(event);
                    }
                }
            }
        }
    }

    while let Ok(event) = rx.try_recv() {
        pending.push_back(event);
    }
    let mut lost = 0usize;
    for event in pending {
        if sink.append(event).await.is_err() {
            lost += 1;
        }
    }
    if lost > 0 {
        warn!(lost, "journal stopped with undelivered events");
    } else {
        info!("journal drained");
    }
}
