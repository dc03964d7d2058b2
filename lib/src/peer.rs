//! Peer-tier interfaces: fog/cloud directory, task handoff, completion
//! callbacks, and the bounded notifier pool that delivers them.
//!
//! The actual wire transport lives outside this crate; in-memory
//! implementations are provided for tests and single-process simulation.
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::SchedulerError;
use crate::task::Criticality;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FogNode {
    pub address: String,
    pub position: (i64, i64),
    pub coverage: i64,
}

impl FogNode {
    pub fn new(address: &str, position: (i64, i64), coverage: i64) -> FogNode {
        FogNode {
            address: address.to_string(),
            position,
            coverage,
        }
    }

    pub fn in_range(&self, position: (i64, i64)) -> bool {
        let dx = (self.position.0 - position.0) as f64;
        let dy = (self.position.1 - position.1) as f64;
        let distance = (dx * dx + dy * dy).sqrt().ceil() as i64;
        distance <= self.coverage
    }
}

/// Task parameters handed to another tier on offload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadedTask {
    pub id: i64,
    pub workflow_id: i64,
    pub job_id: i64,
    pub criticality: Criticality,
    pub cost: i64,
    pub memory: i64,
    pub absolute_deadline: i64,
}

/// Completion callback payload collected by the dispatch tick and delivered
/// back to the task's origin tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNote {
    pub origin: String,
    pub task_id: i64,
    pub workflow_id: i64,
    pub job_id: i64,
}

pub trait PeerDirectory: Send + Sync {
    /// Fog nodes currently registered, refreshed on demand.
    fn fog_nodes(&self) -> Vec<FogNode>;
    fn cloud_address(&self) -> Option<String>;
}

pub trait PeerLink: Send + Sync {
    /// One best-effort handoff. After `Ok`, the destination owns the task.
    fn forward(
        &self,
        destination: &str,
        origin: &str,
        task: &OffloadedTask,
    ) -> Result<(), SchedulerError>;
}

pub trait CompletionSink: Send + Sync {
    fn notify_complete(&self, note: &CompletionNote) -> Result<(), SchedulerError>;
}

#[derive(Default)]
pub struct StaticDirectory {
    fogs: Vec<FogNode>,
    cloud: Option<String>,
}

impl StaticDirectory {
    pub fn new(fogs: Vec<FogNode>, cloud: Option<String>) -> StaticDirectory {
        StaticDirectory { fogs, cloud }
    }
}

impl PeerDirectory for StaticDirectory {
    fn fog_nodes(&self) -> Vec<FogNode> {
        self.fogs.clone()
    }

    fn cloud_address(&self) -> Option<String> {
        self.cloud.clone()
    }
}

/// Accepts every handoff and drops it. Stands in for the transport when a
/// run only exercises local placement.
pub struct NullLink;

impl PeerLink for NullLink {
    fn forward(
        &self,
        destination: &str,
        origin: &str,
        task: &OffloadedTask,
    ) -> Result<(), SchedulerError> {
        debug!(
            "task {} (workflow {}) forwarded from {} to {}",
            task.id, task.workflow_id, origin, destination
        );
        Ok(())
    }
}

/// Records every handoff; used by tests and in-process simulations.
#[derive(Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<(String, String, OffloadedTask)>>,
}

impl RecordingLink {
    pub fn new() -> RecordingLink {
        RecordingLink::default()
    }

    pub fn sent(&self) -> Vec<(String, String, OffloadedTask)> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerLink for RecordingLink {
    fn forward(
        &self,
        destination: &str,
        origin: &str,
        task: &OffloadedTask,
    ) -> Result<(), SchedulerError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), origin.to_string(), task.clone()));
        Ok(())
    }
}

/// Sink that only logs deliveries.
pub struct LogSink;

impl CompletionSink for LogSink {
    fn notify_complete(&self, note: &CompletionNote) -> Result<(), SchedulerError> {
        debug!(
            "task {} | job {} | workflow {} complete, notifying {}",
            note.task_id, note.job_id, note.workflow_id, note.origin
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    notes: Mutex<Vec<CompletionNote>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn notes(&self) -> Vec<CompletionNote> {
        self.notes.lock().unwrap().clone()
    }
}

impl CompletionSink for RecordingSink {
    fn notify_complete(&self, note: &CompletionNote) -> Result<(), SchedulerError> {
        self.notes.lock().unwrap().push(note.clone());
        Ok(())
    }
}

/// Bounded pool of notifier workers. The dispatcher hands notes over without
/// blocking; delivery is at-most-once and failures are logged, not retried.
pub struct NotifierPool {
    tx: Option<SyncSender<CompletionNote>>,
    workers: Vec<JoinHandle<()>>,
}

impl NotifierPool {
    pub fn new(workers: usize, capacity: usize, sink: Arc<dyn CompletionSink>) -> NotifierPool {
        let (tx, rx) = mpsc::sync_channel::<CompletionNote>(capacity.max(1));
        let rx: Arc<Mutex<Receiver<CompletionNote>>> = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let sink = Arc::clone(&sink);
                thread::spawn(move || loop {
                    let note = {
                        let guard = rx.lock().unwrap();
                        guard.recv()
                    };
                    match note {
                        Ok(note) => {
                            if let Err(err) = sink.notify_complete(&note) {
                                warn!("completion notification to {} failed: {}", note.origin, err);
                            }
                        }
                        Err(_) => break,
                    }
                })
            })
            .collect();
        NotifierPool {
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Never blocks the dispatcher: a full queue drops the note with a
    /// warning.
    pub fn dispatch(&self, note: CompletionNote) {
        if let Some(tx) = &self.tx {
            match tx.try_send(note) {
                Ok(()) => {}
                Err(TrySendError::Full(note)) => {
                    warn!("notifier queue full, dropping completion of task {}", note.task_id);
                }
                Err(TrySendError::Disconnected(note)) => {
                    warn!("notifier pool stopped, dropping completion of task {}", note.task_id);
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for NotifierPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
