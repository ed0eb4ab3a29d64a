//! The execution queue abstraction jobs are submitted to, and the local
//! thread-pool implementation shipped by default (§5).

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Identifies one submitted unit of work; returned by the queue with its
/// result so the caller can match completions back to job instances. Backed
/// by a `Uuid` rather than a counter so tickets stay unique across a
/// restarted scheduler or a remote execution queue with no shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(Uuid);

#[derive(Default)]
pub struct TicketSource;

impl TicketSource {
    pub fn next(&self) -> Ticket {
        Ticket(Uuid::new_v4())
    }
}

pub type Work = Box<dyn FnOnce() -> EngineResult<()> + Send>;

/// The mutations a worker hands back once a submitted callable finishes
/// (§5): the user function's own result plus the timing/host metadata the
/// main loop folds into its logs under `finalize`. The engine never mutates
/// state from inside the worker itself; everything it learned travels back
/// in this report.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub result: Result<(), String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub host: String,
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Abstraction over where job bodies actually run. The scheduler only ever
/// submits and waits; swapping the queue (e.g. for a cluster submitter) does
/// not touch scheduler logic.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    fn send(&self, ticket: Ticket, work: Work);
    async fn wait(&self) -> EngineResult<(Ticket, JobReport)>;
    fn length(&self) -> usize;
    fn empty(&self) -> bool {
        self.length() == 0
    }
}

/// Runs job bodies on the tokio blocking thread pool, funnelling completions
/// back through a crossbeam channel.
pub struct LocalThreadQueue {
    sender: Sender<(Ticket, JobReport)>,
    receiver: Receiver<(Ticket, JobReport)>,
    in_flight: AtomicUsize,
}

impl Default for LocalThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalThreadQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExecutionQueue for LocalThreadQueue {
    fn send(&self, ticket: Ticket, work: Work) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sender = self.sender.clone();
        let host = local_hostname();
        tokio::task::spawn_blocking(move || {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = work().map_err(|e| e.to_string());
            let report = JobReport {
                result,
                started_at,
                finished_at: Utc::now(),
                duration: clock.elapsed(),
                host,
            };
            let _ = sender.send((ticket, report));
        });
    }

    async fn wait(&self) -> EngineResult<(Ticket, JobReport)> {
        let receiver = self.receiver.clone();
        let outcome = tokio::task::spawn_blocking(move || receiver.recv())
            .await
            .map_err(|e| EngineError::ReceiveError(e.to_string()))?
            .map_err(|e| EngineError::ReceiveError(e.to_string()))?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    fn length(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
