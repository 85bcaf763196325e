//! Deferred heavy-index construction.
//!
//! One worker thread, owned by an explicitly constructed service and
//! shared by every ingestion session, serializes all queued index
//! builds. Each task runs on its own dedicated connection so a long
//! composite-index build never contends with foreground reads or the
//! ingestion connection's mutex. The worker exits after an idle timeout
//! and is respawned transparently on the next enqueue.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SendError, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::{MoglotError, Result};

use super::schema;

/// Worker exits after this long with an empty queue.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct IndexTask {
    db_path: PathBuf,
    statements: Vec<String>,
    session: String,
}

#[derive(Debug)]
enum WorkerMessage {
    Build(IndexTask),
    Shutdown,
}

#[derive(Default)]
struct WorkerState {
    sender: Option<Sender<WorkerMessage>>,
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Queue of heavy-index build tasks with a single lazy worker thread.
pub struct IndexBuildService {
    state: Mutex<WorkerState>,
    idle_timeout: Duration,
}

impl IndexBuildService {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        IndexBuildService {
            state: Mutex::new(WorkerState::default()),
            idle_timeout,
        }
    }

    /// Enqueue index statements for `db_path`. Returns as soon as the
    /// task is queued; statement failures are logged by the worker and
    /// never surface here.
    pub fn queue_build(
        &self,
        db_path: impl Into<PathBuf>,
        statements: Vec<String>,
        session: &str,
    ) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("index worker state lock");
        if state.stopped {
            return Err(MoglotError::IndexServiceStopped);
        }

        let mut message = WorkerMessage::Build(IndexTask {
            db_path: db_path.into(),
            statements,
            session: session.to_string(),
        });
        if let Some(sender) = &state.sender {
            match sender.send(message) {
                Ok(()) => return Ok(()),
                // The worker hit its idle timeout and dropped the
                // receiver; fall through and respawn.
                Err(SendError(returned)) => message = returned,
            }
        }

        if let Some(handle) = state.handle.take() {
            let _ = handle.join();
        }
        let (sender, receiver) = channel();
        // Queue before spawning so the fresh worker cannot hit its idle
        // timeout with the task still in hand.
        sender.send(message).expect("receiver held on this stack");
        let idle_timeout = self.idle_timeout;
        let handle = thread::Builder::new()
            .name("moglot-indexer".into())
            .spawn(move || worker_loop(receiver, idle_timeout))?;
        state.sender = Some(sender);
        state.handle = Some(handle);
        Ok(())
    }

    /// Drain outstanding tasks and stop the worker. Subsequent
    /// `queue_build` calls fail with [`MoglotError::IndexServiceStopped`].
    pub fn stop(&self) {
        let (sender, handle) = {
            let mut state = self.state.lock().expect("index worker state lock");
            state.stopped = true;
            (state.sender.take(), state.handle.take())
        };
        if let Some(sender) = sender {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Default for IndexBuildService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IndexBuildService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: Receiver<WorkerMessage>, idle_timeout: Duration) {
    loop {
        match receiver.recv_timeout(idle_timeout) {
            Ok(WorkerMessage::Build(task)) => run_task(&task),
            Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                debug!("index worker idle, exiting");
                return;
            }
        }
    }
}

/// Execute one task on a dedicated connection. Every statement runs
/// independently; a failed statement is skipped, not fatal.
fn run_task(task: &IndexTask) {
    let started = Instant::now();
    info!(
        session = %task.session,
        statements = task.statements.len(),
        "building deferred indexes"
    );
    let conn = match Connection::open(&task.db_path) {
        Ok(conn) => conn,
        Err(error) => {
            warn!(
                %error,
                path = %task.db_path.display(),
                "cannot open database for index build"
            );
            return;
        }
    };
    if let Err(error) = conn.execute_batch(schema::INDEX_BUILD_PRAGMAS) {
        warn!(%error, "index build pragmas failed");
    }

    let mut built = 0usize;
    for statement in &task.statements {
        match conn.execute_batch(statement) {
            Ok(()) => built += 1,
            Err(error) => {
                warn!(%error, statement = %statement, "index statement failed, skipping");
            }
        }
    }
    info!(
        session = %task.session,
        built,
        failed = task.statements.len() - built,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "index build task finished"
    );
}
