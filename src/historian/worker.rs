use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{BatchOutcome, Historian, HistorianConfig, HistorianStats, Record};
use crate::storage::{Backend, Error, Result, SqliteBackend};

enum Command {
    Publish {
        records: Vec<Record>,
        reply: Sender<Result<BatchOutcome>>,
    },
    Maintain {
        history_limit: Option<DateTime<Utc>>,
        storage_limit_gb: Option<f64>,
        reply: Sender<Result<bool>>,
    },
    Shutdown,
}

/// Handle to the background thread that owns the historian.
///
/// The storage file is only ever touched from that thread. Commands are
/// served in order; each one runs to completion before the next.
pub struct HistorianWorker {
    commands: Sender<Command>,
    stats: Arc<Mutex<HistorianStats>>,
    handle: Option<JoinHandle<()>>,
}

impl HistorianWorker {
    pub fn spawn(config: HistorianConfig) -> Result<Self> {
        Self::spawn_with::<SqliteBackend>(config)
    }

    /// Construction happens on the writer thread; its error is returned here.
    pub fn spawn_with<B: Backend + 'static>(config: HistorianConfig) -> Result<Self> {
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stats = Arc::new(Mutex::new(HistorianStats::default()));
        let shared = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("historian-writer".to_string())
            .spawn(move || {
                let historian = match Historian::<B>::new(&config) {
                    Ok(historian) => historian,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                writer_loop(historian, inbox, config.maintenance_interval(), shared);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                stats,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::WorkerStopped)
            }
        }
    }

    pub fn publish(&self, records: Vec<Record>) -> Result<BatchOutcome> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::Publish { records, reply })
            .map_err(|_| Error::WorkerStopped)?;
        response.recv().map_err(|_| Error::WorkerStopped)?
    }

    pub fn run_maintenance(
        &self,
        history_limit: Option<DateTime<Utc>>,
        storage_limit_gb: Option<f64>,
    ) -> Result<bool> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::Maintain {
                history_limit,
                storage_limit_gb,
                reply,
            })
            .map_err(|_| Error::WorkerStopped)?;
        response.recv().map_err(|_| Error::WorkerStopped)?
    }

    /// Counters as of the last completed command
    pub fn stats(&self) -> HistorianStats {
        self.stats.lock().clone()
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // the thread may already be gone after a fatal error
        let _ = self.commands.send(Command::Shutdown);
        handle.join().map_err(|_| Error::WorkerStopped)
    }
}

impl Drop for HistorianWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Historian writer did not shut down cleanly: {}", err);
        }
    }
}

fn writer_loop<B: Backend>(
    mut historian: Historian<B>,
    inbox: Receiver<Command>,
    interval: Option<Duration>,
    stats: Arc<Mutex<HistorianStats>>,
) {
    let mut next_maintenance = interval.and_then(deadline_after);

    loop {
        let command = match next_maintenance {
            Some(deadline) => {
                match inbox.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match inbox.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        let fatal = match command {
            Some(Command::Publish { records, reply }) => {
                let result = historian.publish_batch(&records);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Some(Command::Maintain {
                history_limit,
                storage_limit_gb,
                reply,
            }) => {
                let result = historian.run_maintenance(history_limit, storage_limit_gb);
                let fatal = is_fatal(&result);
                let _ = reply.send(result);
                fatal
            }
            Some(Command::Shutdown) => break,
            None => false,
        };

        // scheduled maintenance also runs when the inbox never goes idle
        if let (Some(deadline), Some(interval)) = (next_maintenance, interval) {
            if !fatal && Instant::now() >= deadline {
                next_maintenance = deadline_after(interval);
                let result = historian.run_maintenance(None, None);
                if let Err(err) = &result {
                    log::warn!("Scheduled maintenance failed: {}", err);
                }
                if is_fatal(&result) {
                    *stats.lock() = historian.stats();
                    break;
                }
            }
        }

        *stats.lock() = historian.stats();

        if fatal {
            log::error!("Historian writer stopping after fatal error");
            break;
        }
    }

    if let Err(err) = historian.close() {
        log::error!("Failed to close historian store: {}", err);
    }
}

/// `None` when the interval reaches past what `Instant` can represent.
fn deadline_after(interval: Duration) -> Option<Instant> {
    let deadline = Instant::now().checked_add(interval);
    if deadline.is_none() {
        log::warn!(
            "Maintenance interval of {}s is out of range, scheduled maintenance disabled",
            interval.as_secs()
        );
    }
    deadline
}

fn is_fatal<T>(result: &Result<T>) -> bool {
    matches!(result, Err(err) if err.is_fatal())
}
