//! Periodic sweep that finds due messages and drives the dispatcher.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::credential_store::CredentialStore;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::message_store::MessageStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Due messages returned by the store query.
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    /// Due messages another scheduler instance claimed first.
    pub skipped: usize,
}

/// Owns the periodic dispatch loop. Constructed once by the process; running
/// state lives in the [`SchedulerHandle`] returned from [`start`](Self::start).
pub struct MessageScheduler<M: MessageStore, C: CredentialStore> {
    messages: Arc<M>,
    dispatcher: Dispatcher<M, C>,
    poll_interval: Duration,
}

impl<M: MessageStore, C: CredentialStore> MessageScheduler<M, C> {
    pub fn new(messages: Arc<M>, dispatcher: Dispatcher<M, C>, poll_interval: Duration) -> Self {
        Self {
            messages,
            dispatcher,
            poll_interval,
        }
    }

    /// One sweep at the current time.
    pub fn tick(&self) -> SweepStats {
        self.sweep(Utc::now())
    }

    /// Find messages due at `now` and dispatch each in order, serially.
    ///
    /// Store errors end the sweep early without touching the process; the
    /// next tick starts over. Per-message send failures are terminal for the
    /// message only and do not end the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();

        let due = match self.messages.find_due(now) {
            Ok(due) => due,
            Err(err) => {
                error!("due-message query failed: {}", err);
                return stats;
            }
        };
        if !due.is_empty() {
            info!("found {} due message(s)", due.len());
        }
        stats.selected = due.len();

        for message in due {
            match self.messages.claim(message.id, now) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("message {} no longer pending; skipping", message.id);
                    stats.skipped += 1;
                    continue;
                }
                Err(err) => {
                    error!("failed to claim message {}: {}; ending tick", message.id, err);
                    return stats;
                }
            }

            match self.dispatcher.dispatch(&message) {
                Ok(DispatchOutcome::Sent { .. }) => stats.sent += 1,
                Ok(DispatchOutcome::Failed { .. }) => stats.failed += 1,
                Err(err) => {
                    error!(
                        "recording outcome for message {} failed: {}; ending tick",
                        message.id, err
                    );
                    return stats;
                }
            }
        }

        stats
    }

    /// Tick until `stop_flag` is set.
    pub fn run_loop(&self, stop_flag: &AtomicBool) {
        info!(
            "message scheduler started; polling every {:?}",
            self.poll_interval
        );
        while !stop_flag.load(Ordering::Relaxed) {
            self.tick();
            sleep_until_stopped(self.poll_interval, stop_flag);
        }
        info!("message scheduler stopped");
    }
}

impl<M, C> MessageScheduler<M, C>
where
    M: MessageStore + 'static,
    C: CredentialStore + 'static,
{
    /// Spawn the scheduler loop on its own thread.
    pub fn start(self) -> SchedulerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || self.run_loop(&thread_stop));
        SchedulerHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Stop control for a running scheduler thread.
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// Sleep in short slices so a stop request does not wait out a full interval.
fn sleep_until_stopped(interval: Duration, stop_flag: &AtomicBool) {
    let step = Duration::from_millis(250);
    let mut remaining = interval;
    while !remaining.is_zero() && !stop_flag.load(Ordering::Relaxed) {
        let slice = remaining.min(step);
        thread::sleep(slice);
        remaining -= slice;
    }
}
