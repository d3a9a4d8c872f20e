//! Tick scheduling and the command mailbox.
//!
//! The engine runs on one dedicated thread. Every `tick_ms` it takes whatever
//! command sits in the mailbox and calls `Engine::tick`. A tick that overruns
//! its slot is not replayed; the scheduler jumps to the current slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::{Command, Engine, EngineStatus, StatusBoard};
use crate::program::MeasuredProgram;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Command>,
    posted: u64,
    taken: u64,
    handled: u64,
}

/// Single-slot command mailbox. A later post replaces an unread one.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    drained: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Post a command. Returns its sequence number.
    pub fn post(&self, command: Command) -> u64 {
        let mut slot = self.lock();
        if let Some(old) = slot.pending.replace(command) {
            debug!("mailbox: unread {:?} replaced", old.target_state());
        }
        slot.posted += 1;
        slot.posted
    }

    /// Post and block until a tick has handled this post, or `timeout`
    /// elapses. A superseded command counts as handled.
    pub fn post_and_wait(&self, command: Command, timeout: Duration) -> bool {
        let seq = self.post(command);
        let slot = self.lock();
        let waited = self
            .drained
            .wait_timeout_while(slot, timeout, |s| s.handled < seq);
        match waited {
            Ok((slot, _)) => slot.handled >= seq,
            Err(poisoned) => poisoned.into_inner().0.handled >= seq,
        }
    }

    pub fn take(&self) -> Option<Command> {
        let mut slot = self.lock();
        let cmd = slot.pending.take();
        if cmd.is_some() {
            slot.taken = slot.posted;
        }
        cmd
    }

    /// Mark everything taken so far as handled and wake waiters.
    pub fn acknowledge(&self) {
        let mut slot = self.lock();
        if slot.handled < slot.taken {
            slot.handled = slot.taken;
            self.drained.notify_all();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_none()
    }
}

/// Index of the tick slot that `elapsed` falls into.
pub fn tick_index(elapsed: Duration, interval: Duration) -> u64 {
    let step = interval.as_nanos().max(1);
    (elapsed.as_nanos() / step) as u64
}

/// The slot to dispatch now, if it has not been dispatched yet.
pub fn next_dispatch(last: Option<u64>, elapsed: Duration, interval: Duration) -> Option<u64> {
    let current = tick_index(elapsed, interval);
    match last {
        Some(l) if current <= l => None,
        _ => Some(current),
    }
}

/// Runs an `Engine` on its own thread.
pub struct TickScheduler {
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl TickScheduler {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            clock,
        }
    }

    pub fn spawn(self, mut engine: Engine) -> std::io::Result<SchedulerHandle> {
        let mailbox = Arc::new(Mailbox::new());
        let stop = Arc::new(AtomicBool::new(false));
        let board = engine.status_board();

        let thread_mailbox = Arc::clone(&mailbox);
        let thread_stop = Arc::clone(&stop);
        let TickScheduler { interval, clock } = self;
        let thread = thread::Builder::new()
            .name("neurofeed-tick".to_string())
            .spawn(move || {
                info!("tick scheduler started ({} ms)", interval.as_millis());
                let start = clock.now();
                let mut last = None;
                let mut dispatched = 0u64;
                while !thread_stop.load(Ordering::SeqCst) {
                    let elapsed = clock.now().saturating_sub(start);
                    match next_dispatch(last, elapsed, interval) {
                        Some(index) => {
                            if let Some(prev) = last {
                                if index > prev + 1 {
                                    debug!("skipped {} ticks", index - prev - 1);
                                }
                            }
                            last = Some(index);
                            dispatched += 1;
                            engine.tick(thread_mailbox.take());
                            thread_mailbox.acknowledge();
                        }
                        None => {
                            let next = (tick_index(elapsed, interval) as u128 + 1) * interval.as_nanos();
                            let wait = next.saturating_sub(elapsed.as_nanos()) as u64;
                            clock.sleep(Duration::from_nanos(wait).min(interval));
                        }
                    }
                }
                engine.shutdown();
                thread_mailbox.acknowledge();
                info!("tick scheduler stopped after {dispatched} ticks");
                engine
            })?;

        Ok(SchedulerHandle {
            mailbox,
            board,
            stop,
            thread: Some(thread),
        })
    }
}

/// Control surface for a running scheduler.
pub struct SchedulerHandle {
    mailbox: Arc<Mailbox>,
    board: StatusBoard,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine>>,
}

impl SchedulerHandle {
    pub fn post(&self, command: Command) {
        self.mailbox.post(command);
    }

    pub fn post_and_wait(&self, command: Command, timeout: Duration) -> bool {
        self.mailbox.post_and_wait(command, timeout)
    }

    /// Shared mailbox, for callers that must wait off the current thread.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    pub fn status(&self) -> EngineStatus {
        self.board.snapshot()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn measured_program(&self) -> Option<MeasuredProgram> {
        self.board.measured()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the tick thread, run the current state's exit actions and hand
    /// the engine back.
    pub fn shutdown(mut self) -> Option<Engine> {
        self.join()
    }

    fn join(&mut self) -> Option<Engine> {
        self.stop.store(true, Ordering::SeqCst);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                warn!("tick thread panicked");
                None
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.join();
    }
}
