//! Presentation seam. Windows, audio and video encoding live outside this
//! crate; the engine only asks a `Presenter` to show stimuli and treats any
//! failure as non-fatal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::stimulus::Stimulus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEvents {
    pub key_pressed: bool,
    pub esc_pressed: bool,
}

pub trait Presenter: Send {
    /// Show the stimuli together (picture, keyword, synth parameters).
    /// Returns `false` if presentation failed.
    fn show(&mut self, stimuli: &[Stimulus]) -> bool;
    fn poll_input(&mut self) -> InputEvents;
    fn refresh(&mut self);
    /// Blank the screen and silence any sound.
    fn stop(&mut self) {}
    fn begin_recording(&mut self) -> bool {
        false
    }
    fn finish_recording(&mut self) {}
}

/// Headless presenter that shows nothing.
#[derive(Debug, Default)]
pub struct NullPresenter {
    shown: u64,
}

impl NullPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl Presenter for NullPresenter {
    fn show(&mut self, _stimuli: &[Stimulus]) -> bool {
        self.shown += 1;
        true
    }

    fn poll_input(&mut self) -> InputEvents {
        InputEvents::default()
    }

    fn refresh(&mut self) {}
}

/// What a `RecordingPresenter` observed.
#[derive(Debug, Default)]
pub struct PresenterLog {
    pub shown: Vec<Vec<Stimulus>>,
    pub refreshes: u64,
    pub stops: u64,
    pub recordings_started: u32,
    pub recordings_finished: u32,
    /// Events handed out by `poll_input`, one per call.
    pub pending_input: VecDeque<InputEvents>,
    /// Make `show` report failure.
    pub fail_show: bool,
}

/// Presenter that logs every call into a shared `PresenterLog`.
#[derive(Debug, Clone, Default)]
pub struct RecordingPresenter {
    log: Arc<Mutex<PresenterLog>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<PresenterLog>> {
        Arc::clone(&self.log)
    }

    fn with_log<R>(&self, f: impl FnOnce(&mut PresenterLog) -> R) -> R {
        match self.log.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Presenter for RecordingPresenter {
    fn show(&mut self, stimuli: &[Stimulus]) -> bool {
        self.with_log(|log| {
            log.shown.push(stimuli.to_vec());
            !log.fail_show
        })
    }

    fn poll_input(&mut self) -> InputEvents {
        self.with_log(|log| log.pending_input.pop_front().unwrap_or_default())
    }

    fn refresh(&mut self) {
        self.with_log(|log| log.refreshes += 1);
    }

    fn stop(&mut self) {
        self.with_log(|log| log.stops += 1);
    }

    fn begin_recording(&mut self) -> bool {
        self.with_log(|log| log.recordings_started += 1);
        true
    }

    fn finish_recording(&mut self) {
        self.with_log(|log| log.recordings_finished += 1);
    }
}
