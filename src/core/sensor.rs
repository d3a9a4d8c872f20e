//! Physiological sensors. Polled only; hardware drivers live outside this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::prng::Prng;
use crate::state::{clamp01, PhysiologicalState};

pub trait Sensor: Send {
    fn read(&mut self) -> PhysiologicalState;
    fn is_connected(&self) -> bool;
    fn signal_count(&self) -> usize;
    fn signal_names(&self) -> Vec<String>;
    /// Name used to key datasets and models.
    fn source_name(&self) -> String;
}

/// Shared connectivity switch for a `ScriptedSensor`.
#[derive(Debug, Clone)]
pub struct SensorLink(Arc<AtomicBool>);

impl SensorLink {
    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Replays queued readings, then repeats the last one forever.
#[derive(Debug)]
pub struct ScriptedSensor {
    name: String,
    signals: Vec<String>,
    queue: VecDeque<Vec<f32>>,
    last: Vec<f32>,
    link: SensorLink,
}

impl ScriptedSensor {
    pub fn new(name: &str, signals: &[&str], reading: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            signals: signals.iter().map(|s| s.to_string()).collect(),
            queue: VecDeque::new(),
            last: reading,
            link: SensorLink(Arc::new(AtomicBool::new(true))),
        }
    }

    pub fn with_sequence(mut self, readings: impl IntoIterator<Item = Vec<f32>>) -> Self {
        self.queue.extend(readings);
        self
    }

    pub fn push(&mut self, reading: Vec<f32>) {
        self.queue.push_back(reading);
    }

    pub fn link(&self) -> SensorLink {
        self.link.clone()
    }
}

impl Sensor for ScriptedSensor {
    fn read(&mut self) -> PhysiologicalState {
        if let Some(next) = self.queue.pop_front() {
            self.last = next;
        }
        PhysiologicalState::new(self.last.clone())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn signal_count(&self) -> usize {
        self.signals.len()
    }

    fn signal_names(&self) -> Vec<String> {
        self.signals.clone()
    }

    fn source_name(&self) -> String {
        self.name.clone()
    }
}

/// Bounded random walk; stands in for hardware in headless runs.
#[derive(Debug)]
pub struct RandomSensor {
    signals: Vec<String>,
    state: Vec<f32>,
    step: f32,
    rng: Prng,
}

impl RandomSensor {
    pub fn new(signal_count: usize, seed: u64) -> Self {
        let mut rng = Prng::new(seed);
        let mut state = vec![0.0; signal_count];
        rng.fill_uniform(&mut state);
        Self {
            signals: (0..signal_count).map(|i| format!("s{i}")).collect(),
            state,
            step: 0.02,
            rng,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.state.resize(names.len(), 0.5);
        self.signals = names;
        self
    }
}

impl Sensor for RandomSensor {
    fn read(&mut self) -> PhysiologicalState {
        for v in self.state.iter_mut() {
            *v += self.step * self.rng.next_normal();
        }
        clamp01(&mut self.state);
        PhysiologicalState::new(self.state.clone())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn signal_count(&self) -> usize {
        self.signals.len()
    }

    fn signal_names(&self) -> Vec<String> {
        self.signals.clone()
    }

    fn source_name(&self) -> String {
        "random".to_string()
    }
}
