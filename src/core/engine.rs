//! The engine aggregate and its command state machine.
//!
//! One `Engine` owns the sensor, presenter, artifact store, training services
//! and every in-RAM dataset or model. It is driven by `tick`, which applies a
//! pending command (exit actions of the old state, then entry actions of the
//! new one) and then performs exactly one unit of work for the current state.
//!
//! Any command is accepted in any state. A failed entry action leaves the
//! engine `Idle` with the cause in the status board.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dataset::ResponseDataset;
use crate::error::EngineError;
use crate::jobs::{JobSettings, JobStatus, OptimizationJobManager};
use crate::presenter::Presenter;
use crate::prng::Prng;
use crate::program::{MeasuredProgram, ProgramTable, TargetProgram, MIN_STEP_SECS};
use crate::scorer::{CandidateScorer, ModelSet, ScoringSettings};
use crate::sensor::Sensor;
use crate::state::clamp01;
use crate::stimulus::{CatalogSpec, Stimulus, StimulusCatalog, StimulusKey};
use crate::storage::{ArtifactKey, ArtifactStore};
use crate::training::TrainingServices;

// ═══════════════════════════════════════════════════════════════════════════
// Commands and states
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type"))]
pub enum Command {
    Stop,
    Collect {
        catalog: CatalogSpec,
    },
    Optimize {
        catalog: CatalogSpec,
        #[cfg_attr(feature = "serde", serde(default))]
        model_dir: Option<PathBuf>,
    },
    Execute {
        catalog: CatalogSpec,
        #[cfg_attr(feature = "serde", serde(default))]
        model_dir: Option<PathBuf>,
        program: TargetProgram,
        #[cfg_attr(feature = "serde", serde(default))]
        monte_carlo: bool,
        #[cfg_attr(feature = "serde", serde(default))]
        record: bool,
    },
    MeasureProgram {
        /// Signals to keep; empty keeps every sensor signal.
        #[cfg_attr(feature = "serde", serde(default))]
        signals: Vec<String>,
        length_secs: usize,
        #[cfg_attr(feature = "serde", serde(default = "default_step_secs"))]
        step_secs: f32,
    },
}

#[cfg(feature = "serde")]
fn default_step_secs() -> f32 {
    1.0
}

impl Command {
    pub fn target_state(&self) -> EngineStateKind {
        match self {
            Command::Stop => EngineStateKind::Idle,
            Command::Collect { .. } => EngineStateKind::Collecting,
            Command::Optimize { .. } => EngineStateKind::Optimizing,
            Command::Execute { .. } => EngineStateKind::Executing,
            Command::MeasureProgram { .. } => EngineStateKind::MeasuringProgram,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EngineStateKind {
    #[default]
    Idle,
    Collecting,
    Optimizing,
    Executing,
    MeasuringProgram,
}

impl fmt::Display for EngineStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineStateKind::Idle => "Idle",
            EngineStateKind::Collecting => "Collecting",
            EngineStateKind::Optimizing => "Optimizing",
            EngineStateKind::Executing => "Executing",
            EngineStateKind::MeasuringProgram => "MeasuringProgram",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status board
// ═══════════════════════════════════════════════════════════════════════════

/// Polled diagnostics. `message` is the human-readable status line.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineStatus {
    pub state: EngineStateKind,
    pub message: String,
    pub sensor: String,
    pub sensor_connected: bool,
    pub samples_stored: u64,
    pub samples_rejected: u64,
    pub progress: Option<f32>,
    pub eta_secs: Option<f32>,
    pub program_second: Option<usize>,
    pub program_secs: Option<usize>,
    pub mean_rms: Option<f32>,
    pub quality: Option<f32>,
    pub last_error: Option<String>,
}

/// Shared view of the engine for threads that must not touch it.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    status: Arc<RwLock<EngineStatus>>,
    measured: Arc<RwLock<Option<MeasuredProgram>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> EngineStatus {
        match self.status.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn message(&self) -> String {
        self.snapshot().message
    }

    pub fn measured(&self) -> Option<MeasuredProgram> {
        match self.measured.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut EngineStatus)) {
        match self.status.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn set_measured(&self, m: MeasuredProgram) {
        match self.measured.write() {
            Ok(mut slot) => *slot = Some(m),
            Err(poisoned) => *poisoned.into_inner() = Some(m),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Per-state sessions
// ═══════════════════════════════════════════════════════════════════════════

struct CollectSession {
    catalog: StimulusCatalog,
    dataset: ResponseDataset,
    synth_params: Vec<f32>,
    since_save: u32,
    stored: u64,
}

struct OptimizeSession {
    jobs: OptimizationJobManager,
}

struct ExecuteSession {
    models: ModelSet,
    table: ProgramTable,
    scorer: CandidateScorer,
    started_at: Duration,
    last_second: Option<usize>,
    synth_params: Option<Vec<f32>>,
    rms_sum: f64,
    rms_count: u32,
    record: bool,
}

impl ExecuteSession {
    fn mean_rms(&self) -> Option<f32> {
        (self.rms_count > 0).then(|| (self.rms_sum / self.rms_count as f64) as f32)
    }
}

struct MeasureSession {
    signals: Vec<String>,
    columns: Vec<usize>,
    length_secs: usize,
    step_secs: f32,
    started_at: Duration,
    raw: Vec<Option<Vec<f32>>>,
}

impl MeasureSession {
    fn finish(&self) -> MeasuredProgram {
        MeasuredProgram::resample(
            self.signals.clone(),
            &self.columns,
            &self.raw,
            self.raw.len().min(self.length_secs),
            self.step_secs,
        )
    }
}

enum ActiveState {
    Idle,
    Collecting(CollectSession),
    Optimizing(OptimizeSession),
    Executing(ExecuteSession),
    MeasuringProgram(MeasureSession),
}

impl ActiveState {
    fn kind(&self) -> EngineStateKind {
        match self {
            ActiveState::Idle => EngineStateKind::Idle,
            ActiveState::Collecting(_) => EngineStateKind::Collecting,
            ActiveState::Optimizing(_) => EngineStateKind::Optimizing,
            ActiveState::Executing(_) => EngineStateKind::Executing,
            ActiveState::MeasuringProgram(_) => EngineStateKind::MeasuringProgram,
        }
    }
}

/// Outcome of one unit of work.
enum Flow {
    Continue,
    Done(String),
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// External collaborators handed to the engine at construction.
pub struct Collaborators {
    pub sensor: Box<dyn Sensor>,
    pub presenter: Box<dyn Presenter>,
    pub store: Box<dyn ArtifactStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    cfg: EngineConfig,
    sensor: Box<dyn Sensor>,
    presenter: Box<dyn Presenter>,
    store: Box<dyn ArtifactStore>,
    clock: Arc<dyn Clock>,
    training: TrainingServices,
    rng: Prng,
    board: StatusBoard,
    state: ActiveState,
    sensor_lost_at: Option<Duration>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, collaborators: Collaborators) -> Self {
        let mut rng = cfg.seed.map(Prng::new).unwrap_or_else(Prng::from_entropy);
        let training = TrainingServices::from_config(&cfg, rng.next_u64());
        Self::with_training(cfg, collaborators, training, rng)
    }

    /// Construct with explicit training backends.
    pub fn with_training(
        cfg: EngineConfig,
        collaborators: Collaborators,
        training: TrainingServices,
        rng: Prng,
    ) -> Self {
        let Collaborators {
            sensor,
            presenter,
            store,
            clock,
        } = collaborators;
        let board = StatusBoard::new();
        board.update(|s| {
            s.message = "idle".to_string();
            s.sensor = sensor.source_name();
            s.sensor_connected = sensor.is_connected();
        });
        Self {
            cfg,
            sensor,
            presenter,
            store,
            clock,
            training,
            rng,
            board,
            state: ActiveState::Idle,
            sensor_lost_at: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn state(&self) -> EngineStateKind {
        self.state.kind()
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

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    pub fn training(&self) -> &TrainingServices {
        &self.training
    }

    /// One scheduler tick: apply `command` if any, then do one unit of work.
    pub fn tick(&mut self, command: Option<Command>) {
        match command {
            Some(cmd) => self.handle_command(cmd),
            None => {
                if self.state() != EngineStateKind::Idle && self.presenter.poll_input().esc_pressed {
                    info!("escape pressed, stopping");
                    self.handle_command(Command::Stop);
                }
            }
        }
        self.do_work();
    }

    /// Exit the current state, then enter the state the command implies.
    pub fn handle_command(&mut self, command: Command) {
        let target = command.target_state();
        info!("command: {} -> {}", self.state(), target);
        let previous = std::mem::replace(&mut self.state, ActiveState::Idle);
        self.exit_state(previous);
        self.sensor_lost_at = None;
        self.board.update(|s| {
            s.progress = None;
            s.eta_secs = None;
            s.program_second = None;
            s.program_secs = None;
            s.quality = None;
            s.last_error = None;
        });

        let entered = match command {
            Command::Stop => {
                self.set_status(EngineStateKind::Idle, "stopped".to_string());
                return;
            }
            Command::Collect { catalog } => self.enter_collecting(&catalog),
            Command::Optimize { catalog, model_dir } => self.enter_optimizing(&catalog, model_dir),
            Command::Execute {
                catalog,
                model_dir,
                program,
                monte_carlo,
                record,
            } => self.enter_executing(&catalog, model_dir, &program, monte_carlo, record),
            Command::MeasureProgram {
                signals,
                length_secs,
                step_secs,
            } => self.enter_measuring(signals, length_secs, step_secs),
        };

        match entered {
            Ok(state) => self.state = state,
            Err(e) => {
                warn!("cannot enter {target}: {e}");
                self.store.set_model_dir(None);
                let msg = e.to_string();
                self.board.update(|s| {
                    s.state = EngineStateKind::Idle;
                    s.message = msg.clone();
                    s.last_error = Some(msg);
                });
            }
        }
    }

    /// Run the exit actions of the current state and go `Idle`.
    pub fn shutdown(&mut self) {
        let previous = std::mem::replace(&mut self.state, ActiveState::Idle);
        self.exit_state(previous);
        self.set_status(EngineStateKind::Idle, "shut down".to_string());
    }

    /// Exactly one unit of work for the current state.
    pub fn do_work(&mut self) {
        let state = std::mem::replace(&mut self.state, ActiveState::Idle);
        let kind = state.kind();
        let connected = self.sensor.is_connected();
        self.board.update(|s| s.sensor_connected = connected);

        if matches!(kind, EngineStateKind::Collecting | EngineStateKind::Executing) {
            match self.check_sensor() {
                Ok(true) => {}
                Ok(false) => {
                    self.presenter.refresh();
                    self.state = state;
                    return;
                }
                Err(e) => {
                    self.state = self.settle(state, Err(e));
                    return;
                }
            }
        }

        self.state = match state {
            ActiveState::Idle => {
                self.presenter.refresh();
                ActiveState::Idle
            }
            ActiveState::Collecting(mut s) => {
                let flow = self.collect_step(&mut s);
                self.settle(ActiveState::Collecting(s), flow)
            }
            ActiveState::Optimizing(mut s) => {
                let flow = self.optimize_step(&mut s);
                self.settle(ActiveState::Optimizing(s), flow)
            }
            ActiveState::Executing(mut s) => {
                let flow = self.execute_step(&mut s);
                self.settle(ActiveState::Executing(s), flow)
            }
            ActiveState::MeasuringProgram(mut s) => {
                let flow = self.measure_step(&mut s);
                self.settle(ActiveState::MeasuringProgram(s), flow)
            }
        };
    }

    fn settle(&mut self, state: ActiveState, flow: Result<Flow, EngineError>) -> ActiveState {
        match flow {
            Ok(Flow::Continue) => state,
            Ok(Flow::Done(message)) => {
                info!("{}: {message}", state.kind());
                self.exit_state(state);
                self.set_status(EngineStateKind::Idle, message);
                ActiveState::Idle
            }
            Err(e) => {
                warn!("{} aborted: {e}", state.kind());
                self.exit_state(state);
                let msg = e.to_string();
                self.board.update(|s| {
                    s.state = EngineStateKind::Idle;
                    s.message = msg.clone();
                    s.last_error = Some(msg);
                });
                ActiveState::Idle
            }
        }
    }

    fn set_status(&self, state: EngineStateKind, message: String) {
        self.board.update(|s| {
            s.state = state;
            s.message = message;
        });
    }

    /// `Ok(false)` while the sensor is away but still inside the grace window.
    fn check_sensor(&mut self) -> Result<bool, EngineError> {
        if self.sensor.is_connected() {
            self.sensor_lost_at = None;
            return Ok(true);
        }
        let now = self.clock.now();
        let since = *self.sensor_lost_at.get_or_insert_with(|| {
            warn!("sensor '{}' disconnected", self.sensor.source_name());
            now
        });
        if now.saturating_sub(since) > self.cfg.sensor_grace() {
            return Err(EngineError::SensorUnavailable {
                sensor: self.sensor.source_name(),
            });
        }
        Ok(false)
    }

    fn require_sensor(&self) -> Result<(), EngineError> {
        if self.sensor.is_connected() {
            Ok(())
        } else {
            Err(EngineError::SensorUnavailable {
                sensor: self.sensor.source_name(),
            })
        }
    }

    fn artifact_key(&self, catalog: &StimulusCatalog, key: StimulusKey) -> ArtifactKey {
        ArtifactKey::new(&catalog.identity(key), &self.sensor.source_name())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Entry actions
    // ───────────────────────────────────────────────────────────────────────

    fn empty_datasets(&self, catalog: &StimulusCatalog) -> ResponseDataset {
        ResponseDataset::for_catalog(
            catalog,
            &self.sensor.source_name(),
            self.sensor.signal_count(),
            self.cfg.settle_secs(),
        )
    }

    fn load_datasets(&self, catalog: &StimulusCatalog) -> ResponseDataset {
        let mut dataset = self.empty_datasets(catalog);
        for key in catalog.training_order() {
            self.load_dataset_into(catalog, &mut dataset, key);
        }
        dataset
    }

    /// Replace one empty dataset with its persisted copy, when there is one.
    fn load_dataset_into(&self, catalog: &StimulusCatalog, dataset: &mut ResponseDataset, key: StimulusKey) {
        let akey = self.artifact_key(catalog, key);
        match self.store.load_dataset(&akey) {
            Ok(Some(set)) => {
                if !dataset.install(key, set) {
                    warn!("{}: stored dataset has another shape, starting empty", catalog.identity(key));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{}: cannot load dataset: {e}", catalog.identity(key)),
        }
    }

    fn enter_collecting(&mut self, spec: &CatalogSpec) -> Result<ActiveState, EngineError> {
        self.require_sensor()?;
        let catalog = StimulusCatalog::load(spec)?;
        let dataset = self.load_datasets(&catalog);
        let mut synth_params = vec![0.0; catalog.synth_param_count()];
        self.rng.fill_uniform(&mut synth_params);

        let stored = dataset.total_samples() as u64;
        self.board.update(|s| {
            s.state = EngineStateKind::Collecting;
            s.message = format!(
                "collecting over {} stimuli ({} samples on record)",
                catalog.training_order().len(),
                stored
            );
            s.samples_stored = stored;
            s.samples_rejected = 0;
        });
        Ok(ActiveState::Collecting(CollectSession {
            catalog,
            dataset,
            synth_params,
            since_save: 0,
            stored,
        }))
    }

    fn enter_optimizing(
        &mut self,
        spec: &CatalogSpec,
        model_dir: Option<PathBuf>,
    ) -> Result<ActiveState, EngineError> {
        let catalog = StimulusCatalog::load(spec)?;
        let order = catalog.training_order();
        // One dataset in memory at a time; each job reloads its own.
        let mut shells = self.empty_datasets(&catalog);
        for key in &order {
            self.load_dataset_into(&catalog, &mut shells, *key);
            if let Some(set) = shells.take(*key) {
                set.ensure_sufficient(self.cfg.min_samples)?;
            }
        }

        self.store.set_model_dir(model_dir.as_deref());
        let queue = order
            .iter()
            .map(|key| (*key, self.artifact_key(&catalog, *key)))
            .collect();
        let jobs = OptimizationJobManager::new(JobSettings::from_config(&self.cfg), queue);
        self.set_status(
            EngineStateKind::Optimizing,
            format!("optimizing {} models", jobs.total()),
        );
        self.board.update(|s| s.progress = Some(0.0));
        Ok(ActiveState::Optimizing(OptimizeSession { jobs }))
    }

    fn enter_executing(
        &mut self,
        spec: &CatalogSpec,
        model_dir: Option<PathBuf>,
        program: &TargetProgram,
        monte_carlo: bool,
        record: bool,
    ) -> Result<ActiveState, EngineError> {
        self.require_sensor()?;
        let catalog = StimulusCatalog::load(spec)?;
        let table = program.to_table(&self.sensor.signal_names(), self.cfg.default_tolerance)?;

        self.store.set_model_dir(model_dir.as_deref());
        let (models, excluded) = self.load_models(&catalog);
        if models.is_empty() {
            warn!("no trained models for this catalog; nothing will be presented");
        }
        let synth_params = models
            .synth
            .as_ref()
            .map(|_| vec![0.5; catalog.synth_param_count()]);

        let scorer = CandidateScorer::new(
            ScoringSettings::from_config(&self.cfg),
            monte_carlo,
            self.sensor.signal_count(),
            self.rng.fork(),
        );
        if record && !self.presenter.begin_recording() {
            warn!("presenter cannot record");
        }

        let secs = table.len();
        self.board.update(|s| {
            s.state = EngineStateKind::Executing;
            s.message = format!(
                "executing {secs}s program with {} models ({excluded} unavailable){}",
                models.len(),
                if monte_carlo { ", monte-carlo" } else { "" }
            );
            s.program_secs = Some(secs);
            s.mean_rms = None;
        });
        Ok(ActiveState::Executing(ExecuteSession {
            models,
            table,
            scorer,
            started_at: self.clock.now(),
            last_second: None,
            synth_params,
            rms_sum: 0.0,
            rms_count: 0,
            record,
        }))
    }

    /// Load every model the catalog names. Stimuli without a usable model are
    /// left out of scoring.
    fn load_models(&self, catalog: &StimulusCatalog) -> (ModelSet, usize) {
        let n = self.sensor.signal_count();
        let mut models = ModelSet::default();
        let mut excluded = 0usize;
        for key in catalog.training_order() {
            let akey = self.artifact_key(catalog, key);
            let model = match self.store.load_model(&akey) {
                Ok(Some(m))
                    if m.regressor.input_dim == catalog.input_dim(key, n)
                        && m.regressor.output_dim == n =>
                {
                    m
                }
                Ok(_) => {
                    let e = EngineError::ModelUnavailable {
                        stimulus: catalog.identity(key),
                    };
                    debug!("{e}");
                    excluded += 1;
                    continue;
                }
                Err(e) => {
                    warn!("{}: cannot load model: {e}", catalog.identity(key));
                    excluded += 1;
                    continue;
                }
            };
            match key {
                StimulusKey::Picture(_) => models.pictures.push((key, Box::new(model))),
                StimulusKey::Keyword(_) => models.keywords.push((key, Box::new(model))),
                StimulusKey::Synth => models.synth = Some(Box::new(model)),
            }
        }
        (models, excluded)
    }

    fn enter_measuring(
        &mut self,
        signals: Vec<String>,
        length_secs: usize,
        step_secs: f32,
    ) -> Result<ActiveState, EngineError> {
        if length_secs == 0 {
            return Err(EngineError::Program("measurement length must be positive".to_string()));
        }
        if !(step_secs.is_finite() && step_secs >= MIN_STEP_SECS) {
            return Err(EngineError::Program(format!(
                "measurement step must be at least {MIN_STEP_SECS}s, got {step_secs}"
            )));
        }
        let names = self.sensor.signal_names();
        let signals = if signals.is_empty() { names.clone() } else { signals };
        let columns = signals
            .iter()
            .map(|sig| {
                names.iter().position(|n| n == sig).ok_or_else(|| {
                    EngineError::Program(format!("signal '{sig}' is not provided by the sensor"))
                })
            })
            .collect::<Result<Vec<usize>, EngineError>>()?;

        self.set_status(
            EngineStateKind::MeasuringProgram,
            format!("measuring {} signals for {length_secs}s", signals.len()),
        );
        self.board.update(|s| s.program_secs = Some(length_secs));
        Ok(ActiveState::MeasuringProgram(MeasureSession {
            signals,
            columns,
            length_secs,
            step_secs,
            started_at: self.clock.now(),
            raw: Vec::with_capacity(length_secs),
        }))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Exit actions
    // ───────────────────────────────────────────────────────────────────────

    fn exit_state(&mut self, state: ActiveState) {
        match state {
            ActiveState::Idle => {}
            ActiveState::Collecting(mut s) => {
                self.presenter.stop();
                let failed = persist_dirty(self.store.as_mut(), &mut s.dataset);
                if failed > 0 {
                    warn!("{failed} datasets could not be saved on exit");
                }
                info!("collecting ended with {} samples", s.stored);
            }
            ActiveState::Optimizing(mut s) => {
                s.jobs.stop();
                let unsaved = s.jobs.retry_unsaved(self.store.as_mut());
                if unsaved > 0 {
                    warn!("{unsaved} trained models could not be saved");
                }
                self.store.set_model_dir(None);
            }
            ActiveState::Executing(mut s) => {
                self.presenter.stop();
                if s.record {
                    self.presenter.finish_recording();
                }
                s.scorer.flush();
                self.store.set_model_dir(None);
                if let Some(rms) = s.mean_rms() {
                    info!("execution mean RMS error {rms:.4} over {} s", s.rms_count);
                }
            }
            ActiveState::MeasuringProgram(s) => {
                let measured = s.finish();
                info!("measured {} rows", measured.rows.len());
                self.board.set_measured(measured);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Work units
    // ───────────────────────────────────────────────────────────────────────

    fn collect_step(&mut self, s: &mut CollectSession) -> Result<Flow, EngineError> {
        let before = self.sensor.read();

        let mut shown: Vec<StimulusKey> = Vec::with_capacity(2);
        let pictures = s.catalog.picture_count();
        let keywords = s.catalog.keyword_count();
        if pictures > 0 {
            shown.push(StimulusKey::Picture(self.rng.gen_range_usize(0, pictures) as u32));
        }
        if keywords > 0 {
            shown.push(StimulusKey::Keyword(self.rng.gen_range_usize(0, keywords) as u32));
        }
        let synth = (!s.synth_params.is_empty()).then(|| {
            let mut next = s.synth_params.clone();
            if self.rng.chance(self.cfg.synth_jitter_prob) {
                for p in next.iter_mut() {
                    *p += self.cfg.synth_jitter_sigma * self.rng.next_normal();
                }
                clamp01(&mut next);
            } else {
                self.rng.fill_uniform(&mut next);
            }
            (s.synth_params.clone(), next)
        });

        let mut stimuli: Vec<Stimulus> = shown
            .iter()
            .map(|k| match *k {
                StimulusKey::Picture(i) => Stimulus::Picture(i),
                StimulusKey::Keyword(i) => Stimulus::Keyword(i),
                StimulusKey::Synth => Stimulus::SynthParams(Vec::new()),
            })
            .collect();
        if let Some((_, after)) = &synth {
            stimuli.push(Stimulus::SynthParams(after.clone()));
        }
        if !self.presenter.show(&stimuli) {
            warn!("presenter failed to show {stimuli:?}");
        }

        self.clock.sleep(self.cfg.settle_interval());
        if !self.sensor.is_connected() {
            return Ok(Flow::Continue);
        }
        let after = self.sensor.read();

        let synth_pair = synth.as_ref().map(|(b, a)| (b.as_slice(), a.as_slice()));
        match s.dataset.store_presentation(&shown, synth_pair, &before, &after) {
            Ok(()) => {
                s.stored += 1;
                s.since_save += 1;
            }
            Err(e) => debug!("sample rejected: {e}"),
        }
        if let Some((_, a)) = synth {
            s.synth_params = a;
        }

        if s.since_save >= self.cfg.autosave_every.max(1) {
            let failed = persist_dirty(self.store.as_mut(), &mut s.dataset);
            if failed == 0 {
                s.since_save = 0;
            }
        }

        let (stored, rejected) = (s.stored, s.dataset.rejected());
        self.board.update(|st| {
            st.samples_stored = stored;
            st.samples_rejected = rejected;
            st.message = format!("collecting: {stored} samples ({rejected} rejected)");
        });
        Ok(Flow::Continue)
    }

    fn optimize_step(&mut self, s: &mut OptimizeSession) -> Result<Flow, EngineError> {
        let now = self.clock.now();
        let status = s.jobs.step(&mut self.training, self.store.as_mut(), now);
        let message = match status {
            JobStatus::Running(p) => match s.jobs.current() {
                Some((identity, phase)) => {
                    format!("optimizing {identity} ({phase} phase), {:.1}% overall", p * 100.0)
                }
                None => format!("optimizing, {:.1}% overall", p * 100.0),
            },
            JobStatus::AdvancedToNext => format!(
                "trained {}/{} models",
                s.jobs.stimulus_index(),
                s.jobs.total()
            ),
            JobStatus::AllComplete => {
                let skipped = s.jobs.skipped().len();
                return Ok(Flow::Done(format!(
                    "optimization complete: {} models trained, {skipped} skipped",
                    s.jobs.total() - skipped
                )));
            }
        };
        let progress = s.jobs.progress();
        let eta = s.jobs.eta(now).map(|d| d.as_secs_f32());
        self.board.update(|st| {
            st.message = message;
            st.progress = Some(progress);
            st.eta_secs = eta;
        });
        Ok(Flow::Continue)
    }

    fn execute_step(&mut self, s: &mut ExecuteSession) -> Result<Flow, EngineError> {
        let elapsed = self.clock.now().saturating_sub(s.started_at);
        let second = elapsed.as_secs() as usize;
        let Some(row) = s.table.row(second) else {
            let message = match s.mean_rms() {
                Some(rms) => format!("program finished, mean RMS error {rms:.3}"),
                None => "program finished".to_string(),
            };
            return Ok(Flow::Done(message));
        };
        if s.last_second == Some(second) {
            self.presenter.refresh();
            return Ok(Flow::Continue);
        }
        s.last_second = Some(second);

        let current = self.sensor.read();
        let valid = current.is_valid();
        if valid {
            if let Some(rms) = row.rms_error(current.as_slice()) {
                s.rms_sum += rms as f64;
                s.rms_count += 1;
            }
        }

        let mut quality = None;
        if valid || s.scorer.is_monte_carlo() {
            let selection = s.scorer.select(
                &s.models,
                current.as_slice(),
                row,
                s.synth_params.as_deref(),
            );
            quality = selection.quality;
            if let Some(p) = &selection.synth {
                s.synth_params = Some(p.clone());
            }
            let stimuli = selection.stimuli();
            if !stimuli.is_empty() && !self.presenter.show(&stimuli) {
                warn!("presenter failed to show {stimuli:?}");
            }
        } else {
            debug!("second {second}: reading out of range, not scoring");
        }

        let (mean_rms, secs) = (s.mean_rms(), s.table.len());
        self.board.update(|st| {
            st.program_second = Some(second);
            st.progress = Some((second + 1) as f32 / secs as f32);
            st.mean_rms = mean_rms;
            st.quality = quality;
            st.message = match (quality, mean_rms) {
                (Some(q), _) if q > 1.0 => {
                    format!("executing {}/{secs}s: model noise exceeds signal ({q:.2})", second + 1)
                }
                (_, Some(rms)) => format!("executing {}/{secs}s, mean RMS {rms:.3}", second + 1),
                _ => format!("executing {}/{secs}s", second + 1),
            };
        });
        Ok(Flow::Continue)
    }

    fn measure_step(&mut self, s: &mut MeasureSession) -> Result<Flow, EngineError> {
        let elapsed = self.clock.now().saturating_sub(s.started_at).as_secs() as usize;
        let due = (elapsed + 1).min(s.length_secs);
        while s.raw.len() < due {
            let reading = if self.sensor.is_connected() {
                let r = self.sensor.read();
                r.is_valid().then_some(r.0)
            } else {
                None
            };
            s.raw.push(reading);
        }
        if elapsed >= s.length_secs {
            return Ok(Flow::Done(format!("measured {}s", s.length_secs)));
        }
        self.board.update(|st| {
            st.program_second = Some(elapsed);
            st.message = format!("measuring {}/{}s", elapsed + 1, s.length_secs);
        });
        Ok(Flow::Continue)
    }
}

/// Save every dirty dataset. Failures stay dirty for the next save point.
fn persist_dirty(store: &mut dyn ArtifactStore, dataset: &mut ResponseDataset) -> usize {
    let mut failed = 0;
    for key in dataset.dirty_keys() {
        let Some(set) = dataset.get(key) else {
            continue;
        };
        let akey = ArtifactKey::new(&set.identity, &set.sensor);
        match store.save_dataset(&akey, set) {
            Ok(()) => dataset.mark_clean(key),
            Err(e) => {
                warn!("{}: dataset not saved: {e}", set.identity);
                failed += 1;
            }
        }
    }
    failed
}
