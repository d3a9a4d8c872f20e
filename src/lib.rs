#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/clock.rs"]
pub mod clock;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/state.rs"]
pub mod state;

#[path = "core/stimulus.rs"]
pub mod stimulus;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/dataset.rs"]
pub mod dataset;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/training.rs"]
pub mod training;

#[path = "core/jobs.rs"]
pub mod jobs;

#[path = "core/program.rs"]
pub mod program;

#[path = "core/scorer.rs"]
pub mod scorer;

#[path = "core/sensor.rs"]
pub mod sensor;

#[path = "core/presenter.rs"]
pub mod presenter;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/scheduler.rs"]
pub mod scheduler;

pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Collaborators, Command, Engine, EngineStateKind, EngineStatus, StatusBoard};
    pub use crate::error::{EngineError, StoreError};
    pub use crate::presenter::{NullPresenter, Presenter};
    pub use crate::program::{MeasuredProgram, TargetProgram};
    pub use crate::scheduler::{Mailbox, SchedulerHandle, TickScheduler};
    pub use crate::sensor::{RandomSensor, Sensor};
    pub use crate::state::PhysiologicalState;
    pub use crate::stimulus::{CatalogSpec, Stimulus, StimulusKey, SynthSpec};
    pub use crate::storage::{ArtifactKey, ArtifactStore, FileStore, MemoryStore};
}
