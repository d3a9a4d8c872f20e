//! Neurofeed Daemon - background closed-loop stimulation service
//!
//! This daemon runs continuously in the background, managing:
//! - The engine state machine on its own tick thread
//! - Dataset and model persistence
//! - IPC server for CLI clients
//!
//! Storage locations:
//! - Linux: ~/.local/share/neurofeed/
//! - Windows: %APPDATA%\neurofeed\
//! - MacOS: ~/Library/Application Support/neurofeed/

use neurofeed::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod paths;

use paths::AppPaths;

const LISTEN_ADDR: &str = "127.0.0.1:9877";

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetStatus,
    Collect {
        catalog: CatalogSpec,
    },
    Optimize {
        catalog: CatalogSpec,
        #[serde(default)]
        model_dir: Option<PathBuf>,
    },
    Execute {
        catalog: CatalogSpec,
        #[serde(default)]
        model_dir: Option<PathBuf>,
        /// Program file contents.
        program: String,
        #[serde(default)]
        monte_carlo: bool,
        #[serde(default)]
        record: bool,
    },
    MeasureProgram {
        #[serde(default)]
        signals: Vec<String>,
        length_secs: usize,
        #[serde(default)]
        step_secs: Option<f32>,
    },
    GetMeasured,
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    Status(EngineStatus),
    Measured(MeasuredProgram),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Error)]
enum DaemonError {
    #[error("daemon is shutting down")]
    ShuttingDown,
    #[error("{0} was not picked up within {1:?}")]
    NotTaken(&'static str, Duration),
    #[error("tick thread: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    scheduler: Option<SchedulerHandle>,
    paths: AppPaths,
    command_timeout: Duration,
}

impl DaemonState {
    fn new(paths: AppPaths) -> Result<Self, Box<dyn std::error::Error>> {
        let mut cfg = if paths.config_file().exists() {
            EngineConfig::from_json_file(&paths.config_file())?
        } else {
            EngineConfig::default()
        };
        cfg.apply_env();

        let signals: Vec<String> = std::env::var("NEUROFEED_SIGNALS")
            .unwrap_or_else(|_| "arousal,valence".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let sensor = RandomSensor::new(signals.len(), cfg.seed.unwrap_or(1)).with_names(signals);
        info!("Sensor: {} ({:?})", sensor.source_name(), sensor.signal_names());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = FileStore::new(paths.datasets_dir(), paths.models_dir());
        let interval = cfg.tick_interval();
        // A command waits for one tick; entering Optimize can also load every dataset.
        let command_timeout = (interval * 4).max(Duration::from_secs(10));

        let engine = Engine::new(
            cfg,
            Collaborators {
                sensor: Box::new(sensor),
                presenter: Box::new(NullPresenter::new()),
                store: Box::new(store),
                clock: Arc::clone(&clock),
            },
        );
        let scheduler = TickScheduler::new(interval, clock).spawn(engine)?;

        Ok(Self {
            scheduler: Some(scheduler),
            paths,
            command_timeout,
        })
    }

    fn handle(&self) -> Result<&SchedulerHandle, DaemonError> {
        self.scheduler.as_ref().ok_or(DaemonError::ShuttingDown)
    }

    /// Hand a command to the tick thread and wait until a tick has applied it.
    async fn submit(&self, command: Command) -> Result<EngineStatus, DaemonError> {
        let handle = self.handle()?;
        let mailbox = handle.mailbox();
        let board = handle.status_board();
        let target = command.target_state();
        let timeout = self.command_timeout;
        let name = match target {
            EngineStateKind::Idle => "Stop",
            EngineStateKind::Collecting => "Collect",
            EngineStateKind::Optimizing => "Optimize",
            EngineStateKind::Executing => "Execute",
            EngineStateKind::MeasuringProgram => "MeasureProgram",
        };
        let taken = tokio::task::spawn_blocking(move || mailbox.post_and_wait(command, timeout)).await?;
        if !taken {
            return Err(DaemonError::NotTaken(name, timeout));
        }
        Ok(board.snapshot())
    }

    /// Stop the tick thread and run the active state's exit actions.
    async fn shutdown(&mut self) -> Result<(), DaemonError> {
        if let Some(handle) = self.scheduler.take() {
            let engine = tokio::task::spawn_blocking(move || handle.shutdown()).await?;
            match engine {
                Some(e) => info!("Engine stopped in state {}", e.state()),
                None => warn!("Tick thread ended abnormally"),
            }
        }
        Ok(())
    }
}

fn default_model_dir(paths: &AppPaths, requested: Option<PathBuf>) -> Option<PathBuf> {
    Some(requested.unwrap_or_else(|| paths.models_dir()))
}

fn command_response(result: Result<EngineStatus, DaemonError>, target: EngineStateKind) -> Response {
    match result {
        Ok(status) if status.state == target => Response::Success {
            message: status.message,
        },
        Ok(status) => Response::Error {
            message: status.last_error.unwrap_or(status.message),
        },
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("Invalid request: {}", e),
                };
                writer
                    .write_all(serde_json::to_string(&resp)?.as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                continue;
            }
        };

        let response = match request {
            Request::GetStatus => {
                let s = state.read().await;
                match s.handle() {
                    Ok(h) => Response::Status(h.status()),
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::Collect { catalog } => {
                let s = state.read().await;
                let cmd = Command::Collect { catalog };
                command_response(s.submit(cmd).await, EngineStateKind::Collecting)
            }
            Request::Optimize { catalog, model_dir } => {
                let s = state.read().await;
                let cmd = Command::Optimize {
                    catalog,
                    model_dir: default_model_dir(&s.paths, model_dir),
                };
                command_response(s.submit(cmd).await, EngineStateKind::Optimizing)
            }
            Request::Execute {
                catalog,
                model_dir,
                program,
                monte_carlo,
                record,
            } => match TargetProgram::parse(&program) {
                Ok(program) => {
                    let s = state.read().await;
                    let cmd = Command::Execute {
                        catalog,
                        model_dir: default_model_dir(&s.paths, model_dir),
                        program,
                        monte_carlo,
                        record,
                    };
                    command_response(s.submit(cmd).await, EngineStateKind::Executing)
                }
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::MeasureProgram {
                signals,
                length_secs,
                step_secs,
            } => {
                let s = state.read().await;
                let cmd = Command::MeasureProgram {
                    signals,
                    length_secs,
                    step_secs: step_secs.unwrap_or(1.0),
                };
                command_response(s.submit(cmd).await, EngineStateKind::MeasuringProgram)
            }
            Request::GetMeasured => {
                let s = state.read().await;
                match s.handle().map(|h| h.measured_program()) {
                    Ok(Some(m)) => Response::Measured(m),
                    Ok(None) => Response::Error {
                        message: "No measured program yet".to_string(),
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::Stop => {
                let s = state.read().await;
                command_response(s.submit(Command::Stop).await, EngineStateKind::Idle)
            }
            Request::Shutdown => {
                let mut s = state.write().await;
                match s.shutdown().await {
                    Ok(()) => {
                        info!("Shutdown requested; engine stopped");
                        cancel.cancel();
                        Response::Success {
                            message: "Shutting down".to_string(),
                        }
                    }
                    Err(e) => Response::Error {
                        message: format!("Shutdown failed: {}", e),
                    },
                }
            }
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Setup application paths
    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());
    info!("Datasets: {:?}", paths.datasets_dir());
    info!("Models: {:?}", paths.models_dir());

    let state = Arc::new(RwLock::new(DaemonState::new(paths)?));
    let cancel = CancellationToken::new();

    // Stop the engine on Ctrl-C so pending datasets and models are flushed.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                cancel.cancel();
            }
        });
    }

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    info!("Neurofeed daemon listening on {}", LISTEN_ADDR);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("Client connected: {}", addr);
                let state_clone = Arc::clone(&state);
                let cancel_clone = cancel.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state_clone, cancel_clone).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
        }
    }

    state.write().await.shutdown().await?;
    // Give in-flight responses a moment to flush before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Neurofeed daemon stopped");
    Ok(())
}
