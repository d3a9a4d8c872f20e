//! CLI client for the `neurofeedd` daemon.
//!
//! Examples:
//!   neurofeed-cli status
//!   neurofeed-cli collect --pictures ./pics --keywords words.txt
//!   neurofeed-cli optimize --keywords words.txt
//!   neurofeed-cli execute --keywords words.txt --program calm.txt --mc
//!   neurofeed-cli measure 60 --step 0.5 arousal
//!   neurofeed-cli measured --out measured.txt
//!   neurofeed-cli stop
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use neurofeed::engine::EngineStatus;
use neurofeed::program::MeasuredProgram;
use neurofeed::stimulus::{CatalogSpec, SynthSpec};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetStatus,
    Collect {
        catalog: CatalogSpec,
    },
    Optimize {
        catalog: CatalogSpec,
        model_dir: Option<PathBuf>,
    },
    Execute {
        catalog: CatalogSpec,
        model_dir: Option<PathBuf>,
        program: String,
        monte_carlo: bool,
        record: bool,
    },
    MeasureProgram {
        signals: Vec<String>,
        length_secs: usize,
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

fn usage() -> ! {
    eprintln!("neurofeed-cli (talks to neurofeedd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: neurofeed-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                          Show engine state");
    eprintln!("  collect  <catalog>              Present stimuli and record responses");
    eprintln!("  optimize <catalog> [--models DIR]   Train response models");
    eprintln!("  execute  <catalog> --program FILE [--models DIR] [--mc] [--record]");
    eprintln!("                                  Drive the state along a target program");
    eprintln!("  measure <secs> [--step S] [signal...]  Record a program from the sensor");
    eprintln!("  measured [--out FILE]           Fetch the last measured program");
    eprintln!("  stop                            Return the engine to Idle");
    eprintln!("  shutdown                        Stop the engine and exit the daemon");
    eprintln!("  paths                           Show data directories");
    eprintln!("\nCatalog flags: --pictures PATH --keywords FILE --synth NAME:PARAMS");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

#[derive(Debug, Default)]
struct Flags {
    catalog: CatalogSpec,
    models: Option<PathBuf>,
    program: Option<PathBuf>,
    out: Option<PathBuf>,
    step: Option<f32>,
    monte_carlo: bool,
    record: bool,
    positional: Vec<String>,
}

fn parse_flags(args: &[String]) -> Result<Flags, String> {
    let mut flags = Flags::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .cloned()
                .ok_or_else(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--pictures" => flags.catalog.pictures = Some(PathBuf::from(value("--pictures")?)),
            "--keywords" => flags.catalog.keywords = Some(PathBuf::from(value("--keywords")?)),
            "--synth" => {
                let v = value("--synth")?;
                let (name, count) = v
                    .split_once(':')
                    .ok_or("--synth expects NAME:PARAMS")?;
                let param_count = count
                    .parse()
                    .map_err(|_| "--synth parameter count must be a number".to_string())?;
                flags.catalog.synth = Some(SynthSpec {
                    name: name.to_string(),
                    param_count,
                });
            }
            "--models" => flags.models = Some(PathBuf::from(value("--models")?)),
            "--program" => flags.program = Some(PathBuf::from(value("--program")?)),
            "--out" => flags.out = Some(PathBuf::from(value("--out")?)),
            "--step" => {
                let step: f32 = value("--step")?
                    .parse()
                    .map_err(|_| "--step must be a number of seconds".to_string())?;
                flags.step = Some(step);
            }
            "--mc" => flags.monte_carlo = true,
            "--record" => flags.record = true,
            other if other.starts_with("--") => return Err(format!("unknown flag {other}")),
            other => flags.positional.push(other.to_string()),
        }
    }
    Ok(flags)
}

fn send_request(addr: &str, req: &Request, timeout: Duration) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

#[cfg(unix)]
fn default_data_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".local/share/neurofeed"))
}

#[cfg(windows)]
fn default_data_dir() -> Option<PathBuf> {
    let appdata = std::env::var("APPDATA").ok()?;
    Some(PathBuf::from(appdata).join("neurofeed"))
}

#[cfg(not(any(unix, windows)))]
fn default_data_dir() -> Option<PathBuf> {
    None
}

fn print_status(s: EngineStatus) {
    println!("state={} sensor={} connected={}", s.state, s.sensor, s.sensor_connected);
    println!("status: {}", s.message);
    println!("samples: stored={} rejected={}", s.samples_stored, s.samples_rejected);
    if let Some(p) = s.progress {
        match s.eta_secs {
            Some(eta) => println!("progress: {:.1}% eta={:.0}s", p * 100.0, eta),
            None => println!("progress: {:.1}%", p * 100.0),
        }
    }
    if let (Some(sec), Some(total)) = (s.program_second, s.program_secs) {
        println!("program: {}/{}s", sec + 1, total);
    }
    if let Some(rms) = s.mean_rms {
        println!("mean rms error: {:.4}", rms);
    }
    if let Some(q) = s.quality {
        println!("model quality (stdev/|delta|): {:.3}", q);
    }
    if let Some(e) = s.last_error {
        println!("last error: {}", e);
    }
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let flags = parse_flags(&args[1..]).unwrap_or_else(|e| make_error(&e));
    let mut out_path = None;

    let req = match cmd.as_str() {
        "status" => Request::GetStatus,
        "collect" => Request::Collect {
            catalog: flags.catalog,
        },
        "optimize" => Request::Optimize {
            catalog: flags.catalog,
            model_dir: flags.models,
        },
        "execute" => {
            let path = flags
                .program
                .unwrap_or_else(|| make_error("execute needs --program FILE"));
            let program = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| make_error(&format!("cannot read {:?}: {e}", path)));
            Request::Execute {
                catalog: flags.catalog,
                model_dir: flags.models,
                program,
                monte_carlo: flags.monte_carlo,
                record: flags.record,
            }
        }
        "measure" => {
            let Some((secs, signals)) = flags.positional.split_first() else {
                usage();
            };
            let length_secs: usize = secs
                .parse()
                .unwrap_or_else(|_| make_error("measure length must be a whole number of seconds"));
            Request::MeasureProgram {
                signals: signals.to_vec(),
                length_secs,
                step_secs: flags.step,
            }
        }
        "measured" => {
            out_path = flags.out;
            Request::GetMeasured
        }
        "stop" => Request::Stop,
        "shutdown" => Request::Shutdown,
        "paths" => {
            // Special command: doesn't need daemon, just print paths
            let data_dir = std::env::var("NEUROFEED_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .or_else(default_data_dir);
            if let Some(dir) = data_dir {
                println!("Data directory: {}", dir.display());
                println!("Datasets: {}", dir.join("datasets").display());
                println!("Models: {}", dir.join("models").display());
                println!("Config: {}", dir.join("config.json").display());
            }
            process::exit(0);
        }
        _ => usage(),
    };

    // Entering Optimize loads every dataset before the daemon answers.
    let timeout = Duration::from_secs(30);
    match send_request(&addr, &req, timeout) {
        Ok(Response::Status(s)) => print_status(s),
        Ok(Response::Measured(m)) => {
            let text = m.to_text();
            match out_path {
                Some(path) => {
                    if let Err(e) = std::fs::write(&path, text) {
                        make_error(&format!("cannot write {:?}: {e}", path));
                    }
                    println!("wrote {} rows to {}", m.rows.len(), path.display());
                }
                None => print!("{text}"),
            }
        }
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
