//! beatloom - command-line front end for the beatloom scheduling core.

use anyhow::{Context, Result};
use beatloom_core::{
    note_name, parse_note_name, Command, CommandOutcome, Config, LogOutput, NoteOutput, NoteSpec,
    Runtime, RuntimeHandle,
};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "beatloom")]
#[command(author, version, about = "Beat-accurate MIDI note scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/beatloom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Initial tempo in BPM (overrides the config file)
    #[arg(long, global = true)]
    bpm: Option<f64>,

    /// Log events instead of opening a MIDI port
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
    /// List available MIDI output ports
    ListPorts,
    /// Play C4 then E4, one beat each
    Demo,
    /// Play notes back to back, e.g. `beatloom play C4 E4 G4`
    Play {
        /// Note names or MIDI numbers
        #[arg(required = true)]
        notes: Vec<String>,
        /// Length of each note in beats
        #[arg(long, default_value = "0.5")]
        beats: f64,
        /// Repeat until interrupted
        #[arg(long = "loop")]
        looping: bool,
    },
    /// Read JSON commands from stdin, one per line, and print the outcomes
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            return Ok(());
        }
        Commands::ConfigPath => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            return Ok(());
        }
        Commands::ListPorts => {
            list_ports()?;
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref(), cli.bpm)?;
    let output = open_output(&config, cli.dry_run);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("Failed to install Ctrl-C handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))
        .context("Failed to install SIGTERM handler")?;

    let runtime = Runtime::start(&config, output).context("Failed to start runtime")?;
    let handle = runtime.handle().clone();

    let result = match cli.command {
        Commands::Demo => demo(&handle, &interrupted),
        Commands::Play {
            notes,
            beats,
            looping,
        } => play(&handle, &notes, beats, looping, &interrupted),
        Commands::Run => run(&handle, &interrupted),
        Commands::Init | Commands::ConfigPath | Commands::ListPorts => Ok(()),
    };

    if interrupted.load(Ordering::Relaxed) {
        log::info!("Interrupted, stopping all sequences");
    }
    if let Err(e) = handle.stop_all() {
        log::warn!("Failed to stop sequences: {}", e);
    }
    report_jitter(&handle);
    runtime.shutdown();
    result
}

fn load_config(path: Option<&std::path::Path>, bpm: Option<f64>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid BEATLOOM_* environment override")?;
    if let Some(bpm) = bpm {
        config.scheduler.initial_bpm = bpm;
        config.validate()?;
    }
    Ok(config)
}

#[cfg(feature = "native")]
fn list_ports() -> Result<()> {
    let ports = beatloom_core::list_output_ports()?;
    if ports.is_empty() {
        println!("No MIDI output ports found");
    } else {
        println!("Available MIDI output ports:");
        for port in ports {
            println!("  {}", port);
        }
    }
    Ok(())
}

#[cfg(not(feature = "native"))]
fn list_ports() -> Result<()> {
    println!("MIDI port support not compiled in (build with --features native)");
    Ok(())
}

#[cfg(feature = "native")]
fn open_output(config: &Config, dry_run: bool) -> Box<dyn NoteOutput> {
    if dry_run {
        return Box::new(LogOutput);
    }
    match beatloom_core::MidirOutput::from_settings(&config.midi) {
        Ok(output) => Box::new(output),
        Err(e) => {
            log::warn!("Could not open MIDI output ({}), logging events instead", e);
            Box::new(LogOutput)
        }
    }
}

#[cfg(not(feature = "native"))]
fn open_output(_config: &Config, dry_run: bool) -> Box<dyn NoteOutput> {
    if !dry_run {
        log::warn!("MIDI port support not compiled in, logging events instead");
    }
    Box::new(LogOutput)
}

/// Sleep in short steps until `done` returns true or we are interrupted.
fn wait_until<F>(interrupted: &AtomicBool, mut done: F)
where
    F: FnMut() -> bool,
{
    while !interrupted.load(Ordering::Relaxed) && !done() {
        thread::sleep(Duration::from_millis(20));
    }
}

fn demo(handle: &RuntimeHandle, interrupted: &AtomicBool) -> Result<()> {
    let mut first = NoteSpec::new(60);
    first.duration = Some(1.0);
    let mut second = NoteSpec::new(64);
    second.duration = Some(1.0);

    println!("Playing C4, E4 at {} BPM", handle.current_tempo());
    let id = handle.play_sequence(&[first, second], false)?;
    wait_until(interrupted, || !handle.is_active(id));
    Ok(())
}

fn play(
    handle: &RuntimeHandle,
    names: &[String],
    beats: f64,
    looping: bool,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut specs = Vec::with_capacity(names.len());
    for name in names {
        let pitch = parse_note_name(name).with_context(|| format!("Invalid note '{}'", name))?;
        let mut spec = NoteSpec::new(pitch);
        spec.duration = Some(beats);
        specs.push(spec);
    }

    let labels: Vec<String> = specs.iter().map(|s| note_name(s.pitch)).collect();
    println!(
        "Playing {}{}",
        labels.join(" "),
        if looping { " (looping, Ctrl-C to stop)" } else { "" }
    );

    let id = handle.play_sequence(&specs, looping)?;
    wait_until(interrupted, || !handle.is_active(id));
    Ok(())
}

fn run(handle: &RuntimeHandle, interrupted: &AtomicBool) -> Result<()> {
    let (line_tx, line_rx) = unbounded();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut stdout = io::stdout();
    while !interrupted.load(Ordering::Relaxed) {
        let line = match line_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<Command>(line) {
            Ok(command) => handle.execute(command),
            Err(e) => CommandOutcome::failure(format!("Invalid command: {}", e)),
        };
        writeln!(stdout, "{}", serde_json::to_string(&outcome)?)?;
        stdout.flush()?;
    }

    // Input closed: let finite sequences play out, loops run until Ctrl-C
    wait_until(interrupted, || handle.active_sequences().is_empty());
    Ok(())
}

fn report_jitter(handle: &RuntimeHandle) {
    let stats = handle.jitter_stats();
    if stats.count > 0 {
        log::info!(
            "Dispatched {} events, mean lateness {:?}, max {:?}",
            stats.count,
            stats.mean(),
            stats.max
        );
    }
}
