mod config;
mod logging;
mod render;
mod session;

use clap::{Parser, Subcommand};
use config::AppConfig;
use render::{Pattern, steps};
use session::AppResult;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drum box front end for ASIO drivers", long_about = None)]
struct Args {
    /// TOML configuration file (defaults to ./drumbox.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the built-in simulated driver instead of the ASIO host library
    #[arg(long, global = true)]
    simulate: bool,

    /// More logging; repeat for trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed drivers
    Drivers,
    /// Print a driver's channels, buffer sizes and formats as JSON
    Describe { driver: Option<String> },
    /// Play a drum pattern
    Click {
        #[arg(long)]
        driver: Option<String>,
        #[arg(long, default_value_t = 0)]
        channel: usize,
        #[arg(long, default_value_t = 120.0)]
        bpm: f32,
        #[arg(long, default_value_t = 2)]
        bars: usize,
        /// Kick steps, `x` for a hit and `.` for a rest
        #[arg(long)]
        kick: Option<String>,
        #[arg(long)]
        snare: Option<String>,
        #[arg(long)]
        hat: Option<String>,
    },
    /// Play the drum notes of a MIDI file
    PlayMidi {
        file: PathBuf,
        #[arg(long)]
        driver: Option<String>,
        #[arg(long, default_value_t = 0)]
        channel: usize,
    },
    /// Record an input channel to a WAV file
    Record {
        output: PathBuf,
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
        #[arg(long)]
        driver: Option<String>,
        #[arg(long, default_value_t = 0)]
        channel: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    logging::init(logging::level(args.verbose, &config.logging.level))?;
    let registry = session::registry(&config, args.simulate)?;
    let result = run(&args.command, &config, &registry);
    registry.free_all();
    result
}

fn run(command: &Command, config: &AppConfig, registry: &drumbox_engine::DriverRegistry) -> AppResult<()> {
    match command {
        Command::Drivers => {
            for info in registry.mixer_infos() {
                println!("{}\t{}\tversion {}", info.name, info.description, info.version);
            }
            if let Some(error) = registry.last_error() {
                info!("last driver error: {error}");
            }
        }
        Command::Describe { driver } => {
            let mixer = session::mixer(registry, config, driver.as_deref())?;
            let description = session::describe(&mixer)?;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
        Command::Click {
            driver,
            channel,
            bpm,
            bars,
            kick,
            snare,
            hat,
        } => {
            let mixer = session::mixer(registry, config, driver.as_deref())?;
            let defaults = Pattern::default();
            let pattern = Pattern {
                kick: kick.as_deref().map_or(defaults.kick, steps),
                snare: snare.as_deref().map_or(defaults.snare, steps),
                hat: hat.as_deref().map_or(defaults.hat, steps),
            };
            let rate = mixer.sample_rate()? as f32;
            let samples = pattern.render(*bpm, *bars, rate);
            session::play(&mixer, *channel, &samples)?;
        }
        Command::PlayMidi {
            file,
            driver,
            channel,
        } => {
            let mixer = session::mixer(registry, config, driver.as_deref())?;
            let bytes = fs::read(file)?;
            let rate = mixer.sample_rate()? as f32;
            let samples = render::render_midi(&bytes, rate).map_err(|e| {
                io::Error::other(format!("Failed to parse MIDI '{}': {e}", file.display()))
            })?;
            session::play(&mixer, *channel, &samples)?;
        }
        Command::Record {
            output,
            seconds,
            driver,
            channel,
        } => {
            let mixer = session::mixer(registry, config, driver.as_deref())?;
            let (samples, rate) = session::record(&mixer, *channel, *seconds)?;
            wavers::write::<f32, _>(output, &samples, rate as i32, 1).map_err(|e| {
                io::Error::other(format!("Failed to write '{}': {e}", output.display()))
            })?;
            info!("wrote {} frames to {}", samples.len(), output.display());
        }
    }
    Ok(())
}
