use anyhow::Context;
use clap::{Parser, Subcommand};
use stagekit::{
    build_scan, hal_factory, init_logging, list_ports, plan_scan, Config, ConfirmCallback,
    DriverKind, MotionCommandThread, ScanEvent, SimulatedImager, BUILD_DATE, VERSION,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "stagekit")]
#[command(about = "Motion and scan planning for motorized microscope stages")]
#[command(version)]
struct Cli {
    /// Configuration file (.toml or .json); defaults to the platform config path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a scan and print its geometry without moving anything
    Plan {
        /// Print every grid point as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a scan
    Scan {
        /// Serial port of a GRBL controller (overrides the config)
        #[arg(short, long)]
        port: Option<String>,

        /// Use the simulated stage regardless of the config
        #[arg(long, conflicts_with = "port")]
        simulate: bool,

        /// Output directory (overrides the config)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Home without asking when the config requests homing
        #[arg(short, long)]
        yes: bool,
    },
    /// List serial ports that look like motion controllers
    Ports,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match Config::default_path() {
            Some(path) if path.exists() => path,
            _ => {
                tracing::info!("No config file found, using defaults");
                return Ok(Config::default());
            }
        },
    };
    Config::load_from_file(&path).with_context(|| format!("Failed to load {}", path.display()))
}

fn confirm_homing() -> bool {
    print!("Home the stage before scanning? [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

fn plan(config: &Config, json: bool) -> anyhow::Result<()> {
    let geometry = plan_scan(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&geometry.points())?);
        return Ok(());
    }

    for axis in geometry.descriptors() {
        println!(
            "{}: {} images ({:.3} ideal), step {:.4} mm, {:.4} .. {:.4} mm",
            axis.axis,
            axis.images_actual,
            axis.images_ideal,
            axis.step,
            axis.start,
            axis.actual_end
        );
    }
    println!(
        "{} grid cells, {} to visit",
        geometry.images_expected(),
        geometry.points().len()
    );
    Ok(())
}

fn scan(config: Config, yes: bool) -> anyhow::Result<()> {
    config.validate()?;
    let motion = MotionCommandThread::spawn(hal_factory(&config), &config.motion)
        .context("Failed to start the motion worker")?;
    let imager = SimulatedImager::from_settings(&config.imager);

    let mut pipeline = build_scan(&config, &motion, imager)?;
    if config.scan.home_before_scan {
        let confirm: ConfirmCallback = if yes {
            Box::new(|| true)
        } else {
            Box::new(confirm_homing)
        };
        pipeline = pipeline.with_homing(Some(confirm));
    }

    let handle = pipeline.spawn()?;
    let mut events = handle.subscribe();
    let progress = std::thread::Builder::new()
        .name("stagekit-progress".to_string())
        .spawn(move || {
            while let Ok(event) = events.blocking_recv() {
                match event {
                    ScanEvent::Progress { .. } => tracing::info!("{}", event),
                    ScanEvent::Warning(msg) => tracing::warn!("{}", msg),
                    ScanEvent::StateChanged(state) if state.is_terminal() => break,
                    ScanEvent::StateChanged(_) => {}
                }
            }
        })?;

    let outcome = handle.join()?;
    if progress.join().is_err() {
        tracing::warn!("Progress reporter panicked");
    }
    motion.shutdown();

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_ok() {
        anyhow::bail!(
            "Scan {}: {}",
            outcome.state,
            outcome.message.as_deref().unwrap_or("no message")
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    tracing::debug!("StageKit {} (built {})", VERSION, BUILD_DATE);

    match cli.command {
        Command::Plan { json } => plan(&load_config(cli.config.as_deref())?, json),
        Command::Scan {
            port,
            simulate,
            output,
            yes,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(port) = port {
                config.connection.driver = DriverKind::Grbl;
                config.connection.port = port;
            }
            if simulate {
                config.connection.driver = DriverKind::Simulated;
            }
            if let Some(output) = output {
                config.scan.output.directory = output;
            }
            scan(config, yes)
        }
        Command::Ports => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("No controller ports found");
            }
            for port in ports {
                println!("{}\t{}", port.port_name, port.description);
            }
            Ok(())
        }
    }
}
