//! penlab-ctl: command-line client for the penlab daemon.
//!
//! ## Subcommands
//!
//! - `status`, `start`, `stop`, `label`: session control
//! - `send`: ingest a single sample
//! - `simulate`: stream random MPU6050 samples (~10 Hz by default)
//! - `watch`: subscribe to the live feed and print every event
//! - `pen`: attach as the pen's device channel and send heartbeats

mod daemon_client;
mod logging;
mod simulate;

use clap::{Parser, Subcommand};
use penlab_protocol::{LabelSessionParams, Method, SampleParams, StartSessionParams};
use std::io::{BufRead, Write};
use std::time::Duration;

use daemon_client::ClientError;

#[derive(Parser)]
#[command(name = "penlab-ctl")]
#[command(about = "Control and observe the penlab recording daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recording state, observer count and pen state
    Status,

    /// Start recording a session for a shape
    Start {
        #[arg(value_name = "SHAPE")]
        shape: String,
    },

    /// Stop the current recording
    Stop,

    /// Move a raw recording into labeled/<Shape>/<Quality>[/<Hand>]/
    Label {
        #[arg(value_name = "SHAPE")]
        shape: String,

        #[arg(value_name = "QUALITY")]
        quality: String,

        /// Raw session file name (e.g. circle_20240101_000000.csv)
        #[arg(value_name = "FILENAME")]
        filename: String,

        #[arg(long)]
        hand: Option<String>,
    },

    /// Send one sample
    Send {
        #[arg(long, allow_negative_numbers = true)]
        ax: f64,
        #[arg(long, allow_negative_numbers = true)]
        ay: f64,
        #[arg(long, allow_negative_numbers = true)]
        az: f64,
        #[arg(long, allow_negative_numbers = true)]
        gx: f64,
        #[arg(long, allow_negative_numbers = true)]
        gy: f64,
        #[arg(long, allow_negative_numbers = true)]
        gz: f64,
        #[arg(long, allow_negative_numbers = true)]
        temp: Option<f64>,
        /// Epoch seconds; the daemon uses receipt time when omitted
        #[arg(long)]
        timestamp: Option<f64>,
    },

    /// Stream random samples
    Simulate {
        #[arg(long, default_value_t = 10.0)]
        rate_hz: f64,

        /// Stop after this many samples
        #[arg(long)]
        count: Option<u64>,
    },

    /// Print live-feed events as JSON lines
    Watch,

    /// Act as the pen's device channel
    Pen {
        #[arg(long, default_value_t = 1000)]
        heartbeat_ms: u64,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli.command) {
        tracing::error!(error = %err, "penlab-ctl failed");
        eprintln!("penlab-ctl: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Status => print_data(daemon_client::call(Method::GetStatus, None)?),
        Commands::Start { shape } => {
            let params = StartSessionParams { shape: Some(shape) };
            print_data(daemon_client::call(
                Method::StartSession,
                Some(serde_json::to_value(params)?),
            )?)
        }
        Commands::Stop => print_data(daemon_client::call(Method::StopSession, None)?),
        Commands::Label {
            shape,
            quality,
            filename,
            hand,
        } => {
            let params = LabelSessionParams {
                shape: Some(shape),
                quality: Some(quality),
                hand,
                filename: Some(filename),
            };
            print_data(daemon_client::call(
                Method::LabelSession,
                Some(serde_json::to_value(params)?),
            )?)
        }
        Commands::Send {
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
            temp,
            timestamp,
        } => {
            let sample = SampleParams {
                ax: Some(ax),
                ay: Some(ay),
                az: Some(az),
                gx: Some(gx),
                gy: Some(gy),
                gz: Some(gz),
                temp,
                timestamp,
            };
            let ack = simulate::send_sample(&sample)?;
            println!("{}", simulate::describe(&ack));
            Ok(())
        }
        Commands::Simulate { rate_hz, count } => simulate::run(rate_hz, count),
        Commands::Watch => watch(),
        Commands::Pen { heartbeat_ms } => run_pen(Duration::from_millis(heartbeat_ms.max(10))),
    }
}

fn print_data(data: serde_json::Value) -> Result<(), ClientError> {
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn watch() -> Result<(), ClientError> {
    let (reader, _writer) = daemon_client::open_stream(Method::Subscribe)?;
    let stdout = std::io::stdout();
    for line in reader.lines() {
        let line = line?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
    }
    tracing::info!("Live feed closed by daemon");
    Ok(())
}

fn run_pen(heartbeat: Duration) -> Result<(), ClientError> {
    let (_reader, mut writer) = daemon_client::open_stream(Method::AttachDevice)?;
    println!("Connected to daemon as pen.");
    loop {
        let frame = serde_json::json!({ "status": "alive" });
        if let Err(err) = writeln!(writer, "{}", frame) {
            println!("Pen disconnected from daemon.");
            return Err(ClientError::Io(err));
        }
        std::thread::sleep(heartbeat);
    }
}
