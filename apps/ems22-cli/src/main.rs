use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use ems22_driver as ems22;
use ems22_transport::MockBus;

#[derive(Parser, Debug)]
#[command(
    name = "ems22",
    version,
    about = "EMS22A encoder chain tool",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    /// In-process sensors that turn a little on every read
    Mock,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode raw frames (hex like 0x8021 or decimal)
    Decode {
        #[arg(required = true)]
        frames: Vec<String>,
        /// Skip the parity check
        #[arg(long, action = ArgAction::SetTrue)]
        no_parity: bool,
    },
    /// Validate a driver config file
    CheckConfig {
        #[arg(long)]
        config: String,
        /// Print the parsed config as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Start the configured instances and poll them, printing JSON lines
    Poll {
        /// Driver config file; without one a single chain is started
        #[arg(long)]
        config: Option<String>,
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        /// Chain length when no config is given
        #[arg(long, default_value_t = 1usize)]
        chain: usize,
        /// Number of update cycles (0 = until interrupted)
        #[arg(long, default_value_t = 10u64)]
        cycles: u64,
        /// Overrides the config's poll interval
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Counts advanced per read by the mock sensors
        #[arg(long, default_value_t = 7u16)]
        mock_step: u16,
        /// Dump Prometheus metrics after polling
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Decode { frames, no_parity } => decode_frames(&frames, !no_parity),
        Commands::CheckConfig { config, json } => check_config(&config, json),
        Commands::Poll {
            config,
            backend,
            chain,
            cycles,
            interval_ms,
            mock_step,
            metrics,
        } => poll(
            config.as_deref(),
            backend,
            chain,
            cycles,
            interval_ms,
            mock_step,
            metrics,
        ),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_frame(s: &str) -> Result<u16> {
    let t = s.trim();
    let val = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)?
    } else {
        t.parse::<u16>()?
    };
    Ok(val)
}

#[derive(Serialize)]
struct DecodeRecord {
    frame: String,
    reading: u16,
    even_parity: bool,
    flags: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    angle: Option<ems22::Angle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<String>,
}

fn decode_frames(frames: &[String], parity_checks: bool) -> Result<()> {
    for s in frames {
        let bits = parse_frame(s).map_err(|e| anyhow::anyhow!("invalid frame {s}: {e}"))?;
        let frame = ems22::Frame::new(bits);
        let flags = [
            (frame.end_offset_comp(), "end_offset_comp"),
            (frame.cordic_overflow(), "cordic_overflow"),
            (frame.linearity_alarm(), "linearity_alarm"),
            (frame.mag_increase(), "mag_increase"),
            (frame.mag_decrease(), "mag_decrease"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        let (angle, fault) = match ems22::decode_frame(bits, parity_checks) {
            Ok(a) => (Some(a), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let rec = DecodeRecord {
            frame: format!("0x{bits:04X}"),
            reading: frame.reading(),
            even_parity: frame.has_even_parity(),
            flags,
            angle,
            fault,
        };
        println!("{}", serde_json::to_string(&rec)?);
    }
    Ok(())
}

fn check_config(path: &str, json: bool) -> Result<()> {
    let cfg = ems22::load_config_file(path)?;
    println!(
        "ok: {} instance(s), poll every {} ms",
        cfg.instances.len(),
        cfg.poll_interval_ms
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    }
    Ok(())
}

#[derive(Serialize)]
struct PollRecord<'a> {
    cycle: u64,
    status: ems22::UpdateStatus,
    instances: &'a [ems22::InstanceInfo],
}

fn poll(
    config: Option<&str>,
    backend: Backend,
    chain: usize,
    cycles: u64,
    interval_ms: Option<u64>,
    mock_step: u16,
    with_metrics: bool,
) -> Result<()> {
    let cfg = match config {
        Some(path) => ems22::load_config_file(path)?,
        None => ems22::DriverConfig {
            poll_interval_ms: 100,
            instances: vec![ems22::InstanceConfig {
                label: None,
                chain_length: chain,
                disable_parity: false,
            }],
        },
    };
    let interval = Duration::from_millis(interval_ms.unwrap_or(cfg.poll_interval_ms));

    let hub = ems22::MetricsHub::new().map_err(anyhow::Error::msg)?;
    let driver = ems22::Ems22Driver::new().with_metrics(hub.driver.clone());

    for (i, inst) in cfg.instances.iter().enumerate() {
        let bus = match backend {
            Backend::Mock => MockBus::rotating(&format!("mock{i}"), (i as u16) * 100, mock_step),
        };
        let handle =
            driver.start_instance(bus, inst.chain_length, inst.label.as_deref(), inst.disable_parity)?;
        info!(%handle, "started");
    }

    let mut cycle = 0u64;
    while cycles == 0 || cycle < cycles {
        let status = driver.update_all();
        if status != ems22::UpdateStatus::Ok {
            warn!(cycle, ?status, "update cycle did not fully succeed");
        }
        let infos = driver
            .live_handles()
            .into_iter()
            .map(|h| driver.instance_info(h))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let rec = PollRecord {
            cycle,
            status,
            instances: &infos,
        };
        println!("{}", serde_json::to_string(&rec)?);
        cycle += 1;
        thread::sleep(interval);
    }

    for handle in driver.live_handles() {
        driver.end_instance(handle)?;
    }
    if with_metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}
