#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fsim::nand::EventEngine;
use fsim::types::{IoBitmap, Lpn};
use fsim::{HostRequest, PageMapping, SimConfig, StatEntry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fsim", about = "flashsim — page-mapping FTL simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Warm up a device and run a synthetic host workload.
    Run {
        /// Path to a TOML simulation config; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of host operations to issue after warmup.
        #[arg(long, default_value_t = 100_000)]
        ios: u64,
        /// Fraction of host operations that are writes.
        #[arg(long, default_value_t = 0.7)]
        write_ratio: f64,
        /// Host inter-arrival time in microseconds.
        #[arg(long, default_value_t = 100)]
        interval_us: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the default simulation config as TOML.
    Config,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    warmup_valid_pages: u64,
    warmup_invalid_pages: u64,
    host_ops: u64,
    final_tick_ns: u64,
    stats: Vec<StatEntry>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            ios,
            write_ratio,
            interval_us,
            json,
        } => run(config, ios, write_ratio, interval_us, json),
        Command::Config => {
            let rendered = toml::to_string_pretty(&SimConfig::default())
                .context("serialize default config")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

fn run(
    config: Option<PathBuf>,
    ios: u64,
    write_ratio: f64,
    interval_us: u64,
    json: bool,
) -> Result<()> {
    let cfg: SimConfig = match &config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
        }
        None => SimConfig::default(),
    };

    let mut ftl = PageMapping::from_sim_config(&cfg).context("build FTL")?;
    let mut engine = EventEngine::new();
    let warmup = ftl.initialize(&mut engine).context("warmup")?;

    let total_pages = cfg.geometry.total_logical_pages();
    let io_flag = IoBitmap::full(cfg.geometry.io_unit_in_page)
        .map_err(|e| anyhow::anyhow!("io flag: {e}"))?;
    let mut rng = StdRng::seed_from_u64(cfg.ftl.random_seed ^ 0x5eed_cafe);

    let mut tick = 0_u64;
    for _ in 0..ios {
        while let Some((event, fired_at)) = engine.pop_due(tick) {
            if ftl.is_refresh_event(event) {
                let mut event_tick = fired_at;
                ftl.refresh_tick(&mut engine, &mut event_tick)
                    .context("refresh sweep")?;
            }
        }

        let req = HostRequest {
            lpn: Lpn(rng.gen_range(0..total_pages)),
            io_flag,
        };
        if rng.gen_bool(write_ratio.clamp(0.0, 1.0)) {
            ftl.write(&req, &mut tick).context("host write")?;
        } else {
            ftl.read(&req, &mut tick).context("host read")?;
        }
        tick += interval_us * 1_000;
    }

    let output = RunOutput {
        warmup_valid_pages: warmup.valid_pages,
        warmup_invalid_pages: warmup.invalid_pages,
        host_ops: ios,
        final_tick_ns: tick,
        stats: ftl.stat_list("ftl."),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "warmup: {} valid / {} invalid pages",
            output.warmup_valid_pages, output.warmup_invalid_pages
        );
        println!(
            "workload: {} host ops, final tick {} ns",
            output.host_ops, output.final_tick_ns
        );
        for stat in &output.stats {
            println!("{:<48} {:>16.3}  {}", stat.name, stat.value, stat.desc);
        }
    }
    Ok(())
}
