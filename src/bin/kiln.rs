// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Unified CLI for the Kiln RRAM programming engine.
//!
//! Every subcommand runs against the built-in simulated array, which makes
//! the binary a recipe dry-run and demo driver; hardware sessions link the
//! library and provide their own [`kiln::bus::RramBus`].

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiln::config::Settings;
use kiln::endurance::EnduranceOptions;
use kiln::engine::{ConvergeOptions, RramEngine};
use kiln::mask::{Address, BitLine, SourceLine, WordLine};
use kiln::mlc::MlcOptions;
use kiln::record::CsvSink;
use kiln::sim::SimArray;
use kiln::target::TargetOptions;
use kiln::waveform::PulsePolarity;

#[derive(Parser)]
#[command(name = "kiln", about = "Kiln — adaptive RRAM array programming engine")]
struct Cli {
    /// Chip identifier recorded in every output row.
    #[clap(long, default_value = "CHIP")]
    chip: String,

    /// Device/array identifier recorded in every output row.
    #[clap(long, default_value = "ARRAY")]
    device: String,

    /// Access-transistor polarity: NMOS or PMOS.
    #[clap(long, default_value = "nmos")]
    polarity: String,

    /// Settings JSON path.
    ///
    /// If not specified, the built-in demo recipe for a 2x2 array is used.
    #[clap(long)]
    settings: Option<PathBuf>,

    /// Wordlines to address (comma-separated indices). All when omitted.
    #[clap(long, value_delimiter = ',')]
    wordlines: Vec<u16>,

    /// Bitlines to address (comma-separated indices). All when omitted.
    #[clap(long, value_delimiter = ',')]
    bitlines: Vec<u16>,

    /// Sourcelines to address (comma-separated indices). All when omitted.
    #[clap(long, value_delimiter = ',')]
    sourcelines: Vec<u16>,

    /// CSV output path for per-cell rows. Stdout when omitted.
    #[clap(long)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every addressed cell once and emit one row per cell.
    Read,

    /// FORM fresh cells: a SET convergence search with the (stronger) FORM
    /// settings block.
    Form,

    /// SET convergence: pulse-verify until resistance drops to target.
    Set {
        /// Target resistance in ohms; the recipe default when omitted.
        #[clap(long)]
        target: Option<f64>,
    },

    /// RESET convergence: pulse-verify until resistance rises to target.
    Reset {
        /// Target resistance in ohms; the recipe default when omitted.
        #[clap(long)]
        target: Option<f64>,
    },

    /// Ping-pong the addressed cells into a closed resistance window.
    Target {
        /// Lower window edge in ohms.
        res_lo: f64,
        /// Upper window edge in ohms.
        res_hi: f64,
        /// Ping-pong pass budget.
        #[clap(long, default_value_t = 25)]
        max_attempts: usize,
    },

    /// Like `target`, with the window given in siemens of conductance.
    TargetG {
        /// Lower window edge in siemens.
        g_lo: f64,
        /// Upper window edge in siemens.
        g_hi: f64,
        /// Ping-pong pass budget.
        #[clap(long, default_value_t = 25)]
        max_attempts: usize,
    },

    /// Two-pass coarse/fine multi-level programming per the recipe's `mlc`
    /// block.
    Mlc,

    /// Endurance cycling with log-spaced verified checkpoints.
    Endurance {
        /// Total cycle budget.
        #[clap(long, default_value_t = 1000)]
        cycles: u64,

        /// Consecutive failed checkpoints that end the run.
        #[clap(long, default_value_t = 3)]
        max_failures: usize,

        /// Fail a checkpoint only when every cell failed both directions.
        #[clap(long)]
        fail_on_all: bool,
    },
}

fn load_settings(path: &Option<PathBuf>) -> Settings {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
            Settings::from_json_str(&json).unwrap_or_else(|e| panic!("{e}"))
        }
        None => Settings::demo(),
    }
}

fn build_address(cli: &Cli, settings: &Settings) -> Address {
    let geometry = settings.geometry.to_geometry();
    let full = Address::full(&geometry);
    Address {
        wordlines: if cli.wordlines.is_empty() {
            full.wordlines
        } else {
            cli.wordlines.iter().map(|&i| WordLine(i)).collect()
        },
        bitlines: if cli.bitlines.is_empty() {
            full.bitlines
        } else {
            cli.bitlines.iter().map(|&i| BitLine(i)).collect()
        },
        sourcelines: if cli.sourcelines.is_empty() {
            full.sourcelines
        } else {
            cli.sourcelines.iter().map(|&i| SourceLine(i)).collect()
        },
    }
}

fn open_sink(out: &Option<PathBuf>) -> CsvSink<Box<dyn Write>> {
    let writer: Box<dyn Write> = match out {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .unwrap_or_else(|e| panic!("cannot create {}: {e}", path.display())),
        ),
        None => Box::new(std::io::stdout()),
    };
    CsvSink::new(writer)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let polarity: PulsePolarity = cli.polarity.parse().unwrap_or_else(|e| panic!("{e}"));
    let settings = load_settings(&cli.settings);
    let geometry = settings.geometry.to_geometry();
    let address = build_address(&cli, &settings);
    let sim = SimArray::fresh(&geometry, polarity).unwrap_or_else(|e| panic!("{e}"));
    let sink = open_sink(&cli.out);

    let mut engine = RramEngine::new(
        cli.chip.clone(),
        cli.device.clone(),
        polarity,
        settings,
        address,
        sim,
        sink,
    )
    .unwrap_or_else(|e| panic!("{e}"));

    let success = match cli.command {
        Commands::Read => {
            let frame = engine.read(true).expect("read failed");
            eprintln!(
                "read {} cells, resistance {:?}..{:?} ohm",
                frame.len(),
                frame.min_resistance(),
                frame.max_resistance()
            );
            true
        }
        Commands::Form => {
            let out = engine.dynamic_form(&ConvergeOptions::default()).expect("form failed");
            eprintln!("form: success={}", out.success);
            out.success
        }
        Commands::Set { target } => {
            let opts = ConvergeOptions { target_res: target, ..Default::default() };
            let out = engine.dynamic_set(&opts).expect("set failed");
            eprintln!("set: success={}", out.success);
            out.success
        }
        Commands::Reset { target } => {
            let opts = ConvergeOptions { target_res: target, ..Default::default() };
            let out = engine.dynamic_reset(&opts).expect("reset failed");
            eprintln!("reset: success={}", out.success);
            out.success
        }
        Commands::Target { res_lo, res_hi, max_attempts } => {
            let opts = TargetOptions { max_attempts, record: true };
            let out = engine.target(res_lo, res_hi, &opts).expect("target failed");
            eprintln!(
                "target [{res_lo}, {res_hi}]: success={} final={} ohm attempts={}",
                out.success, out.final_res, out.attempts
            );
            out.success
        }
        Commands::TargetG { g_lo, g_hi, max_attempts } => {
            let opts = TargetOptions { max_attempts, record: true };
            let out = engine.target_g(g_lo, g_hi, &opts).expect("target-g failed");
            eprintln!(
                "target-g [{g_lo}, {g_hi}]: success={} final={} ohm attempts={}",
                out.success, out.final_res, out.attempts
            );
            out.success
        }
        Commands::Mlc => {
            let out = engine.program_mlc(&MlcOptions::default()).expect("mlc failed");
            eprintln!(
                "mlc: success={} final={:?} ohm attempts={}",
                out.success, out.final_res, out.attempts
            );
            out.success
        }
        Commands::Endurance { cycles, max_failures, fail_on_all } => {
            let opts = EnduranceOptions {
                total_cycles: cycles,
                max_failures,
                fail_on_all,
                ..Default::default()
            };
            let out = engine.endurance(&opts).expect("endurance failed");
            eprintln!(
                "endurance: {} cycles, {} checkpoints, {} failures, stopped_early={}",
                out.cycles_run, out.checkpoints, out.total_failures, out.stopped_early
            );
            !out.stopped_early
        }
    };

    let totals = engine.profile_totals();
    eprintln!(
        "operations: {} reads, {} forms, {} sets, {} resets",
        totals.reads, totals.forms, totals.sets, totals.resets
    );
    if !success {
        std::process::exit(2);
    }
}
