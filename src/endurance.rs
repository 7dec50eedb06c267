// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Endurance cycling with log-spaced verified checkpoints.
//!
//! Cycling a cell millions of times with a full pulse-verify search per
//! cycle would take days; measuring only the first few cycles would miss the
//! wear-out. The scheduler splits the difference: a piecewise stride table
//! picks checkpoint cycles (dense early, sparse late), each checkpoint runs
//! a fully verified RESET-then-SET pair, and the stretches in between are
//! covered by unverified hardware-looped pulse pairs.
//!
//! Degradation shows up as checkpoint convergence failures. A configurable
//! count of consecutive failed checkpoints ends the run; any clean
//! checkpoint resets the count, so a transient glitch does not end a
//! multi-day experiment.

use log::{info, warn};

use crate::bus::RramBus;
use crate::engine::{ConvergeOptions, ConvergeOutcome, RramEngine};
use crate::mask::Address;
use crate::record::RecordSink;
use crate::KilnError;

/// Checkpoint cycles for an endurance run.
///
/// `strides` is a list of `(threshold, stride)` pairs: from the largest
/// threshold not exceeding the current cycle, advance by that stride. A
/// stride of zero is treated as one. With `strides = [(0, 1), (10, 10)]`
/// and `total_cycles = 25` the checkpoints are `0..=10` then `20`.
pub fn read_cycle_schedule(total_cycles: u64, strides: &[(u64, u64)]) -> Vec<u64> {
    let mut out = Vec::new();
    let mut cycle = 0;
    while cycle <= total_cycles {
        out.push(cycle);
        let stride = strides
            .iter()
            .rev()
            .find(|(threshold, _)| *threshold <= cycle)
            .map(|(_, stride)| *stride)
            .unwrap_or(1)
            .max(1);
        cycle += stride;
    }
    out
}

/// Options of one endurance run.
#[derive(Debug, Clone)]
pub struct EnduranceOptions {
    /// Total cycle budget; the run covers checkpoints up to this cycle.
    pub total_cycles: u64,
    /// Checkpoint stride table, see [`read_cycle_schedule`].
    pub strides: Vec<(u64, u64)>,
    /// Consecutive failed checkpoints that end the run.
    pub max_failures: usize,
    /// Failure policy: when true a checkpoint fails only if every cell
    /// failed both directions; when false any cell failing either direction
    /// fails the checkpoint.
    pub fail_on_all: bool,
    /// Whether checkpoint rows go to the record sink.
    pub record: bool,
}

impl Default for EnduranceOptions {
    fn default() -> Self {
        EnduranceOptions {
            total_cycles: 1_000_000,
            strides: vec![(0, 1), (10, 10), (100, 100), (1_000, 1_000), (10_000, 10_000)],
            max_failures: 3,
            fail_on_all: false,
            record: true,
        }
    }
}

/// Result of an endurance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnduranceOutcome {
    /// Cycles actually executed, verified and unverified.
    pub cycles_run: u64,
    /// Verified checkpoints executed.
    pub checkpoints: usize,
    /// Failed checkpoints over the whole run.
    pub total_failures: usize,
    /// Whether the failure policy or an interrupt ended the run before the
    /// schedule did.
    pub stopped_early: bool,
}

fn checkpoint_failed(
    address: &Address,
    reset: &ConvergeOutcome,
    set: &ConvergeOutcome,
    fail_on_all: bool,
) -> bool {
    if fail_on_all {
        address
            .cells()
            .into_iter()
            .all(|(wl, bl)| !reset.cell_succeeded(wl, bl) && !set.cell_succeeded(wl, bl))
    } else {
        !(reset.success && set.success)
    }
}

impl<B: RramBus, S: RecordSink> RramEngine<B, S> {
    /// Cycle the addressed cells per the checkpoint schedule, running a
    /// verified RESET-then-SET pair at each checkpoint and unverified pulse
    /// pairs in between.
    pub fn endurance(&mut self, opts: &EnduranceOptions) -> Result<EnduranceOutcome, KilnError> {
        let schedule = read_cycle_schedule(opts.total_cycles, &opts.strides);
        let address = self.address().clone();
        let converge_opts = ConvergeOptions { record: opts.record, ..Default::default() };
        let interrupt = self.interrupt_flag();

        let mut cycles_run = 0;
        let mut checkpoints = 0;
        let mut total_failures = 0;
        let mut consecutive = 0;
        let mut stopped_early = false;

        for (i, &cycle) in schedule.iter().enumerate() {
            if interrupt.is_set() {
                warn!("endurance run interrupted at cycle {cycle}");
                stopped_early = true;
                break;
            }

            let reset = self.dynamic_reset(&converge_opts)?;
            let set = self.dynamic_set(&converge_opts)?;
            cycles_run += 1;
            checkpoints += 1;

            if checkpoint_failed(&address, &reset, &set, opts.fail_on_all) {
                total_failures += 1;
                consecutive += 1;
                warn!(
                    "endurance checkpoint at cycle {cycle} failed \
                     ({consecutive} consecutive, limit {})",
                    opts.max_failures
                );
                if consecutive >= opts.max_failures {
                    stopped_early = true;
                    break;
                }
            } else {
                consecutive = 0;
                info!("endurance checkpoint at cycle {cycle} clean");
            }

            if let Some(&next) = schedule.get(i + 1) {
                let gap = next - cycle - 1;
                self.fast_cycles(gap)?;
                cycles_run += gap;
            }
        }

        info!(
            "endurance run done: {cycles_run} cycles, {checkpoints} checkpoints, \
             {total_failures} failures"
        );
        Ok(EnduranceOutcome { cycles_run, checkpoints, total_failures, stopped_early })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HardwareFault, Measurement, PulseSetup, ReadFrame, ReadLevels};
    use crate::config::Settings;
    use crate::engine::RramEngine;
    use crate::mask::{BitLine, SourceLine, WordLine};
    use crate::record::MemorySink;
    use crate::waveform::PulsePolarity;
    use std::collections::HashMap;

    #[test]
    fn schedule_follows_the_stride_table() {
        let schedule = read_cycle_schedule(25, &[(0, 1), (10, 10)]);
        assert_eq!(schedule, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20]);
    }

    #[test]
    fn schedule_defaults_to_unit_stride() {
        assert_eq!(read_cycle_schedule(3, &[]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn schedule_tolerates_zero_stride() {
        assert_eq!(read_cycle_schedule(2, &[(0, 0)]), vec![0, 1, 2]);
    }

    #[test]
    fn log_spaced_default_covers_a_million_cycles() {
        let opts = EnduranceOptions::default();
        let schedule = read_cycle_schedule(opts.total_cycles, &opts.strides);
        assert_eq!(*schedule.first().unwrap(), 0);
        assert_eq!(*schedule.last().unwrap(), 1_000_000);
        // dense early, sparse late
        assert!(schedule.len() < 200);
        assert!(schedule.contains(&5) && schedule.contains(&50));
    }

    /// Cell behavior under a pulse: responsive cells snap to the demo
    /// targets' side of each direction, stuck cells never move.
    #[derive(Clone, Copy)]
    enum CellKind {
        Responsive,
        Stuck(f64),
    }

    struct ToggleBus {
        cells: HashMap<(WordLine, BitLine), CellKind>,
        res: HashMap<(WordLine, BitLine), f64>,
        pulses: usize,
    }

    impl ToggleBus {
        fn new(cells: &[((WordLine, BitLine), CellKind)]) -> Self {
            let mut res = HashMap::new();
            for &(cell, kind) in cells {
                let r = match kind {
                    CellKind::Responsive => 50_000.0,
                    CellKind::Stuck(r) => r,
                };
                res.insert(cell, r);
            }
            ToggleBus { cells: cells.iter().copied().collect(), res, pulses: 0 }
        }
    }

    impl RramBus for ToggleBus {
        fn pulse(&mut self, setup: &PulseSetup) -> Result<(), HardwareFault> {
            self.pulses += 1;
            let is_set = setup.levels.bitlines.iter().any(|(_, v)| *v > setup.levels.vsl);
            for (cell, kind) in &self.cells {
                if let CellKind::Responsive = kind {
                    // demo targets: SET <= 10k, RESET >= 100k
                    self.res.insert(*cell, if is_set { 9_000.0 } else { 150_000.0 });
                }
            }
            Ok(())
        }

        fn read(
            &mut self,
            _levels: &ReadLevels,
            address: &Address,
        ) -> Result<ReadFrame, HardwareFault> {
            let mut frame = ReadFrame::new();
            for (wl, bl) in address.cells() {
                let r = self.res.get(&(wl, bl)).copied().unwrap_or(1e9);
                frame.insert(wl, bl, Measurement::from_resistance(r, 0.2));
            }
            Ok(frame)
        }
    }

    fn engine_with(
        bus: ToggleBus,
        bitlines: Vec<BitLine>,
    ) -> RramEngine<ToggleBus, MemorySink> {
        let settings = Settings::demo();
        let sourcelines = (0..bitlines.len() as u16).map(SourceLine).collect();
        let address = Address { wordlines: vec![WordLine(0)], bitlines, sourcelines };
        RramEngine::new(
            "C4",
            "D0",
            PulsePolarity::Nmos,
            settings,
            address,
            bus,
            MemorySink::default(),
        )
        .unwrap()
    }

    #[test]
    fn healthy_cell_completes_the_schedule() {
        let bus = ToggleBus::new(&[((WordLine(0), BitLine(0)), CellKind::Responsive)]);
        let mut engine = engine_with(bus, vec![BitLine(0)]);
        let opts = EnduranceOptions {
            total_cycles: 25,
            strides: vec![(0, 1), (10, 10)],
            record: false,
            ..Default::default()
        };
        let out = engine.endurance(&opts).unwrap();
        assert!(!out.stopped_early);
        assert_eq!(out.checkpoints, 12);
        assert_eq!(out.total_failures, 0);
        // 12 verified checkpoints plus the 9 fast cycles between 10 and 20
        assert_eq!(out.cycles_run, 21);
        let totals = engine.profile_totals();
        assert!(totals.sets >= 12 + 9 && totals.resets >= 12 + 9);
    }

    #[test]
    fn consecutive_failures_end_the_run() {
        // stuck mid-window: fails both the RESET and the SET target
        let bus = ToggleBus::new(&[((WordLine(0), BitLine(0)), CellKind::Stuck(50_000.0))]);
        let mut engine = engine_with(bus, vec![BitLine(0)]);
        let opts = EnduranceOptions {
            total_cycles: 100,
            strides: vec![(0, 1)],
            max_failures: 3,
            record: false,
            ..Default::default()
        };
        let out = engine.endurance(&opts).unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.checkpoints, 3, "stops at the third consecutive failure");
        assert_eq!(out.total_failures, 3);
        assert_eq!(out.cycles_run, 3);
    }

    #[test]
    fn fail_on_all_tolerates_a_single_dead_cell() {
        let cells = [
            ((WordLine(0), BitLine(0)), CellKind::Responsive),
            ((WordLine(0), BitLine(1)), CellKind::Stuck(50_000.0)),
        ];
        let opts_base = EnduranceOptions {
            total_cycles: 3,
            strides: vec![(0, 1)],
            max_failures: 2,
            record: false,
            ..Default::default()
        };

        // any-cell policy: the stuck cell fails every checkpoint
        let mut engine =
            engine_with(ToggleBus::new(&cells), vec![BitLine(0), BitLine(1)]);
        let out = engine
            .endurance(&EnduranceOptions { fail_on_all: false, ..opts_base.clone() })
            .unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.checkpoints, 2);

        // all-cells policy: the healthy cell keeps the run alive
        let mut engine =
            engine_with(ToggleBus::new(&cells), vec![BitLine(0), BitLine(1)]);
        let out = engine
            .endurance(&EnduranceOptions { fail_on_all: true, ..opts_base })
            .unwrap();
        assert!(!out.stopped_early);
        assert_eq!(out.checkpoints, 4);
        assert_eq!(out.total_failures, 0);
    }

    #[test]
    fn interrupt_stops_before_the_next_checkpoint() {
        let bus = ToggleBus::new(&[((WordLine(0), BitLine(0)), CellKind::Responsive)]);
        let mut engine = engine_with(bus, vec![BitLine(0)]);
        engine.interrupt_flag().set();
        let out = engine.endurance(&EnduranceOptions::default()).unwrap();
        assert!(out.stopped_early);
        assert_eq!(out.checkpoints, 0);
        assert_eq!(out.cycles_run, 0);
    }
}
