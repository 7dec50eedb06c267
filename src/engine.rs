// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The adaptive pulse-verify convergence engine.
//!
//! [`RramEngine`] drives the nested parameter sweep at the core of every
//! programming operation: pulse width (log10-spaced, outer) → gate voltage
//! (linear) → line voltage (linear, inner). At each combination it pulses all
//! still-masked cells with one encoded waveform, reads the full addressed
//! set back, and clears every cell that meets the direction-specific target
//! comparator. The sweep breaks out of all three loops as soon as the mask
//! clears; exhausting the sweep is not an error — it returns per-cell
//! `success = false` so callers can build retry policy on top without
//! exception-based control flow.
//!
//! Everything here is single-threaded and strictly blocking: the instrument
//! bus serializes all operations, so the mask and in-flight waveform are
//! exclusively owned by one search invocation for its duration.

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::bus::{
    BurstPattern, InterruptFlag, PulseLevels, PulseSetup, ReadFrame, ReadLevels, RramBus,
};
use crate::config::{OpSettings, Settings};
use crate::mask::{Address, ArrayGeometry, ArrayMask, BitLine, WordLine};
use crate::record::{CellRecord, NullSink, OpKind, RecordSink};
use crate::sweep::Comparison;
use crate::waveform::{self, FrameLayout, PulsePolarity, PulseTiming};
use crate::KilnError;

/// A programming direction with settings and a convergence comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramOp {
    /// First-ever SET of a fresh cell; electrically a SET with its own
    /// (stronger) settings block.
    Form,
    Set,
    Reset,
}

impl ProgramOp {
    pub fn kind(&self) -> OpKind {
        match self {
            ProgramOp::Form => OpKind::Form,
            ProgramOp::Set => OpKind::Set,
            ProgramOp::Reset => OpKind::Reset,
        }
    }

    /// SET and FORM drive resistance down; RESET drives it up.
    pub fn is_set_direction(&self) -> bool {
        !matches!(self, ProgramOp::Reset)
    }

    /// The convergence check applied to each measured resistance.
    pub fn comparator(&self) -> Comparison {
        if self.is_set_direction() {
            Comparison::LessOrEquals
        } else {
            Comparison::GreaterOrEquals
        }
    }
}

/// Cell-selection mode of a convergence search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Program every addressed cell.
    All,
    /// 1TNR mode: program only the given bitline's cell on each addressed
    /// wordline; the other bitlines carry a partial bias.
    Single(BitLine),
}

/// Options of one convergence search.
#[derive(Debug, Clone)]
pub struct ConvergeOptions {
    /// Target resistance; `None` uses the operation's configured default.
    pub target_res: Option<f64>,
    pub select: Selection,
    /// Whether per-cell rows are appended to the record sink.
    pub record: bool,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        ConvergeOptions { target_res: None, select: Selection::All, record: true }
    }
}

/// Result of one convergence search: overall success plus one row per
/// addressed cell. Owned by the caller; the engine retains nothing.
#[derive(Debug, Clone)]
pub struct ConvergeOutcome {
    pub success: bool,
    pub cells: Vec<CellRecord>,
}

impl ConvergeOutcome {
    /// Whether the given cell converged in this search.
    pub fn cell_succeeded(&self, wl: WordLine, bl: BitLine) -> bool {
        self.cells.iter().any(|r| r.wl == wl && r.bl == bl && r.success)
    }
}

/// Per-cell operation counters, kept across searches for summary logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrProfile {
    pub forms: u64,
    pub reads: u64,
    pub sets: u64,
    pub resets: u64,
}

/// The array-programming engine.
///
/// Owns the bus and record sink for its lifetime; the settings are read-only
/// during each search call.
pub struct RramEngine<B: RramBus, S: RecordSink = NullSink> {
    chip: String,
    device: String,
    polarity: PulsePolarity,
    settings: Settings,
    geometry: ArrayGeometry,
    layout: FrameLayout,
    address: Address,
    bus: B,
    sink: S,
    interrupt: InterruptFlag,
    profile: IndexMap<(WordLine, BitLine), AddrProfile>,
}

impl<B: RramBus, S: RecordSink> RramEngine<B, S> {
    pub fn new(
        chip: impl Into<String>,
        device: impl Into<String>,
        polarity: PulsePolarity,
        settings: Settings,
        address: Address,
        bus: B,
        sink: S,
    ) -> Result<Self, KilnError> {
        let geometry = settings.geometry.to_geometry();
        let layout = FrameLayout::new(
            geometry.wordlines.len(),
            geometry.sourcelines.len(),
            geometry.bitlines.len(),
        )?;
        validate_address(&address, &geometry)?;
        let mut profile = IndexMap::new();
        for cell in address.cells() {
            profile.insert(cell, AddrProfile::default());
        }
        Ok(RramEngine {
            chip: chip.into(),
            device: device.into(),
            polarity,
            settings,
            geometry,
            layout,
            address,
            bus,
            sink,
            interrupt: InterruptFlag::new(),
            profile,
        })
    }

    /// Re-address a different line subset, e.g. when stepping across a chip.
    pub fn set_address(&mut self, address: Address) -> Result<(), KilnError> {
        validate_address(&address, &self.geometry)?;
        for cell in address.cells() {
            self.profile.entry(cell).or_default();
        }
        self.address = address;
        Ok(())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn polarity(&self) -> PulsePolarity {
        self.polarity
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn geometry(&self) -> &ArrayGeometry {
        &self.geometry
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Clone of the cooperative interrupt flag; hand it to a signal handler
    /// to stop long sweeps between measurement units.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn profile(&self, wl: WordLine, bl: BitLine) -> Option<&AddrProfile> {
        self.profile.get(&(wl, bl))
    }

    /// Summed counters over the addressed cells.
    pub fn profile_totals(&self) -> AddrProfile {
        let mut total = AddrProfile::default();
        for cell in self.address.cells() {
            if let Some(p) = self.profile.get(&cell) {
                total.forms += p.forms;
                total.reads += p.reads;
                total.sets += p.sets;
                total.resets += p.resets;
            }
        }
        total
    }

    // ── Read ────────────────────────────────────────────────────────────────

    fn read_levels(&self) -> ReadLevels {
        let rs = self.settings.read.get(self.polarity);
        ReadLevels {
            vbl: rs.vbl,
            vsl: rs.vsl,
            vwl: rs.vwl,
            vbody: rs.vbody,
            settling_time: rs.settling_time,
            relaxation_cycles: rs.relaxation_cycles,
            shunt_res: rs.shunt_res,
        }
    }

    fn read_frame(&mut self) -> Result<ReadFrame, KilnError> {
        let levels = self.read_levels();
        let frame = self.bus.read(&levels, &self.address)?;
        for cell in self.address.cells() {
            if let Some(p) = self.profile.get_mut(&cell) {
                p.reads += 1;
            }
        }
        Ok(frame)
    }

    /// Read the addressed cell set, optionally appending one READ row per
    /// cell to the record sink.
    pub fn read(&mut self, record: bool) -> Result<ReadFrame, KilnError> {
        let levels = self.read_levels();
        let frame = self.read_frame()?;
        if record {
            for (&(wl, bl), meas) in frame.iter() {
                let row = self.cell_record(
                    OpKind::Read,
                    wl,
                    bl,
                    meas.resistance,
                    meas.conductance,
                    meas.current,
                    meas.voltage,
                    levels.vwl,
                    levels.vsl,
                    levels.vbl,
                    0.0,
                    true,
                );
                info!("{}", row.csv_row());
                self.sink.append(&row);
            }
        }
        Ok(frame)
    }

    // ── Pulse ───────────────────────────────────────────────────────────────

    /// Assemble the full pulse operation for the masked cells at the given
    /// levels: encoded waveform, sequencer register and per-line voltages.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_pulse_setup(
        &self,
        mask: &ArrayMask,
        op: ProgramOp,
        cfg: &OpSettings,
        select: Selection,
        vwl: f64,
        vbl: f64,
        vsl: f64,
        pulse_len: u32,
        pattern: BurstPattern,
    ) -> Result<PulseSetup, KilnError> {
        let timing = PulseTiming {
            pulse_len,
            prepulse_len: cfg.prepulse_len,
            postpulse_len: cfg.postpulse_len,
            max_len: self.settings.max_pulse_frames,
        };
        let wf = waveform::encode(&mask.pulse_masks(), &timing, &self.layout, self.polarity)?;

        // PMOS SET drives the gate between VSL (inactive) and VWL (active
        // low); everything else swings the gate from ground to VWL.
        let (vwl_hi, vwl_lo) = match (self.polarity, op.is_set_direction()) {
            (PulsePolarity::Pmos, true) => (vsl, vwl),
            _ => (vwl, 0.0),
        };

        let mut bl_levels = Vec::with_capacity(self.address.bitlines.len());
        for &bl in &self.address.bitlines {
            let level = match select {
                Selection::All => vbl,
                Selection::Single(sel) if bl == sel => vbl,
                Selection::Single(_) => vsl + (vbl - vsl) / cfg.bias_divisor,
            };
            bl_levels.push((bl, level));
        }

        Ok(PulseSetup {
            waveform: wf,
            pulse_width: timing.register(),
            pattern,
            levels: PulseLevels { vwl_hi, vwl_lo, vsl, bitlines: bl_levels },
        })
    }

    fn bump_profile(&mut self, mask: &ArrayMask, op: ProgramOp, n: u64) {
        for cell in mask.active_cells() {
            if let Some(p) = self.profile.get_mut(&cell) {
                match op {
                    ProgramOp::Form => p.forms += n,
                    ProgramOp::Set => p.sets += n,
                    ProgramOp::Reset => p.resets += n,
                }
            }
        }
    }

    /// Encode and burst one pulse waveform for every still-masked cell.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn pulse_masked(
        &mut self,
        mask: &ArrayMask,
        op: ProgramOp,
        cfg: &OpSettings,
        select: Selection,
        vwl: f64,
        vbl: f64,
        vsl: f64,
        pulse_len: u32,
    ) -> Result<(), KilnError> {
        let setup = self.build_pulse_setup(
            mask,
            op,
            cfg,
            select,
            vwl,
            vbl,
            vsl,
            pulse_len,
            BurstPattern::WordlinePulse,
        )?;
        self.bus.pulse(&setup)?;
        self.bump_profile(mask, op, 1);
        Ok(())
    }

    /// Burst `n` unverified RESET/SET pulse pairs over the whole addressed
    /// cell set, using each operation's first configured voltage point.
    /// Endurance cycling uses this for the stretches between checkpoints.
    pub(crate) fn fast_cycles(&mut self, n: u64) -> Result<(), KilnError> {
        if n == 0 {
            return Ok(());
        }
        let mask = ArrayMask::new(&self.address, &self.geometry)?;
        let reset_cfg = self.settings.reset.get(self.polarity).clone();
        let set_cfg = self.settings.set.get(self.polarity).clone();
        let reset = self.build_pulse_setup(
            &mask,
            ProgramOp::Reset,
            &reset_cfg,
            Selection::All,
            reset_cfg.vwl.fixed(),
            reset_cfg.vbl.fixed(),
            reset_cfg.vsl.fixed(),
            (reset_cfg.pulse_width.fixed() as u32).max(1),
            BurstPattern::EnduranceResetFirst,
        )?;
        let set = self.build_pulse_setup(
            &mask,
            ProgramOp::Set,
            &set_cfg,
            Selection::All,
            set_cfg.vwl.fixed(),
            set_cfg.vbl.fixed(),
            set_cfg.vsl.fixed(),
            (set_cfg.pulse_width.fixed() as u32).max(1),
            BurstPattern::EnduranceSetFirst,
        )?;
        self.bus.cycle(&reset, &set, n)?;
        self.bump_profile(&mask, ProgramOp::Reset, n);
        self.bump_profile(&mask, ProgramOp::Set, n);
        Ok(())
    }

    // ── Convergence search ──────────────────────────────────────────────────

    /// SET convergence: pulse-verify until every masked cell's resistance
    /// drops to the target or the sweep is exhausted.
    pub fn dynamic_set(&mut self, opts: &ConvergeOptions) -> Result<ConvergeOutcome, KilnError> {
        self.converge(ProgramOp::Set, opts)
    }

    /// RESET convergence: like [`Self::dynamic_set`] with the comparator and
    /// swept line voltage reversed.
    pub fn dynamic_reset(&mut self, opts: &ConvergeOptions) -> Result<ConvergeOutcome, KilnError> {
        self.converge(ProgramOp::Reset, opts)
    }

    /// FORM a fresh cell: a SET search with the FORM settings block.
    pub fn dynamic_form(&mut self, opts: &ConvergeOptions) -> Result<ConvergeOutcome, KilnError> {
        self.converge(ProgramOp::Form, opts)
    }

    fn converge(
        &mut self,
        op: ProgramOp,
        opts: &ConvergeOptions,
    ) -> Result<ConvergeOutcome, KilnError> {
        let cfg = match op {
            ProgramOp::Form => self.settings.form.get(self.polarity).clone(),
            ProgramOp::Set => self.settings.set.get(self.polarity).clone(),
            ProgramOp::Reset => self.settings.reset.get(self.polarity).clone(),
        };
        let target = opts.target_res.unwrap_or(match op {
            ProgramOp::Form => self.settings.targets.form,
            ProgramOp::Set => self.settings.targets.set,
            ProgramOp::Reset => self.settings.targets.reset,
        });
        let cmp = op.comparator();

        let mask_address = match opts.select {
            Selection::All => self.address.clone(),
            Selection::Single(bl) => Address {
                wordlines: self.address.wordlines.clone(),
                bitlines: vec![bl],
                sourcelines: self.address.sourcelines.clone(),
            },
        };
        let mut mask = match opts.select {
            Selection::All => ArrayMask::new(&mask_address, &self.geometry)?,
            Selection::Single(_) => ArrayMask::new_1tnr(&mask_address, &self.geometry)?,
        };

        let pws = cfg.pulse_width.log10_points();
        let vwls = cfg.vwl.linear_points();
        let (line_points, fixed) = if op.is_set_direction() {
            (cfg.vbl.linear_points(), cfg.vsl.fixed())
        } else {
            (cfg.vsl.linear_points(), cfg.vbl.fixed())
        };

        debug!(
            "{op_kind} search: target {target} ohm, {} pw x {} vwl x {} vline points",
            pws.len(),
            vwls.len(),
            line_points.len(),
            op_kind = op.kind(),
        );

        let mut rows: Vec<CellRecord> = Vec::new();
        let mut success = mask.is_done();
        let mut last: Option<(ReadFrame, f64, f64, f64, f64)> = None;

        'sweep: for &pw in &pws {
            for &vwl in &vwls {
                for &v in &line_points {
                    if self.interrupt.is_set() {
                        warn!("{} search interrupted between measurement units", op.kind());
                        break 'sweep;
                    }
                    let (vbl, vsl) = if op.is_set_direction() { (v, fixed) } else { (fixed, v) };
                    let pulse_len = (pw as u32).max(1);
                    self.pulse_masked(&mask, op, &cfg, opts.select, vwl, vbl, vsl, pulse_len)?;
                    let frame = self.read_frame()?;

                    let (next, cleared) = mask.apply_read(&frame, cmp, target);
                    mask = next;
                    for (wl, bl) in cleared {
                        let meas = frame.get(wl, bl).copied().unwrap_or_default();
                        let row = self.cell_record(
                            op.kind(),
                            wl,
                            bl,
                            meas.resistance,
                            meas.conductance,
                            meas.current,
                            meas.voltage,
                            vwl,
                            vsl,
                            vbl,
                            pw,
                            true,
                        );
                        info!("{}", row.csv_row());
                        if opts.record {
                            self.sink.append(&row);
                        }
                        rows.push(row);
                    }
                    last = Some((frame, pw, vwl, vbl, vsl));

                    let done = match opts.select {
                        Selection::All => mask.is_done(),
                        Selection::Single(bl) => mask.is_done_for_bitline(bl),
                    };
                    if done {
                        success = true;
                        break 'sweep;
                    }
                }
            }
        }

        // Cells that never converged keep their last measured values; the
        // diagnostic goes out immediately so unattended sweeps leave a
        // forensic trail even when later cells also fail.
        if let Some((frame, pw, vwl, vbl, vsl)) = last {
            for (wl, bl) in mask.active_cells() {
                let meas = frame.get(wl, bl).copied().unwrap_or_default();
                let row = self.cell_record(
                    op.kind(),
                    wl,
                    bl,
                    meas.resistance,
                    meas.conductance,
                    meas.current,
                    meas.voltage,
                    vwl,
                    vsl,
                    vbl,
                    pw,
                    false,
                );
                warn!(
                    "{} failed to converge at {} {}: target {} ohm, reached {} ohm",
                    op.kind(),
                    wl,
                    bl,
                    target,
                    meas.resistance
                );
                if opts.record {
                    self.sink.append(&row);
                }
                rows.push(row);
            }
        }

        Ok(ConvergeOutcome { success, cells: rows })
    }

    pub(crate) fn summary(&mut self, line: &crate::record::TargetSummary) {
        info!("target summary: {}", line.csv_row());
        self.sink.summary(line);
    }

    #[allow(clippy::too_many_arguments)]
    fn cell_record(
        &self,
        op: OpKind,
        wl: WordLine,
        bl: BitLine,
        resistance: f64,
        conductance: f64,
        current: f64,
        voltage: f64,
        vwl: f64,
        vsl: f64,
        vbl: f64,
        pulse_width: f64,
        success: bool,
    ) -> CellRecord {
        CellRecord {
            chip: self.chip.clone(),
            device: self.device.clone(),
            op,
            wl,
            bl,
            resistance,
            conductance,
            current,
            voltage,
            vwl,
            vsl,
            vbl,
            pulse_width,
            success,
        }
    }

    pub(crate) fn chip(&self) -> &str {
        &self.chip
    }

    pub(crate) fn device(&self) -> &str {
        &self.device
    }
}

fn validate_address(address: &Address, geometry: &ArrayGeometry) -> Result<(), KilnError> {
    for wl in &address.wordlines {
        if geometry.wl_index(*wl).is_none() {
            return Err(KilnError::Config(format!("{wl} is outside the array geometry")));
        }
    }
    for bl in &address.bitlines {
        if geometry.bl_index(*bl).is_none() {
            return Err(KilnError::Config(format!("{bl} is outside the array geometry")));
        }
    }
    for sl in &address.sourcelines {
        if !geometry.sourcelines.contains(sl) {
            return Err(KilnError::Config(format!("{sl} is outside the array geometry")));
        }
    }
    Ok(())
}
