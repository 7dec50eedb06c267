// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Two-pass multi-level-cell programming.
//!
//! Intermediate resistance states sit in narrow bands that a plain SET search
//! blows straight through. The two-pass scheme first walks a coarse
//! voltage grid until the cell drops under a loose bound, then re-sweeps a
//! small grid centered on that coarse solution against the tight bound.
//! Dropping below the band's absolute floor at any point is an unrecoverable
//! overshoot: the cell is RESET back above the coarse bound and the whole
//! attempt restarts, up to a configured budget.

use log::{debug, warn};

use crate::bus::RramBus;
use crate::config::OpSettings;
use crate::engine::{ConvergeOptions, ProgramOp, RramEngine, Selection};
use crate::mask::ArrayMask;
use crate::record::RecordSink;
use crate::sweep::{Comparison, SweepParameter};
use crate::KilnError;

/// Outcome of one coarse or fine grid pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassResult {
    /// Every cell dropped under the pass bound at this grid point.
    Converged { vwl: f64, vbl: f64, res_min: f64, res_max: f64 },
    /// Some cell fell below the absolute floor; the attempt must restart.
    Overshot { res_min: f64 },
    /// The grid ran out without convergence.
    Exhausted,
}

/// Options of one multi-level programming run.
#[derive(Debug, Clone)]
pub struct MlcOptions {
    /// Whether the final verification read goes to the record sink.
    pub record: bool,
}

impl Default for MlcOptions {
    fn default() -> Self {
        MlcOptions { record: true }
    }
}

/// Result of a multi-level programming run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MlcOutcome {
    /// Whether the final verification read landed in
    /// `[res_low, res_high_fine]`.
    pub success: bool,
    /// Final verified resistance (worst cell), if a verification read ran.
    pub final_res: Option<f64>,
    /// Coarse passes started.
    pub attempts: usize,
    /// Grid point the successful coarse pass converged at.
    pub coarse: Option<(f64, f64)>,
}

/// The fine axis around a coarse solution: `steps` points spanning `span`,
/// centered on `center` with the top clamped to `max`.
fn centered_axis(center: f64, span: f64, steps: usize, max: f64) -> Vec<f64> {
    let lo = center - span / 2.0;
    let hi = (center + span / 2.0).min(max).max(lo);
    SweepParameter::Steps { start: lo, stop: hi, steps }.linear_points()
}

impl<B: RramBus, S: RecordSink> RramEngine<B, S> {
    /// Program the addressed cells into the multi-level band
    /// `[res_low, res_high_fine]` with a coarse-then-fine grid search.
    pub fn program_mlc(&mut self, opts: &MlcOptions) -> Result<MlcOutcome, KilnError> {
        let mlc = self.settings().mlc.clone();
        let cfg = self.settings().set.get(self.polarity()).clone();
        let coarse_vwls = mlc.vwl.linear_points();
        let coarse_vbls = mlc.vbl.linear_points();

        let mut attempts = 0;
        let mut coarse_solution = None;

        while attempts < mlc.max_attempts {
            attempts += 1;
            let coarse = self.mlc_pass(
                &coarse_vwls,
                &coarse_vbls,
                mlc.res_high_coarse,
                mlc.res_low,
                &cfg,
                mlc.pulse_len,
            )?;
            let (vwl_c, vbl_c) = match coarse {
                PassResult::Converged { vwl, vbl, .. } => (vwl, vbl),
                PassResult::Overshot { res_min } => {
                    warn!(
                        "coarse pass overshot to {res_min} ohm (floor {}), \
                         resetting and restarting attempt {attempts}",
                        mlc.res_low
                    );
                    self.recover_above(mlc.res_high_coarse)?;
                    continue;
                }
                PassResult::Exhausted => {
                    warn!("coarse grid exhausted without reaching {} ohm", mlc.res_high_coarse);
                    break;
                }
            };
            coarse_solution = Some((vwl_c, vbl_c));
            debug!("coarse solution at VWL {vwl_c} / VBL {vbl_c}, refining");

            let fine_vwls = centered_axis(vwl_c, mlc.fine_vwl_span, mlc.fine_steps, mlc.vwl_max);
            let fine_vbls = centered_axis(vbl_c, mlc.fine_vbl_span, mlc.fine_steps, mlc.vbl_max);
            match self.mlc_pass(
                &fine_vwls,
                &fine_vbls,
                mlc.res_high_fine,
                mlc.res_low,
                &cfg,
                mlc.pulse_len,
            )? {
                PassResult::Converged { .. } => break,
                PassResult::Overshot { res_min } => {
                    warn!(
                        "fine pass overshot to {res_min} ohm, \
                         resetting and restarting attempt {attempts}"
                    );
                    self.recover_above(mlc.res_high_coarse)?;
                    continue;
                }
                PassResult::Exhausted => {
                    warn!("fine grid exhausted without reaching {} ohm", mlc.res_high_fine);
                    break;
                }
            }
        }

        // success is judged from a fresh verification read, not from pass
        // bookkeeping
        let frame = self.read(opts.record)?;
        let (min, max) = (frame.min_resistance(), frame.max_resistance());
        let success = match (min, max) {
            (Some(min), Some(max)) => min >= mlc.res_low && max <= mlc.res_high_fine,
            _ => false,
        };
        Ok(MlcOutcome { success, final_res: max, attempts, coarse: coarse_solution })
    }

    /// Walk a voltage grid, pulsing every still-masked cell at each point and
    /// clearing cells whose resistance drops under `bound`.
    fn mlc_pass(
        &mut self,
        vwls: &[f64],
        vbls: &[f64],
        bound: f64,
        res_low: f64,
        cfg: &OpSettings,
        pulse_len: u32,
    ) -> Result<PassResult, KilnError> {
        let mut mask = ArrayMask::new(self.address(), self.geometry())?;
        let vsl = cfg.vsl.fixed();
        let interrupt = self.interrupt_flag();

        for &vwl in vwls {
            for &vbl in vbls {
                if interrupt.is_set() {
                    warn!("multi-level pass interrupted between measurement units");
                    return Ok(PassResult::Exhausted);
                }
                self.pulse_masked(
                    &mask,
                    ProgramOp::Set,
                    cfg,
                    Selection::All,
                    vwl,
                    vbl,
                    vsl,
                    pulse_len,
                )?;
                let frame = self.read(false)?;
                let res_min = frame.min_resistance().unwrap_or(f64::NAN);
                let res_max = frame.max_resistance().unwrap_or(f64::NAN);
                if res_min < res_low {
                    return Ok(PassResult::Overshot { res_min });
                }
                let (next, _) = mask.apply_read(&frame, Comparison::LessOrEquals, bound);
                mask = next;
                if mask.is_done() {
                    return Ok(PassResult::Converged { vwl, vbl, res_min, res_max });
                }
            }
        }
        Ok(PassResult::Exhausted)
    }

    /// Overshoot recovery: RESET the addressed cells back above the coarse
    /// bound so the next attempt starts from a clean high-resistance state.
    fn recover_above(&mut self, res: f64) -> Result<(), KilnError> {
        let opts = ConvergeOptions { target_res: Some(res), record: false, ..Default::default() };
        self.dynamic_reset(&opts)?;
        Ok(())
    }
}
