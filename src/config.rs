// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Programming-recipe settings, loaded from JSON.
//!
//! A settings document carries the array geometry plus one block per
//! operation (READ/FORM/SET/RESET) and polarity. Sweep axes use the
//! [`SweepParameter`] forms, so a recipe can tighten a single voltage into a
//! full range without code changes. Settings are read-only during one search
//! call; callers may mutate them between calls (e.g. chip-wide parameter
//! sweeps), which is the caller's responsibility, not the engine's.

use serde::Deserialize;

use crate::mask::ArrayGeometry;
use crate::sweep::SweepParameter;
use crate::waveform::PulsePolarity;
use crate::KilnError;

/// Array line counts. Line identifiers are numbered from zero.
#[derive(Debug, Clone, Deserialize)]
pub struct GeometrySettings {
    pub wordlines: u16,
    pub bitlines: u16,
    pub sourcelines: u16,
}

impl GeometrySettings {
    pub fn to_geometry(&self) -> ArrayGeometry {
        ArrayGeometry::with_counts(self.wordlines, self.bitlines, self.sourcelines)
    }
}

/// A per-polarity pair of settings blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct PerPolarity<T> {
    pub nmos: T,
    pub pmos: T,
}

impl<T> PerPolarity<T> {
    pub fn get(&self, polarity: PulsePolarity) -> &T {
        match polarity {
            PulsePolarity::Nmos => &self.nmos,
            PulsePolarity::Pmos => &self.pmos,
        }
    }

    /// Same block for both polarities.
    pub fn uniform(value: T) -> Self
    where
        T: Clone,
    {
        PerPolarity { nmos: value.clone(), pmos: value }
    }
}

/// READ operation levels and timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadSettings {
    pub vbl: f64,
    pub vsl: f64,
    pub vwl: f64,
    #[serde(default)]
    pub vbody: f64,
    /// Supply settling time in seconds before measuring.
    #[serde(default)]
    pub settling_time: f64,
    /// All-off relaxation cycles before the read.
    #[serde(default = "default_relaxation_cycles")]
    pub relaxation_cycles: u32,
    /// Series shunt resistance of the measurement path.
    #[serde(default)]
    pub shunt_res: f64,
}

fn default_relaxation_cycles() -> u32 {
    10
}

/// One programming operation's sweep axes and pulse shape.
#[derive(Debug, Clone, Deserialize)]
pub struct OpSettings {
    /// Gate voltage axis, linear-spaced.
    pub vwl: SweepParameter,
    /// Bitline voltage axis (swept for SET/FORM, fixed for RESET).
    pub vbl: SweepParameter,
    /// Sourceline voltage axis (swept for RESET, fixed for SET/FORM).
    pub vsl: SweepParameter,
    /// Pulse width axis in instrument time-steps, log10-spaced.
    pub pulse_width: SweepParameter,
    #[serde(default = "default_edge_len")]
    pub prepulse_len: u32,
    #[serde(default = "default_edge_len")]
    pub postpulse_len: u32,
    /// Divisor of the unselected-bitline bias in 1TNR mode: unselected
    /// bitlines sit at `VSL + (VBL − VSL) / bias_divisor`. Deliberately a
    /// recipe parameter; characterization teams disagree on the canonical
    /// value.
    #[serde(default = "default_bias_divisor")]
    pub bias_divisor: f64,
}

fn default_edge_len() -> u32 {
    2
}

fn default_bias_divisor() -> f64 {
    4.0
}

/// Default convergence targets per operation, in ohms.
#[derive(Debug, Clone, Deserialize)]
pub struct Targets {
    pub form: f64,
    pub set: f64,
    pub reset: f64,
}

/// Two-pass multi-level ("RADAR-style") programming settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MlcSettings {
    /// Coarse gate-voltage axis.
    pub vwl: SweepParameter,
    /// Coarse bitline-voltage axis.
    pub vbl: SweepParameter,
    /// Absolute resistance floor; dropping below it is an unrecoverable
    /// overshoot that restarts the whole attempt.
    pub res_low: f64,
    /// Coarse-pass convergence bound.
    pub res_high_coarse: f64,
    /// Fine-pass convergence bound; success requires the final resistance in
    /// `[res_low, res_high_fine]`.
    pub res_high_fine: f64,
    /// Full width of the fine VWL window centered on the coarse solution.
    pub fine_vwl_span: f64,
    /// Full width of the fine VBL window centered on the coarse solution.
    pub fine_vbl_span: f64,
    /// Points per fine axis.
    pub fine_steps: usize,
    /// Hard VWL ceiling the fine window is clamped to.
    pub vwl_max: f64,
    /// Hard VBL ceiling the fine window is clamped to.
    pub vbl_max: f64,
    /// Coarse+fine restart budget.
    pub max_attempts: usize,
    /// Pulse width used by both passes, in instrument time-steps.
    #[serde(default = "default_mlc_pulse_len")]
    pub pulse_len: u32,
}

fn default_mlc_pulse_len() -> u32 {
    10
}

/// Complete programming-recipe settings for one chip.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub geometry: GeometrySettings,
    pub read: PerPolarity<ReadSettings>,
    pub form: PerPolarity<OpSettings>,
    pub set: PerPolarity<OpSettings>,
    pub reset: PerPolarity<OpSettings>,
    pub targets: Targets,
    pub mlc: MlcSettings,
    /// Instrument frame depth per wordline; encoded waveforms are padded to
    /// `max_pulse_frames * wordlines` frames.
    #[serde(default = "default_max_pulse_frames")]
    pub max_pulse_frames: u32,
}

fn default_max_pulse_frames() -> u32 {
    1200
}

impl Settings {
    /// Parse a settings document from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, KilnError> {
        serde_json::from_str(json).map_err(|e| KilnError::Config(format!("settings: {e}")))
    }

    /// A self-contained demo recipe for a 2×2 array.
    ///
    /// Used by the CLI when no settings file is given and by tests; the
    /// voltage values are representative, not calibrated.
    pub fn demo() -> Self {
        let set = OpSettings {
            vwl: SweepParameter::Range { start: 1.0, stop: 2.0, step: 0.5 },
            vbl: SweepParameter::Range { start: 1.5, stop: 2.5, step: 0.5 },
            vsl: SweepParameter::Single(0.0),
            pulse_width: SweepParameter::Steps { start: 10.0, stop: 1000.0, steps: 3 },
            prepulse_len: 2,
            postpulse_len: 2,
            bias_divisor: 4.0,
        };
        let reset = OpSettings {
            vwl: SweepParameter::Range { start: 1.5, stop: 2.5, step: 0.5 },
            vbl: SweepParameter::Single(0.0),
            vsl: SweepParameter::Range { start: 1.5, stop: 2.5, step: 0.5 },
            pulse_width: SweepParameter::Steps { start: 10.0, stop: 1000.0, steps: 3 },
            prepulse_len: 2,
            postpulse_len: 2,
            bias_divisor: 4.0,
        };
        let form = OpSettings {
            vwl: SweepParameter::Range { start: 2.0, stop: 3.0, step: 0.5 },
            vbl: SweepParameter::Range { start: 2.5, stop: 3.3, step: 0.4 },
            vsl: SweepParameter::Single(0.0),
            pulse_width: SweepParameter::Steps { start: 100.0, stop: 10_000.0, steps: 3 },
            prepulse_len: 2,
            postpulse_len: 2,
            bias_divisor: 4.0,
        };
        let read = ReadSettings {
            vbl: 0.2,
            vsl: 0.0,
            vwl: 1.8,
            vbody: 0.0,
            settling_time: 0.0,
            relaxation_cycles: 10,
            shunt_res: 0.0,
        };
        Settings {
            geometry: GeometrySettings { wordlines: 2, bitlines: 2, sourcelines: 2 },
            read: PerPolarity::uniform(read),
            form: PerPolarity::uniform(form),
            set: PerPolarity::uniform(set),
            reset: PerPolarity::uniform(reset),
            targets: Targets { form: 10_000.0, set: 10_000.0, reset: 100_000.0 },
            mlc: MlcSettings {
                vwl: SweepParameter::Range { start: 1.0, stop: 2.0, step: 0.25 },
                vbl: SweepParameter::Range { start: 1.5, stop: 2.5, step: 0.25 },
                res_low: 8_000.0,
                res_high_coarse: 20_000.0,
                res_high_fine: 12_000.0,
                fine_vwl_span: 0.2,
                fine_vbl_span: 0.2,
                fine_steps: 3,
                vwl_max: 2.5,
                vbl_max: 3.0,
                max_attempts: 5,
                pulse_len: 10,
            },
            max_pulse_frames: 1200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_settings_expand() {
        let s = Settings::demo();
        assert_eq!(s.set.nmos.vwl.linear_points().len(), 3);
        assert_eq!(s.set.nmos.pulse_width.log10_points().len(), 3);
        assert_eq!(s.reset.pmos.vsl.linear_points().len(), 3);
        assert_eq!(s.max_pulse_frames, 1200);
    }

    #[test]
    fn parse_settings_json() {
        let json = r#"{
            "geometry": {"wordlines": 4, "bitlines": 4, "sourcelines": 4},
            "read": {
                "nmos": {"vbl": 0.2, "vsl": 0.0, "vwl": 1.8, "shunt_res": 8200.0},
                "pmos": {"vbl": 0.0, "vsl": 0.2, "vwl": -1.0, "shunt_res": 8200.0}
            },
            "form": {
                "nmos": {"vwl": {"start": 2.0, "stop": 3.0, "step": 0.5},
                         "vbl": 3.0, "vsl": 0.0,
                         "pulse_width": {"start": 100, "stop": 10000, "steps": 3}},
                "pmos": {"vwl": {"start": -3.0, "stop": -2.0, "step": 0.5},
                         "vbl": 3.0, "vsl": 0.0,
                         "pulse_width": {"start": 100, "stop": 10000, "steps": 3}}
            },
            "set": {
                "nmos": {"vwl": [1.2, 1.6, 2.0], "vbl": {"start": 1.5, "stop": 2.5, "step": 0.5},
                         "vsl": 0.0, "pulse_width": {"start": 10, "stop": 1000, "step": 10},
                         "bias_divisor": 2.0},
                "pmos": {"vwl": [-2.0], "vbl": 2.0, "vsl": 0.0,
                         "pulse_width": {"start": 10, "stop": 1000, "steps": 3}}
            },
            "reset": {
                "nmos": {"vwl": {"start": 1.5, "stop": 2.5, "step": 0.5}, "vbl": 0.0,
                         "vsl": {"start": 1.5, "stop": 2.5, "step": 0.5},
                         "pulse_width": {"start": 10, "stop": 1000, "steps": 3}},
                "pmos": {"vwl": [2.0], "vbl": 0.0, "vsl": 2.2,
                         "pulse_width": {"start": 10, "stop": 1000, "steps": 3}}
            },
            "targets": {"form": 10000, "set": 10000, "reset": 100000},
            "mlc": {
                "vwl": {"start": 1.0, "stop": 2.0, "step": 0.25},
                "vbl": {"start": 1.5, "stop": 2.5, "step": 0.25},
                "res_low": 8000, "res_high_coarse": 20000, "res_high_fine": 12000,
                "fine_vwl_span": 0.2, "fine_vbl_span": 0.2, "fine_steps": 3,
                "vwl_max": 2.5, "vbl_max": 3.0, "max_attempts": 5
            }
        }"#;
        let s = Settings::from_json_str(json).unwrap();
        assert_eq!(s.geometry.wordlines, 4);
        assert_eq!(s.set.nmos.bias_divisor, 2.0);
        // defaults fill in unspecified fields
        assert_eq!(s.set.pmos.bias_divisor, 4.0);
        assert_eq!(s.set.nmos.prepulse_len, 2);
        assert_eq!(s.read.nmos.relaxation_cycles, 10);
        assert_eq!(s.mlc.pulse_len, 10);
        // sweep forms survive the round trip
        assert_eq!(s.set.nmos.vwl.linear_points(), vec![1.2, 1.6, 2.0]);
        assert_eq!(s.set.nmos.pulse_width.log10_points().len(), 3);
    }

    #[test]
    fn bad_settings_fail_fast() {
        let err = Settings::from_json_str("{}").unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }
}
