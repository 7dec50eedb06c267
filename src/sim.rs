// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! A simulated array behind the bus seam.
//!
//! [`SimArray`] implements [`RramBus`] over the same per-line channel
//! registry a hardware session uses, with a deterministic filament model in
//! place of real cells: each pulse moves a selected cell's resistance by a
//! factor that grows with the applied bitline drive and gate voltage, bounded
//! by a physical floor and ceiling. Cells are selected by decoding the
//! encoded waveform frames, so the simulation exercises the exact packing a
//! pattern instrument would see; a cell whose wordline or bitline bit is
//! wrong in the waveform does not move, no matter what the levels say.
//!
//! The model is tuned so the demo recipe converges in a handful of pulses.
//! It is a test vehicle, not a device model.

use log::trace;

use crate::bus::{
    AnalogChannel, ChannelRegistry, HardwareFault, LineId, Measurement, PulseSetup, ReadFrame,
    ReadLevels, RramBus,
};
use crate::mask::{Address, ArrayGeometry, BitLine, WordLine};
use crate::waveform::{select_from_bits, FrameLayout, PulseFrame, PulsePolarity};

/// Resistance bounds of the filament model, in ohms.
const RES_FLOOR: f64 = 5_000.0;
const RES_CEILING: f64 = 2_000_000.0;

/// Per-volt² response rate of a pulse.
const PULSE_RATE: f64 = 0.35;

/// Fresh (unformed) cell resistance.
const RES_FRESH: f64 = 1_000_000.0;

/// One simulated instrument channel: holds the last programmed voltage and,
/// for bitline channels during a read, the cell current.
#[derive(Debug, Default)]
pub struct SimChannel {
    volts: f64,
    current: f64,
}

impl AnalogChannel for SimChannel {
    fn set_voltage(&mut self, volts: f64) -> Result<(), HardwareFault> {
        if !(-10.0..=10.0).contains(&volts) {
            return Err(HardwareFault::OutOfRange(format!("{volts} V")));
        }
        self.volts = volts;
        Ok(())
    }

    fn measure_voltage(&mut self) -> Result<f64, HardwareFault> {
        Ok(self.volts)
    }

    fn measure_current(&mut self) -> Result<f64, HardwareFault> {
        Ok(self.current)
    }
}

/// The simulated array.
pub struct SimArray {
    geometry: ArrayGeometry,
    layout: FrameLayout,
    polarity: PulsePolarity,
    channels: ChannelRegistry<SimChannel>,
    /// Row-major per-cell resistance, `wl_index * n_bl + bl_index`.
    res: Vec<f64>,
}

impl SimArray {
    /// A fresh array: every cell unformed at [`RES_FRESH`].
    pub fn fresh(
        geometry: &ArrayGeometry,
        polarity: PulsePolarity,
    ) -> Result<Self, crate::KilnError> {
        let layout = FrameLayout::new(
            geometry.wordlines.len(),
            geometry.sourcelines.len(),
            geometry.bitlines.len(),
        )?;
        let mut channels = ChannelRegistry::new();
        for &wl in &geometry.wordlines {
            channels.insert(LineId::WordLine(wl), SimChannel::default());
        }
        for &bl in &geometry.bitlines {
            channels.insert(LineId::BitLine(bl), SimChannel::default());
        }
        for &sl in &geometry.sourcelines {
            channels.insert(LineId::SourceLine(sl), SimChannel::default());
        }
        for &body in &geometry.body {
            channels.insert(LineId::Body(body), SimChannel::default());
        }
        let res = vec![RES_FRESH; geometry.wordlines.len() * geometry.bitlines.len()];
        Ok(SimArray { geometry: geometry.clone(), layout, polarity, channels, res })
    }

    pub fn resistance(&self, wl: WordLine, bl: BitLine) -> Option<f64> {
        let cell = self.cell_index(wl, bl)?;
        Some(self.res[cell])
    }

    pub fn set_resistance(&mut self, wl: WordLine, bl: BitLine, res: f64) {
        if let Some(cell) = self.cell_index(wl, bl) {
            self.res[cell] = res;
        }
    }

    pub fn channels(&self) -> &ChannelRegistry<SimChannel> {
        &self.channels
    }

    fn cell_index(&self, wl: WordLine, bl: BitLine) -> Option<usize> {
        let r = self.geometry.wl_index(wl)?;
        let c = self.geometry.bl_index(bl)?;
        Some(r * self.geometry.bitlines.len() + c)
    }

    /// Cells addressed by one decoded frame: wordline and bitline bits must
    /// both be active. The zero padding frames select nothing for either
    /// polarity because their bitline field is empty.
    fn frame_cells(&self, raw: u64) -> Vec<(usize, usize)> {
        let frame = PulseFrame::unpack(raw, &self.layout);
        let wl_active: Vec<bool> = select_from_bits(frame.wl_bits, self.layout.n_wl)
            .into_iter()
            .map(|b| match self.polarity {
                PulsePolarity::Nmos => b,
                PulsePolarity::Pmos => !b,
            })
            .collect();
        let bl_active = select_from_bits(frame.bl_bits, self.layout.n_bl);
        let mut cells = Vec::new();
        for (r, &wl_on) in wl_active.iter().enumerate() {
            if !wl_on {
                continue;
            }
            for (c, &bl_on) in bl_active.iter().enumerate() {
                if bl_on {
                    cells.push((r, c));
                }
            }
        }
        cells
    }
}

impl RramBus for SimArray {
    fn pulse(&mut self, setup: &PulseSetup) -> Result<(), HardwareFault> {
        for &(bl, volts) in &setup.levels.bitlines {
            self.channels.get_mut(LineId::BitLine(bl))?.set_voltage(volts)?;
        }

        // every cell the waveform touches moves once per burst
        let mut touched = vec![false; self.res.len()];
        for &raw in &setup.waveform {
            for (r, c) in self.frame_cells(raw) {
                touched[r * self.geometry.bitlines.len() + c] = true;
            }
        }

        let gate = (setup.levels.vwl_hi - setup.levels.vwl_lo).abs();
        for (cell, hit) in touched.iter().enumerate() {
            if !hit {
                continue;
            }
            let c = cell % self.geometry.bitlines.len();
            let bl = self.geometry.bitlines[c];
            let vbl = self
                .channels
                .get(LineId::BitLine(bl))
                .map(|ch| ch.volts)
                .unwrap_or(0.0);
            let drive = (vbl - setup.levels.vsl).abs();
            let factor = 1.0 + PULSE_RATE * drive * gate;
            let old = self.res[cell];
            self.res[cell] = if vbl > setup.levels.vsl {
                (old / factor).max(RES_FLOOR)
            } else {
                (old * factor).min(RES_CEILING)
            };
            trace!("sim cell {cell}: {old} -> {} ohm", self.res[cell]);
        }
        Ok(())
    }

    fn read(&mut self, levels: &ReadLevels, address: &Address) -> Result<ReadFrame, HardwareFault> {
        for &wl in &address.wordlines {
            self.channels.get_mut(LineId::WordLine(wl))?.set_voltage(levels.vwl)?;
        }
        for &sl in &address.sourcelines {
            self.channels.get_mut(LineId::SourceLine(sl))?.set_voltage(levels.vsl)?;
        }
        for &body in &self.geometry.body.clone() {
            self.channels.get_mut(LineId::Body(body))?.set_voltage(levels.vbody)?;
        }
        let mut frame = ReadFrame::new();
        for (wl, bl) in address.cells() {
            let cell = self
                .cell_index(wl, bl)
                .ok_or_else(|| HardwareFault::UnknownChannel(format!("{wl}/{bl}")))?;
            let res = self.res[cell];
            let channel = self.channels.get_mut(LineId::BitLine(bl))?;
            channel.set_voltage(levels.vbl)?;
            channel.current = (levels.vbl - levels.vsl) / (res + levels.shunt_res);
            let current = channel.measure_current()?;
            let recovered = levels.resistance_from_current(current);
            frame.insert(
                wl,
                bl,
                Measurement {
                    resistance: recovered,
                    conductance: 1.0 / recovered,
                    current,
                    voltage: levels.vbl - levels.vsl,
                },
            );
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BurstPattern, PulseLevels};
    use crate::config::Settings;
    use crate::engine::{ConvergeOptions, RramEngine};
    use crate::mask::{ArrayMask, SourceLine};
    use crate::record::MemorySink;
    use crate::target::TargetOptions;
    use crate::waveform::{self, PulseTiming};

    fn demo_parts() -> (Settings, ArrayGeometry) {
        let settings = Settings::demo();
        let geometry = settings.geometry.to_geometry();
        (settings, geometry)
    }

    #[test]
    fn pulse_only_moves_waveform_selected_cells() {
        let (_, geometry) = demo_parts();
        let mut sim = SimArray::fresh(&geometry, PulsePolarity::Nmos).unwrap();

        let address = Address {
            wordlines: vec![WordLine(0)],
            bitlines: vec![BitLine(0)],
            sourcelines: vec![SourceLine(0)],
        };
        let mask = ArrayMask::new_1tnr(&address, &geometry).unwrap();
        let layout = FrameLayout::new(2, 2, 2).unwrap();
        let timing = PulseTiming { pulse_len: 10, prepulse_len: 2, postpulse_len: 2, max_len: 100 };
        let wf =
            waveform::encode(&mask.pulse_masks(), &timing, &layout, PulsePolarity::Nmos).unwrap();
        let setup = PulseSetup {
            waveform: wf,
            pulse_width: timing.register(),
            pattern: BurstPattern::WordlinePulse,
            levels: PulseLevels {
                vwl_hi: 2.0,
                vwl_lo: 0.0,
                vsl: 0.0,
                // the unselected bitline carries a bias, but its waveform
                // bit is off, so its cells must not move
                bitlines: vec![(BitLine(0), 2.0), (BitLine(1), 0.5)],
            },
        };
        sim.pulse(&setup).unwrap();

        assert!(sim.resistance(WordLine(0), BitLine(0)).unwrap() < RES_FRESH);
        assert_eq!(sim.resistance(WordLine(0), BitLine(1)), Some(RES_FRESH));
        assert_eq!(sim.resistance(WordLine(1), BitLine(0)), Some(RES_FRESH));
        assert_eq!(sim.resistance(WordLine(1), BitLine(1)), Some(RES_FRESH));
    }

    #[test]
    fn read_recovers_cell_resistance_through_the_registry() {
        let (settings, geometry) = demo_parts();
        let mut sim = SimArray::fresh(&geometry, PulsePolarity::Nmos).unwrap();
        sim.set_resistance(WordLine(1), BitLine(1), 42_000.0);

        let address = Address::full(&geometry);
        let rs = settings.read.get(PulsePolarity::Nmos);
        let levels = ReadLevels {
            vbl: rs.vbl,
            vsl: rs.vsl,
            vwl: rs.vwl,
            vbody: rs.vbody,
            settling_time: rs.settling_time,
            relaxation_cycles: rs.relaxation_cycles,
            shunt_res: rs.shunt_res,
        };
        let frame = sim.read(&levels, &address).unwrap();
        let meas = frame.get(WordLine(1), BitLine(1)).unwrap();
        assert!((meas.resistance - 42_000.0).abs() < 1.0);

        // the read drove the wordline channels to the read gate voltage
        let wl_ch = sim.channels().get(LineId::WordLine(WordLine(0))).unwrap();
        assert_eq!(wl_ch.volts, 1.8);
    }

    #[test]
    fn read_outside_geometry_is_an_unknown_channel_fault() {
        let (_, geometry) = demo_parts();
        let mut sim = SimArray::fresh(&geometry, PulsePolarity::Nmos).unwrap();
        let address = Address {
            wordlines: vec![WordLine(7)],
            bitlines: vec![BitLine(0)],
            sourcelines: vec![SourceLine(0)],
        };
        let levels = ReadLevels {
            vbl: 0.2,
            vsl: 0.0,
            vwl: 1.8,
            vbody: 0.0,
            settling_time: 0.0,
            relaxation_cycles: 0,
            shunt_res: 0.0,
        };
        let err = sim.read(&levels, &address).unwrap_err();
        assert!(matches!(err, HardwareFault::UnknownChannel(_)));
    }

    #[test]
    fn engine_forms_and_cycles_a_fresh_array() {
        let (settings, geometry) = demo_parts();
        let sim = SimArray::fresh(&geometry, PulsePolarity::Nmos).unwrap();
        let address = Address::full(&geometry);
        let mut engine = RramEngine::new(
            "SIM",
            "D0",
            PulsePolarity::Nmos,
            settings,
            address,
            sim,
            MemorySink::default(),
        )
        .unwrap();

        let form = engine.dynamic_form(&ConvergeOptions::default()).unwrap();
        assert!(form.success, "fresh cells must form under the demo recipe");

        let reset = engine.dynamic_reset(&ConvergeOptions::default()).unwrap();
        assert!(reset.success);
        let set = engine.dynamic_set(&ConvergeOptions::default()).unwrap();
        assert!(set.success);

        let totals = engine.profile_totals();
        assert!(totals.forms > 0 && totals.sets > 0 && totals.resets > 0 && totals.reads > 0);
    }

    #[test]
    fn window_targeting_lands_in_band_on_the_simulated_array() {
        let (settings, geometry) = demo_parts();
        let mut sim = SimArray::fresh(&geometry, PulsePolarity::Nmos).unwrap();
        for (wl, bl) in Address::full(&geometry).cells() {
            sim.set_resistance(wl, bl, 200_000.0);
        }
        let address = Address::full(&geometry);
        let mut engine = RramEngine::new(
            "SIM",
            "D0",
            PulsePolarity::Nmos,
            settings,
            address,
            sim,
            MemorySink::default(),
        )
        .unwrap();

        let out = engine.target(20_000.0, 80_000.0, &TargetOptions::default()).unwrap();
        assert!(out.success);
        assert!(out.final_res >= 20_000.0 && out.final_res <= 80_000.0);
    }

    #[test]
    fn pmos_polarity_selects_through_inverted_wordlines() {
        let (_, geometry) = demo_parts();
        let mut sim = SimArray::fresh(&geometry, PulsePolarity::Pmos).unwrap();

        let address = Address {
            wordlines: vec![WordLine(0)],
            bitlines: vec![BitLine(0)],
            sourcelines: vec![SourceLine(0)],
        };
        let mask = ArrayMask::new_1tnr(&address, &geometry).unwrap();
        let layout = FrameLayout::new(2, 2, 2).unwrap();
        let timing = PulseTiming { pulse_len: 10, prepulse_len: 2, postpulse_len: 2, max_len: 100 };
        let wf =
            waveform::encode(&mask.pulse_masks(), &timing, &layout, PulsePolarity::Pmos).unwrap();
        let setup = PulseSetup {
            waveform: wf,
            pulse_width: timing.register(),
            pattern: BurstPattern::WordlinePulse,
            levels: PulseLevels {
                vwl_hi: 0.0,
                vwl_lo: -2.0,
                vsl: 0.0,
                bitlines: vec![(BitLine(0), 2.0), (BitLine(1), 0.0)],
            },
        };
        sim.pulse(&setup).unwrap();

        assert!(sim.resistance(WordLine(0), BitLine(0)).unwrap() < RES_FRESH);
        assert_eq!(sim.resistance(WordLine(1), BitLine(0)), Some(RES_FRESH));
    }
}
