// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Collaborator interfaces to the instrument hardware.
//!
//! The programming engine never talks to hardware directly. It consumes two
//! primitives — "pulse a waveform" and "read the addressed cell set" —
//! through the [`RramBus`] trait, and implementations build those on a typed
//! [`ChannelRegistry`] of per-line analog capabilities. Swapping the bus for
//! [`crate::sim::SimArray`] runs every convergence algorithm against a
//! simulated array with no instrument attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::mask::{Address, BitLine, BodyLine, SourceLine, WordLine};

/// Fault raised by the read/pulse collaborators.
///
/// Faults are not retried by the engine; they bubble to the caller
/// unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareFault {
    /// The instrument did not complete an operation in time.
    Timeout(String),
    /// A measured or requested value fell outside the instrument's range.
    OutOfRange(String),
    /// A channel was addressed that the session does not expose.
    UnknownChannel(String),
    /// Any other session/bus failure.
    Bus(String),
}

impl std::fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareFault::Timeout(msg) => write!(f, "hardware timeout: {msg}"),
            HardwareFault::OutOfRange(msg) => write!(f, "value out of range: {msg}"),
            HardwareFault::UnknownChannel(msg) => write!(f, "unknown channel: {msg}"),
            HardwareFault::Bus(msg) => write!(f, "bus fault: {msg}"),
        }
    }
}

impl std::error::Error for HardwareFault {}

/// Identifier of one electrical line, the key of the channel registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineId {
    WordLine(WordLine),
    BitLine(BitLine),
    SourceLine(SourceLine),
    Body(BodyLine),
}

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineId::WordLine(wl) => wl.fmt(f),
            LineId::BitLine(bl) => bl.fmt(f),
            LineId::SourceLine(sl) => sl.fmt(f),
            LineId::Body(b) => b.fmt(f),
        }
    }
}

/// Analog capability set of one instrument channel.
pub trait AnalogChannel {
    fn set_voltage(&mut self, volts: f64) -> Result<(), HardwareFault>;
    fn measure_voltage(&mut self) -> Result<f64, HardwareFault>;
    fn measure_current(&mut self) -> Result<f64, HardwareFault>;
}

/// Typed per-line channel registry, insertion-ordered to match pin order.
#[derive(Debug, Default)]
pub struct ChannelRegistry<C> {
    channels: IndexMap<LineId, C>,
}

impl<C: AnalogChannel> ChannelRegistry<C> {
    pub fn new() -> Self {
        ChannelRegistry { channels: IndexMap::new() }
    }

    pub fn insert(&mut self, line: LineId, channel: C) {
        self.channels.insert(line, channel);
    }

    pub fn get_mut(&mut self, line: LineId) -> Result<&mut C, HardwareFault> {
        self.channels
            .get_mut(&line)
            .ok_or_else(|| HardwareFault::UnknownChannel(line.to_string()))
    }

    pub fn get(&self, line: LineId) -> Option<&C> {
        self.channels.get(&line)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&LineId, &mut C)> {
        self.channels.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One cell's measured electrical state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    pub resistance: f64,
    pub conductance: f64,
    pub current: f64,
    pub voltage: f64,
}

impl Measurement {
    /// Measurement consistent with a given resistance under a read bias,
    /// assuming a zero shunt. Handy for fixtures and the simulated array.
    pub fn from_resistance(resistance: f64, v_read: f64) -> Self {
        Measurement {
            resistance,
            conductance: 1.0 / resistance,
            current: v_read / resistance,
            voltage: v_read,
        }
    }
}

/// Per-cell measurements from one read of the addressed cell set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadFrame {
    cells: IndexMap<(WordLine, BitLine), Measurement>,
}

impl ReadFrame {
    pub fn new() -> Self {
        ReadFrame { cells: IndexMap::new() }
    }

    pub fn insert(&mut self, wl: WordLine, bl: BitLine, meas: Measurement) {
        self.cells.insert((wl, bl), meas);
    }

    pub fn get(&self, wl: WordLine, bl: BitLine) -> Option<&Measurement> {
        self.cells.get(&(wl, bl))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(WordLine, BitLine), &Measurement)> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Largest measured resistance in the frame.
    pub fn max_resistance(&self) -> Option<f64> {
        self.cells.values().map(|m| m.resistance).fold(None, |acc, r| {
            Some(match acc {
                Some(a) if a >= r => a,
                _ => r,
            })
        })
    }

    /// Smallest measured resistance in the frame.
    pub fn min_resistance(&self) -> Option<f64> {
        self.cells.values().map(|m| m.resistance).fold(None, |acc, r| {
            Some(match acc {
                Some(a) if a <= r => a,
                _ => r,
            })
        })
    }
}

/// Burst pattern selector handed to the pulse primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstPattern {
    /// The standard decoded wordline pulse train.
    WordlinePulse,
    /// Hardware-looped endurance cycling, RESET phase first.
    EnduranceResetFirst,
    /// Hardware-looped endurance cycling, SET phase first.
    EnduranceSetFirst,
}

/// Voltage levels programmed before a pulse burst.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseLevels {
    /// Active wordline drive level.
    pub vwl_hi: f64,
    /// Inactive wordline level (nonzero for PMOS SET drive).
    pub vwl_lo: f64,
    /// Sourceline level.
    pub vsl: f64,
    /// Per-bitline levels; unselected bitlines in 1TNR mode carry the
    /// configured partial bias rather than the full programming voltage.
    pub bitlines: Vec<(BitLine, f64)>,
}

/// A fully prepared pulse operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseSetup {
    /// Encoded frame sequence, already padded to the instrument frame depth.
    pub waveform: Vec<u64>,
    /// Value for the pulse-width sequencer register.
    pub pulse_width: u32,
    pub pattern: BurstPattern,
    pub levels: PulseLevels,
}

/// Voltage and settling parameters for one read of the addressed cell set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadLevels {
    pub vbl: f64,
    pub vsl: f64,
    pub vwl: f64,
    pub vbody: f64,
    /// Supply settling time in seconds before measuring.
    pub settling_time: f64,
    /// All-off relaxation cycles issued before the read.
    pub relaxation_cycles: u32,
    /// Series shunt resistance subtracted from the raw V/I quotient.
    pub shunt_res: f64,
}

impl ReadLevels {
    /// Resistance from a measured current per the collaborator contract:
    /// `|V_applied / I_measured − shunt|`.
    pub fn resistance_from_current(&self, current: f64) -> f64 {
        ((self.vbl - self.vsl) / current - self.shunt_res).abs()
    }
}

/// The two hardware primitives the programming engine consumes.
pub trait RramBus {
    /// Program levels and burst one encoded pulse waveform.
    fn pulse(&mut self, setup: &PulseSetup) -> Result<(), HardwareFault>;

    /// Read every addressed cell, returning per-cell measurements.
    fn read(&mut self, levels: &ReadLevels, address: &Address) -> Result<ReadFrame, HardwareFault>;

    /// Burst `n` alternating pulse pairs without verification, used for the
    /// unmeasured stretches of endurance cycling.
    ///
    /// The default implementation loops in software; instrument sessions
    /// with a hardware loop sequencer override it and dispatch on the
    /// setups' [`BurstPattern`].
    fn cycle(
        &mut self,
        first: &PulseSetup,
        second: &PulseSetup,
        n: u64,
    ) -> Result<(), HardwareFault> {
        for _ in 0..n {
            self.pulse(first)?;
            self.pulse(second)?;
        }
        Ok(())
    }
}

/// Process-wide cooperative interrupt flag.
///
/// An operator signal handler may set it at any time; the engine checks it
/// only at the boundary between complete pulse-read units, so an interrupt
/// mid-sweep lets the current operation finish before the run exits.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
