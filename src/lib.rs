// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kiln — adaptive RRAM array programming engine.
//!
//! Kiln drives resistive memory arrays through pulse-verify programming:
//! encoded pulse waveforms go out over an instrument bus, per-cell
//! resistances come back, and adaptive sweeps walk voltage and pulse-width
//! axes until every addressed cell meets its target.
//!
//! # Pipeline
//!
//! ```text
//! Settings (JSON recipe)
//!   → Address          (mask — the wordline/bitline/sourceline subset)
//!   → ArrayMask        (mask — per-cell still-needs-programming grid)
//!   → PulseMask rows   (mask — per-wordline line selections)
//!   → packed frames     (waveform — polarity-resolved u64 frame sequence)
//!   → RramBus           (bus — pulse and read primitives, hardware or sim)
//!   → ReadFrame         (bus — per-cell measurements folded back into the mask)
//! ```
//!
//! # Key modules
//!
//! - [`sweep`] — sweep-axis descriptors and convergence comparators
//! - [`mask`] — array geometry, cell addressing, and the selection mask
//! - [`waveform`] — packed pulse-frame encoding with NMOS/PMOS polarity
//! - [`bus`] — instrument seam: [`bus::RramBus`], channel registry, read frames
//! - [`config`] — JSON programming recipes ([`config::Settings`])
//! - [`record`] — per-cell operation rows and CSV/memory record sinks
//! - [`engine`] — the pulse-verify convergence engine ([`engine::RramEngine`])
//! - [`target`] — ping-pong window targeting into a closed resistance band
//! - [`mlc`] — two-pass coarse/fine multi-level programming
//! - [`endurance`] — log-spaced checkpoint cycling with failure policies
//! - [`sim`] — deterministic simulated array behind the bus seam

pub mod sweep;

pub mod mask;

pub mod waveform;

pub mod bus;

pub mod config;

pub mod record;

pub mod engine;

pub mod target;

pub mod mlc;

pub mod endurance;

pub mod sim;

use crate::bus::HardwareFault;

/// Top-level error of every fallible engine operation.
///
/// Convergence failure is deliberately not here: a cell that refuses to
/// reach target is an experimental result, reported as data, while these
/// variants mean the operation itself could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KilnError {
    /// Invalid settings, geometry, or addressing.
    Config(String),
    /// An encoded waveform exceeds the instrument's frame depth.
    WaveformOverflow { frames: usize, limit: usize },
    /// The instrument bus failed.
    Hardware(HardwareFault),
}

impl std::fmt::Display for KilnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KilnError::Config(msg) => write!(f, "configuration error: {msg}"),
            KilnError::WaveformOverflow { frames, limit } => {
                write!(f, "waveform of {frames} frames exceeds the instrument depth of {limit}")
            }
            KilnError::Hardware(fault) => write!(f, "hardware fault: {fault}"),
        }
    }
}

impl std::error::Error for KilnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KilnError::Hardware(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<HardwareFault> for KilnError {
    fn from(fault: HardwareFault) -> Self {
        KilnError::Hardware(fault)
    }
}
