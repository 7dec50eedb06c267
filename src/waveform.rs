// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Pulse-waveform encoding: packed line-state frames for the burst engine.
//!
//! The pattern instrument consumes a flat sequence of integers, one per
//! time-step, each packing the digital state of every array line. The layout
//! is fixed: bitline bits occupy the highest field, sourceline bits the
//! middle, wordline bits the lowest:
//!
//! ```text
//!   [ BL bits | SL bits | WL bits ]
//!     <-n_bl->  <-n_sl->  <-n_wl->
//! ```
//!
//! Each pulse-mask row expands to three frame kinds: a pre-pulse frame that
//! asserts the access lines while the wordline is still in its inactive
//! state (pre-charging the lines before the transistor turns fully on, which
//! reduces programming disturb), the main frame with all lines asserted, and
//! a post-pulse frame that returns the wordline to inactive first. The whole
//! sequence is zero-padded to the instrument's fixed frame depth.
//!
//! [`PulseFrame`] keeps the three fields named and round-trippable instead of
//! hiding them in shifted integers, so field overflow is caught at the
//! layout boundary rather than silently corrupting a neighboring field.

use serde::Deserialize;

use crate::mask::PulseMask;
use crate::KilnError;

/// Bit-field widths of one packed frame, derived from the array geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub n_wl: u32,
    pub n_sl: u32,
    pub n_bl: u32,
}

impl FrameLayout {
    /// Build a layout, checking that all three fields fit in one `u64` frame.
    pub fn new(n_wl: usize, n_sl: usize, n_bl: usize) -> Result<Self, KilnError> {
        let total = n_wl + n_sl + n_bl;
        if total > 64 {
            return Err(KilnError::Config(format!(
                "frame needs {total} bits ({n_bl} BL + {n_sl} SL + {n_wl} WL), limit is 64"
            )));
        }
        Ok(FrameLayout { n_wl: n_wl as u32, n_sl: n_sl as u32, n_bl: n_bl as u32 })
    }

    fn field_mask(width: u32) -> u64 {
        if width == 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        }
    }

    pub fn wl_mask(&self) -> u64 {
        Self::field_mask(self.n_wl)
    }

    pub fn sl_mask(&self) -> u64 {
        Self::field_mask(self.n_sl)
    }

    pub fn bl_mask(&self) -> u64 {
        Self::field_mask(self.n_bl)
    }
}

/// One time-step's line state with named fields.
///
/// Bit `width - 1 - i` of a field corresponds to line index `i`, i.e. line 0
/// is the most significant bit of its field, matching the instrument's pin
/// ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseFrame {
    pub bl_bits: u64,
    pub sl_bits: u64,
    pub wl_bits: u64,
}

impl PulseFrame {
    /// Pack into a single frame integer. Field values are masked to their
    /// widths, so a stray high bit can never leak into a neighboring field.
    pub fn pack(&self, layout: &FrameLayout) -> u64 {
        let wl = self.wl_bits & layout.wl_mask();
        let sl = self.sl_bits & layout.sl_mask();
        let bl = self.bl_bits & layout.bl_mask();
        (bl << (layout.n_wl + layout.n_sl)) | (sl << layout.n_wl) | wl
    }

    /// Split a packed frame back into its named fields.
    pub fn unpack(raw: u64, layout: &FrameLayout) -> PulseFrame {
        PulseFrame {
            wl_bits: raw & layout.wl_mask(),
            sl_bits: (raw >> layout.n_wl) & layout.sl_mask(),
            bl_bits: (raw >> (layout.n_wl + layout.n_sl)) & layout.bl_mask(),
        }
    }
}

/// MSB-first bit field from a selection vector: `select[0]` becomes the most
/// significant bit of a field `select.len()` wide.
pub fn bits_from_select(select: &[bool]) -> u64 {
    let mut bits = 0u64;
    for &s in select {
        bits = (bits << 1) | u64::from(s);
    }
    bits
}

/// Inverse of [`bits_from_select`] for a field of the given width.
pub fn select_from_bits(bits: u64, width: u32) -> Vec<bool> {
    (0..width).map(|i| bits >> (width - 1 - i) & 1 == 1).collect()
}

/// Access-transistor polarity of the array.
///
/// The two variants expose the same pre/main/post interface; all
/// polarity-dependent active-high/low decisions live here rather than
/// branching through the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PulsePolarity {
    /// NMOS access transistor: lines are active-high, the inactive wordline
    /// state is all-zero.
    Nmos,
    /// PMOS access transistor (e.g. CNFET arrays): the wordline and
    /// sourceline selections are inverted, and the inactive wordline state is
    /// all-one.
    Pmos,
}

impl PulsePolarity {
    /// Wordline field for the pre-pulse frame: the inactive pre-bias state.
    pub fn pre_state(&self, layout: &FrameLayout) -> u64 {
        match self {
            PulsePolarity::Nmos => 0,
            PulsePolarity::Pmos => layout.wl_mask(),
        }
    }

    /// Wordline field for the main frame, from the one-hot selection bits.
    pub fn main_state(&self, wl_select_bits: u64, layout: &FrameLayout) -> u64 {
        match self {
            PulsePolarity::Nmos => wl_select_bits & layout.wl_mask(),
            PulsePolarity::Pmos => !wl_select_bits & layout.wl_mask(),
        }
    }

    /// Wordline field for the post-pulse frame: back to the inactive state.
    pub fn post_state(&self, layout: &FrameLayout) -> u64 {
        self.pre_state(layout)
    }

    /// Sourceline field from the selection bits.
    pub fn sourceline_bits(&self, sl_select_bits: u64, layout: &FrameLayout) -> u64 {
        match self {
            PulsePolarity::Nmos => sl_select_bits & layout.sl_mask(),
            PulsePolarity::Pmos => !sl_select_bits & layout.sl_mask(),
        }
    }

    /// Bitline field from the selection bits (identical for both polarities).
    pub fn bitline_bits(&self, bl_select_bits: u64, layout: &FrameLayout) -> u64 {
        bl_select_bits & layout.bl_mask()
    }
}

impl std::str::FromStr for PulsePolarity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nmos" => Ok(PulsePolarity::Nmos),
            "pmos" => Ok(PulsePolarity::Pmos),
            _ => Err(format!("unknown polarity '{s}', expected NMOS or PMOS")),
        }
    }
}

/// Frame-repeat counts for one pulse train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTiming {
    /// Main-frame repeats (the pulse width in instrument time-steps).
    pub pulse_len: u32,
    /// Pre-pulse frame repeats.
    pub prepulse_len: u32,
    /// Post-pulse frame repeats.
    pub postpulse_len: u32,
    /// Instrument frame depth per wordline; the encoded waveform is padded to
    /// `max_len * n_wl` frames.
    pub max_len: u32,
}

impl PulseTiming {
    /// The pulse-width value written to the instrument's sequencer register.
    pub fn register(&self) -> u32 {
        self.prepulse_len + self.pulse_len + self.postpulse_len
    }
}

/// Encode per-row pulse selections into the padded frame sequence.
///
/// For each mask row, the pre/main/post frames are repeated
/// `prepulse_len`/`pulse_len`/`postpulse_len` times and concatenated; the
/// result is zero-padded to exactly `max_len * n_wl` frames. Returns
/// [`KilnError::WaveformOverflow`] if the unpadded content already exceeds
/// that bound.
pub fn encode(
    masks: &[PulseMask],
    timing: &PulseTiming,
    layout: &FrameLayout,
    polarity: PulsePolarity,
) -> Result<Vec<u64>, KilnError> {
    let capacity = timing.max_len as usize * layout.n_wl as usize;
    let per_row = (timing.register()) as usize;
    let content = masks.len() * per_row;
    if content > capacity {
        return Err(KilnError::WaveformOverflow { frames: content, limit: capacity });
    }

    let mut waveform = Vec::with_capacity(capacity);
    for mask in masks {
        let wl_select = bits_from_select(&mask.wl_select);
        let bl = polarity.bitline_bits(bits_from_select(&mask.bl_select), layout);
        let sl = polarity.sourceline_bits(bits_from_select(&mask.sl_select), layout);

        let pre = PulseFrame { bl_bits: bl, sl_bits: sl, wl_bits: polarity.pre_state(layout) }
            .pack(layout);
        let main = PulseFrame {
            bl_bits: bl,
            sl_bits: sl,
            wl_bits: polarity.main_state(wl_select, layout),
        }
        .pack(layout);
        let post = PulseFrame { bl_bits: bl, sl_bits: sl, wl_bits: polarity.post_state(layout) }
            .pack(layout);

        waveform.extend(std::iter::repeat(pre).take(timing.prepulse_len as usize));
        waveform.extend(std::iter::repeat(main).take(timing.pulse_len as usize));
        waveform.extend(std::iter::repeat(post).take(timing.postpulse_len as usize));
    }
    waveform.resize(capacity, 0);
    Ok(waveform)
}

/// The all-off waveform: every line held low for the full frame depth.
///
/// Issued before reads to let cells relax after programming.
pub fn encode_all_off(max_len: u32, layout: &FrameLayout) -> Vec<u64> {
    vec![0; max_len as usize * layout.n_wl as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::new(4, 4, 4).unwrap()
    }

    fn one_row() -> PulseMask {
        PulseMask {
            wl_select: vec![true, false, false, false],
            bl_select: vec![true, true, false, false],
            sl_select: vec![false; 4],
        }
    }

    #[test]
    fn layout_rejects_oversized_frames() {
        assert!(FrameLayout::new(32, 32, 32).is_err());
        assert!(FrameLayout::new(22, 21, 21).is_ok());
    }

    #[test]
    fn select_bits_are_msb_first() {
        assert_eq!(bits_from_select(&[true, false, false, false]), 0b1000);
        assert_eq!(bits_from_select(&[true, true, false, false]), 0b1100);
        assert_eq!(select_from_bits(0b1010, 4), vec![true, false, true, false]);
    }

    #[test]
    fn frame_pack_unpack_round_trip() {
        let layout = layout();
        let frame = PulseFrame { bl_bits: 0b1100, sl_bits: 0b0010, wl_bits: 0b1000 };
        let raw = frame.pack(&layout);
        assert_eq!(raw, (0b1100 << 8) | (0b0010 << 4) | 0b1000);
        assert_eq!(PulseFrame::unpack(raw, &layout), frame);
    }

    #[test]
    fn pack_masks_out_of_range_bits() {
        let layout = layout();
        let frame = PulseFrame { bl_bits: 0b1_0001, sl_bits: 0, wl_bits: 0 };
        // the 5th bitline bit must not bleed into the sourceline field
        assert_eq!(frame.pack(&layout), 0b0001 << 8);
    }

    #[test]
    fn nmos_frame_values() {
        let layout = layout();
        let timing = PulseTiming { pulse_len: 2, prepulse_len: 1, postpulse_len: 1, max_len: 8 };
        let wf = encode(&[one_row()], &timing, &layout, PulsePolarity::Nmos).unwrap();
        assert_eq!(wf.len(), 8 * 4);
        let pre = 0b1100 << 8;
        let main = (0b1100 << 8) | 0b1000;
        assert_eq!(&wf[..4], &[pre, main, main, pre]);
        assert!(wf[4..].iter().all(|&f| f == 0));
    }

    #[test]
    fn pmos_inverts_wordline_and_sourceline() {
        let layout = layout();
        let timing = PulseTiming { pulse_len: 1, prepulse_len: 1, postpulse_len: 1, max_len: 8 };
        let wf = encode(&[one_row()], &timing, &layout, PulsePolarity::Pmos).unwrap();
        // SL selection of all-false inverts to all-on, WL idles all-on
        let pre = (0b1100 << 8) | (0b1111 << 4) | 0b1111;
        let main = (0b1100 << 8) | (0b1111 << 4) | 0b0111;
        assert_eq!(&wf[..3], &[pre, main, pre]);
    }

    #[test]
    fn encode_length_is_exact_for_every_valid_input() {
        let layout = layout();
        for rows in 0..4 {
            for pulse_len in [1u32, 10, 50] {
                let timing =
                    PulseTiming { pulse_len, prepulse_len: 2, postpulse_len: 2, max_len: 100 };
                let masks: Vec<_> = (0..rows)
                    .map(|r| {
                        let mut wl_select = vec![false; 4];
                        wl_select[r] = true;
                        PulseMask { wl_select, bl_select: vec![true; 4], sl_select: vec![false; 4] }
                    })
                    .collect();
                let wf = encode(&masks, &timing, &layout, PulsePolarity::Nmos).unwrap();
                assert_eq!(wf.len(), 100 * 4);
            }
        }
    }

    #[test]
    fn encode_overflow_fails_fast() {
        let layout = layout();
        // one row of 5 frames with a capacity of 1 * 4 = 4 frames
        let timing = PulseTiming { pulse_len: 3, prepulse_len: 1, postpulse_len: 1, max_len: 1 };
        let err = encode(&[one_row()], &timing, &layout, PulsePolarity::Nmos).unwrap_err();
        match err {
            KilnError::WaveformOverflow { frames, limit } => {
                assert_eq!(frames, 5);
                assert_eq!(limit, 4);
            }
            other => panic!("expected WaveformOverflow, got {other:?}"),
        }
    }

    #[test]
    fn pulse_width_register_covers_all_segments() {
        let timing = PulseTiming { pulse_len: 10, prepulse_len: 2, postpulse_len: 3, max_len: 100 };
        assert_eq!(timing.register(), 15);
    }

    #[test]
    fn all_off_waveform_is_zero_padded_depth() {
        let layout = layout();
        let wf = encode_all_off(100, &layout);
        assert_eq!(wf.len(), 400);
        assert!(wf.iter().all(|&f| f == 0));
    }
}
