// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Array geometry and the cell-selection mask.
//!
//! An RRAM array is addressed through three line groups: wordlines gate the
//! access transistors, bitlines and sourcelines carry programming and read
//! current through the resistive elements. [`ArrayMask`] tracks, per
//! (wordline, bitline) intersection, whether a cell still needs programming.
//! As pulse-verify iterations land cells on target, their entries are cleared
//! so subsequent pulses skip them; a row whose cells are all done is dropped
//! from the pulse waveform entirely.
//!
//! Within one convergence pass the mask is monotonic: entries only flip
//! true→false. A fresh mask is built at the start of every search and
//! discarded at the end.

use crate::bus::ReadFrame;
use crate::sweep::Comparison;
use crate::KilnError;

/// Wordline identifier (index into the full array geometry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WordLine(pub u16);

/// Bitline identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitLine(pub u16);

/// Sourceline identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceLine(pub u16);

/// Body/substrate line identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyLine(pub u16);

impl std::fmt::Display for WordLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WL_{}", self.0)
    }
}

impl std::fmt::Display for BitLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BL_{}", self.0)
    }
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SL_{}", self.0)
    }
}

impl std::fmt::Display for BodyLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BODY_{}", self.0)
    }
}

/// One addressed 1T1R cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellAddr {
    pub wl: WordLine,
    pub bl: BitLine,
    pub sl: SourceLine,
}

/// The full addressable line set of one array.
///
/// Line identifiers are listed in pin order; a line's position in these lists
/// determines its bit position in the packed pulse frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayGeometry {
    pub wordlines: Vec<WordLine>,
    pub bitlines: Vec<BitLine>,
    pub sourcelines: Vec<SourceLine>,
    pub body: Vec<BodyLine>,
}

impl ArrayGeometry {
    /// Geometry with `n_wl` wordlines, `n_bl` bitlines, and `n_sl`
    /// sourcelines numbered from zero, and a single body line.
    pub fn with_counts(n_wl: u16, n_bl: u16, n_sl: u16) -> Self {
        ArrayGeometry {
            wordlines: (0..n_wl).map(WordLine).collect(),
            bitlines: (0..n_bl).map(BitLine).collect(),
            sourcelines: (0..n_sl).map(SourceLine).collect(),
            body: vec![BodyLine(0)],
        }
    }

    pub fn wl_index(&self, wl: WordLine) -> Option<usize> {
        self.wordlines.iter().position(|&w| w == wl)
    }

    pub fn bl_index(&self, bl: BitLine) -> Option<usize> {
        self.bitlines.iter().position(|&b| b == bl)
    }
}

/// The subset of lines addressed by the current operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub wordlines: Vec<WordLine>,
    pub bitlines: Vec<BitLine>,
    pub sourcelines: Vec<SourceLine>,
}

impl Address {
    /// Address the entire array, pairing bitline `i` with sourceline `i`.
    pub fn full(geometry: &ArrayGeometry) -> Self {
        Address {
            wordlines: geometry.wordlines.clone(),
            bitlines: geometry.bitlines.clone(),
            sourcelines: geometry.sourcelines.clone(),
        }
    }

    /// Addressed cells in (wordline, bitline) order.
    pub fn cells(&self) -> Vec<(WordLine, BitLine)> {
        let mut out = Vec::with_capacity(self.wordlines.len() * self.bitlines.len());
        for &wl in &self.wordlines {
            for &bl in &self.bitlines {
                out.push((wl, bl));
            }
        }
        out
    }
}

/// Per-row line selection handed to the waveform encoder.
///
/// Selection vectors span the *full* geometry (index = position in the
/// geometry's line lists) so they can be packed directly into pulse frames.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseMask {
    /// One-hot wordline selection over all wordlines.
    pub wl_select: Vec<bool>,
    /// Bitline selection over all bitlines, restricted to this row's
    /// still-active cells.
    pub bl_select: Vec<bool>,
    /// Sourceline selection over all sourcelines. Held unasserted here; the
    /// pulse polarity decides the final line state at encode time.
    pub sl_select: Vec<bool>,
}

/// Boolean grid over (wordline × bitline): `true` = still needs programming.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMask {
    /// Row-major over the full geometry: `grid[wl_idx * n_bl + bl_idx]`.
    grid: Vec<bool>,
    all_wordlines: Vec<WordLine>,
    all_bitlines: Vec<BitLine>,
    n_sl: usize,
    address: Address,
}

impl ArrayMask {
    /// Mask for a standard 1T1R array: true at the intersection of the
    /// addressed wordlines and bitlines, false elsewhere.
    ///
    /// Each addressed bitline must pair with exactly one sourceline; a
    /// mismatch is a caller configuration mistake and fails fast.
    pub fn new(address: &Address, geometry: &ArrayGeometry) -> Result<Self, KilnError> {
        if address.bitlines.len() != address.sourcelines.len() {
            return Err(KilnError::Config(format!(
                "1T1R mask requires one sourceline per bitline, got {} bitlines and {} sourcelines",
                address.bitlines.len(),
                address.sourcelines.len()
            )));
        }
        Ok(Self::build(address, geometry))
    }

    /// Mask for a 1TNR array: N bitlines share one access transistor, so a
    /// single wordline/sourceline pair may serve several bitlines.
    pub fn new_1tnr(address: &Address, geometry: &ArrayGeometry) -> Result<Self, KilnError> {
        if address.sourcelines.is_empty() {
            return Err(KilnError::Config(
                "1TNR mask requires at least one shared sourceline".to_string(),
            ));
        }
        Ok(Self::build(address, geometry))
    }

    /// Mask with every entry false. Encoding it produces the all-off
    /// relaxation waveform used to let cells settle before a read.
    pub fn all_off(geometry: &ArrayGeometry) -> Self {
        let address = Address {
            wordlines: geometry.wordlines.clone(),
            bitlines: Vec::new(),
            sourcelines: Vec::new(),
        };
        Self::build(&address, geometry)
    }

    fn build(address: &Address, geometry: &ArrayGeometry) -> Self {
        let n_bl = geometry.bitlines.len();
        let mut grid = vec![false; geometry.wordlines.len() * n_bl];
        for (wi, wl) in geometry.wordlines.iter().enumerate() {
            for (bi, bl) in geometry.bitlines.iter().enumerate() {
                grid[wi * n_bl + bi] =
                    address.wordlines.contains(wl) && address.bitlines.contains(bl);
            }
        }
        ArrayMask {
            grid,
            all_wordlines: geometry.wordlines.clone(),
            all_bitlines: geometry.bitlines.clone(),
            n_sl: geometry.sourcelines.len(),
            address: address.clone(),
        }
    }

    fn n_bl(&self) -> usize {
        self.all_bitlines.len()
    }

    /// Whether the cell at (wl, bl) still needs programming. Lines outside
    /// the geometry read as false.
    pub fn entry(&self, wl: WordLine, bl: BitLine) -> bool {
        match (
            self.all_wordlines.iter().position(|&w| w == wl),
            self.all_bitlines.iter().position(|&b| b == bl),
        ) {
            (Some(wi), Some(bi)) => self.grid[wi * self.n_bl() + bi],
            _ => false,
        }
    }

    /// Mark one cell as done. Entries only ever flip true→false.
    pub fn clear(&mut self, wl: WordLine, bl: BitLine) {
        if let (Some(wi), Some(bi)) = (
            self.all_wordlines.iter().position(|&w| w == wl),
            self.all_bitlines.iter().position(|&b| b == bl),
        ) {
            let n_bl = self.n_bl();
            self.grid[wi * n_bl + bi] = false;
        }
    }

    /// Bulk-replace the grid, e.g. to fold in convergence results.
    ///
    /// The new grid must have the same dimensions.
    pub fn replace(&mut self, grid: Vec<bool>) {
        assert_eq!(grid.len(), self.grid.len(), "replacement grid dimension mismatch");
        self.grid = grid;
    }

    /// True when no cell needs programming.
    pub fn is_done(&self) -> bool {
        !self.grid.iter().any(|&v| v)
    }

    /// True when every addressed cell on the given bitline is done.
    ///
    /// This is the 1TNR success condition: the selected bitline's cell must
    /// meet target on every addressed wordline.
    pub fn is_done_for_bitline(&self, bl: BitLine) -> bool {
        match self.all_bitlines.iter().position(|&b| b == bl) {
            Some(bi) => {
                let n_bl = self.n_bl();
                !(0..self.all_wordlines.len()).any(|wi| self.grid[wi * n_bl + bi])
            }
            None => true,
        }
    }

    /// Still-active cells in row-major order.
    pub fn active_cells(&self) -> Vec<(WordLine, BitLine)> {
        let n_bl = self.n_bl();
        let mut out = Vec::new();
        for (wi, &wl) in self.all_wordlines.iter().enumerate() {
            for (bi, &bl) in self.all_bitlines.iter().enumerate() {
                if self.grid[wi * n_bl + bi] {
                    out.push((wl, bl));
                }
            }
        }
        out
    }

    /// Per-row pulse selections for every wordline that still has at least
    /// one active cell. Fully cleared rows are omitted, which is what lets
    /// completed cells skip further programming pulses.
    pub fn pulse_masks(&self) -> Vec<PulseMask> {
        let n_wl = self.all_wordlines.len();
        let n_bl = self.n_bl();
        let mut masks = Vec::new();
        for wi in 0..n_wl {
            let row = &self.grid[wi * n_bl..(wi + 1) * n_bl];
            if !row.iter().any(|&v| v) {
                continue;
            }
            let mut wl_select = vec![false; n_wl];
            wl_select[wi] = true;
            masks.push(PulseMask {
                wl_select,
                bl_select: row.to_vec(),
                sl_select: vec![false; self.n_sl],
            });
        }
        masks
    }

    /// Pure mask transform: fold one read frame into a new mask.
    ///
    /// Every still-active cell whose measured resistance satisfies
    /// `cmp(resistance, target)` is cleared in the returned mask; the list of
    /// newly cleared cells is returned alongside. `self` is not modified, so
    /// each convergence step stays independently testable.
    pub fn apply_read(
        &self,
        frame: &ReadFrame,
        cmp: Comparison,
        target: f64,
    ) -> (ArrayMask, Vec<(WordLine, BitLine)>) {
        let mut next = self.clone();
        let mut cleared = Vec::new();
        for (wl, bl) in self.active_cells() {
            if let Some(meas) = frame.get(wl, bl) {
                if cmp.holds(meas.resistance, target) {
                    next.clear(wl, bl);
                    cleared.push((wl, bl));
                }
            }
        }
        (next, cleared)
    }

    /// The addressed line subset this mask was built from.
    pub fn address(&self) -> &Address {
        &self.address
    }
}
