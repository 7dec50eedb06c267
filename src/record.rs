// SPDX-FileCopyrightText: Copyright (c) 2025 The Kiln Project Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Per-cell operation records and the append-only sinks that receive them.
//!
//! Every pulse-verify outcome is reported as a [`CellRecord`] row; window
//! convergence additionally emits a [`TargetSummary`] line. Persistent log
//! files belong to the caller — the engine only appends through the
//! [`RecordSink`] trait.

use std::io::Write;

use log::warn;

use crate::mask::{BitLine, WordLine};

/// Operation kind as it appears in the log's OP column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Form,
    Set,
    Reset,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Read => write!(f, "READ"),
            OpKind::Form => write!(f, "FORM"),
            OpKind::Set => write!(f, "SET"),
            OpKind::Reset => write!(f, "RESET"),
        }
    }
}

/// One per-cell operation result row.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub chip: String,
    pub device: String,
    pub op: OpKind,
    pub wl: WordLine,
    pub bl: BitLine,
    pub resistance: f64,
    pub conductance: f64,
    pub current: f64,
    pub voltage: f64,
    pub vwl: f64,
    pub vsl: f64,
    pub vbl: f64,
    pub pulse_width: f64,
    pub success: bool,
}

/// CSV header matching [`CellRecord::csv_row`].
pub const CSV_HEADER: &str =
    "Chip_ID,Device_ID,OP,Row,Col,Res,Cond,Meas_I,Meas_V,Prog_VWL,Prog_VSL,Prog_VBL,Prog_Pulse,Success";

impl CellRecord {
    /// Render as one CSV line (no trailing newline).
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.chip,
            self.device,
            self.op,
            self.wl,
            self.bl,
            self.resistance,
            self.conductance,
            self.current,
            self.voltage,
            self.vwl,
            self.vsl,
            self.vbl,
            self.pulse_width,
            self.success
        )
    }
}

/// One-line summary of a window-targeting run.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSummary {
    pub chip: String,
    pub device: String,
    pub res_lo: f64,
    pub res_hi: f64,
    pub final_res: f64,
    pub attempts: usize,
    pub reads: u64,
    pub sets: u64,
    pub resets: u64,
    pub success: bool,
}

impl TargetSummary {
    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.chip,
            self.device,
            self.res_lo,
            self.res_hi,
            self.final_res,
            self.attempts,
            self.reads,
            self.sets,
            self.resets,
            self.success
        )
    }
}

/// Append-only receiver for operation rows and window summaries.
pub trait RecordSink {
    fn append(&mut self, row: &CellRecord);
    fn summary(&mut self, line: &TargetSummary);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn append(&mut self, _row: &CellRecord) {}
    fn summary(&mut self, _line: &TargetSummary) {}
}

/// Buffers rows in memory; used by tests and short interactive runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub rows: Vec<CellRecord>,
    pub summaries: Vec<TargetSummary>,
}

impl RecordSink for MemorySink {
    fn append(&mut self, row: &CellRecord) {
        self.rows.push(row.clone());
    }
    fn summary(&mut self, line: &TargetSummary) {
        self.summaries.push(line.clone());
    }
}

/// Writes CSV rows to any `Write` target. The header is emitted before the
/// first row. Write failures are reported once per sink and further output
/// dropped; the programming run itself is never aborted by a log failure.
pub struct CsvSink<W: Write> {
    out: W,
    wrote_header: bool,
    failed: bool,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        CsvSink { out, wrote_header: false, failed: false }
    }

    fn write_line(&mut self, line: &str) {
        if self.failed {
            return;
        }
        if let Err(e) = writeln!(self.out, "{line}") {
            warn!("record sink write failed, dropping further rows: {e}");
            self.failed = true;
        }
    }
}

impl<W: Write> RecordSink for CsvSink<W> {
    fn append(&mut self, row: &CellRecord) {
        if !self.wrote_header {
            self.wrote_header = true;
            let header = CSV_HEADER.to_string();
            self.write_line(&header);
        }
        let line = row.csv_row();
        self.write_line(&line);
    }

    fn summary(&mut self, line: &TargetSummary) {
        let line = line.csv_row();
        self.write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CellRecord {
        CellRecord {
            chip: "C4".into(),
            device: "D0".into(),
            op: OpKind::Set,
            wl: WordLine(1),
            bl: BitLine(2),
            resistance: 9800.0,
            conductance: 1.0 / 9800.0,
            current: 2.0e-5,
            voltage: 0.2,
            vwl: 1.8,
            vsl: 0.0,
            vbl: 2.0,
            pulse_width: 100.0,
            success: true,
        }
    }

    #[test]
    fn csv_row_has_all_columns_in_order() {
        let row = record().csv_row();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), CSV_HEADER.split(',').count());
        assert_eq!(fields[0], "C4");
        assert_eq!(fields[2], "SET");
        assert_eq!(fields[3], "WL_1");
        assert_eq!(fields[4], "BL_2");
        assert_eq!(fields[13], "true");
    }

    #[test]
    fn csv_sink_emits_header_once() {
        let mut buf = Vec::new();
        {
            let mut sink = CsvSink::new(&mut buf);
            sink.append(&record());
            sink.append(&record());
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn memory_sink_buffers() {
        let mut sink = MemorySink::default();
        sink.append(&record());
        assert_eq!(sink.rows.len(), 1);
        assert!(sink.summaries.is_empty());
    }
}
