//! Cell surface
//!
//! The only view the controller has of the spreadsheet: read a cell's
//! displayed text, write a cell's displayed text.

use std::collections::HashMap;

use crate::types::CellAddress;

/// Read/write access to displayed cell values
pub trait CellSurface {
    /// Text shown in `addr`; empty when the cell is blank.
    fn get_value(&self, addr: CellAddress) -> String;

    /// Replace the text shown in `addr`. Writing an empty string blanks it.
    fn set_value(&mut self, addr: CellAddress, text: &str);
}

/// HashMap-backed sparse sheet.
#[derive(Debug, Default, Clone)]
pub struct MemorySheet {
    cells: HashMap<CellAddress, String>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-blank cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Non-blank cells in row-major order
    pub fn filled(&self) -> Vec<(CellAddress, &str)> {
        let mut cells: Vec<_> = self
            .cells
            .iter()
            .map(|(addr, text)| (*addr, text.as_str()))
            .collect();
        cells.sort_by_key(|(addr, _)| *addr);
        cells
    }
}

impl CellSurface for MemorySheet {
    fn get_value(&self, addr: CellAddress) -> String {
        self.cells.get(&addr).cloned().unwrap_or_default()
    }

    fn set_value(&mut self, addr: CellAddress, text: &str) {
        if text.is_empty() {
            self.cells.remove(&addr);
        } else {
            self.cells.insert(addr, text.to_string());
        }
    }
}
