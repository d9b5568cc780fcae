//! Cell addressing
//!
//! A1-style addresses used to key formula callers.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest column index accepted (`XFD`, 0-indexed).
pub const MAX_COLS: u32 = 16_384;
/// Largest 1-based row accepted.
pub const MAX_ROWS: u32 = 1_048_576;

static A1_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$?([A-Za-z]{1,3})\$?([0-9]+)$").expect("valid A1 regex"));

/// Errors produced while parsing an A1 reference
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum A1ParseError {
    #[error("Not an A1 reference: {0:?}")]
    Malformed(String),

    #[error("Column out of range: {0}")]
    InvalidColumn(String),

    #[error("Row out of range: {0}")]
    InvalidRow(String),
}

/// Address of a single cell.
///
/// Rows and columns are 0-indexed: `row = 0, col = 0` is `A1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellAddress {
    pub row: u32,
    pub col: u32,
}

impl CellAddress {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse an A1 reference such as `B7` or `$C$12`.
    pub fn from_a1(a1: &str) -> Result<Self, A1ParseError> {
        let s = a1.trim();
        let caps = A1_PATTERN
            .captures(s)
            .ok_or_else(|| A1ParseError::Malformed(s.to_string()))?;

        let col = caps[1]
            .bytes()
            .fold(0u32, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A' + 1))
            - 1;
        if col >= MAX_COLS {
            return Err(A1ParseError::InvalidColumn(caps[1].to_string()));
        }

        let row: u32 = caps[2]
            .parse()
            .map_err(|_| A1ParseError::InvalidRow(caps[2].to_string()))?;
        if row == 0 || row > MAX_ROWS {
            return Err(A1ParseError::InvalidRow(caps[2].to_string()));
        }

        Ok(Self { row: row - 1, col })
    }

    /// Format as A1 notation.
    pub fn to_a1(self) -> String {
        let mut letters = Vec::new();
        let mut n = self.col + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        letters.reverse();
        format!("{}{}", String::from_utf8_lossy(&letters), self.row + 1)
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

impl FromStr for CellAddress {
    type Err = A1ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_a1(s)
    }
}
