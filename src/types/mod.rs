//! Shared data types

pub mod cell;
pub mod message;

pub use cell::{A1ParseError, CellAddress};
pub use message::{ChatTurn, Role};
