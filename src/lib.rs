//! cellm Library
//!
//! Local LLM generation for spreadsheet formula cells: a worker-thread engine
//! that streams tokens, and a controller that routes them into cells.

pub mod controller;
pub mod inference;
pub mod storage;
pub mod types;
