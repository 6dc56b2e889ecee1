//! Snapshot encoding for emulated storage controllers.

pub mod io;
