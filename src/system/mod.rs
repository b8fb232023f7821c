//! Operating-system integration outside the core

pub mod autostart;

pub use autostart::{AutoStart, EntryKind};
