//! Utility modules for Verikad

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
