//! Helper utilities.

mod time;

pub use time::*;
