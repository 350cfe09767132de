pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;

pub use error::{PerfwatchError, Result};
