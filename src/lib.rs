//! Time-series image acquisition with flatbed and film scanners.
//!
//! A run powers the scanner through a switched outlet, waits for it to
//! enumerate (power-cycling it when it does not), captures and stores one
//! image, powers it off again and waits for the next cycle.

pub mod clock;
pub mod console;
pub mod countdown;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod persist;
pub mod power;
pub mod run_data;
pub mod settings;

pub use error::{ConfigError, RunError};
pub use orchestrator::{CaptureFailurePolicy, CycleOptions, CycleState, Orchestrator, RunOutcome};
pub use run_data::RunData;
pub use settings::Settings;
