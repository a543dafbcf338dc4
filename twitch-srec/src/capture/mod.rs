//! Capture process supervision.
//!
//! A [`CaptureEngine`] knows how to invoke an external recorder; the
//! [`CaptureRunner`] owns the per-channel process table, enforces the
//! one-process-per-channel rule and reports exits back to the registry.

pub mod engine;
mod runner;
pub mod streamlink;

pub use engine::{CaptureEngine, CaptureRequest, OutputStatus};
pub use runner::{CaptureCompletion, CaptureExit, CaptureRunner, RunningCapture};
pub use streamlink::{StreamlinkConfig, StreamlinkEngine};
