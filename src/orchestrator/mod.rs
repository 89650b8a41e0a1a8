//! Application-level orchestration.
//!
//! This module owns the conversion session state machine, run lifecycle control
//! (start/cancel/restart) and post-run processing such as artifact extraction,
//! temp cleanup and auto-save. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;
mod session;

pub(crate) use controller::{run_controller, ControllerOpts, UiCommand};
pub(crate) use post_process::process_run_completion;
pub use session::ConversionSession;
