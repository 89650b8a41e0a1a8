//! Process plumbing for conversion scripts: invocation building, child
//! supervision and output filtering.

pub mod command;
pub mod filter;
pub mod process;

pub use command::build_process_spec;
pub use filter::{StreamFilter, PROGRESS_MARKER};
pub use process::{OutputChunk, ProcessHandle, ProcessRunner};
