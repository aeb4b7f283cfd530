//! Stream worker: one process per logical stream that turns capture-process
//! PCM into committed transcript events.
//!
//! This module owns:
//! - the capture process lifecycle and its IPC channel
//! - the bounded internal frame buffer
//! - the ASR websocket session (sender / receiver / status pumper)
//! - the transcript-commit decision logic
//! - periodic status snapshot emission to the parent supervisor

mod commit;
mod runner;
mod status;

pub use commit::CommitPolicy;
pub use runner::run;
pub use status::{StatusSnapshot, StreamStatus, WorkerEvent};
