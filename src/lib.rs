pub mod asr;
pub mod audio;
pub mod capture;
pub mod config;
pub mod ipc;
pub mod manager;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use audio::{CaptureBackend, CaptureBackendConfig, CaptureNote, FakeBackend, PcmFrame};
pub use config::{Settings, StreamConfig};
pub use manager::DualPipelineManager;
pub use queue::BoundedQueue;
pub use supervisor::{FreezeDetector, StreamSupervisor, TextCallback, WorkerLauncher};
pub use worker::{CommitPolicy, StatusSnapshot, StreamStatus, WorkerEvent};
