pub mod backend;
pub mod device;
pub mod frame;

pub use backend::{CaptureBackend, CaptureBackendConfig, CaptureNote, FakeBackend};
pub use device::CpalBackend;
pub use frame::{epoch_ms, FrameAssembler, PcmFrame};
