pub mod capture;
pub mod dispatch;
pub mod gate;
pub mod session;

pub use capture::CaptureLoop;
pub use dispatch::Dispatcher;
pub use gate::PlaybackGate;
pub use session::{Coordinator, CoordinatorSetupError, SessionError};
