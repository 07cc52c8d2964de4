// libs/call-signaling-cell/src/services/mod.rs

pub mod audio;
pub mod presence;
pub mod repository;
pub mod session;

pub use audio::{AudioCue, AudioCueController, CueError, CuePlayer, NullCuePlayer};
pub use presence::{PresenceEvent, PresenceWatcher};
pub use repository::CallRepository;
pub use session::CallSession;
