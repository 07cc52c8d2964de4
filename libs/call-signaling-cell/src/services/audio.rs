// libs/call-signaling-cell/src/services/audio.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::CallPhase;

/// The two sustained audio cues of the call flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCue {
    /// Receiver side, plays while an incoming call is ringing.
    Ringtone,
    /// Caller side, plays while waiting for the receiver to answer.
    Ringback,
}

#[derive(Debug, thiserror::Error)]
#[error("Audio cue failed: {0}")]
pub struct CueError(pub String);

/// Playback backend seam.
///
/// Implementations must not block: `start` begins a loop and returns,
/// `stop` is safe to call at any time, including when the cue never
/// started. Real backends (e.g. cpal) typically live on a dedicated audio
/// thread behind this trait, since their handles are not `Send`.
pub trait CuePlayer: Send + Sync {
    fn start(&self, cue: AudioCue) -> Result<(), CueError>;
    fn stop(&self, cue: AudioCue);
}

/// Player that produces no sound. Default for embedders without audio
/// output and for tests.
pub struct NullCuePlayer;

impl CuePlayer for NullCuePlayer {
    fn start(&self, cue: AudioCue) -> Result<(), CueError> {
        debug!("Null cue player: start {:?}", cue);
        Ok(())
    }

    fn stop(&self, cue: AudioCue) {
        debug!("Null cue player: stop {:?}", cue);
    }
}

/// Reconciles actual cue playback to the desired cue of the current call
/// phase. A cue that fails to start is logged and skipped - a missing
/// sound never blocks call admission or teardown.
pub struct AudioCueController {
    player: Arc<dyn CuePlayer>,
    ringtone_engaged: AtomicBool,
    ringback_engaged: AtomicBool,
}

impl AudioCueController {
    pub fn new(player: Arc<dyn CuePlayer>) -> Self {
        Self {
            player,
            ringtone_engaged: AtomicBool::new(false),
            ringback_engaged: AtomicBool::new(false),
        }
    }

    /// The cue a phase wants sustained, if any.
    pub fn desired_cue(phase: CallPhase) -> Option<AudioCue> {
        match phase {
            CallPhase::RingingIn => Some(AudioCue::Ringtone),
            CallPhase::RingingOut => Some(AudioCue::Ringback),
            CallPhase::Idle | CallPhase::Connected => None,
        }
    }

    /// Bring playback in line with the phase: start its desired cue,
    /// stop everything else.
    pub fn sync_to_phase(&self, phase: CallPhase) {
        let desired = Self::desired_cue(phase);
        for cue in [AudioCue::Ringtone, AudioCue::Ringback] {
            if desired == Some(cue) {
                self.engage(cue);
            } else {
                self.stop(cue);
            }
        }
    }

    /// Whether the cue is currently engaged (requested to play).
    pub fn is_engaged(&self, cue: AudioCue) -> bool {
        self.flag(cue).load(Ordering::SeqCst)
    }

    /// Stop one cue. Idempotent; the backend stop runs unconditionally so
    /// no cue can outlive its owning state even after a failed start.
    pub fn stop(&self, cue: AudioCue) {
        self.flag(cue).store(false, Ordering::SeqCst);
        self.player.stop(cue);
    }

    pub fn stop_all(&self) {
        self.stop(AudioCue::Ringtone);
        self.stop(AudioCue::Ringback);
    }

    fn engage(&self, cue: AudioCue) {
        if self.flag(cue).swap(true, Ordering::SeqCst) {
            return; // already looping
        }
        if let Err(e) = self.player.start(cue) {
            warn!("Skipping audio cue {:?}: {}", cue, e);
        }
    }

    fn flag(&self, cue: AudioCue) -> &AtomicBool {
        match cue {
            AudioCue::Ringtone => &self.ringtone_engaged,
            AudioCue::Ringback => &self.ringback_engaged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlayer {
        log: Mutex<Vec<String>>,
        fail_start: bool,
    }

    impl RecordingPlayer {
        fn failing() -> Self {
            Self {
                log: Mutex::default(),
                fail_start: true,
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl CuePlayer for RecordingPlayer {
        fn start(&self, cue: AudioCue) -> Result<(), CueError> {
            self.log.lock().unwrap().push(format!("start {:?}", cue));
            if self.fail_start {
                Err(CueError("asset failed to load".to_string()))
            } else {
                Ok(())
            }
        }

        fn stop(&self, cue: AudioCue) {
            self.log.lock().unwrap().push(format!("stop {:?}", cue));
        }
    }

    #[test]
    fn test_phase_maps_to_desired_cue() {
        assert_eq!(AudioCueController::desired_cue(CallPhase::RingingIn), Some(AudioCue::Ringtone));
        assert_eq!(AudioCueController::desired_cue(CallPhase::RingingOut), Some(AudioCue::Ringback));
        assert_eq!(AudioCueController::desired_cue(CallPhase::Idle), None);
        assert_eq!(AudioCueController::desired_cue(CallPhase::Connected), None);
    }

    #[test]
    fn test_sync_engages_and_releases_cues() {
        let player = Arc::new(RecordingPlayer::default());
        let controller = AudioCueController::new(player.clone());

        controller.sync_to_phase(CallPhase::RingingIn);
        assert!(controller.is_engaged(AudioCue::Ringtone));
        assert!(!controller.is_engaged(AudioCue::Ringback));

        controller.sync_to_phase(CallPhase::Connected);
        assert!(!controller.is_engaged(AudioCue::Ringtone));
        assert!(player.log().contains(&"stop Ringtone".to_string()));
    }

    #[test]
    fn test_repeated_sync_does_not_restart_cue() {
        let player = Arc::new(RecordingPlayer::default());
        let controller = AudioCueController::new(player.clone());

        controller.sync_to_phase(CallPhase::RingingOut);
        controller.sync_to_phase(CallPhase::RingingOut);

        let starts = player.log().iter().filter(|e| e.starts_with("start")).count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_stop_without_start_is_harmless() {
        let controller = AudioCueController::new(Arc::new(RecordingPlayer::default()));
        controller.stop(AudioCue::Ringtone);
        controller.stop_all();
        assert!(!controller.is_engaged(AudioCue::Ringtone));
    }

    #[test]
    fn test_start_failure_is_swallowed() {
        let player = Arc::new(RecordingPlayer::failing());
        let controller = AudioCueController::new(player.clone());

        controller.sync_to_phase(CallPhase::RingingIn);
        // Engaged from the state machine's point of view, silent in practice.
        assert!(controller.is_engaged(AudioCue::Ringtone));

        controller.sync_to_phase(CallPhase::Idle);
        assert!(!controller.is_engaged(AudioCue::Ringtone));
        assert!(player.log().contains(&"stop Ringtone".to_string()));
    }
}
