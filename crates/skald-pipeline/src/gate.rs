use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The single signal coupling the capture and receive tasks: set while the
/// speaker is (or is about to be) rendering, cleared when playback fully
/// ends. Capture policy decides whether a set gate pauses the mic or just
/// raises the VAD threshold.
#[derive(Clone, Default)]
pub struct PlaybackGate {
    active: Arc<AtomicBool>,
}

impl PlaybackGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_toggles() {
        let gate = PlaybackGate::new();
        assert!(!gate.is_set());
        gate.set();
        assert!(gate.is_set());

        let clone = gate.clone();
        clone.clear();
        assert!(!gate.is_set());
    }
}
