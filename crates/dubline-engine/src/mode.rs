use dubline_proto::protocol::Mode;
use tracing::{debug, info};

/// Idle / Active / Error session mode with the allowed transitions only.
#[derive(Debug, Default)]
pub struct ModeMachine {
    mode: Mode,
}

impl ModeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.mode == Mode::Active
    }

    /// Idle or Error -> Active (attach succeeded, or explicit start).
    pub fn activate(&mut self) -> bool {
        match self.mode {
            Mode::Idle | Mode::Error => self.set(Mode::Active),
            Mode::Active => false,
        }
    }

    /// Active -> Error.  Failures outside Active are ignored.
    pub fn fail(&mut self) -> bool {
        match self.mode {
            Mode::Active => self.set(Mode::Error),
            other => {
                debug!("mode: ignoring failure while {:?}", other);
                false
            }
        }
    }

    /// Error -> Active, driven by the recovery timer.
    pub fn recover(&mut self) -> bool {
        match self.mode {
            Mode::Error => self.set(Mode::Active),
            _ => false,
        }
    }

    /// Any -> Idle.
    pub fn stop(&mut self) -> bool {
        self.set(Mode::Idle)
    }

    fn set(&mut self, next: Mode) -> bool {
        if self.mode == next {
            return false;
        }
        info!("mode {:?} → {:?}", self.mode, next);
        self.mode = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle() {
        assert_eq!(ModeMachine::new().mode(), Mode::Idle);
    }

    #[test]
    fn test_fail_only_from_active() {
        let mut m = ModeMachine::new();
        assert!(!m.fail());
        assert_eq!(m.mode(), Mode::Idle);

        assert!(m.activate());
        assert!(m.fail());
        assert_eq!(m.mode(), Mode::Error);
        assert!(!m.fail());
    }

    #[test]
    fn test_recover_only_from_error() {
        let mut m = ModeMachine::new();
        assert!(!m.recover());
        m.activate();
        assert!(!m.recover());
        m.fail();
        assert!(m.recover());
        assert!(m.is_active());
    }

    #[test]
    fn test_stop_from_anywhere() {
        let mut m = ModeMachine::new();
        m.activate();
        m.fail();
        assert!(m.stop());
        assert_eq!(m.mode(), Mode::Idle);
        assert!(!m.stop());
    }
}
