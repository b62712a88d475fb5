//! Reset trigger
//!
//! While the medium is exposed over USB the only way back to local access is
//! a restart. Something has to ask for it: a push button, a signal, or both.

pub mod gpio;
pub mod signal;

pub use gpio::GpioButton;
pub use signal::SignalTrigger;

/// Polled source of restart requests
pub trait ResetTrigger: Send {
    /// Returns `true` once per request
    fn poll(&mut self) -> bool;

    fn name(&self) -> &str {
        "trigger"
    }
}

/// Any of several triggers; all are polled every time
impl ResetTrigger for Vec<Box<dyn ResetTrigger>> {
    fn poll(&mut self) -> bool {
        self.iter_mut().fold(false, |fired, t| t.poll() | fired)
    }

    fn name(&self) -> &str {
        "combined"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTrigger;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_combined_polls_every_source() {
        let first = ScriptedTrigger::after(1);
        let second = ScriptedTrigger::never();
        let second_polls = second.polls();

        let mut triggers: Vec<Box<dyn ResetTrigger>> = vec![Box::new(first), Box::new(second)];
        assert!(triggers.poll());
        assert_eq!(second_polls.load(Ordering::SeqCst), 1);
        assert!(!triggers.poll());
    }

    #[test]
    fn test_empty_never_fires() {
        let mut triggers: Vec<Box<dyn ResetTrigger>> = Vec::new();
        assert!(!triggers.poll());
    }
}
