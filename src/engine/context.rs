use std::time::{Duration, Instant};

use crate::error::{BackupError, Result};

/// Cooperative cancellation hook asked between every unit of work.
pub trait StopHook {
    /// Returns true when the current invocation must stop.
    fn should_stop(&mut self) -> bool;
}

impl<F: FnMut() -> bool> StopHook for F {
    fn should_stop(&mut self) -> bool {
        self()
    }
}

/// Hook that never stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStop;

impl StopHook for NeverStop {
    fn should_stop(&mut self) -> bool {
        false
    }
}

/// Hook that stops once a wall-clock budget is spent.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now() + budget }
    }
}

impl StopHook for Deadline {
    fn should_stop(&mut self) -> bool {
        Instant::now() >= self.at
    }
}

/// Per-invocation context handed to every resumable operation.
///
/// The sequence restarts at zero on every invocation, so the n-th call of a
/// step receives the same sequenced key on each replay.
pub struct TaskContext<'a> {
    hook: &'a mut dyn StopHook,
    sequence: u64,
}

impl<'a> TaskContext<'a> {
    pub fn new(hook: &'a mut dyn StopHook) -> Self {
        Self { hook, sequence: 0 }
    }

    /// Returns `Err(Interrupted)` when the stop hook fires.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.hook.should_stop() {
            return Err(BackupError::Interrupted);
        }
        Ok(())
    }

    /// Returns the next value of the invocation sequence.
    pub fn next_sequence(&mut self) -> u64 {
        let value = self.sequence;
        self.sequence += 1;
        value
    }

    /// Returns `name#N` with N taken from the invocation sequence.
    pub fn sequenced_key(&mut self, name: &str) -> String {
        let mut buf = itoa::Buffer::new();
        let seq = buf.format(self.next_sequence());
        format!("{}#{}", name, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_hook() {
        let mut calls = 0;
        let mut hook = || {
            calls += 1;
            calls > 2
        };
        let mut ctx = TaskContext::new(&mut hook);
        assert!(ctx.checkpoint().is_ok());
        assert!(ctx.checkpoint().is_ok());
        assert!(ctx.checkpoint().unwrap_err().is_interrupted());
    }

    #[test]
    fn sequenced_keys_replay_identically() {
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        assert_eq!(ctx.sequenced_key("upload"), "upload#0");
        assert_eq!(ctx.sequenced_key("upload"), "upload#1");

        let mut hook = NeverStop;
        let mut replay = TaskContext::new(&mut hook);
        assert_eq!(replay.sequenced_key("upload"), "upload#0");
    }

    #[test]
    fn expired_deadline_stops() {
        let mut hook = Deadline::after(Duration::ZERO);
        assert!(hook.should_stop());
        let mut hook = Deadline::after(Duration::from_secs(3600));
        assert!(!hook.should_stop());
    }
}
