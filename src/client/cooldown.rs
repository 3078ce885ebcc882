//! Global cooldown gate
//!
//! Converts a single caller's HTTP 429 into system-wide backpressure: the
//! caller that saw the 429 raises the gate, and every concurrent caller
//! waits for it to be lowered before issuing its next request. Without this,
//! N workers would each retry independently and re-trigger the limit.
//!
//! One gate is constructed per client and shared by `Arc`; there is no
//! process-wide instance.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Waiters give up and proceed after this long even if the gate is still
/// raised, so a lost `lower` can never wedge the whole run.
pub const MAX_GATE_WAIT: Duration = Duration::from_secs(120);

/// Shared cooldown signal raised on rate-limit responses.
#[derive(Debug, Default)]
pub struct CooldownGate {
    until: Mutex<Option<Instant>>,
    notify: Notify,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the gate for `wait`. Callers entering `wait_ready` will block
    /// until the deadline passes or the gate is lowered.
    pub fn raise(&self, wait: Duration) {
        let mut until = self.until.lock().unwrap();
        *until = Some(Instant::now() + wait);
    }

    /// Lower the gate and release every waiter.
    pub fn lower(&self) {
        {
            let mut until = self.until.lock().unwrap();
            *until = None;
        }
        self.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        let until = self.until.lock().unwrap();
        matches!(*until, Some(t) if t > Instant::now())
    }

    /// Wait until the gate is lowered or expired, capped at [`MAX_GATE_WAIT`].
    pub async fn wait_ready(&self) {
        let cap = Instant::now() + MAX_GATE_WAIT;
        loop {
            let deadline = {
                let until = self.until.lock().unwrap();
                match *until {
                    Some(t) if t > Instant::now() => Some(t),
                    _ => None,
                }
            };
            let Some(deadline) = deadline else { return };

            let now = Instant::now();
            if now >= cap {
                return;
            }
            let sleep_for = deadline.min(cap).saturating_duration_since(now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_gate_does_not_block() {
        let gate = CooldownGate::new();
        let start = Instant::now();
        gate.wait_ready().await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!gate.is_raised());
    }

    #[tokio::test]
    async fn test_raised_gate_blocks_until_deadline() {
        let gate = CooldownGate::new();
        gate.raise(Duration::from_millis(80));
        assert!(gate.is_raised());
        let start = Instant::now();
        gate.wait_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(!gate.is_raised());
    }

    #[tokio::test]
    async fn test_lower_releases_all_waiters() {
        let gate = Arc::new(CooldownGate::new());
        gate.raise(Duration::from_secs(60));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            waiters.push(tokio::spawn(async move {
                let start = Instant::now();
                gate.wait_ready().await;
                start.elapsed()
            }));
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.lower();

        for waiter in waiters {
            let waited = waiter.await.unwrap();
            assert!(waited < Duration::from_secs(5));
            assert!(waited >= Duration::from_millis(20));
        }
    }
}
