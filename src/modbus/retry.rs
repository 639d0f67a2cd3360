use async_trait::async_trait;
use std::time::Duration;

/// Fixed-delay, fixed-count retry policy. Delays never grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32 },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Bounded-attempt state machine driving one retried operation.
///
/// Idle -> Attempting -> (Succeeded | Retrying -> Attempting ... | Exhausted)
#[derive(Debug)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn start(&mut self) -> RetryState {
        if self.state == RetryState::Idle {
            self.state = RetryState::Attempting { attempt: 1 };
        }
        self.state
    }

    pub fn record_success(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Succeeded { attempts: attempt };
        }
        self.state
    }

    pub fn record_failure(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = if attempt < self.policy.attempts {
                RetryState::Retrying { attempt }
            } else {
                RetryState::Exhausted { attempts: attempt }
            };
        }
        self.state
    }

    /// Leave Retrying once the delay has been served.
    pub fn next_attempt(&mut self) -> RetryState {
        if let RetryState::Retrying { attempt } = self.state {
            self.state = RetryState::Attempting {
                attempt: attempt + 1,
            };
        }
        self.state
    }
}

/// Source of the delay between attempts; swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_after_configured_attempts() {
        let mut machine = RetryMachine::new(RetryPolicy::new(3, Duration::from_millis(100)));
        assert_eq!(machine.state(), RetryState::Idle);
        assert_eq!(machine.start(), RetryState::Attempting { attempt: 1 });
        assert_eq!(machine.record_failure(), RetryState::Retrying { attempt: 1 });
        assert_eq!(machine.next_attempt(), RetryState::Attempting { attempt: 2 });
        assert_eq!(machine.record_failure(), RetryState::Retrying { attempt: 2 });
        assert_eq!(machine.next_attempt(), RetryState::Attempting { attempt: 3 });
        assert_eq!(machine.record_failure(), RetryState::Exhausted { attempts: 3 });
        // terminal
        assert_eq!(machine.next_attempt(), RetryState::Exhausted { attempts: 3 });
    }

    #[test]
    fn succeeds_mid_way() {
        let mut machine = RetryMachine::new(RetryPolicy::new(3, Duration::ZERO));
        machine.start();
        machine.record_failure();
        machine.next_attempt();
        assert_eq!(machine.record_success(), RetryState::Succeeded { attempts: 2 });
        assert_eq!(machine.record_failure(), RetryState::Succeeded { attempts: 2 });
    }

    #[test]
    fn at_least_one_attempt() {
        let mut machine = RetryMachine::new(RetryPolicy::new(0, Duration::ZERO));
        machine.start();
        assert_eq!(machine.record_failure(), RetryState::Exhausted { attempts: 1 });
    }
}
