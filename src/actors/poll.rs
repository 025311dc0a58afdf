use std::time::Duration;

use super::RunState;

/// Backoff and give-up limits for polling one actor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Hard ceiling measured from the start of the run.
    pub max_wait: Duration,
    /// Poll errors tolerated in a row before the run counts as failed.
    pub max_consecutive_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(300),
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Poll again after this long.
    Wait(Duration),
    Finished(RunState),
}

/// Poll bookkeeping for one run, free of any clock or runtime: the caller
/// feeds in each observation with the time elapsed since the run started and
/// gets back what to do next.
#[derive(Debug, Clone)]
pub struct RunTracker {
    policy: PollPolicy,
    state: RunState,
    next_interval: Duration,
    consecutive_errors: u32,
    polls: u32,
}

impl RunTracker {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            state: RunState::Created,
            next_interval: policy.initial_interval,
            consecutive_errors: 0,
            polls: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Record a status observation (`None` for a failed poll).
    pub fn observe(&mut self, status: Option<RunState>, elapsed: Duration) -> PollStep {
        self.polls += 1;

        match status {
            Some(state) if state.is_terminal() => {
                self.state = state;
                return PollStep::Finished(state);
            }
            Some(state) => {
                self.consecutive_errors = 0;
                self.state = state;
            }
            None => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > self.policy.max_consecutive_errors {
                    self.state = RunState::Failed;
                    return PollStep::Finished(RunState::Failed);
                }
            }
        }

        if elapsed >= self.policy.max_wait {
            self.state = RunState::TimedOut;
            return PollStep::Finished(RunState::TimedOut);
        }

        let wait = self.next_interval.min(self.policy.max_wait - elapsed);
        self.next_interval = (self.next_interval * 2).min(self.policy.max_interval);
        PollStep::Wait(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(120),
            max_consecutive_errors: 2,
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn interval_doubles_up_to_cap() {
        let mut tracker = RunTracker::new(policy());
        let mut elapsed = Duration::ZERO;
        let mut waits = Vec::new();
        for _ in 0..5 {
            match tracker.observe(Some(RunState::Running), elapsed) {
                PollStep::Wait(d) => {
                    waits.push(d.as_secs());
                    elapsed += d;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(waits, vec![5, 10, 20, 30, 30]);
        assert_eq!(tracker.state(), RunState::Running);
    }

    #[test]
    fn gives_up_at_max_wait_without_confirmation() {
        let mut tracker = RunTracker::new(policy());
        assert_eq!(
            tracker.observe(Some(RunState::Running), secs(110)),
            PollStep::Wait(secs(5))
        );
        // The last wait is trimmed so the deadline is hit exactly.
        assert_eq!(
            tracker.observe(Some(RunState::Running), secs(115)),
            PollStep::Wait(secs(5))
        );
        assert_eq!(
            tracker.observe(Some(RunState::Running), secs(120)),
            PollStep::Finished(RunState::TimedOut)
        );
        assert_eq!(tracker.state(), RunState::TimedOut);
    }

    #[test]
    fn terminal_status_finishes_immediately() {
        let mut tracker = RunTracker::new(policy());
        assert_eq!(
            tracker.observe(Some(RunState::Created), secs(0)),
            PollStep::Wait(secs(5))
        );
        assert_eq!(
            tracker.observe(Some(RunState::Succeeded), secs(5)),
            PollStep::Finished(RunState::Succeeded)
        );
        assert_eq!(tracker.polls(), 2);
    }

    #[test]
    fn too_many_poll_errors_in_a_row_fail_the_run() {
        let mut tracker = RunTracker::new(policy());
        assert!(matches!(tracker.observe(None, secs(0)), PollStep::Wait(_)));
        assert!(matches!(tracker.observe(None, secs(5)), PollStep::Wait(_)));
        assert_eq!(
            tracker.observe(None, secs(15)),
            PollStep::Finished(RunState::Failed)
        );
    }

    #[test]
    fn successful_poll_resets_error_streak() {
        let mut tracker = RunTracker::new(policy());
        tracker.observe(None, secs(0));
        tracker.observe(None, secs(5));
        tracker.observe(Some(RunState::Running), secs(15));
        tracker.observe(None, secs(35));
        assert!(matches!(tracker.observe(None, secs(65)), PollStep::Wait(_)));
    }
}
