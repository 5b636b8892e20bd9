//! Supervisor state machine, free of any I/O.
//!
//! ```text
//! stopped ──start──▶ starting ──marker──▶ running ⇄ unhealthy
//!                       ▲                    │
//!                       └──── restarting ◀───┘  (abnormal exit, under budget)
//! any ──exit──▶ stopped (code 0 or stop requested) | error (abnormal, over budget)
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Unhealthy => "unhealthy",
            ProcessState::Restarting => "restarting",
            ProcessState::Error => "error",
        }
    }
}

/// What to do after the child process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Respawn after the restart delay; `attempt` is the new restart count.
    Restart { attempt: u32 },
    /// No more respawns; the process settled in this state.
    Settle(ProcessState),
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ProcessState,
    restart_count: u32,
    max_restarts: u32,
    stop_requested: bool,
}

impl Lifecycle {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            state: ProcessState::Stopped,
            restart_count: 0,
            max_restarts,
            stop_requested: false,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Explicit start by the host. Gives the process a fresh restart budget.
    pub fn begin(&mut self) {
        self.state = ProcessState::Starting;
        self.restart_count = 0;
        self.stop_requested = false;
    }

    /// A respawn after `Restart` is about to happen.
    pub fn respawn(&mut self) {
        if !self.stop_requested {
            self.state = ProcessState::Starting;
        }
    }

    /// A startup marker was seen. Returns `true` when this promoted the
    /// process to running (first marker of this spawn).
    pub fn startup_marker(&mut self) -> bool {
        if self.stop_requested || self.state != ProcessState::Starting {
            return false;
        }
        self.state = ProcessState::Running;
        self.restart_count = 0;
        true
    }

    /// Apply a health probe outcome. Returns the new state if it changed.
    pub fn health(&mut self, healthy: bool) -> Option<ProcessState> {
        let next = match (self.state, healthy) {
            (ProcessState::Running, false) => ProcessState::Unhealthy,
            (ProcessState::Unhealthy, true) => ProcessState::Running,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    pub fn stop_requested(&mut self) {
        self.stop_requested = true;
        self.state = ProcessState::Stopped;
    }

    pub fn spawn_failed(&mut self) {
        self.state = ProcessState::Error;
    }

    /// Decide what follows an exit. `code` is `None` when the process was
    /// killed by a signal; anything but `Some(0)` counts as abnormal.
    pub fn exited(&mut self, code: Option<i32>) -> ExitDecision {
        if self.stop_requested {
            self.state = ProcessState::Stopped;
            return ExitDecision::Settle(ProcessState::Stopped);
        }

        let abnormal = code != Some(0);
        if abnormal && self.restart_count < self.max_restarts {
            self.restart_count += 1;
            self.state = ProcessState::Restarting;
            return ExitDecision::Restart { attempt: self.restart_count };
        }

        self.state = if abnormal { ProcessState::Error } else { ProcessState::Stopped };
        ExitDecision::Settle(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_is_exhausted_after_max_restarts() {
        let mut lc = Lifecycle::new(2);
        lc.begin();
        assert_eq!(lc.exited(Some(1)), ExitDecision::Restart { attempt: 1 });
        lc.respawn();
        assert_eq!(lc.exited(Some(1)), ExitDecision::Restart { attempt: 2 });
        lc.respawn();
        assert_eq!(lc.exited(Some(1)), ExitDecision::Settle(ProcessState::Error));
        assert_eq!(lc.restart_count(), 2);
        assert_eq!(lc.state(), ProcessState::Error);
    }

    #[test]
    fn clean_exit_settles_stopped_without_restart() {
        let mut lc = Lifecycle::new(3);
        lc.begin();
        assert_eq!(lc.exited(Some(0)), ExitDecision::Settle(ProcessState::Stopped));
        assert_eq!(lc.restart_count(), 0);
    }

    #[test]
    fn signal_kill_counts_as_abnormal() {
        let mut lc = Lifecycle::new(1);
        lc.begin();
        assert_eq!(lc.exited(None), ExitDecision::Restart { attempt: 1 });
    }

    #[test]
    fn startup_marker_resets_counter_once() {
        let mut lc = Lifecycle::new(3);
        lc.begin();
        lc.exited(Some(2));
        lc.respawn();
        assert_eq!(lc.restart_count(), 1);
        assert!(lc.startup_marker());
        assert_eq!(lc.state(), ProcessState::Running);
        assert_eq!(lc.restart_count(), 0);
        assert!(!lc.startup_marker());
    }

    #[test]
    fn health_flips_between_running_and_unhealthy() {
        let mut lc = Lifecycle::new(3);
        lc.begin();
        assert_eq!(lc.health(false), None);
        lc.startup_marker();
        assert_eq!(lc.health(true), None);
        assert_eq!(lc.health(false), Some(ProcessState::Unhealthy));
        assert_eq!(lc.health(false), None);
        assert_eq!(lc.health(true), Some(ProcessState::Running));
    }

    #[test]
    fn requested_stop_never_restarts() {
        let mut lc = Lifecycle::new(3);
        lc.begin();
        lc.startup_marker();
        lc.stop_requested();
        assert_eq!(lc.state(), ProcessState::Stopped);
        assert_eq!(lc.exited(None), ExitDecision::Settle(ProcessState::Stopped));
        assert!(!lc.startup_marker());
    }
}
