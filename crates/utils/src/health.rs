//! Health-state derivation from consecutive-failure counters.
//!
//! Every monitored subsystem keeps an atomic count of consecutive failures;
//! the count maps onto a three-tier state. The overall state is the worst of
//! its inputs, with the runtime task count contributing a fifth signal.

use std::fmt;

/// Task count at which the runtime is considered degraded.
pub const TASKS_YELLOW_THRESHOLD: usize = 30_000;

/// Task count at which the runtime is considered unhealthy.
pub const TASKS_RED_THRESHOLD: usize = 100_000;

/// Three-tier subsystem health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    Green,
    Yellow,
    Red,
}

impl HealthState {
    /// Derive a state from a consecutive-failure count: 0–2 green, 3–9
    /// yellow, 10 and above red.
    pub fn from_consecutive_failures(count: i64) -> Self {
        if count <= 2 {
            HealthState::Green
        } else if count < 10 {
            HealthState::Yellow
        } else {
            HealthState::Red
        }
    }

    /// Derive a state from the number of alive runtime tasks.
    pub fn from_task_count(count: usize) -> Self {
        if count >= TASKS_RED_THRESHOLD {
            HealthState::Red
        } else if count >= TASKS_YELLOW_THRESHOLD {
            HealthState::Yellow
        } else {
            HealthState::Green
        }
    }

    /// The worst of a set of states; green when the set is empty.
    pub fn worst(states: impl IntoIterator<Item = HealthState>) -> Self {
        states
            .into_iter()
            .max()
            .unwrap_or(HealthState::Green)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Green => "GREEN",
            HealthState::Yellow => "YELLOW",
            HealthState::Red => "RED",
        }
    }

    /// HTTP status for external probes: yellow is still serving, red is not.
    pub fn http_status(&self) -> u16 {
        match self {
            HealthState::Green | HealthState::Yellow => 200,
            HealthState::Red => 503,
        }
    }

    /// Probe-facing status word.
    pub fn status_word(&self) -> &'static str {
        match self {
            HealthState::Green => "healthy",
            HealthState::Yellow => "degraded",
            HealthState::Red => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_table() {
        assert_eq!(HealthState::from_consecutive_failures(0), HealthState::Green);
        assert_eq!(HealthState::from_consecutive_failures(2), HealthState::Green);
        assert_eq!(HealthState::from_consecutive_failures(3), HealthState::Yellow);
        assert_eq!(HealthState::from_consecutive_failures(9), HealthState::Yellow);
        assert_eq!(HealthState::from_consecutive_failures(10), HealthState::Red);
        assert_eq!(HealthState::from_consecutive_failures(5_000), HealthState::Red);
    }

    #[test]
    fn worst_of_inputs() {
        use HealthState::*;
        assert_eq!(HealthState::worst([Green, Green]), Green);
        assert_eq!(HealthState::worst([Green, Yellow, Green]), Yellow);
        assert_eq!(HealthState::worst([Yellow, Red, Green]), Red);
        assert_eq!(HealthState::worst([]), Green);
    }

    #[test]
    fn task_count_signal() {
        assert_eq!(HealthState::from_task_count(100), HealthState::Green);
        assert_eq!(HealthState::from_task_count(30_000), HealthState::Yellow);
        assert_eq!(HealthState::from_task_count(100_000), HealthState::Red);
    }

    #[test]
    fn http_mapping() {
        assert_eq!(HealthState::Green.http_status(), 200);
        assert_eq!(HealthState::Yellow.http_status(), 200);
        assert_eq!(HealthState::Red.http_status(), 503);
    }
}
