//! Iteration and time budget helpers.

use std::time::{Duration, Instant};

/// Iterations still available to the session.
pub fn remaining_iterations(iteration: u32, max_iterations: u32) -> u32 {
    max_iterations.saturating_sub(iteration)
}

pub fn has_budget(iteration: u32, max_iterations: u32) -> bool {
    iteration < max_iterations
}

/// Absolute deadline for an execution started now, if a timeout is configured.
pub fn deadline_from(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

/// True once `deadline` has passed. `None` never expires.
pub fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
