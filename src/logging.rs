//! Structured logging scope for agent runs.
//!
//! The contract: every log record emitted while a step is executing carries
//! `{agent_uuid, run_id, step}`. Rather than relying on ambient state, the
//! scope is an explicit value the agent threads through its step loop and
//! hands to collaborators that log.

use std::fmt;

/// Identifies which agent, run, and step a log record belongs to.
///
/// Cheap to clone; `Display` renders the canonical
/// `agent=<uuid> run=<id> step=<n>` prefix used across the crate:
///
/// ```
/// use relay_agent::logging::RunScope;
///
/// let scope = RunScope::new("agent-1", "run-7").at_step(2);
/// log::info!("{scope} dispatching tools");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    pub agent_uuid: String,
    pub run_id: String,
    pub step: u32,
}

impl RunScope {
    /// Scope for a run before its first step.
    pub fn new(agent_uuid: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            agent_uuid: agent_uuid.into(),
            run_id: run_id.into(),
            step: 0,
        }
    }

    /// The same scope positioned at a specific step.
    pub fn at_step(&self, step: u32) -> Self {
        Self {
            agent_uuid: self.agent_uuid.clone(),
            run_id: self.run_id.clone(),
            step,
        }
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent={} run={} step={}",
            self.agent_uuid, self.run_id, self.step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let scope = RunScope::new("u-1", "r-9").at_step(4);
        assert_eq!(scope.to_string(), "agent=u-1 run=r-9 step=4");
    }

    #[test]
    fn test_at_step_does_not_mutate() {
        let scope = RunScope::new("u", "r");
        let stepped = scope.at_step(3);
        assert_eq!(scope.step, 0);
        assert_eq!(stepped.step, 3);
        assert_eq!(stepped.agent_uuid, "u");
    }
}
