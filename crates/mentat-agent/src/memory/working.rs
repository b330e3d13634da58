use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::goal::{GoalId, GoalStack, GoalStatus};
use crate::operator::OperatorResult;
use crate::state::AgentState;

/// Ring capacity for retained transitions.
pub const TRANSITION_CAPACITY: usize = 100;
/// Consecutive identical failures that count as a loop.
pub const LOOP_WINDOW: usize = 3;

/// One recorded operator application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub operator: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_state: String,
    pub to_state: String,
}

/// Per-solve working memory: goal stack, state snapshots, the transition
/// ring, and the tabu action-count table.
///
/// Action counts are deliberately not rewound by [`WorkingMemory::rollback`]:
/// the tabu history must survive rollbacks or the engine re-enters the loop
/// it just escaped.
pub struct WorkingMemory {
    goals: GoalStack,
    snapshots: Vec<AgentState>,
    transitions: VecDeque<Transition>,
    action_counts: HashMap<String, u64>,
    loop_window: usize,
    last_timestamp: Option<DateTime<Utc>>,
}

impl WorkingMemory {
    pub fn new(root_goal: impl Into<String>, initial_state: AgentState) -> Self {
        Self {
            goals: GoalStack::new(root_goal, 1.0),
            snapshots: vec![initial_state],
            transitions: VecDeque::new(),
            action_counts: HashMap::new(),
            loop_window: LOOP_WINDOW,
            last_timestamp: None,
        }
    }

    pub fn goals(&self) -> &GoalStack {
        &self.goals
    }

    pub fn current_state(&self) -> &AgentState {
        self.snapshots.last().expect("initial snapshot always present")
    }

    pub fn push_goal(&mut self, description: impl Into<String>, priority: f64) -> GoalId {
        self.goals.push(description, priority)
    }

    pub fn pop_goal(&mut self, status: GoalStatus) -> Option<GoalId> {
        self.goals.pop(status)
    }

    pub fn mark_root(&mut self, status: GoalStatus) {
        self.goals.mark_root(status);
    }

    /// Record an applied operator and, on success, advance the state.
    ///
    /// Timestamps are strictly monotonic so transitions form a total order
    /// even when cycles complete inside one clock tick.
    pub fn record_transition(&mut self, operator_name: &str, result: &OperatorResult) {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);

        let from_state = self.current_state().content_hash();
        if let Some(new_state) = &result.new_state {
            self.snapshots.push(new_state.clone());
        }
        let to_state = self.current_state().content_hash();

        self.transitions.push_back(Transition {
            operator: operator_name.to_string(),
            success: result.success,
            error: result.error.clone(),
            timestamp: now,
            from_state,
            to_state,
        });
        while self.transitions.len() > TRANSITION_CAPACITY {
            self.transitions.pop_front();
        }

        *self.action_counts.entry(operator_name.to_string()).or_insert(0) += 1;
    }

    /// Append an engine-level error to the current state's error log.
    pub fn annotate_error(&mut self, message: impl Into<String>) {
        let mut next = self.current_state().successor();
        next.push_error(message);
        self.snapshots.push(next);
    }

    /// Revert up to `k` snapshots, never past the initial state. Action
    /// counts and the transition ring stay untouched.
    pub fn rollback(&mut self, k: usize) -> &AgentState {
        for _ in 0..k {
            if self.snapshots.len() <= 1 {
                break;
            }
            self.snapshots.pop();
        }
        self.current_state()
    }

    /// True when the last [`LOOP_WINDOW`] transitions used the same operator
    /// and all failed.
    pub fn has_loop(&self) -> bool {
        if self.transitions.len() < self.loop_window {
            return false;
        }
        let recent: Vec<_> = self
            .transitions
            .iter()
            .rev()
            .take(self.loop_window)
            .collect();
        let name = &recent[0].operator;
        recent.iter().all(|t| !t.success && &t.operator == name)
    }

    pub fn action_count(&self, operator_name: &str) -> u64 {
        self.action_counts.get(operator_name).copied().unwrap_or(0)
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Compact human/LLM-readable execution trace.
    pub fn trace(&self) -> String {
        if self.transitions.is_empty() {
            return "(no transitions)".to_string();
        }
        self.transitions
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let status = if t.success {
                    "ok".to_string()
                } else {
                    format!("ERR {}", t.error.as_deref().unwrap_or("unknown"))
                };
                format!("{}. {} [{}] at {}", i + 1, t.operator, status, t.timestamp.to_rfc3339())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(state: &AgentState) -> OperatorResult {
        let mut next = state.successor();
        next.last_command_output = Some("done".to_string());
        OperatorResult::succeeded(next, "done")
    }

    fn failed_result() -> OperatorResult {
        OperatorResult::failed("boom")
    }

    #[test]
    fn test_action_counts_accumulate() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        for _ in 0..4 {
            wm.record_transition("read_file(a.py)", &failed_result());
        }
        assert_eq!(wm.action_count("read_file(a.py)"), 4);
        assert_eq!(wm.action_count("never_used"), 0);
    }

    #[test]
    fn test_loop_detection_needs_same_failing_operator() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        wm.record_transition("read_file(a.py)", &failed_result());
        wm.record_transition("read_file(a.py)", &failed_result());
        assert!(!wm.has_loop(), "two failures are not yet a loop");

        wm.record_transition("read_file(a.py)", &failed_result());
        assert!(wm.has_loop());

        // A success breaks the window.
        let state = wm.current_state().clone();
        wm.record_transition("read_file(a.py)", &ok_result(&state));
        assert!(!wm.has_loop());
    }

    #[test]
    fn test_mixed_operators_do_not_loop() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        wm.record_transition("read_file(a.py)", &failed_result());
        wm.record_transition("read_file(b.py)", &failed_result());
        wm.record_transition("read_file(a.py)", &failed_result());
        assert!(!wm.has_loop());
    }

    #[test]
    fn test_rollback_stops_at_initial_and_keeps_counts() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        let initial_hash = wm.current_state().content_hash();

        let state = wm.current_state().clone();
        wm.record_transition("list_directory(.)", &ok_result(&state));
        let advanced_hash = wm.current_state().content_hash();
        assert_ne!(initial_hash, advanced_hash);

        let reverted = wm.rollback(10).content_hash();
        assert_eq!(reverted, initial_hash);
        assert_eq!(wm.action_count("list_directory(.)"), 1, "tabu memory survives rollback");
        assert_eq!(wm.transition_count(), 1);
    }

    #[test]
    fn test_transition_timestamps_are_distinct() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        for _ in 0..10 {
            wm.record_transition("op", &failed_result());
        }
        let stamps: Vec<_> = wm.transitions().map(|t| t.timestamp).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_transition_ring_is_bounded() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        for _ in 0..(TRANSITION_CAPACITY + 5) {
            wm.record_transition("op", &failed_result());
        }
        assert_eq!(wm.transition_count(), TRANSITION_CAPACITY);
    }

    #[test]
    fn test_trace_mentions_operators_and_errors() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        wm.record_transition("read_file(a.py)", &failed_result());
        let trace = wm.trace();
        assert!(trace.contains("read_file(a.py)"));
        assert!(trace.contains("ERR boom"));
    }

    #[test]
    fn test_goal_stack_height_never_below_one() {
        let mut wm = WorkingMemory::new("goal", AgentState::new("/p"));
        wm.push_goal("sub", 1.0);
        assert_eq!(wm.goals().height(), 2);
        wm.pop_goal(GoalStatus::Success);
        wm.pop_goal(GoalStatus::Failure);
        wm.pop_goal(GoalStatus::Failure);
        assert_eq!(wm.goals().height(), 1);
    }
}
