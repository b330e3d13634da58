use std::sync::Arc;

use crate::goal::Goal;
use crate::operator::Operator;
use crate::rules::Proposal;
use crate::state::AgentState;

const PRIORITY_EPSILON: f64 = 1e-9;

/// A decision-cycle outcome the rule engine could not resolve by itself.
pub enum Impasse {
    /// No proposals at all.
    NoChange,
    /// Two or more proposals share the top priority.
    Tie(Vec<Arc<dyn Operator>>),
    /// Reserved for policies with incomparable priorities; the default
    /// policy never produces it.
    #[allow(dead_code)]
    Conflict(Vec<Arc<dyn Operator>>),
    /// A winner was selected but is inapplicable in the current state.
    OperatorNoChange(Arc<dyn Operator>),
}

impl Impasse {
    pub fn label(&self) -> &'static str {
        match self {
            Impasse::NoChange => "no_change",
            Impasse::Tie(_) => "tie",
            Impasse::Conflict(_) => "conflict",
            Impasse::OperatorNoChange(_) => "operator_no_change",
        }
    }
}

/// Outcome of classifying a proposal list.
pub enum Decision {
    /// A single applicable winner; apply it.
    Apply(Proposal),
    /// Escalate to the meta-cognitive monitor.
    Stuck(Impasse),
}

/// Classify an ordered proposal list.
pub fn classify(proposals: &[Proposal], state: &AgentState, goal: &Goal) -> Decision {
    match proposals {
        [] => Decision::Stuck(Impasse::NoChange),
        [only] => {
            if only.operator.is_applicable(state, goal) {
                Decision::Apply(only.clone())
            } else {
                Decision::Stuck(Impasse::OperatorNoChange(only.operator.clone()))
            }
        }
        [top, ..] => {
            let tied: Vec<_> = proposals
                .iter()
                .filter(|p| (p.priority - top.priority).abs() < PRIORITY_EPSILON)
                .collect();
            if tied.len() >= 2 {
                return Decision::Stuck(Impasse::Tie(
                    tied.into_iter().map(|p| p.operator.clone()).collect(),
                ));
            }
            if top.operator.is_applicable(state, goal) {
                Decision::Apply(top.clone())
            } else {
                Decision::Stuck(Impasse::OperatorNoChange(top.operator.clone()))
            }
        }
    }
}
