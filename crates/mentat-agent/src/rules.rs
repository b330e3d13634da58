use log::warn;
use regex::Regex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::goal::Goal;
use crate::operator::Operator;
use crate::operators::{ListDirectoryOperator, ReadFileOperator};
use crate::state::AgentState;

/// Priority at which memory-derived synthetic rules are injected; strictly
/// above every default rule.
pub const CHUNK_RULE_PRIORITY: f64 = 7.0;

pub type Condition = Arc<dyn Fn(&AgentState, &Goal) -> bool + Send + Sync>;
pub type OperatorFactory = Arc<dyn Fn(&AgentState, &Goal) -> Option<Arc<dyn Operator>> + Send + Sync>;

/// A production rule: condition predicate plus operator factory.
#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub priority: f64,
    condition: Condition,
    factory: OperatorFactory,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        priority: f64,
        condition: Condition,
        factory: OperatorFactory,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            condition,
            factory,
        }
    }

    /// Defensive condition evaluation: a panicking predicate is a non-match.
    fn matches(&self, state: &AgentState, goal: &Goal) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.condition)(state, goal))) {
            Ok(matched) => matched,
            Err(_) => {
                warn!("rule.condition_panicked rule={}", self.name);
                false
            }
        }
    }
}

/// One proposed operator, with the priority and rule that produced it.
#[derive(Clone)]
pub struct Proposal {
    pub operator: Arc<dyn Operator>,
    pub priority: f64,
    pub reason: String,
}

/// Ordered registry of production rules.
///
/// Registration order is the tie-break: proposals are sorted by descending
/// priority with a stable sort, so equal-priority rules surface in the order
/// they were registered.
pub struct RuleRegistry {
    rules: Vec<Rule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        for rule in default_rules() {
            registry.register(rule);
        }
        registry
    }

    pub fn register(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate synthetic (memory-derived) rules first, then the static
    /// registry, and return proposals in descending priority order.
    ///
    /// Rules never rewrite state, and each emits at most one operator.
    pub fn propose(&self, state: &AgentState, goal: &Goal, synthetic: &[Rule]) -> Vec<Proposal> {
        let mut proposals = Vec::new();
        for rule in synthetic.iter().chain(self.rules.iter()) {
            if !rule.matches(state, goal) {
                continue;
            }
            match (rule.factory)(state, goal) {
                Some(operator) => proposals.push(Proposal {
                    operator,
                    priority: rule.priority,
                    reason: rule.name.clone(),
                }),
                None => warn!("rule.factory_declined rule={}", rule.name),
            }
        }
        proposals.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        proposals
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

/// First source-file path mentioned in a piece of text.
pub fn first_file_mention(text: &str) -> Option<String> {
    let pattern = Regex::new(r"([\w./-]+\.(?:py|rs|js|jsx|ts|tsx|java|go|json|toml|yaml|txt))")
        .expect("static regex");
    pattern.captures(text).map(|c| c[1].to_string())
}

/// Does the goal read as "look at something" rather than "change something"?
pub fn is_inspection_goal(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["read", "inspect", "show", "view", "look at"]
        .iter()
        .any(|kw| lowered.contains(kw))
}

/// Does the goal ask for workspace exploration?
pub fn is_exploration_goal(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ["explore", "list", "search", "find", "gather", "browse"]
        .iter()
        .any(|kw| lowered.contains(kw))
}

/// The built-in rule set.
///
/// Priorities: error-driven open (6) > file-in-goal open (5) = inspection
/// read (5) > exploration listing (4) > explore-when-empty (3). The two
/// priority-5 conditions are disjoint so a goal naming one file yields one
/// proposal, not a structural tie.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "open_file_from_error",
            6.0,
            Arc::new(|state: &AgentState, _goal: &Goal| {
                state
                    .latest_error()
                    .and_then(first_file_mention)
                    .map(|path| !state.is_file_open(&path))
                    .unwrap_or(false)
            }),
            Arc::new(|state: &AgentState, _goal: &Goal| {
                let path = first_file_mention(state.latest_error()?)?;
                Some(Arc::new(ReadFileOperator::new(path)) as Arc<dyn Operator>)
            }),
        ),
        Rule::new(
            "open_file_in_goal",
            5.0,
            Arc::new(|state: &AgentState, goal: &Goal| {
                !is_inspection_goal(&goal.description)
                    && first_file_mention(&goal.description)
                        .map(|path| !state.is_file_open(&path))
                        .unwrap_or(false)
            }),
            Arc::new(|_state: &AgentState, goal: &Goal| {
                let path = first_file_mention(&goal.description)?;
                Some(Arc::new(ReadFileOperator::new(path)) as Arc<dyn Operator>)
            }),
        ),
        Rule::new(
            "inspect_named_file",
            5.0,
            Arc::new(|state: &AgentState, goal: &Goal| {
                is_inspection_goal(&goal.description)
                    && first_file_mention(&goal.description)
                        .map(|path| !state.is_file_open(&path))
                        .unwrap_or(false)
            }),
            Arc::new(|_state: &AgentState, goal: &Goal| {
                let path = first_file_mention(&goal.description)?;
                Some(Arc::new(ReadFileOperator::new(path)) as Arc<dyn Operator>)
            }),
        ),
        Rule::new(
            "explore_directory",
            4.0,
            Arc::new(|_state: &AgentState, goal: &Goal| is_exploration_goal(&goal.description)),
            Arc::new(|_state: &AgentState, _goal: &Goal| {
                Some(Arc::new(ListDirectoryOperator::new(None)) as Arc<dyn Operator>)
            }),
        ),
        Rule::new(
            "explore_when_empty",
            3.0,
            Arc::new(|state: &AgentState, _goal: &Goal| {
                state.files.is_empty()
                    && std::path::Path::new(&state.working_directory).is_dir()
            }),
            Arc::new(|_state: &AgentState, _goal: &Goal| {
                Some(Arc::new(ListDirectoryOperator::new(None)) as Arc<dyn Operator>)
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::GoalStack;

    fn goal(description: &str) -> Goal {
        let goals = GoalStack::new(description, 1.0);
        goals.current().clone()
    }

    fn render(proposals: &[Proposal]) -> Vec<(String, String)> {
        proposals
            .iter()
            .map(|p| (p.operator.name(), format!("{}@{}", p.reason, p.priority)))
            .collect()
    }

    #[test]
    fn test_inspection_goal_proposes_single_read() {
        let registry = RuleRegistry::with_default_rules();
        // Non-existent working directory: the empty-workspace explorer
        // stays quiet and only the inspection read fires.
        let state = AgentState::new("/p");
        let proposals = registry.propose(&state, &goal("Read main.py"), &[]);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].operator.name(), "read_file(main.py)");
        assert_eq!(proposals[0].reason, "inspect_named_file");
        assert_eq!(proposals[0].priority, 5.0);
    }

    #[test]
    fn test_empty_workspace_explorer_needs_real_directory() {
        let registry = RuleRegistry::with_default_rules();
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState::new(dir.path().to_string_lossy().to_string());

        let proposals = registry.propose(&state, &goal("Read main.py"), &[]);
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[1].reason, "explore_when_empty");
        assert_eq!(proposals[1].priority, 3.0);

        let vague = registry.propose(&AgentState::new("/does/not/exist"), &goal("Do something vague."), &[]);
        assert!(vague.is_empty());
    }

    #[test]
    fn test_error_rule_outranks_goal_rule() {
        let registry = RuleRegistry::with_default_rules();
        let mut state = AgentState::new("/p");
        state.push_error("NameError in utils.py: name 'x' is not defined");

        let proposals = registry.propose(&state, &goal("Fix helper.py"), &[]);
        assert_eq!(proposals[0].operator.name(), "read_file(utils.py)");
        assert_eq!(proposals[0].priority, 6.0);
        assert_eq!(proposals[1].operator.name(), "read_file(helper.py)");
    }

    #[test]
    fn test_proposals_are_idempotent() {
        let registry = RuleRegistry::with_default_rules();
        let mut state = AgentState::new("/p");
        state.push_error("error in a.py");

        let first = render(&registry.propose(&state, &goal("Fix b.py"), &[]));
        let second = render(&registry.propose(&state, &goal("Fix b.py"), &[]));
        assert_eq!(first, second);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let mut registry = RuleRegistry::new();
        for name in ["first", "second"] {
            registry.register(Rule::new(
                name,
                5.0,
                Arc::new(|_: &AgentState, _: &Goal| true),
                Arc::new(move |_: &AgentState, _: &Goal| {
                    Some(Arc::new(ListDirectoryOperator::new(None)) as Arc<dyn Operator>)
                }),
            ));
        }
        let proposals = registry.propose(&AgentState::new("/p"), &goal("anything"), &[]);
        assert_eq!(proposals[0].reason, "first");
        assert_eq!(proposals[1].reason, "second");
    }

    #[test]
    fn test_panicking_condition_is_non_match() {
        let mut registry = RuleRegistry::new();
        registry.register(Rule::new(
            "broken",
            9.0,
            Arc::new(|_: &AgentState, _: &Goal| panic!("bad predicate")),
            Arc::new(|_: &AgentState, _: &Goal| {
                Some(Arc::new(ListDirectoryOperator::new(None)) as Arc<dyn Operator>)
            }),
        ));
        registry.register(Rule::new(
            "sane",
            1.0,
            Arc::new(|_: &AgentState, _: &Goal| true),
            Arc::new(|_: &AgentState, _: &Goal| {
                Some(Arc::new(ListDirectoryOperator::new(None)) as Arc<dyn Operator>)
            }),
        ));

        let proposals = registry.propose(&AgentState::new("/p"), &goal("x"), &[]);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].reason, "sane");
    }

    #[test]
    fn test_synthetic_rules_evaluated_first_and_outrank() {
        let registry = RuleRegistry::with_default_rules();
        let synthetic = vec![Rule::new(
            "chunk:read_file(main.py)",
            CHUNK_RULE_PRIORITY,
            Arc::new(|_: &AgentState, _: &Goal| true),
            Arc::new(|_: &AgentState, _: &Goal| {
                Some(Arc::new(ReadFileOperator::new("main.py")) as Arc<dyn Operator>)
            }),
        )];

        let proposals = registry.propose(&AgentState::new("/p"), &goal("Read main.py"), &synthetic);
        assert_eq!(proposals[0].priority, CHUNK_RULE_PRIORITY);
        assert_eq!(proposals[0].reason, "chunk:read_file(main.py)");
    }

    #[test]
    fn test_file_mention_extraction() {
        assert_eq!(
            first_file_mention("trace in src/app.py line 3"),
            Some("src/app.py".to_string())
        );
        assert_eq!(first_file_mention("nothing here"), None);
    }
}
