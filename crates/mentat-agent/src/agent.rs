use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mentat_core::{EngineConfig, LlmClient};

use crate::actr::ActRResolver;
use crate::evaluator::{CodeEvaluator, FitnessEvaluator};
use crate::evolution::EvolutionarySolver;
use crate::goal::{Goal, GoalStatus};
use crate::impasse::{classify, Decision, Impasse};
use crate::memory::{Chunk, UnifiedMemory, WorkingMemory};
use crate::metacog::{operator_ambiguity, CodeFixClassifier, MetaCognitiveMonitor, ResolutionPath};
use crate::operator::{Operator, OperatorResult};
use crate::operators::{materialize, ApplyFixOperator};
use crate::rules::{first_file_mention, is_exploration_goal, Proposal, RuleRegistry};
use crate::safety::SafetyMiddleware;
use crate::state::AgentState;

/// Error-log entry for the fatal no-candidates-no-LLM impasse.
pub const NO_OPERATORS_ERROR: &str = "no operators available";
/// Past solutions injected into resolver prompts.
const HISTORY_RESULTS: usize = 3;

/// Which tier selected the operator. Chunks are minted only for heuristic
/// and evolutionary selections; symbolic reflexes are already cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionTier {
    Symbolic,
    Heuristic,
    Evolution,
}

/// The decision engine.
///
/// Wires the rule engine, impasse detector, meta-cognitive monitor, ACT-R
/// resolver, evolutionary solver, unified memory and safety middleware into
/// the propose/decide/apply cycle behind [`CognitiveAgent::solve`].
pub struct CognitiveAgent {
    config: EngineConfig,
    llm: Option<Arc<LlmClient>>,
    rules: RuleRegistry,
    memory: UnifiedMemory,
    safety: SafetyMiddleware,
    resolver: Option<ActRResolver>,
    solver: Option<EvolutionarySolver>,
    monitor: MetaCognitiveMonitor,
    cancel: Arc<AtomicBool>,
}

impl CognitiveAgent {
    /// Build an agent. `llm: None` runs in pure symbolic mode.
    pub fn new(config: EngineConfig, llm: Option<Arc<LlmClient>>, memory: UnifiedMemory) -> Self {
        let config = config.normalized();
        let resolver = llm.clone().map(|client| ActRResolver::new(client, &config));
        let solver = if config.evolution_enabled {
            llm.clone().map(|client| {
                EvolutionarySolver::new(
                    client,
                    Arc::new(CodeEvaluator::default()) as Arc<dyn FitnessEvaluator>,
                    &config,
                )
            })
        } else {
            None
        };
        let monitor = MetaCognitiveMonitor::new(&config);
        Self {
            config,
            llm,
            rules: RuleRegistry::with_default_rules(),
            memory,
            safety: SafetyMiddleware::permissive(),
            resolver,
            solver,
            monitor,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_safety(mut self, safety: SafetyMiddleware) -> Self {
        self.safety = safety;
        self
    }

    /// Replace the sandbox evaluator behind the evolutionary solver.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn FitnessEvaluator>) -> Self {
        if self.config.evolution_enabled {
            if let Some(llm) = &self.llm {
                self.solver = Some(EvolutionarySolver::new(llm.clone(), evaluator, &self.config));
            }
        }
        self
    }

    pub fn with_code_fix_classifier(mut self, classifier: CodeFixClassifier) -> Self {
        self.monitor = self.monitor.with_code_fix_classifier(classifier);
        self
    }

    /// Deterministic utility noise for tests.
    pub fn with_seeded_noise(mut self, seed: u64) -> Self {
        self.resolver = self.resolver.map(|r| r.with_seeded_rng(seed));
        self
    }

    /// Flag checked at the top of every cycle; set it to cancel between
    /// cycles.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn safety(&self) -> &SafetyMiddleware {
        &self.safety
    }

    pub fn memory(&self) -> &UnifiedMemory {
        &self.memory
    }

    /// Run the decision cycle until the root goal resolves, the cycle
    /// budget runs out, or an unrecoverable impasse is hit.
    pub async fn solve(
        &mut self,
        goal_description: &str,
        initial_state: AgentState,
        verbose: bool,
    ) -> (bool, AgentState) {
        let mut wm = WorkingMemory::new(goal_description, initial_state);
        self.memory
            .push_context(goal_description, wm.current_state(), None)
            .await;
        self.monitor.reset_timer();

        let max_cycles = self.config.cognitive_max_cycles;
        let mut success = false;
        let mut cycle = 0;

        while cycle < max_cycles {
            cycle += 1;

            if self.cancel.load(Ordering::SeqCst) {
                wm.annotate_error("solve cancelled by caller");
                wm.mark_root(GoalStatus::Failure);
                break;
            }

            let goal = wm.goals().current().clone();
            let state = wm.current_state().clone();
            if verbose {
                info!(
                    "agent.cycle cycle={cycle} depth={} goal='{}'",
                    wm.goals().depth(),
                    goal.description
                );
            }

            let synthetic = self.memory.synthetic_rules(&state, &goal.description).await;
            let proposals = self.rules.propose(&state, &goal, &synthetic);

            let mut decision = classify(&proposals, &state, &goal);
            // A detected loop forbids quietly re-applying the same reflex;
            // force the impasse machinery to reconsider.
            let looped_operator = match (&decision, wm.has_loop()) {
                (Decision::Apply(proposal), true) => Some(proposal.operator.clone()),
                _ => None,
            };
            if let Some(operator) = looped_operator {
                if verbose {
                    info!("agent.loop_detected op={}", operator.name());
                }
                decision = Decision::Stuck(Impasse::OperatorNoChange(operator));
            }

            match decision {
                Decision::Apply(proposal) => {
                    let reason = proposal.reason.clone();
                    self.apply_and_record(
                        &mut wm,
                        proposal.operator,
                        None,
                        None,
                        &reason,
                        SelectionTier::Symbolic,
                        verbose,
                    )
                    .await;
                }
                Decision::Stuck(impasse) => {
                    if !self.resolve_impasse(&mut wm, impasse, &proposals, verbose).await {
                        break;
                    }
                }
            }

            self.settle_goals(&mut wm).await;
            match wm.goals().root_status() {
                GoalStatus::Success => {
                    success = true;
                    break;
                }
                GoalStatus::Failure => break,
                GoalStatus::Active => {}
            }
        }

        if wm.goals().root_status() == GoalStatus::Active {
            debug!("agent.cycle_budget_exhausted max_cycles={max_cycles}");
            wm.mark_root(GoalStatus::Failure);
        }

        let status = wm.goals().root_status();
        while self.memory.get_active_context().is_some() {
            self.memory.pop_context(status, None, None).await;
        }

        if verbose {
            info!("agent.solve_done success={success} cycles={cycle}");
            debug!("agent.trace\n{}", wm.trace());
        }
        (success, wm.current_state().clone())
    }

    /// Route an impasse through the monitor. Returns `false` on the fatal
    /// no-LLM path, with the root already marked failed.
    async fn resolve_impasse(
        &mut self,
        wm: &mut WorkingMemory,
        impasse: Impasse,
        proposals: &[Proposal],
        verbose: bool,
    ) -> bool {
        self.monitor.note_impasse();
        let goal = wm.goals().current().clone();

        let looping = wm.has_loop();
        let ambiguity = operator_ambiguity(Some(&impasse));
        let metrics = self.monitor.metrics(wm.goals().depth(), ambiguity);
        let pressure = self.monitor.pressure(&metrics, looping);
        if verbose {
            info!(
                "agent.impasse kind={} pressure={pressure:.2} loop={looping} depth={}",
                impasse.label(),
                metrics.goal_depth
            );
        }

        // No candidates and no LLM: nothing can ever propose again.
        if matches!(impasse, Impasse::NoChange) && self.llm.is_none() {
            wm.annotate_error(NO_OPERATORS_ERROR);
            wm.mark_root(GoalStatus::Failure);
            return false;
        }

        match self.monitor.route(pressure, &impasse, &goal.description) {
            ResolutionPath::Proceed => {
                if let Impasse::OperatorNoChange(operator) = impasse {
                    self.apply_and_record(
                        wm,
                        operator,
                        None,
                        None,
                        "inapplicable_top_operator",
                        SelectionTier::Symbolic,
                        verbose,
                    )
                    .await;
                }
                true
            }
            ResolutionPath::Subgoal => {
                let description = subgoal_description(&impasse, &goal);
                if wm.goals().current().description != description {
                    let parent = self.memory.get_active_context().map(|c| c.id.clone());
                    let state = wm.current_state().clone();
                    wm.push_goal(&description, goal.priority);
                    self.memory.push_context(&description, &state, parent).await;
                    if verbose {
                        info!("agent.subgoal description='{description}'");
                    }
                }
                true
            }
            ResolutionPath::Heuristic => {
                self.resolve_heuristically(wm, &impasse, proposals, verbose).await
            }
            ResolutionPath::Evolution => {
                if self.solver.is_some() {
                    self.resolve_by_evolution(wm, verbose).await;
                    true
                } else {
                    self.resolve_heuristically(wm, &impasse, proposals, verbose).await
                }
            }
        }
    }

    /// ACT-R tier. Returns `false` only on the fatal no-candidates path.
    async fn resolve_heuristically(
        &mut self,
        wm: &mut WorkingMemory,
        impasse: &Impasse,
        proposals: &[Proposal],
        verbose: bool,
    ) -> bool {
        let goal = wm.goals().current().clone();
        let state = wm.current_state().clone();

        if self.resolver.is_none() {
            return self.degrade_symbolically(wm, proposals, verbose).await;
        }

        let candidates: Vec<Arc<dyn Operator>> = match impasse {
            Impasse::Tie(ops) | Impasse::Conflict(ops) => ops.clone(),
            Impasse::OperatorNoChange(_) => proposals.iter().map(|p| p.operator.clone()).collect(),
            Impasse::NoChange => {
                let specs = match &self.resolver {
                    Some(resolver) => resolver.generate_operators(&state, &goal).await,
                    None => Vec::new(),
                };
                let generated: Vec<Arc<dyn Operator>> =
                    specs.iter().filter_map(materialize).collect();
                if generated.is_empty() {
                    wm.annotate_error(NO_OPERATORS_ERROR);
                    wm.mark_root(GoalStatus::Failure);
                    return false;
                }
                if verbose {
                    info!("agent.generated_operators count={}", generated.len());
                }
                generated
            }
        };

        let history = self
            .memory
            .retrieve_relevant_history(&goal.description, HISTORY_RESULTS)
            .await;
        let selection = match &self.resolver {
            Some(resolver) => resolver.resolve(&candidates, &state, &goal, wm, &history).await,
            None => None,
        };

        match selection {
            Some(selection) => {
                let reasoning = selection.reasoning.clone();
                self.apply_and_record(
                    wm,
                    selection.operator,
                    Some(selection.utility),
                    Some(selection.utility),
                    &reasoning,
                    SelectionTier::Heuristic,
                    verbose,
                )
                .await;
                true
            }
            None => {
                // No selection: evolution picks up code-fix goals,
                // everything else degrades to pure symbolic mode.
                if self.monitor.is_code_fix_goal(&goal.description) && self.solver.is_some() {
                    self.resolve_by_evolution(wm, verbose).await;
                    return true;
                }
                if matches!(impasse, Impasse::NoChange) {
                    wm.annotate_error(NO_OPERATORS_ERROR);
                    wm.mark_root(GoalStatus::Failure);
                    return false;
                }
                self.degrade_symbolically(wm, proposals, verbose).await
            }
        }
    }

    /// Pure-symbolic fallback when the LLM is unavailable: take the top
    /// proposal as-is.
    async fn degrade_symbolically(
        &mut self,
        wm: &mut WorkingMemory,
        proposals: &[Proposal],
        verbose: bool,
    ) -> bool {
        match proposals.first() {
            Some(top) => {
                warn!("agent.degraded_symbolic op={}", top.operator.name());
                self.apply_and_record(
                    wm,
                    top.operator.clone(),
                    None,
                    None,
                    "degraded_symbolic",
                    SelectionTier::Symbolic,
                    verbose,
                )
                .await;
                true
            }
            None => {
                wm.annotate_error(NO_OPERATORS_ERROR);
                wm.mark_root(GoalStatus::Failure);
                false
            }
        }
    }

    /// Evolutionary tier: repair the file implicated by the latest error.
    async fn resolve_by_evolution(&mut self, wm: &mut WorkingMemory, verbose: bool) {
        let goal = wm.goals().current().clone();
        let state = wm.current_state().clone();

        let target = state
            .latest_error()
            .and_then(first_file_mention)
            .or_else(|| first_file_mention(&goal.description))
            .or_else(|| state.files.keys().next().cloned());
        let Some(target) = target else {
            wm.annotate_error("evolution found no repair target");
            return;
        };

        let error_context = state.latest_error().unwrap_or("(no recorded error)").to_string();
        let original = state
            .files
            .get(&target)
            .map(|record| record.content.clone())
            .unwrap_or_default();

        let best = match &self.solver {
            Some(solver) => {
                solver
                    .evolve(&error_context, &goal.description, &original, None)
                    .await
            }
            None => None,
        };

        match best {
            Some(best) => {
                if verbose {
                    info!(
                        "agent.evolution_best score={} hypothesis='{}'",
                        best.report.score, best.candidate.hypothesis
                    );
                }
                let reasoning = best.candidate.reasoning.clone();
                let operator = Arc::new(ApplyFixOperator::new(
                    target,
                    best.candidate.code_patch.clone(),
                )) as Arc<dyn Operator>;
                self.apply_and_record(
                    wm,
                    operator,
                    None,
                    Some(best.report.score as f64),
                    &reasoning,
                    SelectionTier::Evolution,
                    verbose,
                )
                .await;
            }
            None => {
                wm.annotate_error("evolutionary solver returned no candidate");
            }
        }
    }

    /// Gate, execute, and record one operator application. Returns whether
    /// it succeeded.
    #[allow(clippy::too_many_arguments)]
    async fn apply_and_record(
        &mut self,
        wm: &mut WorkingMemory,
        operator: Arc<dyn Operator>,
        utility: Option<f64>,
        chunk_utility: Option<f64>,
        reasoning: &str,
        tier: SelectionTier,
        verbose: bool,
    ) -> bool {
        let goal = wm.goals().current().clone();
        let state = wm.current_state().clone();
        let pre_signature = state.signature(&goal.description);
        let pre_hash = state.content_hash();
        let name = operator.name();

        let result = self
            .safety
            .execute_with_safety(operator.as_ref(), &state, utility, reasoning, verbose)
            .await;

        // Failures surface in the error log even when the operator produced
        // no successor state.
        let recorded = if !result.success && result.new_state.is_none() {
            let mut next = state.successor();
            next.push_error(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{name} failed")),
            );
            OperatorResult {
                success: false,
                new_state: Some(next),
                output: result.output.clone(),
                error: result.error.clone(),
            }
        } else {
            result
        };

        wm.record_transition(&name, &recorded);
        if wm.current_state().content_hash() != pre_hash {
            self.monitor.reset_timer();
        }
        if verbose {
            info!(
                "agent.operator op={name} tier={tier:?} success={}",
                recorded.success
            );
        }

        // Reused chunk rules feed their outcome back into the store.
        if let Some(chunk_id) = reasoning.strip_prefix("chunk:") {
            if let Err(e) = self.memory.update_success(chunk_id, recorded.success).await {
                warn!("agent.chunk_update_failed err={e:#}");
            }
        }

        // Chunk creation happens-after the successful transition; a failed
        // write leaves the transition standing.
        if recorded.success && matches!(tier, SelectionTier::Heuristic | SelectionTier::Evolution) {
            let chunk = Chunk::new(
                pre_signature,
                &name,
                serde_json::to_value(operator.spec()).unwrap_or(serde_json::Value::Null),
                &goal.description,
                chunk_utility,
            );
            if let Err(e) = self.memory.store_chunk(&chunk).await {
                warn!("agent.chunk_store_failed err={e:#}");
            } else if verbose {
                info!("agent.chunk_created op={name}");
            }
        }

        recorded.success
    }

    /// Pop satisfied goals, sealing their persisted frames; the root is
    /// marked instead of popped.
    async fn settle_goals(&mut self, wm: &mut WorkingMemory) {
        loop {
            let current = wm.goals().current().clone();
            if !self.goal_satisfied(wm, &current) {
                break;
            }
            let resolution = wm.transitions().last().map(|t| t.operator.clone());
            if wm.goals().height() == 1 {
                wm.mark_root(GoalStatus::Success);
                break;
            }
            wm.pop_goal(GoalStatus::Success);
            self.memory
                .pop_context(GoalStatus::Success, resolution, None)
                .await;
        }
    }

    /// Conservative goal-completion heuristics over the observable state.
    fn goal_satisfied(&self, wm: &WorkingMemory, goal: &Goal) -> bool {
        let state = wm.current_state();
        let description = &goal.description;

        if self.monitor.is_code_fix_goal(description) {
            // A fix goal closes when a repair landed successfully.
            return wm
                .transitions()
                .last()
                .map(|t| t.success && t.operator.starts_with("apply_fix"))
                .unwrap_or(false);
        }
        if let Some(path) = first_file_mention(description) {
            return state.is_file_open(&path);
        }
        if is_exploration_goal(description) {
            return state.last_command_output.is_some();
        }
        false
    }
}

/// Describe the sub-goal that could dissolve an impasse.
fn subgoal_description(impasse: &Impasse, goal: &Goal) -> String {
    match impasse {
        Impasse::NoChange => format!(
            "Explore the workspace to gather context for: {}",
            goal.description
        ),
        Impasse::Tie(ops) | Impasse::Conflict(ops) => {
            let names: Vec<String> = ops.iter().map(|o| o.name()).collect();
            format!(
                "Gather evidence to choose between: {} (for: {})",
                names.join(", "),
                goal.description
            )
        }
        Impasse::OperatorNoChange(op) => {
            format!("Make {} applicable for: {}", op.name(), goal.description)
        }
    }
}
