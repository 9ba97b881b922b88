//! The execution engine: drives tokens through a validated process graph.
//!
//! One logical scheduler advances tokens. Gateway evaluation and token
//! bookkeeping never suspend; a service-task dispatch is the only
//! suspension point. Tokens spawned by a parallel fork dispatch their
//! handlers as independent tokio tasks so a slow branch never blocks its
//! siblings, and every handler result merges into the run context under a
//! single critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::{self, ProcessDefinitionInput};
use crate::events::RuntimeEvent;
use crate::gateway::{self, JoinBarrier, JoinOutcome};
use crate::handler::{HandlerError, HandlerRegistry, TaskHandler};
use crate::types::{
    ElementId, ElementKind, ExecutionResult, FailurePolicy, Fault, FaultKind, ProcessDefinition,
    Token, TokenState, VarMap,
};
use crate::validate::ValidationError;

/// Synchronous steps allowed between suspension points before the run is
/// aborted. Only reachable by condition-free gateway cycles.
const MAX_SYNC_STEPS: usize = 10_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown process definition `{0}`")]
    UnknownDefinition(String),
}

/// Owns the handler registry, the failure policy, and the deployed
/// definitions. One engine value per embedding; no module-level state.
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    policy: FailurePolicy,
    definitions: HashMap<String, Arc<ProcessDefinition>>,
}

impl Engine {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_policy(registry, FailurePolicy::default())
    }

    pub fn with_policy(registry: HandlerRegistry, policy: FailurePolicy) -> Self {
        Self {
            registry: Arc::new(registry),
            policy,
            definitions: HashMap::new(),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Load, validate, and store a definition under its id.
    pub fn deploy(&mut self, input: ProcessDefinitionInput) -> Result<(), ValidationError> {
        let def = definition::load(input)?;
        info!(definition = %def.id(), "deployed process definition");
        self.definitions.insert(def.id().to_string(), Arc::new(def));
        Ok(())
    }

    pub fn definition(&self, id: &str) -> Option<&ProcessDefinition> {
        self.definitions.get(id).map(Arc::as_ref)
    }

    /// Run a deployed definition.
    pub async fn execute(
        &self,
        definition_id: &str,
        initial_data: VarMap,
    ) -> Result<ExecutionResult, EngineError> {
        let def = self
            .definitions
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_string()))?;
        Ok(self.run(&def, initial_data).await)
    }

    /// Run a definition the caller already holds.
    pub async fn run(&self, def: &ProcessDefinition, initial_data: VarMap) -> ExecutionResult {
        Run::new(def, Arc::clone(&self.registry), self.policy, initial_data)
            .drive()
            .await
    }
}

/// A service-task dispatch queued during synchronous token advancement.
struct Dispatch {
    token_idx: usize,
    token_id: Uuid,
    element_id: ElementId,
    /// Where the token resumes after the handler completes.
    next: ElementId,
    task_type: String,
    handler: Arc<dyn TaskHandler>,
}

/// Identity of an in-flight handler task, keyed by tokio task id so a
/// panicking handler can still be attributed to its token.
struct Pending {
    token_idx: usize,
    token_id: Uuid,
    element_id: ElementId,
    next: ElementId,
}

/// Per-run state. Created at run start, discarded at completion.
struct Run<'a> {
    def: &'a ProcessDefinition,
    policy: FailurePolicy,
    run_id: Uuid,
    context: Arc<Mutex<VarMap>>,
    registry: Arc<HandlerRegistry>,
    tokens: Vec<Token>,
    path: Vec<ElementId>,
    events: Vec<RuntimeEvent>,
    faults: Vec<Fault>,
    barriers: HashMap<ElementId, JoinBarrier>,
    failed: bool,
}

impl<'a> Run<'a> {
    fn new(
        def: &'a ProcessDefinition,
        registry: Arc<HandlerRegistry>,
        policy: FailurePolicy,
        initial_data: VarMap,
    ) -> Self {
        Self {
            def,
            policy,
            run_id: Uuid::now_v7(),
            context: Arc::new(Mutex::new(initial_data)),
            registry,
            tokens: Vec::new(),
            path: Vec::new(),
            events: Vec::new(),
            faults: Vec::new(),
            barriers: HashMap::new(),
            failed: false,
        }
    }

    async fn drive(mut self) -> ExecutionResult {
        info!(run_id = %self.run_id, definition = %self.def.id(), "run started");
        self.events.push(RuntimeEvent::RunStarted {
            run_id: self.run_id,
            definition_id: self.def.id().to_string(),
            fingerprint: *self.def.fingerprint(),
        });

        let start = self.def.start().id.clone();
        self.spawn_token(start, None);

        loop {
            let dispatches = self.advance_ready_tokens();
            if dispatches.is_empty() {
                break;
            }
            self.dispatch_round(dispatches).await;
            if self.failed {
                break;
            }
        }

        self.finish()
    }

    /// Advance every Ready token until each is parked on a service task,
    /// waiting at a join, completed, or failed. Never suspends.
    fn advance_ready_tokens(&mut self) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut steps = 0usize;
        loop {
            if self.failed {
                return Vec::new();
            }
            let mut progressed = false;
            for idx in 0..self.tokens.len() {
                if self.tokens[idx].state != TokenState::Ready {
                    continue;
                }
                steps += 1;
                if steps > MAX_SYNC_STEPS {
                    let position = self.tokens[idx].position.clone();
                    self.fail_token(
                        idx,
                        Fault {
                            element_id: position,
                            kind: FaultKind::Routing,
                            message: "step limit exceeded; definition loops without tasks".into(),
                        },
                    );
                    return Vec::new();
                }
                self.step_token(idx, &mut dispatches);
                progressed = true;
            }
            if !progressed {
                return dispatches;
            }
        }
    }

    /// Process the element under one Ready token.
    fn step_token(&mut self, idx: usize, dispatches: &mut Vec<Dispatch>) {
        let def = self.def;
        let element_id = self.tokens[idx].position.clone();
        let token_id = self.tokens[idx].id;

        let Some(element) = def.element(&element_id) else {
            self.fail_token(
                idx,
                Fault {
                    element_id: element_id.clone(),
                    kind: FaultKind::Routing,
                    message: format!("token positioned at unknown element `{element_id}`"),
                },
            );
            return;
        };

        debug!(run_id = %self.run_id, token = %token_id, element = %element_id, kind = ?element.kind, "step");
        self.events.push(RuntimeEvent::ElementEntered {
            token_id,
            element_id: element_id.clone(),
        });

        match element.kind {
            ElementKind::Start => {
                self.path.push(element_id.clone());
                match def.outgoing(&element_id).first() {
                    Some(flow) => self.advance(idx, flow.target.clone()),
                    None => self.fail_no_outgoing(idx, element_id),
                }
            }

            ElementKind::End => {
                self.path.push(element_id.clone());
                self.tokens[idx].state = TokenState::Completed;
            }

            ElementKind::ServiceTask => {
                self.path.push(element_id.clone());
                let task_type = element.handler_key().to_string();
                let outgoing = def.outgoing(&element_id);
                let Some(flow) = outgoing.first() else {
                    self.fail_no_outgoing(idx, element_id);
                    return;
                };
                match self.registry.get(&task_type) {
                    Some(handler) => {
                        self.tokens[idx].state = TokenState::Waiting;
                        self.events.push(RuntimeEvent::HandlerDispatched {
                            token_id,
                            element_id: element_id.clone(),
                            task_type: task_type.clone(),
                        });
                        dispatches.push(Dispatch {
                            token_idx: idx,
                            token_id,
                            element_id,
                            next: flow.target.clone(),
                            task_type,
                            handler,
                        });
                    }
                    None => self.fail_token(
                        idx,
                        Fault {
                            element_id,
                            kind: FaultKind::Handler,
                            message: HandlerError::NotRegistered(task_type).to_string(),
                        },
                    ),
                }
            }

            ElementKind::ExclusiveGateway => {
                self.path.push(element_id.clone());
                let outgoing = def.outgoing(&element_id);
                let data = self.context.lock().expect("context lock").clone();
                match gateway::evaluate_exclusive(element, &outgoing, &data) {
                    Ok(flow) => {
                        self.events.push(RuntimeEvent::GatewayTaken {
                            gateway_id: element_id,
                            flow_id: flow.id.clone(),
                        });
                        self.advance(idx, flow.target.clone());
                    }
                    Err(fault) => self.fail_token(idx, fault),
                }
            }

            ElementKind::ParallelGateway => {
                if def.in_degree(&element_id) <= 1 {
                    self.fork(idx, element_id, token_id);
                } else {
                    self.join(idx, element_id, token_id);
                }
            }
        }
    }

    /// Parallel fork: one new token per outgoing flow, forking token retires.
    fn fork(&mut self, idx: usize, element_id: ElementId, token_id: Uuid) {
        self.path.push(element_id.clone());
        let targets: Vec<ElementId> = gateway::parallel_split(&self.def.outgoing(&element_id))
            .iter()
            .map(|flow| flow.target.clone())
            .collect();
        let mut children = Vec::with_capacity(targets.len());
        for target in targets {
            children.push(self.spawn_token(target, Some(token_id)));
        }
        self.events.push(RuntimeEvent::Forked {
            fork_id: element_id,
            child_tokens: children,
        });
        self.tokens[idx].state = TokenState::Completed;
    }

    /// Parallel join: park arrivals until the barrier releases, then
    /// collapse the waiting tokens into one released downstream.
    fn join(&mut self, idx: usize, element_id: ElementId, token_id: Uuid) {
        let required = self.def.in_degree(&element_id);
        let barrier = self
            .barriers
            .entry(element_id.clone())
            .or_insert_with(|| JoinBarrier::new(required));
        let outcome = barrier.arrive();
        let arrived = barrier.arrived();
        self.events.push(RuntimeEvent::JoinArrived {
            join_id: element_id.clone(),
            token_id,
            arrived,
            required,
        });

        match outcome {
            JoinOutcome::Waiting => self.tokens[idx].state = TokenState::Waiting,
            JoinOutcome::Release => {
                for token in &mut self.tokens {
                    if token.position == element_id && token.state == TokenState::Waiting {
                        token.state = TokenState::Completed;
                    }
                }
                self.tokens[idx].state = TokenState::Completed;
                self.barriers.remove(&element_id);
                self.path.push(element_id.clone());
                match self.def.outgoing(&element_id).first() {
                    Some(flow) => {
                        let released = self.spawn_token(flow.target.clone(), Some(token_id));
                        self.events.push(RuntimeEvent::JoinReleased {
                            join_id: element_id,
                            released_token: released,
                        });
                    }
                    None => self.fail_no_outgoing(idx, element_id),
                }
            }
            JoinOutcome::Overflow => self.fail_token(
                idx,
                Fault {
                    element_id: element_id.clone(),
                    kind: FaultKind::JoinMismatch,
                    message: format!(
                        "join `{element_id}` received {arrived} arrivals but declares \
                         an in-degree of {required}"
                    ),
                },
            ),
        }
    }

    /// Run all queued handler dispatches concurrently and merge results in
    /// completion order. After a fail-fast failure, late results are
    /// discarded unmerged.
    async fn dispatch_round(&mut self, dispatches: Vec<Dispatch>) {
        let mut set: JoinSet<Result<VarMap, HandlerError>> = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, Pending> = HashMap::new();

        for dispatch in dispatches {
            let snapshot = self.context.lock().expect("context lock").clone();
            debug!(
                run_id = %self.run_id,
                element = %dispatch.element_id,
                task_type = %dispatch.task_type,
                "dispatching handler"
            );
            let handler = dispatch.handler;
            let abort = set.spawn(async move { handler.run(snapshot).await });
            pending.insert(
                abort.id(),
                Pending {
                    token_idx: dispatch.token_idx,
                    token_id: dispatch.token_id,
                    element_id: dispatch.element_id,
                    next: dispatch.next,
                },
            );
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    if let Some(meta) = pending.remove(&task_id) {
                        self.complete_dispatch(meta, outcome);
                    }
                }
                Err(join_err) => {
                    if let Some(meta) = pending.remove(&join_err.id()) {
                        let message = format!("handler panicked: {join_err}");
                        self.complete_dispatch(meta, Err(HandlerError::Failed(message)));
                    }
                }
            }
        }
    }

    fn complete_dispatch(&mut self, meta: Pending, outcome: Result<VarMap, HandlerError>) {
        match outcome {
            Ok(update) => {
                if self.failed {
                    debug!(
                        run_id = %self.run_id,
                        element = %meta.element_id,
                        "run already failed; handler result discarded"
                    );
                    self.events.push(RuntimeEvent::HandlerResultDiscarded {
                        token_id: meta.token_id,
                        element_id: meta.element_id,
                    });
                    return;
                }
                let keys_merged: Vec<String> = update.keys().cloned().collect();
                {
                    let mut context = self.context.lock().expect("context lock");
                    for (key, value) in update {
                        context.insert(key, value);
                    }
                }
                self.events.push(RuntimeEvent::HandlerCompleted {
                    token_id: meta.token_id,
                    element_id: meta.element_id,
                    keys_merged,
                });
                self.advance(meta.token_idx, meta.next);
            }
            Err(err) => self.fail_token(
                meta.token_idx,
                Fault {
                    element_id: meta.element_id,
                    kind: FaultKind::Handler,
                    message: err.to_string(),
                },
            ),
        }
    }

    fn advance(&mut self, idx: usize, target: ElementId) {
        self.tokens[idx].position = target;
        self.tokens[idx].state = TokenState::Ready;
    }

    fn spawn_token(&mut self, position: ElementId, parent: Option<Uuid>) -> Uuid {
        let token = Token::spawn(position.clone());
        let token_id = token.id;
        self.events.push(RuntimeEvent::TokenSpawned {
            token_id,
            position,
            parent,
        });
        self.tokens.push(token);
        token_id
    }

    fn fail_token(&mut self, idx: usize, fault: Fault) {
        warn!(
            run_id = %self.run_id,
            element = %fault.element_id,
            kind = ?fault.kind,
            message = %fault.message,
            "token fault"
        );
        self.tokens[idx].state = TokenState::Failed;
        self.events.push(RuntimeEvent::FaultRaised {
            token_id: self.tokens[idx].id,
            fault: fault.clone(),
        });
        self.faults.push(fault);
        if self.policy == FailurePolicy::FailFast {
            self.failed = true;
        }
    }

    /// Unreachable on a validated definition; kept so a hand-built graph
    /// fails loudly instead of panicking.
    fn fail_no_outgoing(&mut self, idx: usize, element_id: ElementId) {
        self.fail_token(
            idx,
            Fault {
                element_id: element_id.clone(),
                kind: FaultKind::Routing,
                message: format!("element `{element_id}` has no outgoing flow"),
            },
        );
    }

    fn finish(mut self) -> ExecutionResult {
        let all_completed = self
            .tokens
            .iter()
            .all(|t| t.state == TokenState::Completed);

        // A run that stalls with tokens parked at a join (and no recorded
        // fault) must still report why it did not complete.
        if self.faults.is_empty() && !all_completed {
            if let Some(stuck) = self
                .tokens
                .iter()
                .find(|t| t.state != TokenState::Completed)
            {
                let fault = Fault {
                    element_id: stuck.position.clone(),
                    kind: FaultKind::JoinMismatch,
                    message: format!(
                        "run stalled with a token waiting at `{}`",
                        stuck.position
                    ),
                };
                self.events.push(RuntimeEvent::FaultRaised {
                    token_id: stuck.id,
                    fault: fault.clone(),
                });
                self.faults.push(fault);
            }
        }

        let success = self.faults.is_empty() && all_completed;
        let final_data = self.context.lock().expect("context lock").clone();
        if success {
            info!(run_id = %self.run_id, "run completed");
            self.events.push(RuntimeEvent::RunCompleted { run_id: self.run_id });
        } else {
            warn!(run_id = %self.run_id, faults = self.faults.len(), "run failed");
            self.events.push(RuntimeEvent::RunFailed { run_id: self.run_id });
        }

        ExecutionResult {
            run_id: self.run_id,
            success,
            final_data,
            execution_path: self.path,
            errors: self.faults,
            events: self.events,
        }
    }
}
