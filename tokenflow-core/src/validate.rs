//! Structural validation of process definitions.
//!
//! Runs once at load time. Checks are pure: validating an already-valid
//! definition returns success and mutates nothing.

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use std::collections::HashSet;
use thiserror::Error;

use crate::condition::ConditionError;
use crate::types::{ElementId, ElementKind, ProcessDefinition};

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ValidationError {
    #[error("flow `{flow_id}` references unknown element `{element_id}`")]
    DanglingFlow {
        flow_id: String,
        element_id: ElementId,
    },
    #[error("element `{element_id}` has unrecognized kind `{kind}`")]
    UnknownElementKind {
        element_id: ElementId,
        kind: String,
    },
    #[error("duplicate element id `{element_id}`")]
    DuplicateElement { element_id: ElementId },
    #[error("expected exactly one start element with no incoming flows, found {found}")]
    MissingOrAmbiguousStart { found: usize },
    #[error("no end element reachable from the start")]
    MissingEnd,
    #[error("element `{element_id}` has no outgoing flow")]
    DeadEnd { element_id: ElementId },
    #[error(
        "parallel gateway `{element_id}` is neither a fork nor a join \
         (in={in_degree}, out={out_degree})"
    )]
    MalformedGateway {
        element_id: ElementId,
        in_degree: usize,
        out_degree: usize,
    },
    #[error("exclusive gateway `{element_id}` has {found} default flows")]
    AmbiguousDefaultFlow { element_id: ElementId, found: usize },
    #[error(
        "fork `{fork_id}` produces {produced} tokens but join `{join_id}` \
         expects {expected} arrivals"
    )]
    ForkJoinMismatch {
        fork_id: ElementId,
        join_id: ElementId,
        produced: usize,
        expected: usize,
    },
    #[error("flow `{flow_id}`: {source}")]
    InvalidCondition {
        flow_id: String,
        #[source]
        source: ConditionError,
    },
}

/// First violation in check order, or Ok. `load` calls this; callers can
/// re-run it at any time via [`ProcessDefinition::validate`].
pub fn validate(def: &ProcessDefinition) -> Result<(), ValidationError> {
    match check(def).into_iter().next() {
        Some(violation) => Err(violation),
        None => Ok(()),
    }
}

/// All violations, in check order.
pub fn check(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut violations = Vec::new();

    // Every flow endpoint must exist.
    for flow in def.flows() {
        for endpoint in [&flow.source, &flow.target] {
            if def.element(endpoint).is_none() {
                violations.push(ValidationError::DanglingFlow {
                    flow_id: flow.id.clone(),
                    element_id: endpoint.clone(),
                });
            }
        }
    }

    // Exactly one start, and it must not be a flow target.
    let starts: Vec<_> = def
        .elements()
        .filter(|e| e.kind == ElementKind::Start)
        .collect();
    let roots = starts.iter().filter(|e| def.in_degree(&e.id) == 0).count();
    if starts.len() != 1 || roots != 1 {
        violations.push(ValidationError::MissingOrAmbiguousStart { found: roots });
    }

    // At least one end, reachable from the start.
    let ends: Vec<_> = def
        .elements()
        .filter(|e| e.kind == ElementKind::End)
        .collect();
    if ends.is_empty() {
        violations.push(ValidationError::MissingEnd);
    } else if starts.len() == 1 {
        let reachable = reachable_from(def, &starts[0].id);
        if !ends.iter().any(|e| reachable.contains(e.id.as_str())) {
            violations.push(ValidationError::MissingEnd);
        }
    }

    // Every non-end element must have somewhere to go.
    for element in def.elements() {
        if element.kind != ElementKind::End && def.out_degree(&element.id) == 0 {
            violations.push(ValidationError::DeadEnd {
                element_id: element.id.clone(),
            });
        }
    }

    // Parallel gateways are unambiguously fork (1 in, >1 out) or
    // join (>1 in, 1 out), never both and never neither.
    for element in def.elements() {
        if element.kind != ElementKind::ParallelGateway {
            continue;
        }
        let in_degree = def.in_degree(&element.id);
        let out_degree = def.out_degree(&element.id);
        let is_fork = in_degree == 1 && out_degree > 1;
        let is_join = in_degree > 1 && out_degree == 1;
        if !is_fork && !is_join {
            violations.push(ValidationError::MalformedGateway {
                element_id: element.id.clone(),
                in_degree,
                out_degree,
            });
        }
    }

    // At most one default (unconditioned) flow per exclusive gateway.
    for element in def.elements() {
        if element.kind != ElementKind::ExclusiveGateway {
            continue;
        }
        let defaults = def
            .outgoing(&element.id)
            .iter()
            .filter(|f| f.condition.is_none())
            .count();
        if def.out_degree(&element.id) > 1 && defaults > 1 {
            violations.push(ValidationError::AmbiguousDefaultFlow {
                element_id: element.id.clone(),
                found: defaults,
            });
        }
    }

    // A fork's token count must equal its matching join's declared
    // in-degree. Only flagged when every branch converges on the same
    // join; unbalanced nestings are left to the runtime barrier guard.
    for element in def.elements() {
        if element.kind != ElementKind::ParallelGateway {
            continue;
        }
        let branches = def.outgoing(&element.id);
        if def.in_degree(&element.id) != 1 || branches.len() <= 1 {
            continue;
        }
        let per_branch: Vec<HashSet<&str>> = branches
            .iter()
            .map(|flow| first_parallel_joins(def, &flow.target))
            .collect();
        let union: HashSet<&str> = per_branch.iter().flatten().copied().collect();
        if per_branch.iter().all(|joins| joins.len() == 1) {
            if let Some(&join_id) = union.iter().next() {
                if union.len() == 1 {
                    let expected = def.in_degree(join_id);
                    if expected != branches.len() {
                        violations.push(ValidationError::ForkJoinMismatch {
                            fork_id: element.id.clone(),
                            join_id: join_id.to_string(),
                            produced: branches.len(),
                            expected,
                        });
                    }
                }
            }
        }
    }

    violations
}

/// Element ids reachable from `start`, including `start` itself.
fn reachable_from<'a>(def: &'a ProcessDefinition, start: &'a str) -> HashSet<&'a str> {
    let mut graph = DiGraphMap::<&str, ()>::new();
    for element in def.elements() {
        graph.add_node(element.id.as_str());
    }
    for flow in def.flows() {
        if def.element(&flow.source).is_some() && def.element(&flow.target).is_some() {
            graph.add_edge(flow.source.as_str(), flow.target.as_str(), ());
        }
    }
    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, start);
    while let Some(node) = dfs.next(&graph) {
        reachable.insert(node);
    }
    reachable
}

/// First parallel join encountered on each path out of `from`. Traversal
/// stops at a join: arrivals are consumed there, so anything past it
/// belongs to the released token, not this branch.
fn first_parallel_joins<'a>(def: &'a ProcessDefinition, from: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut joins = HashSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(element) = def.element(id) else {
            continue;
        };
        if element.kind == ElementKind::ParallelGateway && def.in_degree(id) > 1 {
            joins.insert(id);
            continue;
        }
        for flow in def.outgoing(id) {
            stack.push(flow.target.as_str());
        }
    }
    joins
}
