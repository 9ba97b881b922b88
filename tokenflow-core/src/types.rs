use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::condition::Condition;
use crate::events::RuntimeEvent;

// ─── Scalar aliases ───────────────────────────────────────────

/// Element identifier within a process definition.
pub type ElementId = String;

/// Run-scoped variable map. Handler updates merge into this shape.
pub type VarMap = serde_json::Map<String, serde_json::Value>;

// ─── Elements and flows ───────────────────────────────────────

/// The five element kinds the engine interprets. Matched exhaustively;
/// there is no string-typed dispatch anywhere in the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    Start,
    End,
    ServiceTask,
    ExclusiveGateway,
    ParallelGateway,
}

impl ElementKind {
    /// Parse the wire spelling used by definition inputs. Accepts both
    /// camelCase and snake_case, plus the BPMN event names.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "start" | "startEvent" | "start_event" => Some(ElementKind::Start),
            "end" | "endEvent" | "end_event" => Some(ElementKind::End),
            "serviceTask" | "service_task" | "task" => Some(ElementKind::ServiceTask),
            "exclusiveGateway" | "exclusive_gateway" => Some(ElementKind::ExclusiveGateway),
            "parallelGateway" | "parallel_gateway" => Some(ElementKind::ParallelGateway),
            _ => None,
        }
    }
}

/// A node in the process graph. Immutable once loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub kind: ElementKind,
    pub name: String,
    /// Free-form element attributes, e.g. a service task's `handler` key.
    pub attributes: VarMap,
}

impl Element {
    /// Handler registry key for a service task: the `handler` attribute,
    /// falling back to the element id.
    pub fn handler_key(&self) -> &str {
        self.attributes
            .get("handler")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.id)
    }
}

/// A directed sequence flow. A missing condition marks the default flow
/// out of an exclusive gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub source: ElementId,
    pub target: ElementId,
    pub condition: Option<Condition>,
}

// ─── Process definition ───────────────────────────────────────

/// A validated, immutable process graph. Produced only by
/// [`crate::definition::load`]; read-only for the lifetime of all runs.
#[derive(Clone, Debug)]
pub struct ProcessDefinition {
    pub(crate) id: String,
    /// SHA-256 over the canonical JSON of the definition input.
    pub(crate) fingerprint: [u8; 32],
    pub(crate) elements: BTreeMap<ElementId, Element>,
    pub(crate) flows: Vec<Flow>,
    /// Flow indices by source element, in declaration order.
    pub(crate) outgoing: BTreeMap<ElementId, Vec<usize>>,
    /// Flow indices by target element, in declaration order.
    pub(crate) incoming: BTreeMap<ElementId, Vec<usize>>,
    pub(crate) start_id: ElementId,
}

impl ProcessDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// The unique start element.
    pub fn start(&self) -> &Element {
        &self.elements[&self.start_id]
    }

    /// Outgoing flows of an element, in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&Flow> {
        self.outgoing
            .get(id)
            .map(|idxs| idxs.iter().map(|&i| &self.flows[i]).collect())
            .unwrap_or_default()
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.outgoing.get(id).map(Vec::len).unwrap_or(0)
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.incoming.get(id).map(Vec::len).unwrap_or(0)
    }

    /// Re-run the structural checks. Pure and idempotent: a loaded
    /// definition always passes and is left untouched.
    pub fn validate(&self) -> Result<(), crate::validate::ValidationError> {
        crate::validate::validate(self)
    }
}

// ─── Tokens ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Ready,
    Waiting,
    Completed,
    Failed,
}

/// A logical cursor for one in-flight execution path. Parallel forks
/// spawn additional tokens; joins collapse them back to one.
#[derive(Clone, Debug)]
pub struct Token {
    pub id: Uuid,
    pub position: ElementId,
    pub state: TokenState,
}

impl Token {
    pub fn spawn(position: ElementId) -> Self {
        Self {
            id: Uuid::now_v7(),
            position,
            state: TokenState::Ready,
        }
    }
}

// ─── Faults and results ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Exclusive gateway with no true condition and no default flow.
    Routing,
    /// Registered handler returned an error or panicked.
    Handler,
    /// A join observed more arrivals than its declared in-degree, or a
    /// run stalled with tokens parked at an unreleased join.
    JoinMismatch,
}

/// A token-level failure, attributed to the element where it occurred.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub element_id: ElementId,
    pub kind: FaultKind,
    pub message: String,
}

/// What the engine does after the first token-level fault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Mark the run failed immediately; results from in-flight sibling
    /// handlers are discarded on arrival.
    #[default]
    FailFast,
    /// Let sibling tokens run to completion; the run still reports
    /// `success = false` with every fault listed.
    ContinueOthers,
}

/// Outcome of one `execute` call.
///
/// `execution_path` and `final_data` are the stable fields external
/// consumers may depend on; `events` is the in-memory audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub success: bool,
    pub final_data: VarMap,
    /// Element ids in visitation order. Parallel branches may interleave,
    /// but each branch's internal order is preserved.
    pub execution_path: Vec<ElementId>,
    pub errors: Vec<Fault>,
    pub events: Vec<RuntimeEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn element_kind_wire_spellings() {
        assert_eq!(ElementKind::parse("serviceTask"), Some(ElementKind::ServiceTask));
        assert_eq!(ElementKind::parse("service_task"), Some(ElementKind::ServiceTask));
        assert_eq!(ElementKind::parse("startEvent"), Some(ElementKind::Start));
        assert_eq!(ElementKind::parse("parallelGateway"), Some(ElementKind::ParallelGateway));
        assert_eq!(ElementKind::parse("subProcess"), None);
    }

    #[test]
    fn handler_key_falls_back_to_element_id() {
        let mut attributes = VarMap::new();
        attributes.insert("handler".into(), json!("check_funds"));
        let with_attr = Element {
            id: "t1".into(),
            kind: ElementKind::ServiceTask,
            name: String::new(),
            attributes,
        };
        assert_eq!(with_attr.handler_key(), "check_funds");

        let bare = Element {
            id: "t2".into(),
            kind: ElementKind::ServiceTask,
            name: String::new(),
            attributes: VarMap::new(),
        };
        assert_eq!(bare.handler_key(), "t2");
    }
}
