//! Definition input DTOs and the load pipeline.
//!
//! Embedders hand the engine an in-memory graph description; translating
//! any external file format into [`ProcessDefinitionInput`] is their
//! responsibility. `load` parses element kinds and condition expressions,
//! computes the definition fingerprint, builds adjacency, and validates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::condition::Condition;
use crate::types::{Element, ElementId, ElementKind, Flow, ProcessDefinition, VarMap};
use crate::validate::{self, ValidationError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinitionInput {
    pub id: String,
    pub elements: Vec<ElementInput>,
    pub flows: Vec<FlowInput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementInput {
    pub id: String,
    /// Wire spelling of the element kind, e.g. `serviceTask`.
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: VarMap,
}

impl ElementInput {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: String::new(),
            attributes: VarMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowInput {
    /// Optional; defaults to `source->target`.
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    /// Condition expression text; absent marks the default flow.
    #[serde(default)]
    pub condition: Option<String>,
}

impl FlowInput {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            condition: Some(condition.into()),
            ..Self::new(source, target)
        }
    }
}

/// Load and validate a definition. The returned [`ProcessDefinition`] is
/// immutable; re-validating it is idempotent.
pub fn load(input: ProcessDefinitionInput) -> Result<ProcessDefinition, ValidationError> {
    let fingerprint = fingerprint(&input);

    let mut elements: BTreeMap<ElementId, Element> = BTreeMap::new();
    for raw in &input.elements {
        let kind =
            ElementKind::parse(&raw.kind).ok_or_else(|| ValidationError::UnknownElementKind {
                element_id: raw.id.clone(),
                kind: raw.kind.clone(),
            })?;
        let element = Element {
            id: raw.id.clone(),
            kind,
            name: raw.name.clone(),
            attributes: raw.attributes.clone(),
        };
        if elements.insert(raw.id.clone(), element).is_some() {
            return Err(ValidationError::DuplicateElement {
                element_id: raw.id.clone(),
            });
        }
    }

    let mut flows = Vec::with_capacity(input.flows.len());
    for raw in &input.flows {
        let id = if raw.id.is_empty() {
            format!("{}->{}", raw.source, raw.target)
        } else {
            raw.id.clone()
        };
        let condition = match &raw.condition {
            Some(text) => Some(Condition::parse(text).map_err(|source| {
                ValidationError::InvalidCondition {
                    flow_id: id.clone(),
                    source,
                }
            })?),
            None => None,
        };
        flows.push(Flow {
            id,
            source: raw.source.clone(),
            target: raw.target.clone(),
            condition,
        });
    }

    let mut outgoing: BTreeMap<ElementId, Vec<usize>> = BTreeMap::new();
    let mut incoming: BTreeMap<ElementId, Vec<usize>> = BTreeMap::new();
    for (idx, flow) in flows.iter().enumerate() {
        outgoing.entry(flow.source.clone()).or_default().push(idx);
        incoming.entry(flow.target.clone()).or_default().push(idx);
    }

    let start_id = elements
        .values()
        .find(|e| e.kind == ElementKind::Start)
        .map(|e| e.id.clone())
        .ok_or(ValidationError::MissingOrAmbiguousStart { found: 0 })?;

    let definition = ProcessDefinition {
        id: input.id,
        fingerprint,
        elements,
        flows,
        outgoing,
        incoming,
        start_id,
    };
    validate::validate(&definition)?;
    Ok(definition)
}

/// SHA-256 over the canonical JSON of the input, used as the deployment
/// version key.
fn fingerprint(input: &ProcessDefinitionInput) -> [u8; 32] {
    let canonical = serde_json::to_vec(input).expect("definition input serializes");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.finalize().into()
}
