//! Gateway evaluation: exclusive routing and the parallel join barrier.

use crate::types::{Element, Fault, FaultKind, Flow, VarMap};

/// Choose the outgoing flow for an exclusive gateway.
///
/// Flows are inspected in declaration order; the first whose condition
/// evaluates true wins. If no condition matches, the default flow (the one
/// with no condition) is taken. With neither, routing fails for this token.
/// Deterministic: identical variables always yield the same choice.
pub fn evaluate_exclusive<'a>(
    gateway: &Element,
    outgoing: &[&'a Flow],
    data: &VarMap,
) -> Result<&'a Flow, Fault> {
    let mut default = None;
    for flow in outgoing {
        match &flow.condition {
            Some(cond) => {
                if cond.evaluate(data) {
                    return Ok(flow);
                }
            }
            None => {
                if default.is_none() {
                    default = Some(*flow);
                }
            }
        }
    }
    default.ok_or_else(|| Fault {
        element_id: gateway.id.clone(),
        kind: FaultKind::Routing,
        message: format!(
            "exclusive gateway {}: no condition matched and no default flow",
            gateway.id
        ),
    })
}

/// A parallel fork activates every outgoing flow, unconditionally.
pub fn parallel_split<'a>(outgoing: &[&'a Flow]) -> Vec<&'a Flow> {
    outgoing.to_vec()
}

/// What a join arrival produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Siblings still outstanding; the arriving token parks.
    Waiting,
    /// Every sibling has arrived; release exactly one token downstream.
    Release,
    /// More arrivals than the declared in-degree. Malformed or reused
    /// gateway; fatal to the run.
    Overflow,
}

/// Arrival counter for one (run, join gateway) pair. The required count is
/// fixed at load time from the gateway's declared in-degree.
#[derive(Clone, Debug)]
pub struct JoinBarrier {
    required: usize,
    arrived: usize,
}

impl JoinBarrier {
    pub fn new(required: usize) -> Self {
        Self {
            required,
            arrived: 0,
        }
    }

    pub fn arrive(&mut self) -> JoinOutcome {
        self.arrived += 1;
        if self.arrived == self.required {
            JoinOutcome::Release
        } else if self.arrived > self.required {
            JoinOutcome::Overflow
        } else {
            JoinOutcome::Waiting
        }
    }

    pub fn arrived(&self) -> usize {
        self.arrived
    }

    pub fn required(&self) -> usize {
        self.required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::types::ElementKind;
    use serde_json::json;

    fn gateway(id: &str) -> Element {
        Element {
            id: id.into(),
            kind: ElementKind::ExclusiveGateway,
            name: String::new(),
            attributes: VarMap::new(),
        }
    }

    fn flow(id: &str, condition: Option<&str>) -> Flow {
        Flow {
            id: id.into(),
            source: "gw".into(),
            target: format!("after_{id}"),
            condition: condition.map(|c| Condition::parse(c).unwrap()),
        }
    }

    #[test]
    fn first_matching_condition_wins_in_declaration_order() {
        let gw = gateway("gw");
        let a = flow("a", Some("amount > 10"));
        let b = flow("b", Some("amount > 5"));
        let outgoing = vec![&a, &b];

        let mut data = VarMap::new();
        data.insert("amount".into(), json!(50));
        // Both conditions hold; declaration order decides.
        let chosen = evaluate_exclusive(&gw, &outgoing, &data).unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn default_flow_taken_only_when_nothing_matches() {
        let gw = gateway("gw");
        let cond = flow("cond", Some("valid"));
        let default = flow("default", None);
        // Default listed first must not shadow a matching condition.
        let outgoing = vec![&default, &cond];

        let mut data = VarMap::new();
        data.insert("valid".into(), json!(true));
        assert_eq!(evaluate_exclusive(&gw, &outgoing, &data).unwrap().id, "cond");

        data.insert("valid".into(), json!(false));
        assert_eq!(
            evaluate_exclusive(&gw, &outgoing, &data).unwrap().id,
            "default"
        );
    }

    #[test]
    fn no_match_and_no_default_is_a_routing_fault() {
        let gw = gateway("gw");
        let a = flow("a", Some("valid"));
        let outgoing = vec![&a];

        let fault = evaluate_exclusive(&gw, &outgoing, &VarMap::new()).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Routing);
        assert_eq!(fault.element_id, "gw");
    }

    #[test]
    fn split_activates_every_flow() {
        let a = flow("a", None);
        let b = flow("b", None);
        let c = flow("c", None);
        let outgoing = vec![&a, &b, &c];
        assert_eq!(parallel_split(&outgoing).len(), 3);
    }

    #[test]
    fn barrier_releases_exactly_once_at_required_count() {
        let mut barrier = JoinBarrier::new(3);
        assert_eq!(barrier.arrive(), JoinOutcome::Waiting);
        assert_eq!(barrier.arrive(), JoinOutcome::Waiting);
        assert_eq!(barrier.arrive(), JoinOutcome::Release);
        // A fourth arrival is a malformed or reused gateway.
        assert_eq!(barrier.arrive(), JoinOutcome::Overflow);
    }
}
