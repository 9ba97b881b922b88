use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ElementId, Fault};

/// Runtime events: the per-run audit trail. Collected in memory and
/// returned on [`crate::types::ExecutionResult`]; persistence across
/// restarts is a caller concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    RunStarted {
        run_id: Uuid,
        definition_id: String,
        fingerprint: [u8; 32],
    },
    TokenSpawned {
        token_id: Uuid,
        position: ElementId,
        parent: Option<Uuid>,
    },
    ElementEntered {
        token_id: Uuid,
        element_id: ElementId,
    },
    HandlerDispatched {
        token_id: Uuid,
        element_id: ElementId,
        task_type: String,
    },
    HandlerCompleted {
        token_id: Uuid,
        element_id: ElementId,
        keys_merged: Vec<String>,
    },
    /// A handler finished after the run had already failed; its partial
    /// update was not merged.
    HandlerResultDiscarded {
        token_id: Uuid,
        element_id: ElementId,
    },
    GatewayTaken {
        gateway_id: ElementId,
        flow_id: String,
    },
    Forked {
        fork_id: ElementId,
        child_tokens: Vec<Uuid>,
    },
    JoinArrived {
        join_id: ElementId,
        token_id: Uuid,
        arrived: usize,
        required: usize,
    },
    JoinReleased {
        join_id: ElementId,
        released_token: Uuid,
    },
    FaultRaised {
        token_id: Uuid,
        fault: Fault,
    },
    RunCompleted {
        run_id: Uuid,
    },
    RunFailed {
        run_id: Uuid,
    },
}
