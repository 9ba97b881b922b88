//! Token-based process execution engine.
//!
//! A process is a directed graph of elements (start, end, service tasks,
//! exclusive and parallel gateways) connected by flows whose optional
//! boolean conditions route execution. Definitions are described in memory
//! via [`ProcessDefinitionInput`], validated structurally by
//! [`definition::load`], and executed by an [`Engine`] that drives tokens
//! through the graph: exclusive gateways pick one flow deterministically,
//! parallel gateways fork tokens and re-join them at a barrier, and service
//! tasks dispatch to externally registered [`TaskHandler`]s whose partial
//! results merge into the shared run context.
//!
//! ```no_run
//! use tokenflow_core::{
//!     Engine, ElementInput, FlowInput, HandlerRegistry, ProcessDefinitionInput, VarMap,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("greet", |_data| {
//!     let mut update = VarMap::new();
//!     update.insert("greeted".into(), serde_json::json!(true));
//!     Ok(update)
//! });
//!
//! let mut engine = Engine::new(registry);
//! engine.deploy(ProcessDefinitionInput {
//!     id: "hello".into(),
//!     elements: vec![
//!         ElementInput::new("start", "start"),
//!         ElementInput::new("greet", "serviceTask"),
//!         ElementInput::new("end", "end"),
//!     ],
//!     flows: vec![
//!         FlowInput::new("start", "greet"),
//!         FlowInput::new("greet", "end"),
//!     ],
//! })?;
//!
//! let result = engine.execute("hello", VarMap::new()).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod condition;
pub mod definition;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod types;
pub mod validate;

pub use condition::{Condition, ConditionError};
pub use definition::{load, ElementInput, FlowInput, ProcessDefinitionInput};
pub use engine::{Engine, EngineError};
pub use events::RuntimeEvent;
pub use gateway::{evaluate_exclusive, parallel_split, JoinBarrier, JoinOutcome};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, TaskHandler};
pub use types::{
    Element, ElementId, ElementKind, ExecutionResult, FailurePolicy, Fault, FaultKind, Flow,
    ProcessDefinition, Token, TokenState, VarMap,
};
pub use validate::ValidationError;
