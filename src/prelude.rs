//! Common entry points, for `use hsm_engine::prelude::*;`.

pub use crate::config::{EngineConfig, PostMessageErrorPolicy};
pub use crate::context::{MessageContext, TransitionContext};
pub use crate::data::{DataCodec, DataValue, SerdeCodec};
pub use crate::engine::{CurrentState, Engine, StartOptions};
pub use crate::error::{EngineError, EngineResult};
pub use crate::filter::Filter;
pub use crate::handler::{EnterFn, EnterHandler, ExitFn, ExitHandler, MessageFn, MessageHandler};
pub use crate::key::{DataStateKey, StateKey};
pub use crate::lifecycle::LifecycleState;
pub use crate::message::{
    FailedMessage, HandledMessage, Message, MessageResult, Metadata, ProcessedMessage, TransitionAction, UnhandledMessage,
};
pub use crate::nested::{nested_machine_node, MachineTreeStateData, NestedMachineOptions};
pub use crate::node::{DataSpec, NodeDef, NodeKind};
pub use crate::snapshot::SnapshotEnvelope;
pub use crate::transition::Transition;
