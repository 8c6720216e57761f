pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod handler;
pub mod lease;
pub mod manager;
pub mod query;
pub mod state;
pub mod store;
pub mod workflows;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EngineConfig, ProcessManagerConfig};
pub use entity::{EntityMeta, FieldDef, FieldKind, Lease, StatefulEntity};
pub use error::{EntityError, RemoteError, StateMachineError, StoreError, StoreResult};
pub use events::{ChannelListener, EventBus, LoggingListener, TransitionEvent, TransitionListener};
pub use handler::{HandlerRegistry, Outcome, SharedHandler, StateHandler};
pub use lease::Caller;
pub use manager::{CycleReport, ProcessManager};
pub use query::{Criterion, Operator, QuerySpec, SortOrder};
pub use state::{TransitionTable, WorkflowState};
pub use store::EntityStore;
