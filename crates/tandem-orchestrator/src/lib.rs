pub mod agents;
pub mod budget;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod secrets;
pub mod staging;
pub mod store;
pub mod types;
pub mod workspace;


pub use agents::{Generation, GenerationRequest, Generator, ScriptedGenerator, ScriptedResponse, ToolCall};
pub use budget::{BudgetController, BudgetExceeded, BudgetKind, BudgetLedger, BudgetStatus};
pub use config::{CompletionPolicy, ConfigLoader, OrchestratorConfig};
pub use engine::{PlanReview, RunEngine};
pub use error::{OrchestratorError, Result};
pub use events::EventBus;
pub use policy::{ActionKind, PolicyAction, PolicyDecision, PolicyGate, PolicyTier, RequestedAction};
pub use registry::RunRegistry;
pub use scheduler::TaskScheduler;
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
pub use staging::{ApprovalRecord, BatchOutcome, StagedOperation, StagingStore};
pub use store::ArtifactStore;
pub use types::*;
pub use workspace::Workspace;
