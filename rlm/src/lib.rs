//! RLM: Recursive Language Model session engine
//!
//! A session answers one query over one document. The model works in turns:
//! it may run Python against the document in a policy-filtered sandbox, fan
//! out recursive sub-calls, or return a final answer. Every model call is
//! priced by the budget governor before it is sent, routed to a cost tier by
//! the tiered router, and recorded in the ledger.

pub mod budget;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod provider;
pub mod reply;
pub mod routing;
pub mod sandbox;
pub mod session;

pub use config::BudgetConfig;
pub use config::ConfigLoader;
pub use config::GatewayConfig;
pub use config::LoadedConfig;
pub use config::ModelConfig;
pub use config::PromptConfig;
pub use config::SandboxConfig;
pub use config::SessionConfig;
pub use config::TomlConfigLoader;
pub use config::TraceConfig;
pub use policy::BlockedBuiltin;
pub use policy::ModuleAllowlist;
pub use policy::PolicyViolation;
pub use policy::PolicyViolationType;
pub use policy::SandboxPolicy;
pub use policy::SecurityMode;

// Errors
pub use error::BudgetExceededKind;
pub use error::Result;
pub use error::RlmError;

// Budget and cost
pub use budget::BudgetGovernor;
pub use budget::BudgetLimits;
pub use budget::BudgetState;
pub use budget::ChargeReceipt;
pub use budget::Reservation;
pub use cost::CostReport;
pub use cost::CostTracker;
pub use cost::TokenEstimator;
pub use cost::TokenPricing;
pub use cost::TokenUsage;

// Routing
pub use routing::Decision;
pub use routing::FailureKind;
pub use routing::OutputSchema;
pub use routing::PromotionMachine;
pub use routing::RetrievalSignals;
pub use routing::RouteSignals;
pub use routing::Tier;
pub use routing::TieredRouter;
pub use routing::Transition;

// Sandbox
pub use sandbox::ExecutionStatus;
pub use sandbox::SandboxExecution;
pub use sandbox::SandboxExecutor;

// Ledger
pub use ledger::LedgerEntry;
pub use ledger::LedgerHandle;
pub use ledger::LedgerSummary;
pub use ledger::LedgerWriter;

// Session
pub use context::ContextSource;
pub use context::LoadedContext;
pub use provider::ModelProvider;
pub use provider::ProviderError;
pub use provider::ProviderRequest;
pub use provider::ProviderResponse;
pub use provider::RetrievalIndex;
pub use provider::ScriptedProvider;
pub use provider::ScriptedResponse;
pub use reply::FinalAnswer;
pub use reply::ModelReply;
pub use session::RlmSession;
pub use session::SessionResult;
pub use session::SessionStatus;
