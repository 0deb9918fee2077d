//! Concrete pipeline stages, one module per component in the system
//! overview's data-flow order: circuit breaker, user budget, request
//! guard, response cache, context trimmer, model router, prefix
//! optimizer. The cost ledger lives here too, though it runs after the
//! provider call rather than as a `Stage`.

pub mod breaker;
pub mod cache;
pub mod guard;
pub mod ledger;
pub mod prefix;
pub mod router;
pub mod trimmer;
pub mod user_budget;

pub use breaker::CircuitBreaker;
pub use cache::ResponseCache;
pub use guard::RequestGuard;
pub use ledger::CostLedger;
pub use prefix::PrefixOptimizer;
pub use router::ModelRouter;
pub use trimmer::ContextTrimmer;
pub use user_budget::UserBudgetManager;
