// Usage quotas and rate limiting.
// Every metered action goes through `QuotaEvaluator`; counters live behind
// the `CounterStore` trait so the backend (Redis, PostgreSQL, memory) is a
// start-up choice.

pub mod clock;
pub mod compaction;
pub mod evaluator;
pub mod middleware;
pub mod policy;
pub mod store;
pub mod tier;
pub mod window;
