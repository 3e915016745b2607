use std::sync::Arc;

use crate::accounts::AccountStore;
use crate::config::Config;
use crate::quota::evaluator::QuotaEvaluator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub quota: Arc<QuotaEvaluator>,
    pub accounts: Arc<dyn AccountStore>,
    pub config: Config,
}
