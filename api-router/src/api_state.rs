use std::sync::Arc;

use common::{
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, rate_limit::SharedRateLimitTracker},
};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub tracker: SharedRateLimitTracker,
}

impl ApiState {
    pub fn new(db: Arc<SurrealDbClient>, config: AppConfig, tracker: SharedRateLimitTracker) -> Self {
        Self {
            db,
            config,
            tracker,
        }
    }
}
