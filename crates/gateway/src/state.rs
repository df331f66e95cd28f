use std::sync::Arc;

use weft_domain::config::Config;
use weft_engine::Runtime;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub config: Arc<Config>,
}
