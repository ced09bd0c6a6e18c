use std::sync::Arc;

use crate::auth::resolver::SessionResolver;
use crate::config::Config;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<SessionResolver>,
    pub config: Config,
}
