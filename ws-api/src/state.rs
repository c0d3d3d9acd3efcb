use std::sync::Arc;
use ws_orchestrator::WorkspaceController;

#[derive(Clone)]
pub struct AppState {
    pub controller: WorkspaceController,
    pub api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(controller: WorkspaceController, api_token: Option<String>) -> Self {
        Self {
            controller,
            api_token: api_token.map(Arc::from),
        }
    }
}
