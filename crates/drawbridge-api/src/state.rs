use crate::service::ConvertService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConvertService>,
}
