use std::sync::Arc;

use crate::history::HistoryStore;

#[derive(Clone)]
pub struct AppState {
    pub history: Arc<dyn HistoryStore>,
}

impl AppState {
    pub fn new(history: Arc<dyn HistoryStore>) -> Self {
        Self { history }
    }
}
