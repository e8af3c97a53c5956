use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::broker::Broker;

/// Estado compartido por los handlers HTTP. Se clona por request; lo
/// pesado queda detrás de `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker: Arc::new(broker),
            started_at: Utc::now(),
        }
    }
}
