use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use gramflow_core::{ApiResult, Bot};

/// A bot that records every message instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingBot {
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingBot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Bot for RecordingBot {
    fn id(&self) -> &str {
        "recording"
    }

    async fn call_api(&self, _method: &str, params: Value) -> ApiResult<Value> {
        Ok(params)
    }

    async fn send_message(&self, peer_id: i64, text: &str) -> ApiResult<i64> {
        let mut sent = self.sent.lock();
        sent.push((peer_id, text.to_string()));
        Ok(sent.len() as i64)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
