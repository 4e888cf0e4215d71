use std::sync::Arc;
use std::time::Duration;

use self::pipelines::worker::WorkerHandle;
use self::script_filter::ScriptFilter;

pub mod conversation;
pub mod openai_server;
pub mod pipelines;
pub mod requests;
pub mod responses;
pub mod sampling_params;
pub mod script_filter;
pub mod streaming;
pub mod utils;

/// Shared state of the HTTP layer.
#[derive(Clone)]
pub struct OpenAIServerData {
    pub worker: WorkerHandle,
    pub script_filter: Option<Arc<dyn ScriptFilter>>,
    /// Reported in the `model` field of every response
    pub served_model_name: String,
    pub keep_alive_interval: Duration,
}

impl OpenAIServerData {
    pub fn new(worker: WorkerHandle, served_model_name: impl Into<String>) -> Self {
        Self {
            worker,
            script_filter: None,
            served_model_name: served_model_name.into(),
            keep_alive_interval: Duration::from_secs(15),
        }
    }

    pub fn with_script_filter(mut self, filter: Arc<dyn ScriptFilter>) -> Self {
        self.script_filter = Some(filter);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }
}
