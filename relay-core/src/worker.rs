use std::sync::Arc;

use async_trait::async_trait;
use relay_queue::JobHandler;
use relay_types::{Job, ToolError, ToolRequest};
use serde_json::Value;

use crate::RelayKernel;

/// Runs queued tool requests through the same path as inline calls.
pub(crate) struct ToolJobs {
    kernel: Arc<RelayKernel>,
}

impl ToolJobs {
    pub(crate) fn new(kernel: Arc<RelayKernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait]
impl JobHandler for ToolJobs {
    async fn handle(&self, job: &Job) -> Result<Value, ToolError> {
        let mut request: ToolRequest = serde_json::from_value(job.payload.clone())
            .map_err(|e| ToolError::invalid_input(format!("job payload: {e}")))?;
        if request.request_id.is_none() {
            request.request_id = Some(job.id.clone());
        }
        self.kernel
            .invoke(request)
            .await
            .map(|inv| inv.result)
            .map_err(|e| e.into_tool_error())
    }
}
