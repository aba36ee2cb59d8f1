//! Proxy that lets a task look up its own identity.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::{ProxyHandler, ProxyRequest, ProxyResponse};
use crate::queue::Task;

/// Name under which the task-info proxy is attached.
pub const TASK_INFO_PROXY: &str = "task-info";

/// Answers `GET /` with the run's identity and worker.
pub struct TaskInfoProxy {
    info: Value,
}

impl TaskInfoProxy {
    pub fn new(task: &Task) -> Self {
        let worker = task.worker();
        Self {
            info: json!({
                "taskId": task.task_id(),
                "runId": task.run_id(),
                "provisionerId": worker.provisioner_id,
                "workerType": worker.worker_type,
                "workerGroup": worker.worker_group,
                "workerId": worker.worker_id,
            }),
        }
    }
}

#[async_trait]
impl ProxyHandler for TaskInfoProxy {
    async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        match (request.method.as_str(), request.path.trim_end_matches('/')) {
            ("GET", "") | ("GET", "/task") => ProxyResponse::json(200, &self.info),
            _ => ProxyResponse::not_found(),
        }
    }
}
