//! JSON-line protocol spoken by `pixelpilot serve`.
//!
//! One [`Request`] per input line, one [`Response`] per output line. The
//! response echoes the request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::pipeline::NodeSummary;
use crate::scheduler::Outcome;

/// A request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the server can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Validate a pipeline document and keep it for later runs.
    SubmitPipeline {
        document: Value,
        /// Directory relative template paths resolve against.
        base_dir: Option<String>,
        name: Option<String>,
    },
    /// List submitted pipelines.
    ListPipelines,
    /// Start a run that replays stored screenshots as its frames.
    StartRun {
        pipeline_id: String,
        entry: String,
        frames: Vec<String>,
    },
    /// Current state of a run.
    RunStatus { run_id: String },
    /// Block until a run finishes or the timeout elapses.
    WaitRun {
        run_id: String,
        timeout_ms: Option<u64>,
    },
    /// Request cancellation of a run.
    AbortRun { run_id: String },
    /// List all known runs.
    ListRuns,
    /// Abort every run and stop the server.
    Shutdown,
}

/// A response to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    PipelineSubmitted {
        pipeline_id: String,
        nodes: Vec<NodeSummary>,
        /// Nodes nothing transitions to; likely entries.
        roots: Vec<String>,
    },
    Pipelines { pipelines: Vec<PipelineInfo> },
    RunStarted { run_id: String },
    Run { run: RunInfo },
    WaitRunResult {
        finished: bool,
        run: RunInfo,
        elapsed_ms: u64,
    },
    Runs { runs: Vec<RunInfo> },
    /// Generic success message.
    Ok { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: String,
    pub name: Option<String>,
    pub nodes: usize,
    pub resource_base: String,
    pub submitted_at: String,
}

/// Coarse lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunPhase {
    #[must_use]
    pub fn is_finished(self) -> bool {
        !matches!(self, RunPhase::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: String,
    pub pipeline_id: String,
    pub entry: String,
    pub phase: RunPhase,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Present once the run has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_parse_start_run_request() {
        let line = r#"{"id":"7","command":{"action":"start_run","pipeline_id":"p1","entry":"start","frames":["a.png","b.png"]}}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert_eq!(req.id, "7");
        assert_eq!(
            req.command,
            Command::StartRun {
                pipeline_id: "p1".into(),
                entry: "start".into(),
                frames: vec!["a.png".into(), "b.png".into()],
            }
        );
    }

    #[test]
    fn test_submit_pipeline_optional_fields() {
        let req: Request = serde_json::from_value(json!({
            "id": "1",
            "command": { "action": "submit_pipeline", "document": { "start": {} } }
        }))
        .unwrap();
        let Command::SubmitPipeline {
            document,
            base_dir,
            name,
        } = req.command
        else {
            panic!("expected submit_pipeline");
        };
        assert!(document.get("start").is_some());
        assert_eq!(base_dir, None);
        assert_eq!(name, None);
    }

    #[test]
    fn test_unit_commands() {
        for (action, expected) in [
            ("list_pipelines", Command::ListPipelines),
            ("list_runs", Command::ListRuns),
            ("shutdown", Command::Shutdown),
        ] {
            let req: Request = serde_json::from_value(json!({
                "id": "x", "command": { "action": action }
            }))
            .unwrap();
            assert_eq!(req.command, expected);
        }
    }

    #[test]
    fn test_error_response_omits_data() {
        let resp = Response::error("9", ApiError::run_not_found("r1"));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert!(value.get("data").is_none());
        assert_eq!(value["error"]["code"], "RUN_NOT_FOUND");
        let back: Response = serde_json::from_value(value).unwrap();
        assert_eq!(back.error.unwrap().code, ErrorCode::RunNotFound);
    }

    #[test]
    fn test_response_data_is_tagged() {
        let resp = Response::success(
            "2",
            ResponseData::RunStarted {
                run_id: "abc".into(),
            },
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["data"]["type"], "run_started");
        assert_eq!(value["data"]["run_id"], "abc");
    }

    #[test]
    fn test_run_phase_finished() {
        assert!(!RunPhase::Running.is_finished());
        assert!(RunPhase::Aborted.is_finished());
        assert_eq!(serde_json::to_value(RunPhase::Succeeded).unwrap(), "succeeded");
    }
}
