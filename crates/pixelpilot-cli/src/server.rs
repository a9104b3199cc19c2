//! JSON-line protocol server over stdin/stdout.
//!
//! Requests are handled concurrently, so a long `wait_run` does not hold up
//! an `abort_run` sent after it. Responses are written whole, one per line,
//! in completion order; clients match them up by id.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pixelpilot_core::action::RecordingInjector;
use pixelpilot_core::error::ApiError;
use pixelpilot_core::pipeline::PipelineGraph;
use pixelpilot_core::protocol::{Command, Request, Response, ResponseData};
use serde_json::Value;

use crate::capture::ReplayCapture;
use crate::config;
use crate::runs::{PipelineRegistry, RunManager};

/// Maximum request size in bytes. Pipeline documents travel inline.
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Default and ceiling for `wait_run`.
const DEFAULT_WAIT_MS: u64 = 30_000;
const MAX_WAIT_MS: u64 = 10 * 60 * 1000;

/// How long in-flight requests get to finish once input ends.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outstanding responses before handlers wait on the writer.
const RESPONSE_QUEUE: usize = 64;

/// Shared state behind every request handler.
#[derive(Default)]
struct ServerState {
    pipelines: PipelineRegistry,
    runs: RunManager,
    shutdown: Notify,
}

/// Serve until `shutdown` is requested or input ends.
///
/// Every run still going at that point is aborted.
pub async fn serve<R, W>(mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(ServerState::default());
    let (tx, rx) = mpsc::channel::<Response>(RESPONSE_QUEUE);
    let writer_task = tokio::spawn(write_responses(rx, writer));
    let mut handlers: JoinSet<()> = JoinSet::new();
    let mut line = String::new();
    let mut outcome = Ok(());

    info!("Serving JSON-line protocol on stdin/stdout");

    loop {
        line.clear();
        // Reap finished handlers so the set does not grow without bound.
        while handlers.try_join_next().is_some() {}

        // Only the read and the shutdown signal race here: the read is not
        // cancel safe, and a partial line is only dropped when stopping.
        tokio::select! {
            read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE) => {
                let read = match read {
                    Ok(read) => read,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                };
                match read {
                    ReadLine::Eof => {
                        debug!("Input closed");
                        break;
                    }
                    ReadLine::TooLarge => {
                        warn!("Dropped request over {} bytes", MAX_REQUEST_SIZE);
                        let response = Response::error(
                            "unknown",
                            ApiError::invalid_input_with_suggestion(
                                format!("Request too large: exceeded {} byte limit", MAX_REQUEST_SIZE),
                                "Submit large pipelines by reference: set 'base_dir' and keep templates on disk",
                            ),
                        );
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    ReadLine::InvalidUtf8 => {
                        warn!("Dropped request that is not valid UTF-8");
                        let response = Response::error(
                            "unknown",
                            ApiError::invalid_input_with_suggestion(
                                "Request is not valid UTF-8",
                                "Encode each request line as UTF-8 JSON",
                            ),
                        );
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    ReadLine::Line => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        debug!("Received: {} bytes", trimmed.len());
                        match serde_json::from_str::<Request>(trimmed) {
                            Ok(request) => {
                                let state = Arc::clone(&state);
                                let tx = tx.clone();
                                handlers.spawn(async move {
                                    let response = handle_request(request, &state).await;
                                    let _ = tx.send(response).await;
                                });
                            }
                            Err(e) => {
                                let response = Response::error(
                                    request_id(trimmed),
                                    ApiError::invalid_input_with_suggestion(
                                        format!("Invalid JSON request: {}", e),
                                        "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"list_runs\"}}",
                                    ),
                                );
                                if tx.send(response).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            _ = state.shutdown.notified() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    state.runs.abort_all().await;

    if !handlers.is_empty() {
        let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Graceful shutdown timed out after {:?}, dropping {} request(s)",
                GRACEFUL_SHUTDOWN_TIMEOUT,
                handlers.len()
            );
            handlers.abort_all();
        }
    }

    drop(tx);
    writer_task.await.context("Response writer panicked")??;
    outcome
}

/// Best effort id recovery for requests that fail to parse.
fn request_id(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn write_responses<W>(mut rx: mpsc::Receiver<Response>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut json = serde_json::to_string(&response).context("Failed to serialize response")?;
        debug!("Sending: {}", json);
        json.push('\n');
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write response")?;
        writer.flush().await.context("Failed to flush")?;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ReadLine {
    Eof,
    Line,
    /// The line was discarded up to and including its newline.
    TooLarge,
    /// The line was consumed but is not UTF-8.
    InvalidUtf8,
}

/// Read a line with a maximum size limit to prevent memory DoS.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<ReadLine> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();
    let mut oversized = false;

    loop {
        let available = reader.fill_buf().await.context("Failed to read request")?;

        if available.is_empty() {
            if oversized {
                return Ok(ReadLine::TooLarge);
            }
            if bytes.is_empty() {
                return Ok(ReadLine::Eof);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if !oversized && total + consume > max_size {
            oversized = true;
            bytes = Vec::new();
        }
        if !oversized {
            bytes.extend_from_slice(&available[..consume]);
        }
        total += consume;
        reader.consume(consume);

        if newline_pos.is_some() {
            if oversized {
                return Ok(ReadLine::TooLarge);
            }
            break;
        }
    }

    match std::str::from_utf8(&bytes) {
        Ok(line) => {
            buf.push_str(line);
            Ok(ReadLine::Line)
        }
        Err(_) => Ok(ReadLine::InvalidUtf8),
    }
}

/// Handle a single request and return a response.
async fn handle_request(request: Request, state: &ServerState) -> Response {
    debug!("Handling command: {:?}", request.command);
    let id = request.id;

    let result = match request.command {
        Command::SubmitPipeline {
            document,
            base_dir,
            name,
        } => handle_submit(state, document, base_dir, name).await,
        Command::ListPipelines => Ok(ResponseData::Pipelines {
            pipelines: state.pipelines.list().await,
        }),
        Command::StartRun {
            pipeline_id,
            entry,
            frames,
        } => handle_start_run(state, pipeline_id, entry, frames).await,
        Command::RunStatus { run_id } => state
            .runs
            .status(&run_id)
            .await
            .map(|run| ResponseData::Run { run }),
        Command::WaitRun { run_id, timeout_ms } => handle_wait_run(state, run_id, timeout_ms).await,
        Command::AbortRun { run_id } => state
            .runs
            .abort(&run_id)
            .await
            .map(|run| ResponseData::Run { run }),
        Command::ListRuns => Ok(ResponseData::Runs {
            runs: state.runs.list().await,
        }),
        Command::Shutdown => Ok(handle_shutdown(state).await),
    };

    match result {
        Ok(data) => Response::success(id, data),
        Err(e) => Response::error(id, e),
    }
}

async fn handle_submit(
    state: &ServerState,
    document: Value,
    base_dir: Option<String>,
    name: Option<String>,
) -> Result<ResponseData, ApiError> {
    let options = config::submit_options(base_dir.as_deref());
    // Template decoding is file I/O plus image work.
    let graph = tokio::task::spawn_blocking(move || PipelineGraph::from_value(&document, &options))
        .await
        .map_err(|e| ApiError::internal(format!("Pipeline loader failed: {}", e)))?
        .map_err(|e| ApiError::invalid_pipeline(&e))?;

    let nodes = graph.summary();
    let roots = graph.roots().into_iter().map(str::to_string).collect();
    let pipeline_id = state.pipelines.insert(graph, name).await?;
    Ok(ResponseData::PipelineSubmitted {
        pipeline_id,
        nodes,
        roots,
    })
}

async fn handle_start_run(
    state: &ServerState,
    pipeline_id: String,
    entry: String,
    frames: Vec<String>,
) -> Result<ResponseData, ApiError> {
    if frames.is_empty() {
        return Err(ApiError::invalid_input_with_suggestion(
            "start_run needs at least one frame",
            "Pass screenshot paths in 'frames'; the last one repeats once the others are used",
        ));
    }
    let graph = state.pipelines.get(&pipeline_id).await?;

    let paths: Vec<PathBuf> = frames.into_iter().map(PathBuf::from).collect();
    let capture = tokio::task::spawn_blocking(move || ReplayCapture::open(&paths))
        .await
        .map_err(|e| ApiError::internal(format!("Frame loader failed: {}", e)))?
        .map_err(|e| {
            ApiError::invalid_input_with_suggestion(
                format!("{:#}", e),
                "Frame paths must point to PNG, JPEG or BMP files readable by the server",
            )
        })?;

    let run_id = state
        .runs
        .start(
            &pipeline_id,
            graph,
            &entry,
            Arc::new(capture),
            Arc::new(RecordingInjector::new()),
        )
        .await?;
    Ok(ResponseData::RunStarted { run_id })
}

async fn handle_wait_run(
    state: &ServerState,
    run_id: String,
    timeout_ms: Option<u64>,
) -> Result<ResponseData, ApiError> {
    let timeout_ms = timeout_ms.unwrap_or(DEFAULT_WAIT_MS);
    if timeout_ms > MAX_WAIT_MS {
        return Err(ApiError::invalid_input_with_suggestion(
            format!("timeout_ms {} exceeds maximum {}", timeout_ms, MAX_WAIT_MS),
            "Wait in shorter slices and poll again with 'wait_run'",
        ));
    }
    let start = Instant::now();
    let (finished, run) = state
        .runs
        .wait(&run_id, Duration::from_millis(timeout_ms))
        .await?;
    Ok(ResponseData::WaitRunResult {
        finished,
        run,
        elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Abort every run and signal the read loop to stop.
async fn handle_shutdown(state: &ServerState) -> ResponseData {
    info!("Received shutdown command, stopping server");
    state.runs.abort_all().await;
    // notify_one stores a permit, so the read loop sees it even if it is
    // not parked on notified() right now.
    state.shutdown.notify_one();
    ResponseData::Ok {
        message: "Server shutting down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use pixelpilot_core::error::ErrorCode;
    use pixelpilot_core::protocol::RunPhase;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::timeout;

    /// Drives a server over in-memory pipes.
    struct Harness {
        input: tokio::io::DuplexStream,
        output: BufReader<tokio::io::DuplexStream>,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start() -> Self {
            let (input, server_in) = tokio::io::duplex(64 * 1024);
            let (server_out, output) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(serve(BufReader::new(server_in), server_out));
            Self {
                input,
                output: BufReader::new(output),
                server,
            }
        }

        async fn send(&mut self, id: &str, command: Value) {
            let line = json!({ "id": id, "command": command }).to_string();
            self.input.write_all(line.as_bytes()).await.unwrap();
            self.input.write_all(b"\n").await.unwrap();
            self.input.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let mut line = String::new();
            timeout(Duration::from_secs(5), self.output.read_line(&mut line))
                .await
                .expect("Timeout reading response")
                .expect("Failed to read");
            serde_json::from_str(&line).expect("Failed to parse response")
        }

        async fn request(&mut self, id: &str, command: Value) -> Response {
            self.send(id, command).await;
            let response = self.recv().await;
            assert_eq!(response.id, id);
            response
        }
    }

    fn direct_pipeline() -> Value {
        json!({
            "start": {
                "recognition": "DirectHit",
                "action": "Click",
                "target": [10, 10],
                "pre_delay": 0,
                "post_delay": 0,
                "next": ["done"]
            },
            "done": {
                "recognition": "DirectHit",
                "action": "DoNothing",
                "pre_delay": 0,
                "post_delay": 0
            }
        })
    }

    fn frame_file(dir: &std::path::Path) -> String {
        let path = dir.join("frame.png");
        RgbImage::from_pixel(32, 32, Rgb([0, 0, 0])).save(&path).unwrap();
        path.display().to_string()
    }

    async fn submit(harness: &mut Harness, document: Value) -> String {
        let response = harness
            .request(
                "submit",
                json!({ "action": "submit_pipeline", "document": document }),
            )
            .await;
        assert!(response.success, "{:?}", response.error);
        match response.data {
            Some(ResponseData::PipelineSubmitted { pipeline_id, .. }) => pipeline_id,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_line_bounded_handles_utf8_chunks() {
        let data = "hello 你好\n".as_bytes().to_vec();
        let cursor = std::io::Cursor::new(data);
        let mut reader = BufReader::with_capacity(1, cursor);
        let mut buf = String::new();

        let read = read_line_bounded(&mut reader, &mut buf, 1024)
            .await
            .expect("read line");

        assert_eq!(read, ReadLine::Line);
        assert_eq!(buf, "hello 你好\n");
    }

    #[tokio::test]
    async fn test_read_line_bounded_skips_oversized_line() {
        let data = b"0123456789abcdef\nok\n".to_vec();
        let mut reader = BufReader::with_capacity(4, std::io::Cursor::new(data));
        let mut buf = String::new();

        assert_eq!(
            read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(),
            ReadLine::TooLarge
        );
        assert!(buf.is_empty());
        assert_eq!(
            read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(),
            ReadLine::Line
        );
        assert_eq!(buf, "ok\n");
        buf.clear();
        assert_eq!(
            read_line_bounded(&mut reader, &mut buf, 8).await.unwrap(),
            ReadLine::Eof
        );
    }

    #[tokio::test]
    async fn test_read_line_bounded_flags_invalid_utf8() {
        let data = b"{\"id\":\"x\",\"command\":\"\xff\"}\nok\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = String::new();

        assert_eq!(
            read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap(),
            ReadLine::InvalidUtf8
        );
        assert!(buf.is_empty());
        assert_eq!(
            read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap(),
            ReadLine::Line
        );
        assert_eq!(buf, "ok\n");
    }

    #[tokio::test]
    async fn test_invalid_utf8_request_keeps_serving() {
        let mut harness = Harness::start();
        harness
            .input
            .write_all(b"{\"id\":\"x\",\"command\":\"\xff\"}\n")
            .await
            .unwrap();

        let response = harness.recv().await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);

        let response = harness
            .request("2", json!({ "action": "list_runs" }))
            .await;
        assert!(response.success);
        assert!(!harness.server.is_finished());
    }

    #[test]
    fn test_request_id_recovery() {
        assert_eq!(request_id(r#"{"id":"42","command":{"action":"bogus"}}"#), "42");
        assert_eq!(request_id("not json"), "unknown");
    }

    #[tokio::test]
    async fn test_submit_reports_nodes_and_roots() {
        let mut harness = Harness::start();
        let response = harness
            .request(
                "1",
                json!({ "action": "submit_pipeline", "document": direct_pipeline(), "name": "demo" }),
            )
            .await;
        assert!(response.success);
        let Some(ResponseData::PipelineSubmitted { nodes, roots, .. }) = response.data else {
            panic!("expected pipeline_submitted");
        };
        assert_eq!(nodes.len(), 2);
        assert_eq!(roots, vec!["start".to_string()]);

        let response = harness.request("2", json!({ "action": "list_pipelines" })).await;
        let Some(ResponseData::Pipelines { pipelines }) = response.data else {
            panic!("expected pipelines");
        };
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].name.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn test_submit_invalid_pipeline() {
        let mut harness = Harness::start();
        let response = harness
            .request(
                "1",
                json!({
                    "action": "submit_pipeline",
                    "document": { "start": { "recognition": "DirectHit", "action": "DoNothing", "next": ["ghost"] } }
                }),
            )
            .await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::InvalidPipeline);
        assert!(error.message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_response() {
        let mut harness = Harness::start();
        harness.input.write_all(b"{not json}\n").await.unwrap();
        let response = harness.recv().await;
        assert!(!response.success);
        assert_eq!(response.id, "unknown");
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_file(dir.path());
        let mut harness = Harness::start();
        let pipeline_id = submit(&mut harness, direct_pipeline()).await;

        let response = harness
            .request(
                "run",
                json!({ "action": "start_run", "pipeline_id": pipeline_id, "entry": "start", "frames": [frame] }),
            )
            .await;
        assert!(response.success, "{:?}", response.error);
        let Some(ResponseData::RunStarted { run_id }) = response.data else {
            panic!("expected run_started");
        };

        let response = harness
            .request(
                "wait",
                json!({ "action": "wait_run", "run_id": run_id, "timeout_ms": 5000 }),
            )
            .await;
        let Some(ResponseData::WaitRunResult { finished, run, .. }) = response.data else {
            panic!("expected wait_run_result");
        };
        assert!(finished);
        assert_eq!(run.phase, RunPhase::Succeeded);
        assert_eq!(
            run.outcome.unwrap().visited_names(),
            vec!["start", "done"]
        );

        let response = harness.request("list", json!({ "action": "list_runs" })).await;
        let Some(ResponseData::Runs { runs }) = response.data else {
            panic!("expected runs");
        };
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_start_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::start();
        let pipeline_id = submit(&mut harness, direct_pipeline()).await;

        let response = harness
            .request(
                "1",
                json!({ "action": "start_run", "pipeline_id": "nope", "entry": "start", "frames": ["x.png"] }),
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::PipelineNotFound);

        let response = harness
            .request(
                "2",
                json!({ "action": "start_run", "pipeline_id": pipeline_id, "entry": "start", "frames": [] }),
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);

        let missing = dir.path().join("missing.png").display().to_string();
        let response = harness
            .request(
                "3",
                json!({ "action": "start_run", "pipeline_id": pipeline_id, "entry": "start", "frames": [missing] }),
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);

        let response = harness
            .request("4", json!({ "action": "run_status", "run_id": "nope" }))
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::RunNotFound);
    }

    #[tokio::test]
    async fn test_abort_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let frame = frame_file(dir.path());
        let mut harness = Harness::start();
        let pipeline_id = submit(
            &mut harness,
            json!({
                "start": { "recognition": "DirectHit", "action": "Wait", "duration": 60000, "pre_delay": 0 }
            }),
        )
        .await;

        let response = harness
            .request(
                "run",
                json!({ "action": "start_run", "pipeline_id": pipeline_id, "entry": "start", "frames": [frame] }),
            )
            .await;
        let Some(ResponseData::RunStarted { run_id }) = response.data else {
            panic!("expected run_started");
        };

        // The wait is still pending when the abort goes out.
        harness
            .send("wait", json!({ "action": "wait_run", "run_id": run_id, "timeout_ms": 30000 }))
            .await;
        harness
            .send("abort", json!({ "action": "abort_run", "run_id": run_id }))
            .await;

        let mut waited = None;
        for _ in 0..2 {
            let response = harness.recv().await;
            assert!(response.success, "{:?}", response.error);
            if response.id == "wait" {
                waited = response.data;
            }
        }
        let Some(ResponseData::WaitRunResult { finished, run, .. }) = waited else {
            panic!("expected wait_run_result");
        };
        assert!(finished);
        assert_eq!(run.phase, RunPhase::Aborted);
    }

    #[tokio::test]
    async fn test_wait_rejects_excessive_timeout() {
        let mut harness = Harness::start();
        let response = harness
            .request(
                "1",
                json!({ "action": "wait_run", "run_id": "r", "timeout_ms": MAX_WAIT_MS + 1 }),
            )
            .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let mut harness = Harness::start();
        let response = harness.request("bye", json!({ "action": "shutdown" })).await;
        assert!(response.success);

        let result = timeout(Duration::from_secs(5), &mut harness.server)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_eof_stops_server() {
        let harness = Harness::start();
        let Harness { input, server, .. } = harness;
        drop(input);
        let result = timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
    }
}
