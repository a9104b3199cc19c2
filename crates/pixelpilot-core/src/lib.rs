//! Core types and engine for pixelpilot.
//!
//! pixelpilot drives a graphical application from a declarative pipeline:
//! capture the screen, recognize something in a region of it, act on it with
//! synthetic input, move on to the next node. This crate holds everything
//! except the concrete screen and input backends, which plug in through
//! [`frame::CaptureProvider`] and [`action::InputInjector`].
//!
//! # Modules
//!
//! - [`pipeline`]: graph model and the JSON document loader
//! - [`recognition`]: DirectHit, TemplateMatch, FeatureMatch and ColorMatch
//! - [`action`]: target resolution and the action executor
//! - [`scheduler`]: the polling loop that turns a graph into an [`scheduler::Outcome`]
//! - [`abort`]: cooperative cancellation
//! - [`protocol`]: JSON-line request/response protocol
//! - [`error`]: configuration errors and protocol errors with suggestions
//!
//! # Running a pipeline
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use pixelpilot_core::{frame::CaptureProvider, action::RecordingInjector};
//! # async fn demo(capture: Arc<dyn CaptureProvider>) -> anyhow::Result<()> {
//! let doc = serde_json::json!({
//!     "start": { "recognition": "DirectHit", "action": "Click", "target": [600, 300] }
//! });
//! let graph = pixelpilot_core::submit_pipeline(&doc, std::path::Path::new("."))?;
//! let outcome = pixelpilot_core::run(
//!     Arc::new(graph),
//!     "start",
//!     capture,
//!     Arc::new(RecordingInjector::new()),
//! )
//! .await;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod action;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod protocol;
pub mod recognition;
pub mod scheduler;

pub use pipeline::submit_pipeline;
pub use scheduler::{run, Outcome, RunStatus, Scheduler};
