//! imgsim Jobs - Asynchronous classification pipeline
//!
//! This crate runs feature extraction and similarity ranking as jobs:
//! - A bounded worker pool with pollable job handles
//! - An orchestrator that waits on jobs without busy polling
//! - Service wiring from configuration to a running pipeline
//!
//! Author: hephaex@gmail.com

pub mod dispatcher;
pub mod executor;
pub mod orchestrator;
pub mod service;

pub use dispatcher::Dispatcher;
pub use executor::{JobExecutor, PipelineExecutor};
pub use orchestrator::{ClassificationOrchestrator, Outcome};
pub use service::ImgsimService;
