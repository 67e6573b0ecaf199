//! IPC bridge between the pool (parent) and isolated generator workers.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, JobId)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
