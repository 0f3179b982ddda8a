//! Integration tests for the MogileFS client
//!
//! These run the full client stack against the in-memory cluster from
//! `mogile_core::testing`, and against real sockets where the transport
//! itself is under test.

#[path = "integration/bigfile_workflow.rs"]
mod bigfile_workflow;
#[path = "integration/directory_workflow.rs"]
mod directory_workflow;
#[path = "integration/http_storage.rs"]
mod http_storage;
#[path = "integration/tcp_tracker.rs"]
mod tcp_tracker;
