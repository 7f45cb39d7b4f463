//! tunkeeper CLI Library
//!
//! Verb handlers for the `tunkeeper` binary. Lifecycle logic lives in
//! `tunkeeper-core`; this crate parses flags, picks the logging sink and
//! formats output.

pub mod args;
pub mod lifecycle_cmd;
pub mod logs_cmd;
