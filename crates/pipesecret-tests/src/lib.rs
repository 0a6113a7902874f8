//! End-to-end helpers: a full controller/remote tunnel over in-memory pipes
//! with the bridge on a real Unix socket in a temp directory.

pub mod harness;
