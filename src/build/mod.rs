//! Build workspace management.
//!
//! This module provides:
//! - [`context`] - The per-build [`Context`](context::Context) and sandbox invocation
//! - [`tree`] - Creating, copying and removing directory trees

pub mod context;
pub mod tree;
