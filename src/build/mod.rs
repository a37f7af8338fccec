//! Build orchestration.
//!
//! This module provides:
//! - [`context`] - Command runner, tool paths and privilege control for a build
//! - [`privileges`] - Scoped effective-uid switching under sudo
//! - [`payload`] - Unpacking the system payload
//! - [`pipeline`] - The end-to-end build sequence

pub mod context;
pub mod payload;
pub mod pipeline;
pub mod privileges;
