//! CLI-related shared utilities.
//!
//! Keeps CLI policy in one place so binaries don't duplicate behavior.

mod color;

pub use color::ColorWhen;
