//! Shared types for the devconf workspace.
//!
//! Keep wire-level enums and their string forms here so the controller, its
//! tests and any device tooling agree on one spelling.

#![warn(missing_docs)]

/// Device protocol and lifecycle vocabulary.
pub mod api;
