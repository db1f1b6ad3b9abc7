//! Compilation of a config plus its ordered template fragments into the
//! package a device downloads.
//!
//! Every backend merges fragments first to last with the local config on
//! top, substitutes `{{ variable }}` references from the resolved context,
//! validates the result against its schema and renders a file list that
//! [`archive::pack`] turns into a reproducible tarball.

use serde_json::Value;
use thiserror::Error;

use crate::context::ResolvedContext;

pub mod archive;
pub mod dsa;
pub mod generic;
pub mod merge;
pub mod registry;

pub use dsa::DsaPolicy;
pub use generic::GenericBackend;
pub use registry::BackendRegistry;

/// One schema violation, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid configuration triggered by \"#{}\", validator says:\n\n{}",
            self.path, self.message
        )
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("{}", join_violations(.0))]
    Validation(Vec<Violation>),
    #[error("backend schema is invalid: {0}")]
    Schema(String),
    #[error("failed to build configuration archive")]
    Archive(#[source] std::io::Error),
}

impl CompileError {
    /// Every schema violation, in validator order. Empty for other errors.
    pub fn violations(&self) -> &[Violation] {
        match self {
            CompileError::Validation(violations) => violations,
            _ => &[],
        }
    }
}

/// One file of the rendered package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: String,
    pub mode: u32,
    pub contents: String,
}

impl RenderedFile {
    pub fn new(path: impl Into<String>, mode: u32, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode,
            contents: contents.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Switch model for backends that support it; `None` lets the backend
    /// pick its own default.
    pub dsa: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    /// Local config document, applied after every fragment.
    pub config: &'a Value,
    /// Template fragments in stored order.
    pub fragments: &'a [Value],
    pub context: &'a ResolvedContext,
    /// Used for the hostname default; template-only renders pass `None`.
    pub device_name: Option<&'a str>,
    pub options: RenderOptions,
}

/// Parameters for generating a VPN client fragment from a VPN server.
#[derive(Debug, Clone, Copy)]
pub struct AutoClientRequest<'a> {
    pub vpn_backend: common::api::VpnBackend,
    pub vpn_name: &'a str,
    /// Simple hex id of the VPN; context variables are suffixed with it.
    pub vpn_hex: &'a str,
    pub host: &'a str,
    pub server: &'a Value,
    /// Include client certificate and key references.
    pub auto_cert: bool,
}

pub trait Backend: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn schema(&self) -> &Value;

    fn supports_dsa(&self) -> bool {
        false
    }

    /// Merge, substitute and normalize without validating.
    fn document(&self, input: &RenderInput<'_>) -> Value {
        let mut document = merge::merge_document(input.fragments.iter(), input.config);
        merge::substitute(&mut document, input.context);
        merge::dedupe_files(&mut document);
        if let Some(name) = input.device_name {
            merge::default_hostname(&mut document, name);
        }
        document
    }

    /// Validate the compiled document, returning it on success.
    fn validate(&self, input: &RenderInput<'_>) -> Result<Value, CompileError>;

    fn render(&self, input: &RenderInput<'_>) -> Result<Vec<RenderedFile>, CompileError>;

    fn generate(&self, input: &RenderInput<'_>) -> Result<Vec<u8>, CompileError> {
        let files = self.render(input)?;
        archive::pack(&files).map_err(CompileError::Archive)
    }

    /// Client fragment for a VPN server; `None` when this backend cannot
    /// generate one for the VPN backend.
    fn auto_client(&self, _request: &AutoClientRequest<'_>) -> Option<Value> {
        None
    }
}
