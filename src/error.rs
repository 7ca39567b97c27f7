// src/error.rs
//! Error handling for the entire crate.
//!
//! - **Taxonomy**: one variant per failure the bridge can report, authoring-time
//!   (`InvalidInterface`, `DuplicateParameterName`, `CyclicInclude`, `UnresolvedInclude`),
//!   compile-time (`CompileFailure`, `BackendUnavailable`) and bind-time (`TypeMismatch`).
//! - **Cheap to clone**: foreign errors are stored behind `Arc` so errors can be fanned
//!   out to every waiter of a shared compile and to notification subscribers.
//! - **Context chaining** with [`Error::context`] and a crate-wide [`Result`] alias.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::line_map::SourceOrigin;
use crate::permutation::CompileDiagnostics;
use crate::snippets::SnippetId;
use crate::source_model::{BlockId, ShaderType};

/// Main error type. Send + Sync + Clone + 'static.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Malformed authored interface (duplicate names, bad identifiers, bad meta tags...).
    #[error("invalid interface on block {block}: {reason}")]
    InvalidInterface { block: BlockId, reason: String },

    /// Two parameters collide after case-insensitive normalization.
    #[error("duplicate parameter name `{name}` on block {block} (collides with `{existing}`)")]
    DuplicateParameterName {
        block: BlockId,
        name: String,
        existing: String,
    },

    /// Snippet include graph contains a cycle. `cycle` starts and ends on the same snippet.
    #[error("cyclic include: {}", format_cycle(.cycle))]
    CyclicInclude { cycle: Vec<SnippetId> },

    /// An `#include` names a snippet the asset system does not know about.
    #[error("unresolved include \"{include}\" at {from}:{line}")]
    UnresolvedInclude {
        include: SnippetId,
        from: SourceOrigin,
        line: u32,
    },

    /// The backend rejected the source. Structured diagnostics are attached.
    #[error("compile failure: {0}")]
    CompileFailure(Arc<CompileDiagnostics>),

    /// A material-instance value disagrees with the declared parameter type.
    #[error("type mismatch on `{name}`: declared {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: ShaderType,
        got: ShaderType,
    },

    /// Compiler backend not reachable or misconfigured (retryable).
    #[error("shader compiler backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    #[error("unknown snippet \"{0}\"")]
    UnknownSnippet(SnippetId),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining (like `.context()` in anyhow).
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

fn format_cycle(cycle: &[SnippetId]) -> String {
    cycle
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn invalid_interface(block: BlockId, reason: impl Into<String>) -> Self {
        Self::InvalidInterface {
            block,
            reason: reason.into(),
        }
    }

    /// Add context to any error (chainable).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    // === kind checks ===

    /// Errors raised while editing: they block extraction/compilation of the block
    /// but leave the last valid state active for runtime purposes.
    #[inline]
    pub fn is_authoring(&self) -> bool {
        matches!(
            self.root(),
            Error::InvalidInterface { .. }
                | Error::DuplicateParameterName { .. }
                | Error::CyclicInclude { .. }
                | Error::UnresolvedInclude { .. }
        )
    }

    /// Only infrastructure failures are worth retrying.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Error::BackendUnavailable(_))
    }

    #[inline]
    pub fn is_compile_failure(&self) -> bool {
        matches!(self.root(), Error::CompileFailure(_))
    }

    #[inline]
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self.root(), Error::TypeMismatch { .. })
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = Error::CyclicInclude {
            cycle: vec![SnippetId::new("a.ush"), SnippetId::new("b.ush"), SnippetId::new("a.ush")],
        };
        assert_eq!(err.to_string(), "cyclic include: a.ush -> b.ush -> a.ush");
        assert!(err.is_authoring());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::BackendUnavailable("dxc not found".into()).context("compiling block 3");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "compiling block 3: shader compiler backend unavailable: dxc not found"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), "I/O error: gone");
    }
}
