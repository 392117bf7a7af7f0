//! Error classification shared by every request-facing error type.

use std::fmt;

/// Broad class of a failure, used by the HTTP layer to pick a status code
/// and by workers to decide how loudly to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing setting, malformed pattern, unknown connector or driver.
    Configuration,
    /// Invalid id, name, alias, interval or priority.
    Identity,
    /// Link or parent points nowhere, or would form a cycle.
    Referential,
    /// Unique name or alias already taken.
    Conflict,
    /// Requested graph, group or catalog entry does not exist.
    Resolution,
    /// Malformed `{{ ... }}` or missing template attribute.
    Template,
    /// A backend call failed or timed out.
    TransientBackend,
    /// A backend returned a different number of series than requested.
    ShapeMismatch,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Identity => "identity",
            ErrorKind::Referential => "referential",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Resolution => "resolution",
            ErrorKind::Template => "template",
            ErrorKind::TransientBackend => "transient_backend",
            ErrorKind::ShapeMismatch => "shape_mismatch",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
