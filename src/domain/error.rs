// Engine error taxonomy
use thiserror::Error;

/// Errors raised while loading a definition document or operating a mounted
/// dashboard. Load-time structural errors abort construction entirely;
/// runtime errors are scoped to one data source or visualization and recorded
/// against it. Validation findings that must not abort the load (unresolved
/// layout items, overlapping geometry) are reported as warning strings, not
/// as variants here.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("token `{name}` has never been set")]
    MissingToken { name: String },

    #[error("template references token `{name}`, which is unset and has no default")]
    UnresolvedToken { name: String },

    #[error("token `{token}` has no field `{field}`")]
    InvalidFieldAccess { token: String, field: String },

    #[error("result has no series named `{series}`")]
    SeriesNotFound { series: String },

    #[error("visualization `{visualization}`: role `{role}` does not resolve to a declared data source (`{source}`)")]
    DanglingDataSourceReference {
        visualization: String,
        role: String,
        // `r#` keeps thiserror from treating this field as the error cause;
        // the identifier is still plain `source` at every use site.
        r#source: String,
    },

    #[error("data source `{source}` failed: {message}")]
    QueryBackend { r#source: String, message: String },

    #[error("malformed template in {context}: {reason}")]
    TemplateParse { context: String, reason: String },

    #[error("malformed pipeline in {context}: {reason}")]
    PipelineParse { context: String, reason: String },

    #[error("data source `{id}`: {reason}")]
    InvalidDataSource { id: String, reason: String },

    #[error("tab `{tab}` references unknown layout `{layout}`")]
    UnknownLayout { tab: String, layout: String },

    #[error("dependency cycle detected: {path}")]
    CycleDetected { path: String },

    #[error("unknown input `{id}`")]
    UnknownInput { id: String },

    #[error("no tab at index {index}")]
    UnknownTab { index: usize },

    #[error("invalid definition document: {0}")]
    Definition(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
