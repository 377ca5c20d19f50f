//! Error type shared by every stage of a pipeline.
//!
//! An [`EtlError`] is either one classified failure or the aggregate of several, which is how
//! concurrent export workers report. The [`ErrorKind`] decides how the controller reacts:
//! destination faults are recovered by waiting for the destination, everything else stops the
//! pipeline.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

pub type EtlResult<T> = Result<T, EtlError>;

type Source = Arc<dyn error::Error + Send + Sync>;

/// A single classified failure.
#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Source>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(Box<Failure>),
    /// Failures of concurrent workers, in the order they were joined.
    Many {
        errors: Vec<EtlError>,
        location: &'static Location<'static>,
    },
}

/// Error returned by pipelines, destinations, scripts and stores.
///
/// Build one with [`crate::etl_error!`] or return early with [`crate::bail!`]. Equality only
/// compares kinds, which is what tests assert on.
#[derive(Debug, Clone)]
pub struct EtlError {
    repr: ErrorRepr,
}

/// Classification of an [`EtlError`].
///
/// The controller decides between fault recovery and a hard stop by looking at the kind, so
/// new kinds must be placed in the right group.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connections
    SourceConnectionFailed,
    DestinationConnectionFailed,
    DestinationUnhealthy,

    // Queries and writes
    SourceQueryFailed,
    DestinationQueryFailed,

    // Table metadata
    MissingTableSchema,
    SchemaDrift,
    MissingOrderColumn,

    // Row transformation
    ConversionError,
    EncodingError,
    InvalidData,

    // Scripts
    ScriptCompileError,
    ScriptRuntimeError,

    ConfigError,

    // IO and serialization
    IoError,
    DeserializationError,

    // Pipeline state
    InvalidState,
    CheckpointError,
    StreamWorkerPanic,
    ReaderWorkerPanic,
    ExportWorkerPanic,

    DestinationError,

    Unknown,
}

impl ErrorKind {
    /// Whether the kind is produced by a failing destination and can be recovered by waiting for
    /// the destination to become healthy again.
    ///
    /// Encoding, script and data errors are not: replaying the same rows fails the same way.
    pub fn is_destination_fault(&self) -> bool {
        matches!(
            self,
            ErrorKind::DestinationConnectionFailed
                | ErrorKind::DestinationUnhealthy
                | ErrorKind::DestinationQueryFailed
                | ErrorKind::DestinationError
        )
    }
}

impl EtlError {
    /// Kind of the error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::Single(failure) => failure.kind,
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(EtlError::kind)
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Every kind contained in the error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.repr {
            ErrorRepr::Single(failure) => vec![failure.kind],
            ErrorRepr::Many { errors, .. } => errors.iter().flat_map(EtlError::kinds).collect(),
        }
    }

    /// Dynamic detail, or the first detail among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(failure) => failure.detail.as_deref(),
            ErrorRepr::Many { errors, .. } => errors.iter().find_map(EtlError::detail),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match &self.repr {
            ErrorRepr::Single(failure) => Some(failure.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Where the error was created.
    pub fn location(&self) -> &'static Location<'static> {
        match &self.repr {
            ErrorRepr::Single(failure) => failure.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Ignored on aggregates, which expose their first error as
    /// source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(failure) = &mut self.repr {
            failure.source = Some(Arc::new(source));
        }

        self
    }

    #[track_caller]
    fn single(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Source>,
    ) -> Self {
        EtlError {
            repr: ErrorRepr::Single(Box::new(Failure {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            })),
        }
    }
}

impl PartialEq for EtlError {
    fn eq(&self, other: &EtlError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(failure) => {
                write!(
                    f,
                    "[{:?}] {} @ {}",
                    failure.kind, failure.description, failure.location
                )?;
                if let Some(detail) = &failure.detail {
                    write_block(f, "Detail", detail)?;
                }
                if failure.backtrace.status() == BacktraceStatus::Captured {
                    write_block(f, "Backtrace", &failure.backtrace.to_string())?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let plural = if errors.len() == 1 { "" } else { "s" };
                write!(f, "[Many] {} error{plural} aggregated @ {location}", errors.len())?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

/// Writes an indented, labelled block. Blank text writes nothing.
fn write_block(f: &mut fmt::Formatter<'_>, label: &str, text: &str) -> fmt::Result {
    if text.trim().is_empty() {
        return Ok(());
    }

    write!(f, "\n  {label}:")?;
    for line in text.lines() {
        write!(f, "\n    {}", line.trim_end())?;
    }

    Ok(())
}

impl error::Error for EtlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(failure) => failure
                .source
                .as_deref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for EtlError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> EtlError {
        EtlError::single(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> EtlError {
        EtlError::single(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for EtlError
where
    E: Into<EtlError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> EtlError {
        let location = Location::caller();
        let mut errors: Vec<EtlError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        EtlError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts a library error into an [`EtlError`] keeping it as the source.
macro_rules! convert_error {
    ($source:ty, |$err:ident| $classify:expr) => {
        impl From<$source> for EtlError {
            #[track_caller]
            fn from($err: $source) -> EtlError {
                let (kind, description): (ErrorKind, &'static str) = $classify;
                let detail = $err.to_string();
                EtlError::single(
                    kind,
                    Cow::Borrowed(description),
                    Some(Cow::Owned(detail)),
                    Some(Arc::new($err)),
                )
            }
        }
    };
}

convert_error!(std::io::Error, |err| (ErrorKind::IoError, "I/O operation failed"));

convert_error!(serde_json::Error, |err| match err.classify() {
    serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
    _ => (ErrorKind::DeserializationError, "JSON deserialization failed"),
});

convert_error!(std::str::Utf8Error, |err| (
    ErrorKind::ConversionError,
    "Invalid UTF-8 text"
));

convert_error!(std::string::FromUtf8Error, |err| (
    ErrorKind::ConversionError,
    "Invalid UTF-8 text"
));

convert_error!(std::num::ParseIntError, |err| (
    ErrorKind::ConversionError,
    "Integer parsing failed"
));

convert_error!(std::num::ParseFloatError, |err| (
    ErrorKind::ConversionError,
    "Float parsing failed"
));

convert_error!(chrono::ParseError, |err| (
    ErrorKind::ConversionError,
    "Datetime parsing failed"
));

convert_error!(sqlx::Error, |err| match &err {
    sqlx::Error::Io(_) => (ErrorKind::IoError, "Database I/O failed"),
    sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
        (ErrorKind::SourceConnectionFailed, "Database pool unavailable")
    }
    _ => (ErrorKind::SourceQueryFailed, "Database operation failed"),
});

convert_error!(mysql::schema::SchemaError, |err| match &err {
    mysql::schema::SchemaError::Database(_) => {
        (ErrorKind::SourceQueryFailed, "Table schema lookup failed")
    }
    mysql::schema::SchemaError::TableNotFound(_) => {
        (ErrorKind::MissingTableSchema, "Table schema lookup failed")
    }
});

convert_error!(rhai::ParseError, |err| (
    ErrorKind::ScriptCompileError,
    "Script compilation failed"
));

impl From<Box<rhai::EvalAltResult>> for EtlError {
    #[track_caller]
    fn from(err: Box<rhai::EvalAltResult>) -> EtlError {
        let detail = err.to_string();
        EtlError::single(
            ErrorKind::ScriptRuntimeError,
            Cow::Borrowed("Script execution failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(*err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, etl_error};

    fn failing() -> EtlResult<()> {
        bail!(ErrorKind::SchemaDrift, "Row width mismatch", "expected 3 got 4");
    }

    #[test]
    fn bail_carries_kind_and_detail() {
        let err = failing().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaDrift);
        assert_eq!(err.detail(), Some("expected 3 got 4"));
        assert!(err.to_string().contains("Row width mismatch"));
    }

    #[test]
    fn single_error_vector_is_not_wrapped() {
        let err = EtlError::from(vec![etl_error!(
            ErrorKind::DestinationError,
            "Write failed"
        )]);
        assert_eq!(err.kinds(), vec![ErrorKind::DestinationError]);
        assert_eq!(err, etl_error!(ErrorKind::DestinationError, "Other"));
    }

    #[test]
    fn aggregated_errors_expose_all_kinds() {
        let err = EtlError::from(vec![
            etl_error!(ErrorKind::SourceQueryFailed, "Page failed"),
            etl_error!(ErrorKind::DestinationError, "Write failed"),
        ]);
        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceQueryFailed, ErrorKind::DestinationError]
        );
        assert!(err.to_string().contains("2 errors aggregated"));
    }

    #[test]
    fn library_errors_keep_their_source() {
        let err: EtlError = "x".parse::<i64>().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
        assert!(error::Error::source(&err).is_some());

        let err: EtlError = serde_json::from_str::<i64>("{").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }

    #[test]
    fn script_errors_map_to_script_kinds() {
        let engine = rhai::Engine::new();
        let err: EtlError = engine.compile("fn handle(").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::ScriptCompileError);

        let err: EtlError = engine.eval::<i64>("throw 1").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::ScriptRuntimeError);
    }

    #[test]
    fn destination_faults_are_classified() {
        assert!(ErrorKind::DestinationError.is_destination_fault());
        assert!(!ErrorKind::CheckpointError.is_destination_fault());
        assert!(!ErrorKind::ScriptRuntimeError.is_destination_fault());
        assert!(!ErrorKind::EncodingError.is_destination_fault());
    }
}
