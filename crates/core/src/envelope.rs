use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub type Metadata = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Success,
    Partial,
    Error,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    Resource,
    Process,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Process => "process",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{} error: {message}", .kind.label())]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub resource_path: Option<PathBuf>,
    pub details: BTreeMap<String, String>,
    pub targets: Vec<String>,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            resource_path: None,
            details: BTreeMap::new(),
            targets: Vec::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn resource(message: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::new(ErrorKind::Resource, message).with_resource_path(path)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, message)
    }

    /// A process failure carrying the child's exit code and trimmed output.
    pub fn process_output(
        message: impl Into<String>,
        return_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        let mut error = Self::process(message);
        let code = return_code.map_or_else(|| String::from("signal"), |code| code.to_string());
        error.details.insert(String::from("return_code"), code);
        if !stdout.trim().is_empty() {
            error
                .details
                .insert(String::from("stdout"), stdout.trim().to_string());
        }
        if !stderr.trim().is_empty() {
            error
                .details
                .insert(String::from("stderr"), stderr.trim().to_string());
        }
        error
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_resource_path(mut self, path: impl AsRef<Path>) -> Self {
        self.resource_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Outcome of one operation. `Partial` always carries both a payload and the
/// error describing what did not succeed; the payload of `Error` is
/// diagnostic only.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultEnvelope<T> {
    Success {
        data: T,
        message: Option<String>,
        metadata: Metadata,
    },
    Partial {
        data: T,
        error: OperationError,
        message: Option<String>,
        metadata: Metadata,
    },
    Error {
        error: OperationError,
        data: Option<T>,
        message: Option<String>,
        metadata: Metadata,
    },
}

impl<T> ResultEnvelope<T> {
    pub fn success(data: T) -> Self {
        Self::Success {
            data,
            message: None,
            metadata: Metadata::new(),
        }
    }

    pub fn partial(data: T, error: OperationError) -> Self {
        Self::Partial {
            data,
            error,
            message: None,
            metadata: Metadata::new(),
        }
    }

    pub fn error(error: OperationError) -> Self {
        Self::Error {
            error,
            data: None,
            message: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            Self::Success { message, .. }
            | Self::Partial { message, .. }
            | Self::Error { message, .. } => *message = text,
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_mut().insert(key.into(), value.into());
        self
    }

    /// Attaches a diagnostic payload to an error envelope. Ignored for the
    /// other statuses, which already carry their data.
    pub fn with_diagnostic_data(mut self, diagnostic: T) -> Self {
        if let Self::Error { data, .. } = &mut self {
            *data = Some(diagnostic);
        }
        self
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Success { .. } => Status::Success,
            Self::Partial { .. } => Status::Partial,
            Self::Error { .. } => Status::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } | Self::Partial { data, .. } => Some(data),
            Self::Error { data, .. } => data.as_ref(),
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Success { data, .. } | Self::Partial { data, .. } => Some(data),
            Self::Error { data, .. } => data,
        }
    }

    pub fn error_ref(&self) -> Option<&OperationError> {
        match self {
            Self::Success { .. } => None,
            Self::Partial { error, .. } | Self::Error { error, .. } => Some(error),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success { message, .. }
            | Self::Partial { message, .. }
            | Self::Error { message, .. } => message.as_deref(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Success { metadata, .. }
            | Self::Partial { metadata, .. }
            | Self::Error { metadata, .. } => metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Success { metadata, .. }
            | Self::Partial { metadata, .. }
            | Self::Error { metadata, .. } => metadata,
        }
    }

    pub fn map<U>(self, transform: impl FnOnce(T) -> U) -> ResultEnvelope<U> {
        match self {
            Self::Success {
                data,
                message,
                metadata,
            } => ResultEnvelope::Success {
                data: transform(data),
                message,
                metadata,
            },
            Self::Partial {
                data,
                error,
                message,
                metadata,
            } => ResultEnvelope::Partial {
                data: transform(data),
                error,
                message,
                metadata,
            },
            Self::Error {
                error,
                data,
                message,
                metadata,
            } => ResultEnvelope::Error {
                error,
                data: data.map(transform),
                message,
                metadata,
            },
        }
    }

    /// One-line description suitable for a status bar.
    pub fn summary(&self) -> String {
        match (self.message(), self.error_ref()) {
            (Some(message), Some(error)) if self.is_partial() => {
                format!("{}: {message} ({})", self.status(), error.message)
            }
            (Some(message), _) => format!("{}: {message}", self.status()),
            (None, Some(error)) => format!("{}: {}", self.status(), error.message),
            (None, None) => self.status().to_string(),
        }
    }
}

impl<T> From<OperationError> for ResultEnvelope<T> {
    fn from(error: OperationError) -> Self {
        Self::error(error)
    }
}
