use core::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    path: Option<PathBuf>,
    source: ErrorSource,
    kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, source: ErrorSource, path: Option<PathBuf>) -> Self {
        Self { kind, source, path }
    }

    pub(crate) fn with_path(
        kind: ErrorKind,
        source: impl Into<ErrorSource>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(kind, source.into(), Some(path.into()))
    }

    pub(crate) fn unreadable(error: io::Error, path: impl Into<PathBuf>) -> Self {
        Self::with_path(ErrorKind::Unreadable, error, path)
    }

    pub(crate) fn unparseable(error: impl fmt::Display, path: impl Into<PathBuf>) -> Self {
        Self::with_path(
            ErrorKind::Unparseable,
            ErrorSource::Parse(error.to_string()),
            path,
        )
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum ErrorSource {
    Io(io::Error),
    Parse(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ErrorKind {
    Unreadable,
    Unparseable,
}

impl From<io::Error> for ErrorSource {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Parse(e) => f.write_str(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        match self.kind {
            ErrorKind::Unreadable => write!(f, "unable to read {path}: {}", self.source),
            ErrorKind::Unparseable => write!(f, "unable to parse {path}: {}", self.source),
        }
    }
}
