//! Engine error types.
//!
//! Collaborator failures (routing, classifier, watch transports) arrive as
//! `anyhow::Error` and are wrapped into structured variants that keep the
//! underlying error as their source.

use std::fmt;

use thiserror::Error;

use crate::id_offset::OffsetError;

pub type LbResult<T> = Result<T, LbError>;

#[derive(Debug, Error)]
pub enum LbError {
    /// Benign: removal of a target that is not active.
    #[error("no such target: {0}")]
    NoSuchTarget(u32),

    #[error("target {0} is already active")]
    TargetAlreadyActive(u32),

    #[error("invalid target entry: {0}")]
    InvalidTarget(String),

    #[error("invalid flow '{name}': {reason}")]
    InvalidFlow { name: String, reason: String },

    #[error("route for {ip} (mark {mark}) failed")]
    Route {
        ip: String,
        mark: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("classifier {op} failed for stream '{stream}'")]
    Classifier {
        stream: String,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("watch on stream '{stream}' failed")]
    Watch {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("load balancer for stream '{stream}' is {state}, cannot {op}")]
    InvalidState {
        stream: String,
        state: &'static str,
        op: &'static str,
    },

    #[error("target {identifier} on stream '{stream}'")]
    Target {
        stream: String,
        identifier: u32,
        #[source]
        source: Box<LbError>,
    },

    #[error(transparent)]
    Offset(#[from] OffsetError),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl LbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LbError::NoSuchTarget(_))
    }

    pub(crate) fn for_target(stream: &str, identifier: u32, source: LbError) -> Self {
        LbError::Target {
            stream: stream.to_string(),
            identifier,
            source: Box::new(source),
        }
    }
}

/// Collects every failure of a batch operation without aborting the batch.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<LbError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: LbError) {
        match error {
            // Flatten nested aggregates so every cause sits at one level.
            LbError::Multi(nested) => self.errors.extend(nested.errors),
            other => self.errors.push(other),
        }
    }

    /// Records the error of `result`, if any.
    pub fn collect<T>(&mut self, result: LbResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[LbError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<LbError> {
        self.errors
    }

    pub fn into_result(self) -> LbResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(LbError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            write!(f, "{}", if i == 0 { ": " } else { "; " })?;
            write!(f, "{}", error)?;
            let mut source = std::error::Error::source(error);
            while let Some(cause) = source {
                write!(f, ": {}", cause)?;
                source = cause.source();
            }
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
