//! Error types shared by the pipeline stages.

use std::fmt;

/// Every problem found while validating a configuration.
///
/// Validation never stops at the first problem, so this carries the full
/// list for the user to fix in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<String>);

impl ConfigErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// Ok if no problem was recorded.
    pub fn into_result<T>(self, value: T) -> Result<T, PipelineError> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(PipelineError::Config(self))
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration problem(s)", self.0.len())?;
        for message in &self.0 {
            write!(f, "\n  - {}", message)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(ConfigErrors),
    #[error("Input was produced with {tag} `{found}`, but this stage is configured with `{expected}`")]
    Consistency {
        tag: &'static str,
        expected: String,
        found: String,
    },
    #[error("Matrix error: {0}")]
    Matrix(String),
    #[error("Failed to parse {what}: `{input}`")]
    Parse { what: &'static str, input: String },
}

impl PipelineError {
    pub fn parse(what: &'static str, input: impl Into<String>) -> Self {
        PipelineError::Parse {
            what,
            input: input.into(),
        }
    }
}
