use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exception_private::{ExcType, TracebackEntry};

/// An exception that escaped to the host, detached from the heap.
///
/// `exc_type` is the closest builtin type (user classes report the builtin they
/// derive from), while `type_name` is the actual class name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    type_name: String,
    message: Option<String>,
    /// Outermost frame first ("most recent call last").
    traceback: Vec<StackFrame>,
}

/// One line of a traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub filename: String,
    pub line: u32,
}

impl From<&TracebackEntry> for StackFrame {
    fn from(entry: &TracebackEntry) -> Self {
        Self {
            name: entry.name.clone(),
            filename: entry.filename.clone(),
            line: entry.line,
        }
    }
}

impl Exception {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self {
            exc_type,
            type_name: exc_type.to_string(),
            message,
            traceback: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn new_full(
        exc_type: ExcType,
        type_name: String,
        message: Option<String>,
        traceback: Vec<StackFrame>,
    ) -> Self {
        Self {
            exc_type,
            type_name,
            message,
            traceback,
        }
    }

    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::RuntimeError, Some(message.into()))
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    /// `Type: message` without the traceback.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.message {
            Some(m) if !m.is_empty() => format!("{}: {m}", self.type_name),
            _ => self.type_name.clone(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.traceback {
                writeln!(f, "  File \"{}\", line {}, in {}", frame.filename, frame.line, frame.name)?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

impl std::error::Error for Exception {}
