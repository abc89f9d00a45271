use crate::tpl::lexer::Position;
use thiserror::Error;

/// Coarse classification of a [`TplError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unterminated token. Fatal to parsing.
    Lex,
    /// Grammar, block matching or tag extension failure. Fatal to parsing.
    Parse,
    /// Failure while executing a template. Aborts the render.
    Runtime,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TplError {
    #[error("Lex Error: {message} at {pos}")]
    Lex { message: String, pos: Position },
    #[error("Parse Error: {message} at {pos}")]
    Parse { message: String, pos: Position },
    #[error("Variable Not Found: `{path}`{}", at(.pos))]
    NotFound {
        path: String,
        pos: Option<Position>,
    },
    #[error("Type Mismatch: {message}{}", at(.pos))]
    TypeMismatch {
        message: String,
        pos: Option<Position>,
    },
    #[error("unknown filter `{name}`{}", at(.pos))]
    UnknownFilter {
        name: String,
        pos: Option<Position>,
    },
    #[error("Filter Error: `{name}` failed: {message}{}", at(.pos))]
    Filter {
        name: String,
        message: String,
        pos: Option<Position>,
    },
    #[error("Runtime Error: {message}{}", at(.pos))]
    Runtime {
        message: String,
        pos: Option<Position>,
    },
    #[error("Serialization Error: {0}")]
    Serialization(String),
    #[error("Write Error: {0}")]
    Write(#[from] std::fmt::Error),
}

fn at(pos: &Option<Position>) -> String {
    match pos {
        Some(p) => format!(" at {}", p),
        None => String::new(),
    }
}

impl TplError {
    pub fn lex(message: impl Into<String>, pos: Position) -> Self {
        TplError::Lex {
            message: message.into(),
            pos,
        }
    }

    pub fn parse(message: impl Into<String>, pos: Position) -> Self {
        TplError::Parse {
            message: message.into(),
            pos,
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        TplError::NotFound {
            path: path.into(),
            pos: None,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        TplError::TypeMismatch {
            message: message.into(),
            pos: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TplError::Runtime {
            message: message.into(),
            pos: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TplError::Lex { .. } => ErrorKind::Lex,
            TplError::Parse { .. } => ErrorKind::Parse,
            _ => ErrorKind::Runtime,
        }
    }

    /// Returns the source position attached to this error, if any.
    pub fn position(&self) -> Option<Position> {
        match self {
            TplError::Lex { pos, .. } | TplError::Parse { pos, .. } => Some(*pos),
            TplError::NotFound { pos, .. }
            | TplError::TypeMismatch { pos, .. }
            | TplError::UnknownFilter { pos, .. }
            | TplError::Filter { pos, .. }
            | TplError::Runtime { pos, .. } => *pos,
            TplError::Serialization(_) | TplError::Write(_) => None,
        }
    }

    /// Attaches `at` to a runtime error that has no position yet.
    ///
    /// Errors that already carry a position keep the innermost one.
    pub fn at(mut self, at: Position) -> Self {
        match &mut self {
            TplError::NotFound { pos, .. }
            | TplError::TypeMismatch { pos, .. }
            | TplError::UnknownFilter { pos, .. }
            | TplError::Filter { pos, .. }
            | TplError::Runtime { pos, .. } => {
                if pos.is_none() {
                    *pos = Some(at);
                }
            }
            _ => {}
        }
        self
    }
}

impl serde::ser::Error for TplError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        TplError::Serialization(msg.to_string())
    }
}
