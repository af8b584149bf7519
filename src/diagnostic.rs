//! Severity-leveled diagnostics for the assembly pipeline.
//!
//! Every pipeline stage accumulates [`Diagnostic`]s instead of aborting on
//! the first problem, so a single run surfaces as many errors as possible.

use std::fmt;

use colored::Colorize;

use crate::assembler::source::Line;
use crate::assembler::{Verbosity, VERBOSITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Note,
}

impl Level {
    fn verbosity(self) -> Verbosity {
        match self {
            Level::Error => Verbosity::Error,
            Level::Warning => Verbosity::Warn,
            Level::Note => Verbosity::Info,
        }
    }

    fn header(self) -> colored::ColoredString {
        match self {
            Level::Error => "error".red().bold(),
            Level::Warning => "warning".yellow().bold(),
            Level::Note => "note".white().bold(),
        }
    }
}

/// A secondary location attached to a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub origin: Line,
    pub message: String,
}

impl Reference {
    pub fn new<M: Into<String>>(origin: Line, message: M) -> Self {
        Reference {
            origin,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    level: Level,
    message: String,
    origin: Option<Line>,
    reference: Option<Reference>,
    help: Option<String>,
}

impl Diagnostic {
    pub fn error<M: Into<String>>(message: M) -> Self {
        Diagnostic {
            level: Level::Error,
            message: message.into(),
            origin: None,
            reference: None,
            help: None,
        }
    }

    pub fn warning<M: Into<String>>(message: M) -> Self {
        Diagnostic {
            level: Level::Warning,
            message: message.into(),
            origin: None,
            reference: None,
            help: None,
        }
    }

    pub fn note<M: Into<String>>(message: M) -> Self {
        Diagnostic {
            level: Level::Note,
            message: message.into(),
            origin: None,
            reference: None,
            help: None,
        }
    }

    pub fn spanned_error<M: Into<String>>(origin: Line, message: M) -> Self {
        Diagnostic {
            level: Level::Error,
            message: message.into(),
            origin: Some(origin),
            reference: None,
            help: None,
        }
    }

    pub fn referencing_error<M: Into<String>>(origin: Line, message: M, reference: Reference) -> Self {
        Diagnostic {
            level: Level::Error,
            message: message.into(),
            origin: Some(origin),
            reference: Some(reference),
            help: None,
        }
    }

    pub fn with_help<M: Into<String>>(mut self, help: M) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn set_origin(&mut self, origin: Line) {
        self.origin = Some(origin);
    }

    pub fn origin(&self) -> Option<&Line> {
        self.origin.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Marks an internal invariant violation.
    pub fn as_bug(mut self) -> Self {
        self.message = format!("internal assembler bug: {}", self.message);
        self.help = Some("please report this".to_owned());
        self
    }

    /// Emits the diagnostic if the configured verbosity admits its level.
    pub fn emit(&self) {
        let verbosity = VERBOSITY.get().copied().unwrap_or(Verbosity::Warn);
        if self.level.verbosity() <= verbosity {
            eprintln!("{self}");
        }
    }

    /// Emits regardless of verbosity.
    pub fn force_emit(&self) {
        eprintln!("{self}");
    }

    /// Emits and panics. Test-side last resort.
    pub fn scream(&self) -> ! {
        self.force_emit();
        panic!("{}", self.message);
    }
}

// `logos` requires its error type to be constructible from nothing.
impl Default for Diagnostic {
    fn default() -> Self {
        Diagnostic::error("unrecognized token")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level.header(), self.message)?;
        if let Some(origin) = &self.origin {
            write!(f, "\n  {} {}", "-->".blue().bold(), origin.location())?;
            write!(f, "\n   {} {}", "|".blue().bold(), origin.text)?;
        }
        if let Some(reference) = &self.reference {
            write!(
                f,
                "\n  {} {}: {}",
                "-->".blue().bold(),
                reference.origin.location(),
                reference.message
            )?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  {}: {}", "help".cyan().bold(), help)?;
        }
        Ok(())
    }
}

impl From<Diagnostic> for Vec<Diagnostic> {
    fn from(value: Diagnostic) -> Self {
        vec![value]
    }
}

/// Creates an unlocated error [`Diagnostic`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::diagnostic::Diagnostic::error(format!($($arg)*))
    };
}

/// Creates an error [`Diagnostic`] bound to a source [`Line`].
#[macro_export]
macro_rules! spanned_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::diagnostic::Diagnostic::spanned_error($origin, format!($($arg)*))
    };
}

/// Creates a note-level [`Diagnostic`].
#[macro_export]
macro_rules! note {
    ($($arg:tt)*) => {
        $crate::diagnostic::Diagnostic::note(format!($($arg)*))
    };
}

pub trait ResultScream<T, E> {
    fn scream(self) -> T;
    fn expect_or_scream<M: fmt::Display>(self, message: M) -> T;
}

impl<T, E: fmt::Debug> ResultScream<T, E> for Result<T, E> {
    fn scream(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => Diagnostic::error(format!("{err:?}")).scream(),
        }
    }

    fn expect_or_scream<M: fmt::Display>(self, message: M) -> T {
        match self {
            Ok(value) => value,
            Err(err) => Diagnostic::error(format!("{message}: {err:?}")).scream(),
        }
    }
}

pub trait OptionalScream<T> {
    fn expect_or_scream<M: fmt::Display>(self, message: M) -> T;
}

impl<T> OptionalScream<T> for Option<T> {
    fn expect_or_scream<M: fmt::Display>(self, message: M) -> T {
        match self {
            Some(value) => value,
            None => Diagnostic::error(message.to_string()).scream(),
        }
    }
}
