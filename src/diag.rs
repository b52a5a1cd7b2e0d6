//! Diagnostics: error kinds, counting, and phase checkpoints.
//!
//! Everything funnels through one [`Diagnostics`] value. Individual
//! errors are reported as they happen (through the `log` facade) and
//! counted; [`Diagnostics::assert_no_errors`] is called between pipeline
//! phases and fails the run if anything was reported since the previous
//! checkpoint.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::assembly::Position;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("codegen error: {0}")]
    Codegen(String),
    #[error("link error: {0}")]
    Link(String),
    #[error("platform error: {0}")]
    Platform(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{count} error(s) in phase `{phase}`")]
    PhaseFailed { phase: String, count: usize },
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: AtomicUsize,
    checkpointed: AtomicUsize,
    warnings: AtomicUsize,
    fatal_warnings: bool,
}

impl Diagnostics {
    pub fn new(fatal_warnings: bool) -> Diagnostics {
        Diagnostics {
            fatal_warnings,
            ..Diagnostics::default()
        }
    }

    fn format_position(position: Option<Position>) -> String {
        match position {
            Some(p) => format!(" at {}:{}", p.line, p.column),
            None => String::new(),
        }
    }

    pub fn error(&self, message: impl fmt::Display, position: Option<Position>) {
        log::error!("{}{}", message, Diagnostics::format_position(position));
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn warn(&self, message: impl fmt::Display, position: Option<Position>) {
        if self.fatal_warnings {
            self.error(message, position);
        } else {
            log::warn!("{}{}", message, Diagnostics::format_position(position));
            self.warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    /// Checkpoint: fails if any error arrived since the last checkpoint.
    pub fn assert_no_errors(&self, phase: &str) -> Result<(), CompileError> {
        let total = self.errors.load(Ordering::SeqCst);
        let seen = self.checkpointed.swap(total, Ordering::SeqCst);
        if total > seen {
            Err(CompileError::PhaseFailed {
                phase: phase.to_string(),
                count: total - seen,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_only_see_new_errors() {
        let diagnostics = Diagnostics::new(false);
        assert!(diagnostics.assert_no_errors("parse").is_ok());

        diagnostics.error("bad thing", None);
        assert!(diagnostics.assert_no_errors("compile").is_err());

        // The error was consumed by the previous checkpoint.
        assert!(diagnostics.assert_no_errors("assemble").is_ok());
    }

    #[test]
    fn fatal_warnings_count_as_errors() {
        let diagnostics = Diagnostics::new(true);
        diagnostics.warn("suspicious thing", None);
        assert_eq!(diagnostics.error_count(), 1);
        assert!(diagnostics.assert_no_errors("compile").is_err());
    }

    #[test]
    fn ordinary_warnings_do_not_fail_checkpoints() {
        let diagnostics = Diagnostics::new(false);
        diagnostics.warn("suspicious thing", None);
        assert_eq!(diagnostics.warning_count(), 1);
        assert!(diagnostics.assert_no_errors("compile").is_ok());
    }
}
