// src/errors/mod.rs
//! Internal-error diagnostics for the mid-end transforms (E95xx).
//!
//! Every variant is a compiler invariant violation: the transform aborts
//! the current routine and the failure is fatal for the translation unit.
//! There is no recovery path.

#![allow(unused_assignments)] // False positives from thiserror derive

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum InternalError {
    #[error("'{construct}' must be eliminated before the closure-iterator transform")]
    #[diagnostic(code(E9501))]
    UnsupportedConstruct {
        construct: &'static str,
        #[label("not expected at this stage")]
        span: SourceSpan,
    },

    #[error("yield remains in expression position after lowering")]
    #[diagnostic(code(E9502))]
    YieldInExpression {
        #[label("still inside an expression")]
        span: SourceSpan,
    },

    #[error("closure-iterator transform invariant violated: {message}")]
    #[diagnostic(code(E9503))]
    InvariantViolation {
        message: String,
        #[label("while transforming this")]
        span: SourceSpan,
    },

    #[error("return with a value in an iterator without a return type")]
    #[diagnostic(code(E9504))]
    MissingReturnType {
        #[label("value materialized here")]
        span: SourceSpan,
    },
}
