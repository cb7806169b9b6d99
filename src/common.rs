// Copyright 2026 The Arraycalc Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    // compile-time errors, reported with a source span
    TooManyResults,
    BadLiteral,
    BadAssignment,
    BadSeparator,
    CloseParenNoOpen,
    CloseBracketNoOpen,
    CloseCurlyNoOpen,
    ParenStillOpen,
    UnbalancedConditional,
    IncompleteExpression,
    StackUnderflow,
    StackOverflow,
    UnknownToken,
    InternalError,
    // evaluation-time errors
    EmptyProgram,
    StackImbalance,
    AllocFailed,
    NonFiniteResult,
    BadBindings,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            TooManyResults => "too_many_results",
            BadLiteral => "bad_literal",
            BadAssignment => "bad_assignment",
            BadSeparator => "bad_separator",
            CloseParenNoOpen => "close_paren_no_open",
            CloseBracketNoOpen => "close_bracket_no_open",
            CloseCurlyNoOpen => "close_curly_no_open",
            ParenStillOpen => "paren_still_open",
            UnbalancedConditional => "unbalanced_conditional",
            IncompleteExpression => "incomplete_expression",
            StackUnderflow => "stack_underflow",
            StackOverflow => "stack_overflow",
            UnknownToken => "unknown_token",
            InternalError => "internal_error",
            EmptyProgram => "empty_program",
            StackImbalance => "stack_imbalance",
            AllocFailed => "alloc_failed",
            NonFiniteResult => "non_finite_result",
            BadBindings => "bad_bindings",
        };

        write!(f, "{name}")
    }
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            NoError => "no error",
            TooManyResults => "expression leaves more than one result on the stack",
            BadLiteral => "malformed numeric literal",
            BadAssignment => "':=' must follow a storable operand",
            BadSeparator => "separator outside of any argument list or subrange",
            CloseParenNoOpen => "')' without a matching '('",
            CloseBracketNoOpen => "']' without a matching '['",
            CloseCurlyNoOpen => "'}' without a matching '{'",
            ParenStillOpen => "unclosed '(', '[' or '{'",
            UnbalancedConditional => "'?' without ':' or ':' without '?'",
            IncompleteExpression => "expression ends where an operand is expected",
            StackUnderflow => "expression pops more operands than it pushes",
            StackOverflow => "expression needs more than the available stack slots",
            UnknownToken => "unrecognized or misplaced token",
            InternalError => "internal error",
            EmptyProgram => "program has no instructions",
            StackImbalance => "evaluation finished with an imbalanced stack",
            AllocFailed => "scratch buffer pool exhausted",
            NonFiniteResult => "result is NaN or infinite",
            BadBindings => "caller bindings are inconsistent with the array length",
        }
    }
}

/// A compile-time error, with byte offsets into the expression text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EquationError {
    pub start: u16,
    pub end: u16,
    pub code: ErrorCode,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.code)
    }
}

impl std::error::Error for EquationError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Evaluation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Compile => "compile",
            ErrorKind::Evaluation => "evaluation",
        };
        match &self.details {
            Some(details) => write!(f, "{}: {} -- {}", kind, self.code, details),
            None => write!(f, "{}: {}", kind, self.code),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
pub type EquationResult<T> = std::result::Result<T, EquationError>;

#[macro_export]
macro_rules! eqn_err(
    ($code:tt, $start:expr, $end:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(EquationError{ start: $start as u16, end: $end as u16, code: ErrorCode::$code})
    }}
);

#[macro_export]
macro_rules! eval_err {
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(
            ErrorKind::Evaluation,
            ErrorCode::$code,
            Some($str.to_string()),
        ))
    }};
    ($code:tt) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error::new(ErrorKind::Evaluation, ErrorCode::$code, None))
    }};
}
