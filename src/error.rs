// Copyright © 2018 Cormac O'Brien
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Shared error taxonomy for the simulation core.
//!
//! Each subsystem exposes its own `*ErrorKind` but wraps it in the same
//! `failure::Context` shape, following the pattern used throughout the
//! engine (see `client::sound::error::SoundError` in the original client).

use std::fmt::{self, Display};

use failure::{Backtrace, Context, Fail};

/// The taxonomy of errors a simulation subsystem can report, independent of
/// which subsystem raised it.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum SimErrorKind {
    #[fail(display = "invalid argument: {}", detail)]
    InvalidArgument { detail: String },

    #[fail(display = "capacity exhausted: {}", detail)]
    CapacityExhausted { detail: String },

    #[fail(display = "invariant violated: {}", detail)]
    InvariantViolation { detail: String },

    #[fail(display = "reference expired: {}", detail)]
    ExpiredReference { detail: String },

    #[fail(display = "unreachable engine state: {}", detail)]
    EngineLogic { detail: String },
}

impl SimErrorKind {
    pub fn invalid_argument<S: Into<String>>(detail: S) -> Self {
        SimErrorKind::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub fn capacity_exhausted<S: Into<String>>(detail: S) -> Self {
        SimErrorKind::CapacityExhausted {
            detail: detail.into(),
        }
    }

    pub fn invariant_violation<S: Into<String>>(detail: S) -> Self {
        SimErrorKind::InvariantViolation {
            detail: detail.into(),
        }
    }

    pub fn expired_reference<S: Into<String>>(detail: S) -> Self {
        SimErrorKind::ExpiredReference {
            detail: detail.into(),
        }
    }

    pub fn engine_logic<S: Into<String>>(detail: S) -> Self {
        SimErrorKind::EngineLogic {
            detail: detail.into(),
        }
    }
}

/// Crate-wide error type. Carries a `SimErrorKind` plus a backtrace via
/// `failure::Context`.
#[derive(Debug)]
pub struct SimError {
    inner: Context<SimErrorKind>,
}

impl SimError {
    pub fn kind(&self) -> SimErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<SimErrorKind> for SimError {
    fn from(kind: SimErrorKind) -> Self {
        SimError {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<SimErrorKind>> for SimError {
    fn from(inner: Context<SimErrorKind>) -> Self {
        SimError { inner }
    }
}

impl Fail for SimError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_context() {
        let err: SimError = SimErrorKind::invalid_argument("bad dim").into();
        match err.kind() {
            SimErrorKind::InvalidArgument { detail } => assert_eq!(detail, "bad dim"),
            other => panic!("wrong kind: {:?}", other),
        }
    }
}
