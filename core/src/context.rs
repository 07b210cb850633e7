//! Cancellation context handed to every submission.
//!
//! # Design
//! A `Context` pairs a `CancellationToken` with an optional deadline. The
//! submission path races its two suspension points (dispatch and body read)
//! against [`Context::done`]; whichever side loses is dropped, which for the
//! transport means the in-flight connection is discarded rather than handed
//! back to the pool half-used.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Canceled,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context together with the token that cancels it.
    pub fn with_cancel() -> (Self, CancellationToken) {
        let ctx = Self::background();
        let token = ctx.token.clone();
        (ctx, token)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derives a context that is canceled along with `self` but can also be
    /// canceled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Like [`Context::child`], keeping whichever deadline comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |parent| parent.min(deadline))),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reports whether the context has already finished, without waiting.
    pub fn cause(&self) -> Option<Done> {
        if self.token.is_cancelled() {
            Some(Done::Canceled)
        } else if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            Some(Done::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Done::Canceled,
                _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Done::Canceled
            }
        }
    }

    /// Drives `fut` to completion unless the context finishes first, in which
    /// case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Done> {
        if let Some(done) = self.cause() {
            return Err(done);
        }
        tokio::select! {
            biased;
            done = self.done() => Err(done),
            output = fut => Ok(output),
        }
    }
}
