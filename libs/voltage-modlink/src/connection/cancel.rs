//! Per-request cancellation
//!
//! A request can end early for three reasons: the caller cancelled it, the
//! connection is shutting down, or the caller stopped waiting (its future was
//! dropped). Each source has its own token so the outcome can be reported
//! precisely.

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::ModbusError;

/// Which source ended a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token fired
    Caller,
    /// The connection is being disposed
    Shutdown,
    /// The waiting future was dropped
    Abandoned,
}

impl CancelReason {
    pub fn into_error(self) -> ModbusError {
        match self {
            CancelReason::Caller | CancelReason::Abandoned => ModbusError::Cancelled,
            CancelReason::Shutdown => ModbusError::Disposed,
        }
    }
}

/// Caller token + connection shutdown token + request-local token
#[derive(Debug, Clone)]
pub struct CancelContext {
    caller: CancellationToken,
    shutdown: CancellationToken,
    local: CancellationToken,
}

impl CancelContext {
    pub fn new(caller: CancellationToken, shutdown: CancellationToken) -> Self {
        Self {
            caller,
            shutdown,
            local: CancellationToken::new(),
        }
    }

    /// Fire the request-local token when the returned guard is dropped
    pub fn abandon_on_drop(&self) -> DropGuard {
        self.local.clone().drop_guard()
    }

    /// The source that has fired, if any
    pub fn fired(&self) -> Option<CancelReason> {
        if self.caller.is_cancelled() {
            Some(CancelReason::Caller)
        } else if self.shutdown.is_cancelled() {
            Some(CancelReason::Shutdown)
        } else if self.local.is_cancelled() {
            Some(CancelReason::Abandoned)
        } else {
            None
        }
    }

    /// Resolves when any source fires
    pub async fn cancelled(&self) -> CancelReason {
        tokio::select! {
            biased;
            _ = self.caller.cancelled() => CancelReason::Caller,
            _ = self.shutdown.cancelled() => CancelReason::Shutdown,
            _ = self.local.cancelled() => CancelReason::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_the_source_that_fired() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let ctx = CancelContext::new(caller.clone(), shutdown.clone());
        assert_eq!(ctx.fired(), None);

        shutdown.cancel();
        assert_eq!(ctx.fired(), Some(CancelReason::Shutdown));
        assert_eq!(ctx.cancelled().await, CancelReason::Shutdown);
        assert_eq!(CancelReason::Shutdown.into_error(), ModbusError::Disposed);

        let ctx = CancelContext::new(caller.clone(), CancellationToken::new());
        caller.cancel();
        assert_eq!(ctx.cancelled().await, CancelReason::Caller);
        assert_eq!(CancelReason::Caller.into_error(), ModbusError::Cancelled);
    }

    #[tokio::test]
    async fn test_drop_guard_abandons() {
        let ctx = CancelContext::new(CancellationToken::new(), CancellationToken::new());
        {
            let _guard = ctx.abandon_on_drop();
            assert_eq!(ctx.fired(), None);
        }
        assert_eq!(ctx.fired(), Some(CancelReason::Abandoned));
        assert_eq!(ctx.cancelled().await, CancelReason::Abandoned);
    }
}
