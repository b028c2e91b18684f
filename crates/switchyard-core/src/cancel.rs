use crate::error::{FlowError, Result};

/// Cooperative stop signal for a run.
///
/// Cancellation is advisory: nothing is interrupted. The flow runner polls
/// the token before dispatching each node, and node runners may poll it or
/// await [`CancellationToken::cancelled`] at their own suspension points.
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Fail with `OperationCancelled` once the token has been cancelled.
    pub fn raise_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FlowError::OperationCancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
