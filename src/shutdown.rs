use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
}

pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the token on the first of Ctrl+C or SIGTERM.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::CtrlC,
            _ = wait_sigterm() => ShutdownReason::Sigterm,
        };
        self.cancel();
        reason
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM on Unix. On non-Unix, this future never completes.
#[cfg(unix)]
async fn wait_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_sigterm() {
    std::future::pending::<()>().await;
}
