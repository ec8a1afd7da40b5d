//! Process-wide shutdown signalling
//!
//! One [`CancellationToken`] is cancelled on Ctrl+C or SIGTERM. Tasks select
//! on `token.cancelled()` instead of installing signal handlers themselves.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Token cancelled by the first termination signal.
///
/// Must be called inside a tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let name = termination_signal().await;
        info!("{} received, shutting down", name);
        trigger.cancel();
    });
    token
}

/// Name of the signal that ended the wait
async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                name = interrupt() => name,
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable, only Ctrl+C stops the service: {}", e);
                interrupt().await
            },
        }
    }
    #[cfg(not(unix))]
    {
        interrupt().await
    }
}

async fn interrupt() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_stays_live_without_signal() {
        let token = shutdown_token();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());

        // children follow the process token
        let child = token.child_token();
        token.cancel();
        assert!(child.is_cancelled());
    }
}
