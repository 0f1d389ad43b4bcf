pub mod checksum;
pub mod packets;
pub mod retry;
pub mod runner;
pub mod transport;

use tracing::error;

use crate::config::SessionConfig;
use crate::session::retry::RetryPolicy;
use crate::session::runner::SessionRunner;
use crate::shutdown::Shutdown;

/// Runs a single session to completion.
pub async fn run_session(config: SessionConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    SessionRunner::new(config, RetryPolicy::default(), shutdown)
        .run()
        .await
}

/// Starts one independent task per configured session, all sharing the same
/// shutdown signal, and waits for every one of them to finish. Sessions do not
/// coordinate; a failing session does not stop the others.
pub async fn run_sessions(configs: Vec<SessionConfig>, shutdown: Shutdown) {
    let mut tasks = Vec::new();
    for config in configs {
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            // failures are already logged by the runner
            let _ = run_session(config, shutdown).await;
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!("session task panicked: {}", e);
        }
    }
}
