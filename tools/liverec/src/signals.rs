use crate::errors::LiverecError;
use crate::logging::append_run_log;
use crate::runtime::StopSignal;
use serde_json::json;
use std::thread;

/// Raises `stop` on the first Ctrl-C or SIGTERM. A second Ctrl-C exits
/// immediately with status 130.
pub fn spawn_shutdown_watcher(stop: StopSignal) -> Result<thread::JoinHandle<()>, LiverecError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LiverecError::Io(e.to_string()))?;

    thread::Builder::new()
        .name("shutdown-watcher".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let signal = shutdown_signal().await;
                append_run_log("info", "shutdown.requested", json!({ "signal": signal }));
                stop.raise();

                if tokio::signal::ctrl_c().await.is_ok() {
                    append_run_log("warn", "shutdown.forced", json!({}));
                    std::process::exit(130);
                }
            });
        })
        .map_err(|e| LiverecError::Io(e.to_string()))
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            append_run_log(
                "error",
                "shutdown.ctrl_c_unavailable",
                json!({ "error": err.to_string() }),
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "shutdown.sigterm_unavailable",
                    json!({ "error": err.to_string() }),
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "ctrl_c",
        () = terminate => "sigterm",
    }
}
