//! Map process signals and supervisor control messages onto
//! [`ShutdownController::trigger`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownController;
use crate::supervisor::ControlMessage;

/// Listen for SIGINT, SIGTERM and (optionally) control messages until the
/// controller has closed. Every occurrence triggers shutdown; repeats are
/// no-ops on the controller side.
pub fn spawn_signal_listener(
    controller: ShutdownController,
    mut control: Option<mpsc::UnboundedReceiver<ControlMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut terminate = Terminate::install();
        let mut sigint_ok = true;

        loop {
            let reason = tokio::select! {
                result = tokio::signal::ctrl_c(), if sigint_ok => match result {
                    Ok(()) => "SIGINT",
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to listen for SIGINT");
                        sigint_ok = false;
                        continue;
                    }
                },
                () = terminate.recv() => "SIGTERM",
                Some(message) = recv_control(&mut control) => match message {
                    ControlMessage::Shutdown => "control message",
                },
                () = controller.closed() => break,
            };

            if !controller.trigger(reason) {
                tracing::info!(reason, state = %controller.state(), "Shutdown already in progress, ignoring");
            }
        }
    })
}

#[cfg(unix)]
struct Terminate(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Terminate {
    fn install() -> Self {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = &mut self.0 {
            if signal.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending().await
    }
}

#[cfg(not(unix))]
struct Terminate;

#[cfg(not(unix))]
impl Terminate {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}

async fn recv_control(
    control: &mut Option<mpsc::UnboundedReceiver<ControlMessage>>,
) -> Option<ControlMessage> {
    match control {
        Some(rx) => match rx.recv().await {
            Some(message) => Some(message),
            None => {
                *control = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
