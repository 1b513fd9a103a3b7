//! Graceful shutdown via a cancellation token

use std::io;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio_util::sync::CancellationToken;

/// Cloneable shutdown handle shared by the background loops.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn request(&self) {
        self.token.cancel();
    }

    /// Check if shutdown was requested
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is requested.
    pub async fn requested(&self) {
        self.token.cancelled().await;
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Route SIGTERM/SIGINT into `shutdown`.
///
/// First signal: graceful shutdown. Second signal: exit with 130.
pub fn install_signal_handlers(shutdown: &Shutdown) -> io::Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let shutdown = shutdown.clone();
    std::thread::Builder::new()
        .name("studyq-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                if shutdown.is_requested() {
                    log::warn!("second signal ({signal}), exiting immediately");
                    std::process::exit(130);
                }
                log::info!("signal {signal} received, shutting down");
                shutdown.request();
            }
        })?;
    Ok(())
}
