use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default spot-instance termination notice endpoint.
pub const SPOT_TERMINATION_URL: &str = "http://169.254.169.254/latest/meta-data/spot/termination-time";

/// Token for signaling graceful shutdown to the worker loop.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a cancel in between is not missed.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
pub fn spawn_signal_listener(token: ShutdownToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interrupt = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!("received SIGINT, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    })
}

/// Out-of-band check for an imminent host termination.
#[async_trait]
pub trait PreemptionProbe: Send + Sync {
    /// Returns true once a termination notice has been posted.
    async fn is_preempted(&self) -> bool;
}

/// Polls an HTTP endpoint that answers 200 once the host is being reclaimed.
///
/// Unreachable endpoints read as "not preempted", so the probe is harmless
/// off the cloud it targets.
#[derive(Clone, Debug)]
pub struct HttpPreemptionProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpPreemptionProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn spot_termination() -> Self {
        Self::new(SPOT_TERMINATION_URL)
    }
}

#[async_trait]
impl PreemptionProbe for HttpPreemptionProbe {
    async fn is_preempted(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                debug!(url = %self.url, error = %err, "preemption probe unavailable");
                false
            }
        }
    }
}

/// Polls `probe` every `interval` and cancels `token` on a termination notice.
pub fn spawn_preemption_watch<P>(probe: P, interval: Duration, token: ShutdownToken) -> JoinHandle<()>
where
    P: PreemptionProbe + 'static,
{
    tokio::spawn(async move {
        loop {
            if probe.is_preempted().await {
                warn!("termination notice detected, shutting down");
                token.cancel();
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => return,
            }
        }
    })
}
