use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    credentials::{AccessToken, CredentialProvider},
    error::{ClientError, ErrorCategory},
    scheduler::DedicatedScheduler,
};

/// Receives every refreshed token, normally the live transport.
pub trait TokenSink: Send + Sync + 'static {
    fn push(&self, token: &AccessToken) -> Result<(), ClientError>;
}

impl TokenSink for mpsc::UnboundedSender<AccessToken> {
    fn push(&self, token: &AccessToken) -> Result<(), ClientError> {
        self.send(token.clone()).map_err(|_| {
            ClientError::new(ErrorCategory::Network, "token_sink_closed", "token sink is closed")
        })
    }
}

/// Delay until `token` is due for refresh, `None` if it already is.
pub fn delay_until_refresh(token: &AccessToken, grace: Duration, now: SystemTime) -> Option<Duration> {
    token
        .refresh_due(grace)
        .duration_since(now)
        .ok()
        .filter(|delay| !delay.is_zero())
}

struct RefreshState {
    scheduled_at: Mutex<Option<SystemTime>>,
    refreshes: AtomicU64,
    stop: CancellationToken,
    scheduler: Mutex<Option<DedicatedScheduler>>,
}

impl RefreshState {
    fn set_scheduled(&self, due: Option<SystemTime>) {
        *self
            .scheduled_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = due;
    }
}

/// Re-fetches the access token `grace` before it expires and pushes it to a
/// sink, rearming on every new expiry.
#[derive(Clone)]
pub struct TokenRefresher {
    state: Arc<RefreshState>,
}

impl TokenRefresher {
    /// Run the refresh timer on `handle`.
    pub fn start<P, S>(
        provider: Arc<P>,
        sink: S,
        grace: Duration,
        handle: &Handle,
        initial: &AccessToken,
    ) -> Self
    where
        P: CredentialProvider,
        S: TokenSink,
    {
        Self::start_inner(provider, sink, grace, handle, initial, None)
    }

    /// Run the refresh timer on its own single-threaded scheduler, released
    /// by [`TokenRefresher::destroy`].
    pub fn start_dedicated<P, S>(
        provider: Arc<P>,
        sink: S,
        grace: Duration,
        initial: &AccessToken,
    ) -> Result<Self, ClientError>
    where
        P: CredentialProvider,
        S: TokenSink,
    {
        let scheduler = DedicatedScheduler::start("ditto-token-refresh")?;
        let handle = scheduler.handle();
        Ok(Self::start_inner(
            provider,
            sink,
            grace,
            &handle,
            initial,
            Some(scheduler),
        ))
    }

    fn start_inner<P, S>(
        provider: Arc<P>,
        sink: S,
        grace: Duration,
        handle: &Handle,
        initial: &AccessToken,
        scheduler: Option<DedicatedScheduler>,
    ) -> Self
    where
        P: CredentialProvider,
        S: TokenSink,
    {
        let state = Arc::new(RefreshState {
            scheduled_at: Mutex::new(None),
            refreshes: AtomicU64::new(0),
            stop: CancellationToken::new(),
            scheduler: Mutex::new(scheduler),
        });

        if delay_until_refresh(initial, grace, SystemTime::now()).is_none() {
            debug!("token already due, refresh not scheduled");
            return Self { state };
        }
        state.set_scheduled(Some(initial.refresh_due(grace)));
        handle.spawn(refresh_loop(
            Arc::clone(&state),
            provider,
            sink,
            grace,
            initial.clone(),
        ));
        Self { state }
    }

    /// When the next refresh fires, if one is armed.
    pub fn scheduled_at(&self) -> Option<SystemTime> {
        *self
            .state
            .scheduled_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn refresh_count(&self) -> u64 {
        self.state.refreshes.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.stop.is_cancelled()
    }

    /// Cancel the timer and release the scheduler thread. Idempotent.
    pub fn destroy(&self) {
        self.state.stop.cancel();
        self.state.set_scheduled(None);
        let scheduler = self
            .state
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
    }
}

async fn refresh_loop<P, S>(
    state: Arc<RefreshState>,
    provider: Arc<P>,
    sink: S,
    grace: Duration,
    mut current: AccessToken,
) where
    P: CredentialProvider,
    S: TokenSink,
{
    loop {
        let Some(delay) = delay_until_refresh(&current, grace, SystemTime::now()) else {
            debug!("token already due, refresh not scheduled");
            state.set_scheduled(None);
            return;
        };
        state.set_scheduled(Some(current.refresh_due(grace)));

        tokio::select! {
            _ = state.stop.cancelled() => {
                debug!("token refresh cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match provider.fetch_token().await {
            Ok(token) => {
                if let Err(err) = sink.push(&token) {
                    warn!(error = %err, "failed to push refreshed token");
                }
                state.refreshes.fetch_add(1, Ordering::AcqRel);
                info!("access token refreshed");
                current = token;
            }
            Err(err) => {
                error!(error = %err, "token refresh failed, no further refresh scheduled");
                state.set_scheduled(None);
                return;
            }
        }
    }
}
