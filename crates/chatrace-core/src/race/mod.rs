//! First-meaningful-frame race across providers.
//!
//! Every configured provider is asked the same question at once. The first
//! attempt whose stream yields a meaningful frame wins; all other attempts
//! are cancelled and the winner's frames are relayed onward unbuffered.

pub mod retry;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RaceConfig;
use crate::error::{AttemptFailure, ProviderError, RaceError};
use crate::provider::{ProviderDescriptor, StreamOpener};
use crate::sse::{frames, is_meaningful, to_wire, ByteStream, FrameStream};
use crate::types::ConversationPayload;

pub use retry::{race_with_retry, RetryPolicy};

/// Cancellation handle for one attempt.
///
/// The token is a child of the caller's signal, so cancelling the request
/// reaches every attempt. [`cancel`](AttemptHandle::cancel) performs its
/// side effect once; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct AttemptHandle {
    provider: String,
    token: CancellationToken,
    invoked: Arc<AtomicBool>,
}

impl AttemptHandle {
    pub fn new(provider: impl Into<String>, signal: &CancellationToken) -> Self {
        Self {
            provider: provider.into(),
            token: signal.child_token(),
            invoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the attempt. Returns `true` only for the call that did it.
    pub fn cancel(&self) -> bool {
        if self.invoked.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        debug!("Cancelled attempt for {}", self.provider);
        true
    }

    /// Whether [`cancel`](AttemptHandle::cancel) has been called on this handle.
    pub fn was_invoked(&self) -> bool {
        self.invoked.load(Ordering::Acquire)
    }

    /// Whether the attempt should stop, from its own handle or the caller's signal.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

/// Handles of one race. Dropping the set cancels every attempt that was
/// not promoted to winner, so abandoning the race future stops all I/O.
struct AttemptSet {
    handles: Vec<AttemptHandle>,
    promoted: Option<usize>,
}

impl AttemptSet {
    fn new(providers: &[ProviderDescriptor], signal: &CancellationToken) -> Self {
        Self {
            handles: providers
                .iter()
                .map(|p| AttemptHandle::new(p.id.clone(), signal))
                .collect(),
            promoted: None,
        }
    }

    fn token(&self, index: usize) -> CancellationToken {
        self.handles[index].token()
    }

    /// Make `index` the winner and cancel everyone else.
    fn promote(&mut self, index: usize) -> AttemptHandle {
        self.promoted = Some(index);
        self.cancel_losers();
        self.handles[index].clone()
    }

    fn cancel_losers(&self) {
        for (i, handle) in self.handles.iter().enumerate() {
            if self.promoted != Some(i) {
                handle.cancel();
            }
        }
    }
}

impl Drop for AttemptSet {
    fn drop(&mut self) {
        self.cancel_losers();
    }
}

/// Outcome reported by an attempt task.
enum Settlement {
    Won {
        index: usize,
        first: String,
        rest: FrameStream,
    },
    Failed {
        index: usize,
        error: ProviderError,
    },
}

/// A won race: the winner's SSE stream, starting with the frame that won.
pub struct RaceResult {
    pub stream: ByteStream,
    pub winner: String,
    pub winner_id: String,
    pub elapsed: Duration,
}

impl fmt::Debug for RaceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceResult")
            .field("winner", &self.winner)
            .field("winner_id", &self.winner_id)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

/// Runs races between providers through a [`StreamOpener`].
#[derive(Clone)]
pub struct RaceCoordinator {
    opener: Arc<dyn StreamOpener>,
    deadline: Duration,
}

impl RaceCoordinator {
    pub fn new(opener: Arc<dyn StreamOpener>, deadline: Duration) -> Self {
        Self { opener, deadline }
    }

    pub fn from_config(opener: Arc<dyn StreamOpener>, config: &RaceConfig) -> Self {
        Self::new(opener, config.deadline())
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Race every provider once.
    ///
    /// Returns as soon as one attempt produces a meaningful frame. Fails with
    /// [`RaceError::AllProvidersFailed`] when every attempt ends without one,
    /// [`RaceError::Timeout`] when the deadline passes first, and
    /// [`RaceError::Cancelled`] when `signal` fires. Loser handles are always
    /// cancelled before this returns.
    pub async fn race(
        &self,
        providers: &[ProviderDescriptor],
        payload: Arc<ConversationPayload>,
        signal: &CancellationToken,
    ) -> Result<RaceResult, RaceError> {
        if providers.is_empty() {
            return Err(RaceError::ConfigurationMissing);
        }
        let span = info_span!("race", race_id = %Uuid::new_v4(), providers = providers.len());
        let attempts = AttemptSet::new(providers, signal);
        self.run(providers, payload, signal, attempts)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        providers: &[ProviderDescriptor],
        payload: Arc<ConversationPayload>,
        signal: &CancellationToken,
        mut attempts: AttemptSet,
    ) -> Result<RaceResult, RaceError> {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel::<Settlement>(providers.len());

        for (index, provider) in providers.iter().enumerate() {
            let opener = self.opener.clone();
            let provider = provider.clone();
            let payload = payload.clone();
            let token = attempts.token(index);
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(ProviderError::Cancelled),
                        outcome = run_attempt(opener.as_ref(), &provider, &payload, token.clone()) => outcome,
                    };
                    let settlement = match outcome {
                        Ok((first, rest)) => Settlement::Won { index, first, rest },
                        Err(error) => Settlement::Failed { index, error },
                    };
                    // The receiver is gone once the race is decided.
                    let _ = tx.send(settlement).await;
                }
                .in_current_span(),
            );
        }
        drop(tx);

        let mut failures: Vec<Option<ProviderError>> = providers.iter().map(|_| None).collect();
        let mut outstanding = providers.len();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);

        while outstanding > 0 {
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    attempts.cancel_losers();
                    info!("Race cancelled by caller after {:?}", started.elapsed());
                    return Err(RaceError::Cancelled);
                }
                settlement = rx.recv() => match settlement {
                    Some(Settlement::Won { index, first, rest }) => {
                        let handle = attempts.promote(index);
                        let provider = &providers[index];
                        let elapsed = started.elapsed();
                        info!("Provider {} won the race in {:?}", provider.display_name, elapsed);
                        return Ok(RaceResult {
                            stream: relay(first, rest, handle),
                            winner: provider.display_name.clone(),
                            winner_id: provider.id.clone(),
                            elapsed,
                        });
                    }
                    Some(Settlement::Failed { index, error }) => {
                        warn!("Provider {} failed: {}", providers[index].id, error);
                        failures[index] = Some(error);
                        outstanding -= 1;
                    }
                    // Every task has exited; any still unsettled died without reporting.
                    None => break,
                },
                _ = &mut deadline => {
                    attempts.cancel_losers();
                    let failures = collect_failures(providers, failures, || ProviderError::TimedOut);
                    warn!("Race timed out after {:?}", self.deadline);
                    return Err(RaceError::Timeout { deadline: self.deadline, failures });
                }
            }
        }

        attempts.cancel_losers();
        let failures = collect_failures(providers, failures, || {
            ProviderError::UpstreamStream("attempt ended without reporting".to_string())
        });
        warn!("All {} providers failed", providers.len());
        Err(RaceError::AllProvidersFailed { failures })
    }
}

/// Open one provider and read until its first meaningful frame.
async fn run_attempt(
    opener: &dyn StreamOpener,
    provider: &ProviderDescriptor,
    payload: &ConversationPayload,
    token: CancellationToken,
) -> Result<(String, FrameStream), ProviderError> {
    let body = opener.open(provider, payload, token).await?;
    let mut stream = frames(body);
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        if is_meaningful(&frame) {
            return Ok((frame, stream));
        }
        debug!("Skipping frame from {}: no output yet", provider.id);
    }
    Err(ProviderError::NoMeaningfulOutput)
}

/// Failures in provider order; unsettled attempts get `pending()`.
fn collect_failures(
    providers: &[ProviderDescriptor],
    failures: Vec<Option<ProviderError>>,
    pending: impl Fn() -> ProviderError,
) -> Vec<AttemptFailure> {
    providers
        .iter()
        .zip(failures)
        .map(|(provider, error)| AttemptFailure {
            provider: provider.id.clone(),
            error: error.unwrap_or_else(&pending),
        })
        .collect()
}

/// Winner's wire stream: the winning frame, then the rest of the attempt,
/// until it ends or the winner's token fires.
fn relay(first: String, mut rest: FrameStream, handle: AttemptHandle) -> ByteStream {
    let token = handle.token();
    Box::pin(async_stream::stream! {
        yield Ok(to_wire(&first));
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Winner stream for {} cancelled", handle.provider());
                    break;
                }
                frame = rest.next() => match frame {
                    Some(Ok(frame)) => yield Ok(to_wire(&frame)),
                    Some(Err(e)) => {
                        warn!("Winner stream from {} broke: {}", handle.provider(), e);
                        yield Err(e);
                        break;
                    }
                    None => break,
                },
            }
        }
    })
}
