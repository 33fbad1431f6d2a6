//! KeepKey signing coordination
//!
//! A [`SigningCoordinator`] owns the connection to one signing authority and
//! runs at most one signing session against it at a time. Each session is
//! driven by its own tokio task; PIN and passphrase interrupts park the task
//! on a oneshot channel until the presentation layer answers through
//! [`SigningCoordinator::respond`]. Progress is published on a broadcast
//! channel any number of listeners can subscribe to.

pub mod authority;
pub mod events;
pub mod session;

pub use authority::{AuthorityError, AuthorityRequest, AuthorityResponse, FailureCode, SigningAuthority};
pub use events::{ChallengeResponse, SessionEvent, SessionProgress};
pub use session::{ChallengeKind, SessionState};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::chains::bitcoin::{FinishedTransaction, UnsignedTransaction};
use crate::config::SendConfig;
use crate::errors::{FailureReason, Result, SendError};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CANCEL_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

type Outcome = oneshot::Sender<Result<()>>;

#[cfg_attr(test, derive(Debug))]
enum ChallengeAnswer {
    Resolved { secret: String, outcome: Outcome },
    Declined,
}

struct PendingChallenge {
    kind: ChallengeKind,
    responder: oneshot::Sender<ChallengeAnswer>,
}

/// State shared between a session task and whoever answers its challenges
struct SessionShared {
    state: SessionState,
    pending: Option<PendingChallenge>,
    answered: HashSet<ChallengeKind>,
    /// Caller waiting to learn whether its last answer was accepted
    unsettled: Option<(ChallengeKind, Outcome)>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: SessionState::Created,
            pending: None,
            answered: HashSet::new(),
            unsettled: None,
        }
    }
}

struct ActiveSlot {
    session_id: String,
    shared: Arc<Mutex<SessionShared>>,
    cancel: Option<oneshot::Sender<()>>,
}

type SessionSlot = Arc<Mutex<Option<ActiveSlot>>>;

/// Lock, recovering the guard from a poisoned mutex
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn random_id(bytes: usize) -> String {
    let raw: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    hex::encode(raw)
}

/// Frees the device slot when the session task ends, even on panic
struct SlotRelease {
    active: SessionSlot,
    session_id: String,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let mut slot = lock(&self.active);
        if slot.as_ref().map_or(false, |s| s.session_id == self.session_id) {
            *slot = None;
        }
    }
}

#[derive(Clone)]
pub struct SigningCoordinator {
    authority: Arc<dyn SigningAuthority>,
    session_timeout: Duration,
    cancel_notify_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
    active: SessionSlot,
}

impl SigningCoordinator {
    pub fn new(authority: Arc<dyn SigningAuthority>) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            authority,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            cancel_notify_timeout: DEFAULT_CANCEL_NOTIFY_TIMEOUT,
            events,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(authority: Arc<dyn SigningAuthority>, config: &SendConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            events,
            ..Self::new(authority)
        }
        .with_session_timeout(config.session_timeout)
        .with_cancel_notify_timeout(config.cancel_notify_timeout)
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_cancel_notify_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_notify_timeout = timeout;
        self
    }

    /// Progress events for every session on this device
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn active_session(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|slot| slot.session_id.clone())
    }

    /// Dispatch `unsigned` to the device in a new session.
    ///
    /// Fails with `SessionAlreadyActive` while another session holds the device.
    pub fn start(&self, unsigned: UnsignedTransaction) -> Result<SigningSessionHandle> {
        let session_id = random_id(8);
        let shared = Arc::new(Mutex::new(SessionShared::new()));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut slot = lock(&self.active);
            if let Some(active) = slot.as_ref() {
                log::warn!(
                    "⚠️ Refusing to start signing session: {} is still active",
                    active.session_id
                );
                return Err(SendError::SessionAlreadyActive);
            }
            *slot = Some(ActiveSlot {
                session_id: session_id.clone(),
                shared: shared.clone(),
                cancel: Some(cancel_tx),
            });
        }

        // Subscribe before the task exists so the handle sees every event
        let events = self.events.subscribe();
        let ctx = SessionContext {
            session_id: session_id.clone(),
            authority: self.authority.clone(),
            events: self.events.clone(),
            shared: shared.clone(),
        };
        let release = SlotRelease {
            active: self.active.clone(),
            session_id: session_id.clone(),
        };

        log::info!("✍️ Starting signing session {}", session_id);
        let span = tracing::info_span!("signing_session", session_id = %session_id);
        let task = tokio::spawn(
            run_session(
                ctx,
                unsigned,
                cancel_rx,
                release,
                self.session_timeout,
                self.cancel_notify_timeout,
            )
            .instrument(span),
        );

        Ok(SigningSessionHandle {
            session_id,
            coordinator: self.clone(),
            shared,
            events,
            closed: false,
            task,
        })
    }

    /// Answer a pending challenge.
    ///
    /// For a resolved challenge this waits until the device has reacted to the
    /// secret, so a wrong PIN comes back as `IncorrectPin` and may be retried
    /// once the challenge is raised again.
    pub async fn respond(&self, response: ChallengeResponse) -> Result<()> {
        let kind = response.kind();
        let shared = self
            .session_shared(response.session_id())
            .ok_or(SendError::ChallengeNotPending(kind))?;
        let responder = take_responder(&shared, kind)?;

        match response {
            ChallengeResponse::Resolved { secret, .. } => {
                let (outcome_tx, outcome_rx) = oneshot::channel();
                responder
                    .send(ChallengeAnswer::Resolved {
                        secret,
                        outcome: outcome_tx,
                    })
                    .map_err(|_| SendError::Cancelled)?;
                outcome_rx.await.map_err(|_| SendError::Cancelled)?
            }
            ChallengeResponse::Declined { .. } => {
                log::info!("🙅 {} challenge declined", kind);
                let _ = responder.send(ChallengeAnswer::Declined);
                Ok(())
            }
        }
    }

    /// Cancel the session if it is still running. Returns false when there was
    /// nothing to cancel.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut slot = lock(&self.active);
        match slot.as_mut() {
            Some(active) if active.session_id == session_id => match active.cancel.take() {
                Some(cancel) => {
                    log::info!("🛑 Cancelling signing session {}", session_id);
                    cancel.send(()).is_ok()
                }
                None => false,
            },
            _ => false,
        }
    }

    fn session_shared(&self, session_id: &str) -> Option<Arc<Mutex<SessionShared>>> {
        lock(&self.active)
            .as_ref()
            .filter(|slot| slot.session_id == session_id)
            .map(|slot| slot.shared.clone())
    }
}

fn take_responder(shared: &Mutex<SessionShared>, kind: ChallengeKind) -> Result<oneshot::Sender<ChallengeAnswer>> {
    let mut shared = lock(shared);
    match shared.pending.take() {
        Some(pending) if pending.kind == kind => {
            shared.answered.insert(kind);
            Ok(pending.responder)
        }
        other => {
            shared.pending = other;
            if shared.answered.contains(&kind) {
                Err(SendError::DuplicateChallengeResponse(kind))
            } else {
                Err(SendError::ChallengeNotPending(kind))
            }
        }
    }
}

/// Caller-side view of one signing session
pub struct SigningSessionHandle {
    session_id: String,
    coordinator: SigningCoordinator,
    shared: Arc<Mutex<SessionShared>>,
    events: broadcast::Receiver<SessionEvent>,
    closed: bool,
    task: JoinHandle<Result<FinishedTransaction>>,
}

impl SigningSessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// Next progress event of this session; `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.events.recv().await {
                Ok(event) if event.session_id == self.session_id => {
                    if event.event.is_terminal() {
                        self.closed = true;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Session {} listener missed {} events", self.session_id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    /// Wait for the device to raise a challenge; `None` if the session ended first
    pub async fn next_challenge(&mut self) -> Option<ChallengeKind> {
        while let Some(event) = self.next_event().await {
            if let SessionProgress::ChallengeRequested { kind } = event.event {
                return Some(kind);
            }
        }
        None
    }

    pub async fn resolve_challenge(&self, kind: ChallengeKind, secret: impl Into<String>) -> Result<()> {
        self.coordinator
            .respond(ChallengeResponse::Resolved {
                session_id: self.session_id.clone(),
                kind,
                secret: secret.into(),
            })
            .await
    }

    pub async fn decline_challenge(&self, kind: ChallengeKind) -> Result<()> {
        self.coordinator
            .respond(ChallengeResponse::Declined {
                session_id: self.session_id.clone(),
                kind,
            })
            .await
    }

    pub fn cancel(&self) -> bool {
        self.coordinator.cancel(&self.session_id)
    }

    /// Wait for the session to end
    pub async fn finished(self) -> Result<FinishedTransaction> {
        self.task
            .await
            .map_err(|e| SendError::UnexpectedAuthorityState(format!("signing task failed: {}", e)))?
    }
}

struct SessionContext {
    session_id: String,
    authority: Arc<dyn SigningAuthority>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<Mutex<SessionShared>>,
}

impl SessionContext {
    fn emit(&self, progress: SessionProgress) {
        // No subscribers is fine
        let _ = self.events.send(SessionEvent::new(&self.session_id, progress));
    }

    fn enter(&self, next: SessionState, progress: SessionProgress) -> Result<()> {
        lock(&self.shared).state.transition_to(next)?;
        self.emit(progress);
        Ok(())
    }

    fn settle(&self, outcome: Result<()>) {
        let unsettled = lock(&self.shared).unsettled.take();
        if let Some((_, caller)) = unsettled {
            let _ = caller.send(outcome);
        }
    }

    fn pin_unsettled(&self) -> bool {
        matches!(lock(&self.shared).unsettled, Some((ChallengeKind::Pin, _)))
    }

    /// Wrong PIN: let the caller answer the PIN challenge again
    fn reject_pin(&self) {
        lock(&self.shared).answered.remove(&ChallengeKind::Pin);
        log::warn!("❌ Device rejected the PIN");
        self.emit(SessionProgress::ChallengeRejected {
            kind: ChallengeKind::Pin,
            reason: FailureReason::IncorrectPin,
        });
        self.settle(Err(SendError::IncorrectPin));
    }

    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse> {
        let name = request.name();
        log::debug!("→ {}", name);
        let response = self
            .authority
            .call(request)
            .await
            .map_err(|e| SendError::AuthorityUnavailable(e.to_string()))?;
        log::debug!("← {:?} (after {})", response_name(&response), name);
        Ok(response)
    }

    async fn await_challenge(&self, kind: ChallengeKind) -> Result<String> {
        let (responder, answer) = oneshot::channel();
        let previous = {
            let mut shared = lock(&self.shared);
            if shared.answered.contains(&kind) {
                return Err(SendError::UnexpectedAuthorityState(format!(
                    "device asked for the {} again after accepting it",
                    kind
                )));
            }
            shared.state.transition_to(SessionState::awaiting(kind))?;
            shared.pending = Some(PendingChallenge { kind, responder });
            shared.unsettled.take()
        };

        self.emit(match kind {
            ChallengeKind::Pin => SessionProgress::AwaitingPin,
            ChallengeKind::Passphrase => SessionProgress::AwaitingPassphrase,
        });
        self.emit(SessionProgress::ChallengeRequested { kind });
        if let Some((_, caller)) = previous {
            let _ = caller.send(Ok(()));
        }
        log::info!("🔐 Waiting for {} entry", kind);

        match answer.await {
            Ok(ChallengeAnswer::Resolved { secret, outcome }) => {
                lock(&self.shared).unsettled = Some((kind, outcome));
                Ok(secret)
            }
            Ok(ChallengeAnswer::Declined) | Err(_) => Err(SendError::Cancelled),
        }
    }
}

fn response_name(response: &AuthorityResponse) -> &'static str {
    match response {
        AuthorityResponse::PinMatrixRequest => "PinMatrixRequest",
        AuthorityResponse::PassphraseRequest => "PassphraseRequest",
        AuthorityResponse::ButtonRequest => "ButtonRequest",
        AuthorityResponse::TxSigned { .. } => "TxSigned",
        AuthorityResponse::Failure { .. } => "Failure",
    }
}

async fn run_session(
    ctx: SessionContext,
    unsigned: UnsignedTransaction,
    cancel: oneshot::Receiver<()>,
    release: SlotRelease,
    session_timeout: Duration,
    cancel_notify_timeout: Duration,
) -> Result<FinishedTransaction> {
    let outcome = tokio::select! {
        biased;
        _ = cancel => Err(SendError::Cancelled),
        driven = tokio::time::timeout(session_timeout, drive(&ctx, &unsigned)) => match driven {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout_millis(session_timeout))),
        },
    };

    // The device may still be showing a prompt
    if matches!(outcome, Err(SendError::Cancelled) | Err(SendError::Timeout(_))) {
        match tokio::time::timeout(cancel_notify_timeout, ctx.authority.cancel()).await {
            Ok(Ok(())) => log::info!("Device notified of cancellation"),
            Ok(Err(e)) => log::warn!("Failed to notify device of cancellation: {}", e),
            Err(_) => log::warn!("Device did not acknowledge cancellation within {:?}", cancel_notify_timeout),
        }
    }

    finalize(&ctx, outcome, release)
}

async fn drive(ctx: &SessionContext, unsigned: &UnsignedTransaction) -> Result<FinishedTransaction> {
    'dispatch: loop {
        let request_id = random_id(16);
        ctx.enter(
            SessionState::Dispatched,
            SessionProgress::Dispatched {
                request_id: request_id.clone(),
            },
        )?;
        log::info!(
            "📤 Sending SignTx {} ({} inputs, {} outputs)",
            request_id,
            unsigned.inputs.len(),
            unsigned.outputs.len()
        );

        let mut request = AuthorityRequest::SignTx {
            request_id,
            tx: unsigned.clone(),
        };
        loop {
            request = match ctx.call(request).await? {
                AuthorityResponse::PinMatrixRequest => AuthorityRequest::PinMatrixAck {
                    pin: ctx.await_challenge(ChallengeKind::Pin).await?,
                },
                AuthorityResponse::PassphraseRequest => AuthorityRequest::PassphraseAck {
                    passphrase: ctx.await_challenge(ChallengeKind::Passphrase).await?,
                },
                AuthorityResponse::ButtonRequest => {
                    ctx.enter(
                        SessionState::AwaitingUserConfirmation,
                        SessionProgress::AwaitingUserConfirmation,
                    )?;
                    ctx.settle(Ok(()));
                    log::info!("👆 Confirm the transaction on the device");
                    AuthorityRequest::ButtonAck
                }
                AuthorityResponse::TxSigned { serialized_tx } => {
                    let finished = FinishedTransaction::from_bytes(&serialized_tx)?;
                    finished.verify_against(unsigned)?;
                    ctx.settle(Ok(()));
                    return Ok(finished);
                }
                AuthorityResponse::Failure {
                    code: FailureCode::PinInvalid,
                    ..
                } if ctx.pin_unsettled() => {
                    ctx.reject_pin();
                    continue 'dispatch;
                }
                AuthorityResponse::Failure { code, message } => {
                    log::error!("Device failure {:?}: {}", code, message);
                    return Err(code.into_error(&message));
                }
            };
        }
    }
}

fn finalize(
    ctx: &SessionContext,
    outcome: Result<FinishedTransaction>,
    release: SlotRelease,
) -> Result<FinishedTransaction> {
    let (state, progress) = match &outcome {
        Ok(finished) => (
            SessionState::Signed,
            SessionProgress::Signed {
                txid: finished.txid().to_string(),
            },
        ),
        Err(SendError::Cancelled) => (SessionState::Cancelled, SessionProgress::Cancelled),
        Err(err) => {
            let reason = err.failure_reason().unwrap_or(FailureReason::UnexpectedAuthorityState);
            (
                SessionState::Failed(reason),
                SessionProgress::Failed {
                    reason,
                    message: err.to_string(),
                },
            )
        }
    };

    let unsettled = {
        let mut shared = lock(&ctx.shared);
        shared.state = state;
        shared.pending = None;
        shared.unsettled.take()
    };
    if let Some((_, caller)) = unsettled {
        let _ = caller.send(outcome.as_ref().map(|_| ()).map_err(|e| e.clone()));
    }

    drop(release);
    match &outcome {
        Ok(finished) => log::info!("✅ Session {} signed {}", ctx.session_id, finished.txid()),
        Err(SendError::Cancelled) => log::info!("Session {} cancelled", ctx.session_id),
        Err(err) => log::error!("❌ Session {} failed: {}", ctx.session_id, err),
    }
    ctx.emit(progress);
    outcome
}
