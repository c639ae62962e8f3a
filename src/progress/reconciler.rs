//! Progress reconciler
//!
//! The facade a consumer starts and stops. It activates exactly one
//! transport per session (push preferred, pull as fallback), forwards
//! every non-terminal envelope through the consumer's tick callback, and
//! invokes exactly one terminal callback before shutting everything down.
//! Cancellation is the safety-critical property here: once `stop` returns
//! (or a new `start` supersedes the session), no callback fires again,
//! even for deliveries that were already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, EnvelopeKind};
use super::pull::{HttpProgressQuery, PullChannel};
use super::push::PushChannel;
use super::{ChannelEvent, ProgressError};
use crate::config::{Settings, EVENT_CHANNEL_CAPACITY};

/// A transport that can deliver envelopes for one session.
///
/// Implementations run until they observe a terminal envelope, become
/// unavailable, or are cancelled; they communicate exclusively through the
/// event sender. [`PushChannel`] and [`PullChannel`] are the production
/// implementations; tests substitute scripted ones.
#[async_trait]
pub trait ProgressChannel: Send + Sync + 'static {
    /// Deliver envelopes for `session_id` until done.
    async fn run(
        self: Arc<Self>,
        session_id: String,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    );
}

/// Consumer-side callbacks for one watched session.
///
/// `on_tick` fires for every non-terminal envelope, in transport order,
/// and once more with the terminal envelope's payload immediately before
/// the terminal callback, so the consumer's last rendered state matches
/// the final result set exactly. Exactly one of `on_complete`/`on_error`
/// fires per started session, and none after `stop`.
pub trait ProgressSink: Send + Sync {
    /// A non-terminal progress update (also called once with the terminal
    /// payload, right before the terminal callback).
    fn on_tick(&self, envelope: &Envelope);
    /// The session finished with all items accounted for.
    fn on_complete(&self, envelope: &Envelope);
    /// The session failed, with the job-provided message or a generic
    /// fallback.
    fn on_error(&self, message: &str);
}

struct ActiveSession {
    cancel: Option<CancellationToken>,
    driver: Option<JoinHandle<()>>,
}

/// Unifies push and pull delivery into one ordered, deduplicated stream.
///
/// At most one session is observed at a time; calling [`start`] while a
/// session is active fully supersedes it. Dropping the watcher stops the
/// active session, covering consumer teardown.
///
/// [`start`]: ProgressWatcher::start
pub struct ProgressWatcher {
    push: Arc<dyn ProgressChannel>,
    pull: Arc<dyn ProgressChannel>,
    sink: Arc<dyn ProgressSink>,
    active: Mutex<ActiveSession>,
    // Bumped by every start and stop; driver tasks compare their captured
    // generation against this before every callback, so late deliveries
    // from a superseded session can never reach the sink.
    generation: Arc<AtomicU64>,
    // Held across every sink callback. `halt` acquires it after bumping
    // the generation, so `stop` cannot return while a callback is still
    // executing, and a driver that wins the lock first re-checks the
    // generation before dispatching.
    callback_gate: Arc<Mutex<()>>,
}

impl ProgressWatcher {
    /// Create a watcher over the production transports.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::ClientBuild`] when the HTTP client for the
    /// pull channel cannot be constructed.
    pub fn new(
        settings: &Settings,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, ProgressError> {
        let query = Arc::new(HttpProgressQuery::new(settings)?);
        Ok(Self::with_channels(
            Arc::new(PushChannel::new(settings)),
            Arc::new(PullChannel::new(query)),
            sink,
        ))
    }

    /// Create a watcher over explicit channel implementations.
    #[must_use]
    pub fn with_channels(
        push: Arc<dyn ProgressChannel>,
        pull: Arc<dyn ProgressChannel>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            push,
            pull,
            sink,
            active: Mutex::new(ActiveSession {
                cancel: None,
                driver: None,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            callback_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Begin observing a session, superseding any prior one.
    ///
    /// Fire-and-forget: activation failures are handled internally by
    /// falling back from push to pull; the caller never sees a transport
    /// error. Must be called from within a tokio runtime.
    pub fn start(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        let mut active = lock_unpoisoned(&self.active);
        Self::halt(&mut active, &self.generation, &self.callback_gate);

        let generation = self.generation.load(Ordering::SeqCst);
        let cancel = CancellationToken::new();
        active.cancel = Some(cancel.clone());

        info!(%session_id, "starting progress watch");
        let driver = Driver {
            push: self.push.clone(),
            pull: self.pull.clone(),
            sink: self.sink.clone(),
            generation_counter: self.generation.clone(),
            generation,
            callback_gate: self.callback_gate.clone(),
        };
        active.driver = Some(tokio::spawn(driver.drive(session_id, cancel)));
    }

    /// Stop observing. Idempotent, safe from any state, and guarantees no
    /// further callback fires once it returns. Blocks until any callback
    /// that is already executing has returned; do not call it from inside
    /// a sink callback.
    pub fn stop(&self) {
        let mut active = lock_unpoisoned(&self.active);
        Self::halt(&mut active, &self.generation, &self.callback_gate);
    }

    /// Whether a session is currently being observed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let active = lock_unpoisoned(&self.active);
        active
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
    }

    fn halt(active: &mut ActiveSession, generation: &AtomicU64, gate: &Mutex<()>) {
        // Invalidate the generation first: a driver that already dequeued
        // an event re-checks it under the gate before touching the sink.
        generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = active.cancel.take() {
            cancel.cancel();
        }
        if let Some(driver) = active.driver.take() {
            driver.abort();
        }
        // Wait out a callback that was already executing when the
        // generation flipped. Once the lock is ours no callback is in
        // flight and none can start for this generation.
        drop(lock_unpoisoned(gate));
    }
}

impl Drop for ProgressWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Per-session state of the reconciliation loop.
struct Driver {
    push: Arc<dyn ProgressChannel>,
    pull: Arc<dyn ProgressChannel>,
    sink: Arc<dyn ProgressSink>,
    generation_counter: Arc<AtomicU64>,
    generation: u64,
    callback_gate: Arc<Mutex<()>>,
}

impl Driver {
    fn superseded(&self) -> bool {
        self.generation_counter.load(Ordering::SeqCst) != self.generation
    }

    /// Run `dispatch` against the sink unless the session was superseded.
    ///
    /// The gate is held across the callback; `halt` takes the same gate
    /// after flipping the generation, so a dispatch either sees the flip
    /// and backs off, or finishes before `stop` returns.
    fn with_sink(&self, dispatch: impl FnOnce(&dyn ProgressSink)) {
        let _gate = lock_unpoisoned(&self.callback_gate);
        if self.superseded() {
            return;
        }
        dispatch(self.sink.as_ref());
    }

    async fn drive(self, session_id: String, cancel: CancellationToken) {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Push is preferred; pull only ever runs after push reported
        // itself unavailable, so the two are never live concurrently.
        tokio::spawn(self.push.clone().run(
            session_id.clone(),
            events_tx.clone(),
            cancel.clone(),
        ));

        let mut on_pull = false;
        let mut last_completed: u64 = 0;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            if self.superseded() {
                return;
            }

            match event {
                ChannelEvent::Update(envelope) => {
                    // Terminal envelopes always end the session; an error
                    // envelope legitimately carries no counts, so the
                    // staleness guard applies to non-terminal ticks only.
                    if envelope.is_terminal() {
                        self.deliver_terminal(&session_id, &envelope);
                        cancel.cancel();
                        return;
                    }
                    if envelope.completed_count < last_completed {
                        // Stale snapshot, e.g. an idempotent re-poll racing
                        // the push->pull switch. Progress never regresses.
                        debug!(
                            completed = envelope.completed_count,
                            seen = last_completed,
                            "dropping stale envelope"
                        );
                        continue;
                    }
                    last_completed = envelope.completed_count;
                    self.with_sink(|sink| sink.on_tick(&envelope));
                }
                ChannelEvent::Unavailable(reason) => {
                    if on_pull {
                        // The backstop itself gave up; this is the bounded
                        // end of the retry policy and the one case where a
                        // transport failure surfaces to the consumer.
                        warn!(%session_id, %reason, "pull channel exhausted");
                        self.with_sink(|sink| sink.on_error(&reason));
                        cancel.cancel();
                        return;
                    }
                    info!(%session_id, %reason, "push unavailable, falling back to polling");
                    on_pull = true;
                    tokio::spawn(self.pull.clone().run(
                        session_id.clone(),
                        events_tx.clone(),
                        cancel.clone(),
                    ));
                }
            }
        }
    }

    fn deliver_terminal(&self, session_id: &str, envelope: &Envelope) {
        self.with_sink(|sink| {
            // Final tick first, so the consumer's last rendered state
            // matches the terminal result set.
            sink.on_tick(envelope);
            match envelope.kind {
                EnvelopeKind::Completed => {
                    info!(
                        %session_id,
                        completed = envelope.completed_count,
                        total = envelope.total_count,
                        "session completed"
                    );
                    sink.on_complete(envelope);
                }
                EnvelopeKind::Error => {
                    let message = envelope.error_message();
                    warn!(%session_id, %message, "session failed");
                    sink.on_error(&message);
                }
                _ => debug!("non-terminal envelope passed to deliver_terminal"),
            }
        });
    }
}
