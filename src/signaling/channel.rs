// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The shared signaling connection and its driver task.
//!
//! One [`SignalingChannel`] owns at most one live connection. Consumers
//! acquire it with [`connect`](SignalingChannel::connect) and get a
//! [`SignalingHandle`]; the consumer count is an atomic counter. Releasing
//! the last handle does not close the connection. Only
//! [`disconnect`](SignalingChannel::disconnect) does.
//!
//! Each connection is driven by a spawned task that owns the socket and
//! handles reconnect backoff, heartbeats, and inbound frames. Status updates
//! from a superseded driver are ignored via a generation counter.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::message::{SignalMessage, SignalMetadata, SignalType};
use super::transport::{Frame, SignalSink, SignalSocket, SignalTransport};
use super::{ConnectionState, SignalError, SignalStatus, PROTOCOL_VERSION};
use crate::clock::Clock;
use crate::config::SignalingConfig;
use crate::events::{EventBus, SyncEvent};
use crate::resilience::retry::RetryConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 128;
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

struct Session {
    url: String,
    budget_id: String,
    outbound: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    transport: Arc<dyn SignalTransport>,
    config: SignalingConfig,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    status: watch::Sender<SignalStatus>,
    signals: broadcast::Sender<SignalMessage>,
    consumers: AtomicUsize,
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
}

enum SessionEnd {
    Shutdown,
    Closed,
    Dropped(String),
}

impl Shared {
    /// Replace the status if `generation` is still current.
    fn update(&self, generation: u64, f: impl FnOnce(&mut SignalStatus)) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.replace_status(f);
    }

    fn replace_status(&self, f: impl FnOnce(&mut SignalStatus)) {
        let previous = self.status.borrow().clone();
        let mut next = previous.clone();
        f(&mut next);
        next.is_connected = next.status == ConnectionState::Connected;
        if next == previous {
            return;
        }

        crate::metrics::set_signal_state(next.status as u8);
        self.status.send_replace(next.clone());

        let transition = next.status != previous.status
            || next.reconnect_attempts != previous.reconnect_attempts
            || next.error != previous.error;
        if transition {
            self.events.publish(SyncEvent::SignalStatusChanged(next));
        }
    }
}

/// Reference-counted signaling service. Cheap to clone.
#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

/// One consumer's claim on the channel. Dropping it releases the claim
/// but leaves the connection up.
pub struct SignalingHandle {
    channel: SignalingChannel,
}

impl SignalingHandle {
    #[must_use]
    pub fn channel(&self) -> &SignalingChannel {
        &self.channel
    }

    /// Explicit release; same as dropping.
    pub fn release(self) {}
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        let remaining = self.channel.shared.consumers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining == 0 {
            debug!("Last signaling consumer released, connection stays up until disconnect");
        }
    }
}

impl SignalingChannel {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        config: SignalingConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(SignalStatus::default());
        let (signals, _) = broadcast::channel(INBOUND_BUFFER);
        Self {
            shared: Arc::new(Shared {
                transport,
                retry: config.retry_config(),
                config,
                clock,
                events,
                status,
                signals,
                consumers: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                session: Mutex::new(None),
            }),
        }
    }

    /// Connect using the configured URL. `None` (logged) when signaling is
    /// disabled or no URL is configured.
    pub fn connect_configured(&self, budget_id: &str) -> Option<SignalingHandle> {
        let Some(url) = self.shared.config.active_url().map(str::to_string) else {
            info!("Realtime signaling disabled (no URL configured or disabled by flag)");
            return None;
        };
        Some(self.connect(&url, budget_id))
    }

    /// Acquire the shared connection for `budget_id`, starting it if needed.
    ///
    /// A live connection to the same URL and budget is reused. Connecting to
    /// a different budget replaces the connection for every consumer.
    pub fn connect(&self, url: &str, budget_id: &str) -> SignalingHandle {
        let consumers = self.shared.consumers.fetch_add(1, Ordering::AcqRel) + 1;

        let mut session = self.shared.session.lock();
        let reusable = session
            .as_ref()
            .is_some_and(|s| s.url == url && s.budget_id == budget_id && !s.task.is_finished());

        if reusable {
            debug!(consumers, "Reusing signaling connection");
        } else {
            if let Some(old) = session.take() {
                info!(budget = %old.budget_id, "Replacing signaling connection");
                let _ = old.shutdown.send(true);
            }
            *session = Some(self.start(url, budget_id));
        }

        SignalingHandle { channel: self.clone() }
    }

    fn start(&self, url: &str, budget_id: &str) -> Session {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.shared.replace_status(|s| {
            s.reconnect_attempts = 0;
            s.error = None;
        });

        let task = tokio::spawn(drive(
            Arc::clone(&self.shared),
            generation,
            url.to_string(),
            budget_id.to_string(),
            outbound_rx,
            shutdown_rx,
        ));

        Session {
            url: url.to_string(),
            budget_id: budget_id.to_string(),
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Tear the connection down regardless of how many consumers hold it.
    pub async fn disconnect(&self) {
        let session = self.shared.session.lock().take();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.replace_status(|s| {
            s.status = ConnectionState::Disconnected;
            s.error = None;
        });

        let Some(session) = session else {
            return;
        };
        let _ = session.shutdown.send(true);
        if tokio::time::timeout(DISCONNECT_GRACE, session.task).await.is_err() {
            warn!("Signaling driver did not stop in time");
        }
        info!(budget = %session.budget_id, "Signaling disconnected");
    }

    /// Push a signal to the other devices on the budget.
    ///
    /// Metadata outside the whitelist cannot be expressed; overlong values are
    /// dropped. Fails with `NotConnected` unless the channel is connected.
    pub fn send_signal(&self, signal_type: SignalType, metadata: Option<SignalMetadata>) -> Result<(), SignalError> {
        if !self.is_connected() {
            warn!(signal = %signal_type, "Cannot send signal, channel not connected");
            return Err(SignalError::NotConnected);
        }
        let session = self.shared.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(SignalError::NotConnected);
        };

        let message = SignalMessage::new(
            signal_type,
            Some(session.budget_id.clone()),
            self.shared.clock.now_millis(),
            metadata,
        );
        let text = message.to_json().map_err(|e| SignalError::Send(e.to_string()))?;
        session
            .outbound
            .try_send(text)
            .map_err(|e| SignalError::Send(e.to_string()))?;

        crate::metrics::record_signal("out", signal_type.as_str());
        debug!(signal = %signal_type, "Signal queued");
        Ok(())
    }

    /// Inbound signals (pongs excluded) for the current budget.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.shared.signals.subscribe()
    }

    /// Run `callback` for every inbound signal until the returned task is aborted.
    pub fn on_signal<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SignalMessage) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => callback(signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Signal listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    #[must_use]
    pub fn status(&self) -> SignalStatus {
        self.shared.status.borrow().clone()
    }

    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SignalStatus> {
        self.shared.status.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected
    }

    /// Number of outstanding [`SignalingHandle`]s.
    #[must_use]
    pub fn consumers(&self) -> usize {
        self.shared.consumers.load(Ordering::Acquire)
    }
}

async fn drive(
    shared: Arc<Shared>,
    generation: u64,
    url: String,
    budget_id: String,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_attempts = shared.config.max_reconnect_attempts;
    let mut attempts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }
        shared.update(generation, |s| s.status = ConnectionState::Connecting);
        debug!(url = %url, attempt = attempts, "Connecting to signaling server");

        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            result = tokio::time::timeout(CONNECT_TIMEOUT, shared.transport.connect(&url)) => {
                result.unwrap_or_else(|_| Err(SignalError::Connect("connect timed out".into())))
            }
        };

        let failure = match connected {
            Ok(socket) => {
                attempts = 0;
                match run_session(&shared, generation, &budget_id, socket, &mut outbound, &mut shutdown).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Closed => {
                        info!("Signaling connection closed by server");
                        shared.update(generation, |s| s.status = ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Dropped(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        if attempts >= max_attempts {
            error!(attempts, "Signaling reconnect attempts exhausted");
            shared.update(generation, |s| {
                s.status = ConnectionState::Error;
                s.error = Some(format!("Failed to reconnect after {max_attempts} attempts"));
            });
            return;
        }

        attempts += 1;
        crate::metrics::record_reconnect_attempt();
        let delay = shared.retry.delay_for_attempt(attempts - 1);
        warn!(attempt = attempts, max = max_attempts, ?delay, error = %failure, "Signaling connection lost, reconnecting");
        shared.update(generation, |s| {
            s.status = ConnectionState::Reconnecting;
            s.reconnect_attempts = attempts;
            s.error = Some(failure);
        });

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn send_message(sink: &mut dyn SignalSink, message: &SignalMessage) -> Result<(), SignalError> {
    let text = message.to_json().map_err(|e| SignalError::Send(e.to_string()))?;
    sink.send(text).await
}

async fn run_session(
    shared: &Shared,
    generation: u64,
    budget_id: &str,
    socket: SignalSocket,
    outbound: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let SignalSocket { mut sink, mut stream } = socket;

    let hello = SignalMessage::new(
        SignalType::Connected,
        Some(budget_id.to_string()),
        shared.clock.now_millis(),
        Some(SignalMetadata::new().budget_id(budget_id).version(PROTOCOL_VERSION)),
    );
    if let Err(e) = send_message(sink.as_mut(), &hello).await {
        return SessionEnd::Dropped(e.to_string());
    }

    // Local listeners learn about the connection before status flips
    let _ = shared.signals.send(SignalMessage::new(
        SignalType::Connected,
        Some(budget_id.to_string()),
        shared.clock.now_millis(),
        None,
    ));
    info!(budget = %budget_id, "Signaling connected");
    shared.update(generation, |s| {
        s.status = ConnectionState::Connected;
        s.reconnect_attempts = 0;
        s.error = None;
    });

    let interval = Duration::from_millis(shared.config.heartbeat_interval_ms.max(1));
    let dead_after = interval * shared.config.missed_heartbeats.max(1);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let bye = SignalMessage::new(
                    SignalType::Disconnected,
                    Some(budget_id.to_string()),
                    shared.clock.now_millis(),
                    None,
                );
                let _ = send_message(sink.as_mut(), &bye).await;
                sink.close().await;
                return SessionEnd::Shutdown;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(text).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() >= dead_after {
                    warn!(missed = shared.config.missed_heartbeats, "Signaling heartbeat lost");
                    sink.close().await;
                    return SessionEnd::Dropped("heartbeat timeout".into());
                }
                let ping = SignalMessage::new(SignalType::Ping, Some(budget_id.to_string()), shared.clock.now_millis(), None);
                if let Err(e) = send_message(sink.as_mut(), &ping).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            frame = stream.next_frame() => match frame {
                Frame::Text(text) => {
                    let Some(signal) = SignalMessage::parse(&text, shared.clock.now_millis()) else {
                        debug!("Discarding unrecognized signal frame");
                        continue;
                    };
                    if signal.budget_id.as_deref().is_some_and(|b| b != budget_id) {
                        debug!(signal = %signal.signal_type, "Discarding signal for another budget");
                        continue;
                    }
                    crate::metrics::record_signal("in", signal.signal_type.as_str());
                    if signal.signal_type == SignalType::Pong {
                        last_pong = Instant::now();
                        let at = shared.clock.now_millis();
                        shared.update(generation, |s| s.last_heartbeat = Some(at));
                        continue;
                    }
                    let _ = shared.signals.send(signal);
                }
                Frame::Closed => return SessionEnd::Closed,
                Frame::Dropped(reason) => return SessionEnd::Dropped(reason),
            }
        }
    }
}
