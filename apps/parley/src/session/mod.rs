//! Public entry point: one [`SessionController`] per participant per match.
//!
//! Every connection attempt runs as a single task that owns its media, peer
//! connection, bus subscription and [`NegotiationStateMachine`]. Signals, peer
//! events and stop requests are multiplexed into that task, so the state machine
//! only ever has one writer. Attempts carry a generation number; a task whose
//! generation is no longer current discards whatever it was doing and releases
//! its resources.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use signal_bus::{Bus, SubscriptionHandle};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::media::{LocalMedia, MediaError, MediaSource, RemoteMedia};
use crate::negotiation::{
    CandidateBuffer, NegotiationError, NegotiationState, NegotiationStateMachine,
};
use crate::peer::{ConnectivityState, PeerConnection, PeerConnector, PeerEvent};
use crate::signal::{ChannelKey, MatchId, Participant};
use crate::transport::SignalChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl From<NegotiationState> for SessionStatus {
    fn from(state: NegotiationState) -> Self {
        match state {
            NegotiationState::Connected => SessionStatus::Connected,
            NegotiationState::Disconnected | NegotiationState::Failed => {
                SessionStatus::Disconnected
            }
            NegotiationState::Idle
            | NegotiationState::AwaitingPeer
            | NegotiationState::Negotiating => SessionStatus::Connecting,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    MediaUnavailable(MediaError),
    #[error("signaling transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("connectivity lost ({0:?})")]
    ConnectivityLost(ConnectivityState),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl SessionError {
    pub fn user_message(&self) -> String {
        match self {
            SessionError::MediaUnavailable(err) => err.user_message(),
            SessionError::TransportUnavailable(_) => {
                "Lost contact with the match server. Try again.".to_string()
            }
            SessionError::ConnectivityLost(_) => {
                "The connection to your opponent was lost. Try again.".to_string()
            }
            SessionError::Negotiation(_) => {
                "Could not set up a connection with your opponent. Try again.".to_string()
            }
        }
    }

    /// Media problems are reported as `Error`; everything else as `Disconnected`.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionError::MediaUnavailable(_) => SessionStatus::Error,
            _ => SessionStatus::Disconnected,
        }
    }
}

impl From<NegotiationError> for SessionError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Transport(err) => SessionError::TransportUnavailable(err.to_string()),
            other => SessionError::Negotiation(other.to_string()),
        }
    }
}

/// What the caller sees of a session at one point in time.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub negotiation: NegotiationState,
    pub error: Option<SessionError>,
    pub attempt: u64,
    pub local_media: Option<Arc<LocalMedia>>,
    pub remote_media: RemoteMedia,
}

impl SessionSnapshot {
    fn connecting(attempt: u64) -> Self {
        Self {
            status: SessionStatus::Connecting,
            negotiation: NegotiationState::Idle,
            error: None,
            attempt,
            local_media: None,
            remote_media: RemoteMedia::default(),
        }
    }

    pub fn has_local_media(&self) -> bool {
        self.local_media.as_ref().is_some_and(|m| !m.is_stopped())
    }

    /// Connected, but the opponent is not sending video.
    pub fn remote_video_missing(&self) -> bool {
        self.status == SessionStatus::Connected && !self.remote_media.has_video()
    }
}

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct SessionContext {
    pub bus: Arc<dyn Bus>,
    pub media: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerConnector>,
    pub config: Config,
}

struct Shared {
    match_id: MatchId,
    participant: Participant,
    ctx: SessionContext,
    generation: AtomicU64,
    stopped: AtomicBool,
    status: watch::Sender<SessionSnapshot>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Applies `update` only while `generation` is still the live attempt.
    fn publish(&self, generation: u64, update: impl FnOnce(&mut SessionSnapshot)) {
        self.status.send_if_modified(|snapshot| {
            if !self.is_current(generation) {
                return false;
            }
            update(snapshot);
            true
        });
    }
}

enum Command {
    Stop,
}

struct AttemptHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl AttemptHandle {
    /// Stops the attempt and waits until its resources are released.
    async fn stop(self) {
        let _ = self.commands.send(Command::Stop);
        if let Err(err) = self.task.await {
            tracing::warn!(
                target = "parley::session",
                generation = self.generation,
                error = %err,
                "attempt task ended abnormally"
            );
        }
    }
}

pub struct SessionController {
    shared: Arc<Shared>,
    current: Mutex<Option<AttemptHandle>>,
}

impl SessionController {
    /// Starts the first attempt immediately. Must be called inside a Tokio runtime.
    pub fn start(match_id: MatchId, participant: Participant, ctx: SessionContext) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::connecting(1));
        let shared = Arc::new(Shared {
            match_id,
            participant,
            ctx,
            generation: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            status,
        });
        tracing::info!(
            target = "parley::session",
            match_id = %shared.match_id,
            participant = %shared.participant,
            "session starting"
        );
        let first = spawn_attempt(&shared, 1, None);
        Self {
            shared,
            current: Mutex::new(Some(first)),
        }
    }

    pub fn match_id(&self) -> &MatchId {
        &self.shared.match_id
    }

    pub fn participant(&self) -> &Participant {
        &self.shared.participant
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.status.subscribe()
    }

    /// Tears down the current attempt and starts a fresh one after the retry delay.
    /// Ignored once the session has been stopped.
    pub async fn retry(&self) {
        // `stop` flips `stopped` under the same lock, so no attempt can be
        // started behind its back.
        let (generation, previous) = {
            let mut slot = self.current.lock();
            if self.shared.stopped.load(Ordering::SeqCst) {
                tracing::debug!(target = "parley::session", "retry after stop ignored");
                return;
            }
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (generation, slot.take())
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        if !self.shared.is_current(generation) {
            // A later retry or stop took over while we were tearing down.
            return;
        }
        tracing::info!(
            target = "parley::session",
            match_id = %self.shared.match_id,
            attempt = generation,
            "retrying session"
        );
        self.shared
            .publish(generation, |snapshot| *snapshot = SessionSnapshot::connecting(generation));
        let delay = self.shared.ctx.config.retry_delay;
        let mut slot = self.current.lock();
        if self.shared.is_current(generation) {
            *slot = Some(spawn_attempt(&self.shared, generation, Some(delay)));
        }
    }

    /// Deterministic teardown; later calls return immediately.
    pub async fn stop(&self) {
        let previous = {
            let mut slot = self.current.lock();
            if self.shared.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        self.shared.status.send_modify(|snapshot| {
            snapshot.status = SessionStatus::Disconnected;
            snapshot.negotiation = NegotiationState::Disconnected;
            snapshot.error = None;
            snapshot.local_media = None;
            snapshot.remote_media = RemoteMedia::default();
        });
        tracing::info!(
            target = "parley::session",
            match_id = %self.shared.match_id,
            participant = %self.shared.participant,
            "session stopped"
        );
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(attempt) = self.current.get_mut().take() {
            let _ = attempt.commands.send(Command::Stop);
        }
    }
}

fn spawn_attempt(shared: &Arc<Shared>, generation: u64, delay: Option<Duration>) -> AttemptHandle {
    let (commands, mailbox) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_attempt(Arc::clone(shared), generation, mailbox, delay));
    AttemptHandle {
        generation,
        commands,
        task,
    }
}

enum Exit {
    /// Stopped by the controller or superseded by a newer attempt.
    Halted,
    Ended(SessionError),
}

/// Everything an attempt has acquired so far.
#[derive(Default)]
struct Resources {
    media: Option<Arc<LocalMedia>>,
    peer: Option<Arc<dyn PeerConnection>>,
    channel: Option<SignalChannel>,
    subscription: Option<SubscriptionHandle>,
    machine: Option<NegotiationStateMachine>,
}

impl Resources {
    async fn release(&mut self, generation: u64) {
        if let Some(media) = self.media.take() {
            let stopped = media.stop();
            tracing::debug!(target = "parley::session", generation, stopped, "local tracks stopped");
        }
        if let Some(mut machine) = self.machine.take() {
            machine.close().await;
        } else if let Some(peer) = self.peer.as_ref() {
            if let Err(err) = peer.close().await {
                tracing::debug!(target = "parley::session", error = %err, "peer close failed");
            }
        }
        self.peer = None;
        if let (Some(channel), Some(handle)) = (self.channel.take(), self.subscription.take()) {
            if let Err(err) = channel.unsubscribe(&handle) {
                tracing::debug!(target = "parley::session", error = %err, "unsubscribe failed");
            }
        }
    }
}

async fn run_attempt(
    shared: Arc<Shared>,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
    delay: Option<Duration>,
) {
    let mut resources = Resources::default();
    let exit = drive(&shared, generation, &mut commands, delay, &mut resources).await;
    resources.release(generation).await;
    match exit {
        Exit::Halted => {
            tracing::debug!(target = "parley::session", generation, "attempt halted");
        }
        Exit::Ended(error) => {
            tracing::warn!(
                target = "parley::session",
                generation,
                error = %error,
                "attempt ended"
            );
            shared.publish(generation, |snapshot| {
                snapshot.status = error.status();
                if snapshot.negotiation != NegotiationState::Failed {
                    snapshot.negotiation = NegotiationState::Disconnected;
                }
                snapshot.local_media = None;
                snapshot.error = Some(error);
            });
        }
    }
}

/// Races `work` against the mailbox; any command or a closed mailbox halts the attempt.
async fn guarded<F: Future>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    work: F,
) -> Result<F::Output, Exit> {
    tokio::select! {
        biased;
        _ = commands.recv() => Err(Exit::Halted),
        output = work => Ok(output),
    }
}

fn ensure_current(shared: &Shared, generation: u64) -> Result<(), Exit> {
    if shared.is_current(generation) {
        Ok(())
    } else {
        Err(Exit::Halted)
    }
}

async fn drive(
    shared: &Arc<Shared>,
    generation: u64,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    delay: Option<Duration>,
    resources: &mut Resources,
) -> Exit {
    match run(shared, generation, commands, delay, resources).await {
        Ok(never) => match never {},
        Err(exit) => exit,
    }
}

async fn run(
    shared: &Arc<Shared>,
    generation: u64,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    delay: Option<Duration>,
    resources: &mut Resources,
) -> Result<std::convert::Infallible, Exit> {
    let ctx = &shared.ctx;

    if let Some(delay) = delay {
        // Give the capture device time to be released by the previous attempt.
        guarded(commands, tokio::time::sleep(delay)).await?;
        ensure_current(shared, generation)?;
    }

    let media = guarded(commands, ctx.media.acquire(&ctx.config.media)).await?;
    let media = Arc::new(media.map_err(SessionError::MediaUnavailable).map_err(Exit::Ended)?);
    resources.media = Some(Arc::clone(&media));
    ensure_current(shared, generation)?;
    shared.publish(generation, |snapshot| {
        snapshot.local_media = Some(Arc::clone(&media));
    });

    let (peer_events, mut peer_rx) = mpsc::unbounded_channel();
    let peer = guarded(commands, ctx.peers.connect(&ctx.config.ice_servers, peer_events))
        .await?
        .map_err(|err| Exit::Ended(SessionError::Negotiation(err.to_string())))?;
    resources.peer = Some(Arc::clone(&peer));
    ensure_current(shared, generation)?;

    let channel = SignalChannel::new(
        Arc::clone(&ctx.bus),
        ChannelKey::new(&ctx.config.signal_namespace, &shared.match_id),
        shared.participant.clone(),
    );
    let mut subscription = channel
        .subscribe()
        .map_err(|err| Exit::Ended(SessionError::TransportUnavailable(err.to_string())))?;
    resources.channel = Some(channel.clone());
    resources.subscription = Some(subscription.handle().clone());
    guarded(commands, subscription.ready())
        .await?
        .map_err(|err| Exit::Ended(SessionError::TransportUnavailable(err.to_string())))?;
    ensure_current(shared, generation)?;

    let buffer = if ctx.config.deduplicate_candidates {
        CandidateBuffer::deduplicating()
    } else {
        CandidateBuffer::new()
    };
    let machine = resources.machine.insert(
        NegotiationStateMachine::new(shared.participant.clone(), peer, Arc::new(channel))
            .with_candidate_buffer(buffer),
    );
    let mut restarts = machine.restarts();
    guarded(commands, machine.start(&media))
        .await?
        .map_err(|err| Exit::Ended(err.into()))?;
    ensure_current(shared, generation)?;
    shared.publish(generation, |snapshot| {
        snapshot.negotiation = machine.state();
    });
    tracing::info!(
        target = "parley::session",
        match_id = %shared.match_id,
        participant = %shared.participant,
        attempt = generation,
        "awaiting peer"
    );

    loop {
        tokio::select! {
            biased;
            _ = commands.recv() => return Err(Exit::Halted),
            event = peer_rx.recv() => {
                let Some(event) = event else {
                    return Err(Exit::Ended(SessionError::Negotiation(
                        "peer connection dropped its event stream".into(),
                    )));
                };
                ensure_current(shared, generation)?;
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        machine
                            .handle_local_candidate(candidate)
                            .map_err(|err| Exit::Ended(err.into()))?;
                    }
                    PeerEvent::RemoteTrack(track) => {
                        tracing::debug!(
                            target = "parley::session",
                            kind = ?track.kind,
                            track_id = %track.id,
                            "remote track"
                        );
                        shared.publish(generation, |snapshot| snapshot.remote_media.add_track(track));
                    }
                    PeerEvent::Connectivity(connectivity) => {
                        let state = machine.handle_connectivity(connectivity);
                        shared.publish(generation, |snapshot| {
                            snapshot.negotiation = state;
                            snapshot.status = state.into();
                        });
                        if state == NegotiationState::Connected {
                            tracing::info!(
                                target = "parley::session",
                                match_id = %shared.match_id,
                                participant = %shared.participant,
                                "session connected"
                            );
                        }
                        if state.is_finished() {
                            return Err(Exit::Ended(SessionError::ConnectivityLost(connectivity)));
                        }
                    }
                }
            }
            signal = subscription.recv() => {
                let Some(signal) = signal else {
                    return Err(Exit::Ended(SessionError::TransportUnavailable(
                        "signaling subscription ended".into(),
                    )));
                };
                ensure_current(shared, generation)?;
                let handled = guarded(commands, machine.handle_signal(signal)).await?;
                ensure_current(shared, generation)?;
                let state = machine.state();
                let restarted = machine.restarts() != restarts;
                if restarted {
                    restarts = machine.restarts();
                    tracing::info!(
                        target = "parley::session",
                        match_id = %shared.match_id,
                        participant = %shared.participant,
                        "opponent restarted; reconnecting"
                    );
                }
                shared.publish(generation, |snapshot| {
                    snapshot.negotiation = state;
                    snapshot.status = state.into();
                    if restarted {
                        snapshot.remote_media = RemoteMedia::default();
                    }
                });
                handled.map_err(|err| Exit::Ended(err.into()))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaErrorReason;

    #[test]
    fn status_follows_negotiation_state() {
        assert_eq!(
            SessionStatus::from(NegotiationState::AwaitingPeer),
            SessionStatus::Connecting
        );
        assert_eq!(
            SessionStatus::from(NegotiationState::Connected),
            SessionStatus::Connected
        );
        assert_eq!(
            SessionStatus::from(NegotiationState::Failed),
            SessionStatus::Disconnected
        );
    }

    #[test]
    fn media_errors_surface_as_error_status() {
        let err = SessionError::MediaUnavailable(MediaError::new(
            MediaErrorReason::DeviceBusy,
            "NotReadableError",
        ));
        assert_eq!(err.status(), SessionStatus::Error);
        assert!(err.user_message().contains("in use"));
        assert_eq!(
            SessionError::ConnectivityLost(ConnectivityState::Failed).status(),
            SessionStatus::Disconnected
        );
    }

    #[test]
    fn remote_video_missing_only_when_connected() {
        let mut snapshot = SessionSnapshot::connecting(1);
        assert!(!snapshot.remote_video_missing());
        snapshot.status = SessionStatus::Connected;
        assert!(snapshot.remote_video_missing());
        snapshot.remote_media.add_track(crate::media::RemoteTrackInfo {
            kind: crate::media::TrackKind::Video,
            id: "v".into(),
            stream_id: "s".into(),
        });
        assert!(!snapshot.remote_video_missing());
    }
}
