use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_bus::{Bus, BusError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{DebateTimer, TickOutcome, TimerState};
use crate::signal::{ChannelKey, MatchId, Participant};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TimerStoreError {
    #[error("timer store unavailable: {0}")]
    Bus(#[from] BusError),
    #[error("timer record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Where timer records are kept and how changes made elsewhere arrive.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn load(&self, match_id: &MatchId) -> Result<Option<TimerState>, TimerStoreError>;
    async fn upsert(&self, match_id: &MatchId, state: &TimerState) -> Result<(), TimerStoreError>;
    /// Records written by other participants, until the store drops the feed.
    async fn watch(
        &self,
        match_id: &MatchId,
    ) -> Result<mpsc::UnboundedReceiver<TimerState>, TimerStoreError>;
}

/// Relays timer records over the bus on `"{namespace}-{match_id}"`.
///
/// The bus keeps no history, so `load` only knows records this store has written
/// or received.
pub struct BusTimerStore {
    bus: Arc<dyn Bus>,
    namespace: String,
    member: Participant,
    last_seen: Arc<Mutex<HashMap<MatchId, TimerState>>>,
}

impl BusTimerStore {
    pub fn new(bus: Arc<dyn Bus>, namespace: impl Into<String>, member: Participant) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
            member,
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel(&self, match_id: &MatchId) -> ChannelKey {
        ChannelKey::new(&self.namespace, match_id)
    }
}

#[async_trait]
impl TimerStore for BusTimerStore {
    async fn load(&self, match_id: &MatchId) -> Result<Option<TimerState>, TimerStoreError> {
        Ok(self.last_seen.lock().get(match_id).cloned())
    }

    async fn upsert(&self, match_id: &MatchId, state: &TimerState) -> Result<(), TimerStoreError> {
        let payload = serde_json::to_vec(state)?;
        self.last_seen.lock().insert(match_id.clone(), state.clone());
        self.bus.publish(
            self.channel(match_id).as_str(),
            self.member.as_str(),
            payload.into(),
        )?;
        Ok(())
    }

    async fn watch(
        &self,
        match_id: &MatchId,
    ) -> Result<mpsc::UnboundedReceiver<TimerState>, TimerStoreError> {
        let channel = self.channel(match_id);
        let subscription = self.bus.subscribe(channel.as_str(), self.member.as_str())?;
        let (handle, mut messages) = subscription.into_parts();
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::clone(&self.bus);
        let last_seen = Arc::clone(&self.last_seen);
        let match_id = match_id.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let state: TimerState = match serde_json::from_slice(&message.payload) {
                    Ok(state) => state,
                    Err(err) => {
                        tracing::debug!(target = "parley::timer", error = %err, "bad timer record");
                        continue;
                    }
                };
                last_seen.lock().insert(match_id.clone(), state.clone());
                if tx.send(state).is_err() {
                    break;
                }
            }
            let _ = bus.unsubscribe(&handle);
        });
        Ok(rx)
    }
}

/// Local [`DebateTimer`] kept in step with an optional [`TimerStore`].
///
/// Without a store, or when the store fails, the timer still runs locally.
pub struct TimerSync {
    match_id: MatchId,
    store: Option<Arc<dyn TimerStore>>,
    timer: Mutex<DebateTimer>,
    updates: watch::Sender<TimerState>,
}

impl TimerSync {
    pub fn new(match_id: MatchId, store: Option<Arc<dyn TimerStore>>) -> Self {
        let timer = DebateTimer::new();
        let (updates, _) = watch::channel(timer.state());
        Self {
            match_id,
            store,
            timer: Mutex::new(timer),
            updates,
        }
    }

    pub fn state(&self) -> TimerState {
        self.timer.lock().state()
    }

    pub fn display(&self) -> String {
        self.timer.lock().display()
    }

    pub fn progress(&self) -> String {
        self.timer.lock().progress()
    }

    pub fn watch(&self) -> watch::Receiver<TimerState> {
        self.updates.subscribe()
    }

    /// Adopt whatever the store already holds for this match.
    pub async fn hydrate(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match store.load(&self.match_id).await {
            Ok(Some(state)) => self.apply_remote(&state),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(target = "parley::timer", error = %err, "timer state unavailable");
            }
        }
    }

    pub async fn start(&self) {
        let state = self.timer.lock().start();
        self.publish(state).await;
    }

    pub async fn pause(&self) {
        let state = self.timer.lock().pause();
        self.publish(state).await;
    }

    pub async fn reset(&self) {
        let state = self.timer.lock().reset();
        self.publish(state).await;
    }

    pub async fn tick(&self) -> TickOutcome {
        let (outcome, state) = {
            let mut timer = self.timer.lock();
            let outcome = timer.tick();
            (outcome, timer.state())
        };
        match outcome {
            TickOutcome::Idle => {}
            TickOutcome::Finished => {
                tracing::info!(target = "parley::timer", match_id = %self.match_id, "debate finished");
                self.publish(state).await;
            }
            _ => self.publish(state).await,
        }
        outcome
    }

    pub fn apply_remote(&self, state: &TimerState) {
        let adopted = {
            let mut timer = self.timer.lock();
            timer.apply_remote(state);
            timer.state()
        };
        self.updates.send_replace(adopted);
    }

    /// Drives the one-second ticker and relays remote records until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut remote = match self.store.as_ref() {
                Some(store) => match store.watch(&self.match_id).await {
                    Ok(rx) => Some(rx),
                    Err(err) => {
                        tracing::debug!(target = "parley::timer", error = %err, "timer sync disabled");
                        None
                    }
                },
                None => None,
            };
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    state = recv_remote(&mut remote) => match state {
                        Some(state) => self.apply_remote(&state),
                        None => remote = None,
                    },
                }
            }
        })
    }

    async fn publish(&self, state: TimerState) {
        self.updates.send_replace(state.clone());
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(err) = store.upsert(&self.match_id, &state).await {
            tracing::debug!(target = "parley::timer", error = %err, "timer state not persisted");
        }
    }
}

async fn recv_remote(remote: &mut Option<mpsc::UnboundedReceiver<TimerState>>) -> Option<TimerState> {
    match remote {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
