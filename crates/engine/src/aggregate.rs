//! The aggregate engine: command processing, event replay, snapshotting,
//! and optimistic concurrency with bounded retry.
//!
//! Flow: command -> handler decides events -> append to the store (claiming
//! the next version) -> fold the committed batch through the event handlers
//! -> publish to the `main` ingress stream -> snapshot per policy. A version
//! conflict means another writer got there first: reload and restart the
//! handler, up to the retry cap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use arque_core::{AggregateId, AggregateRef, Event, EventId, EventMeta, Snapshot, Value};
use arque_infra::{EventBatch, EventBus, EventQuery, EventStore, MAIN_STREAM, StreamBatch};

use crate::error::EngineError;

/// A command submitted to an aggregate: a numeric type code plus opaque
/// arguments forwarded to the registered handler.
#[derive(Debug, Clone)]
pub struct Command {
    pub command_type: u32,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(command_type: u32, args: Vec<Value>) -> Self {
        Self { command_type, args }
    }
}

/// Read-only view handed to command handlers.
#[derive(Debug, Clone)]
pub struct CommandContext<S> {
    pub aggregate: AggregateRef,
    pub state: S,
    pub timestamp: DateTime<Utc>,
}

/// An event decided by a command handler, before the engine assigns its id,
/// version, and batch timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: u32,
    pub body: Option<Value>,
    pub meta: EventMeta,
}

/// Decides events for a command, or raises a domain error (never retried).
pub type CommandHandler<S> = Arc<
    dyn Fn(CommandContext<S>, Option<EventMeta>, Vec<Value>) -> BoxFuture<'static, anyhow::Result<Vec<EventDraft>>>
        + Send
        + Sync,
>;

/// Folds one event into the state, both during replay and after an append.
pub type EventApplier<S> =
    Arc<dyn Fn(S, Event) -> BoxFuture<'static, anyhow::Result<S>> + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_handler<S, F, Fut>(f: F) -> CommandHandler<S>
where
    F: Fn(CommandContext<S>, Option<EventMeta>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<EventDraft>>> + Send + 'static,
{
    Arc::new(move |ctx, meta, args| Box::pin(f(ctx, meta, args)))
}

/// Wrap an async closure as an [`EventApplier`].
pub fn event_applier<S, F, Fut>(f: F) -> EventApplier<S>
where
    F: Fn(S, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
{
    Arc::new(move |state, event| Box::pin(f(state, event)))
}

pub struct AggregateOptions<S> {
    /// Snapshot every N versions; 0 disables snapshotting.
    pub snapshot_interval: u32,
    /// When set, replaces the interval modulo check.
    pub should_take_snapshot: Option<Arc<dyn Fn(&S, u32) -> bool + Send + Sync>>,
    pub serialize_state: Arc<dyn Fn(&S) -> anyhow::Result<Vec<u8>> + Send + Sync>,
    pub deserialize_state: Arc<dyn Fn(&[u8]) -> anyhow::Result<S> + Send + Sync>,
    /// Cap on version-conflict reload cycles in [`Aggregate::process`].
    pub retry_attempts: u32,
}

impl<S> Default for AggregateOptions<S>
where
    S: serde::Serialize + serde::de::DeserializeOwned,
{
    fn default() -> Self {
        Self {
            snapshot_interval: 20,
            should_take_snapshot: None,
            serialize_state: Arc::new(|state| serde_json::to_vec(state).map_err(Into::into)),
            deserialize_state: Arc::new(|bytes| serde_json::from_slice(bytes).map_err(Into::into)),
            retry_attempts: arque_core::RetryPolicy::store_write().attempts,
        }
    }
}

/// Options for a single [`Aggregate::process`] call.
#[derive(Debug, Copy, Clone, Default)]
pub struct ProcessOptions {
    /// Skip the reload at the start of processing (the caller knows the
    /// in-memory state is current).
    pub no_reload: bool,
}

struct AggregateState<S> {
    version: u32,
    state: S,
}

/// A live aggregate: derived state plus the handler registries that evolve
/// it.
///
/// Consistency comes from version conflicts, not locks: concurrent writers
/// race on the claimed version and the loser reloads and retries. Within
/// one instance, `process` calls serialize and `reload` is internally
/// serialized so concurrent reloads converge instead of interleaving.
pub struct Aggregate<S> {
    id: AggregateId,
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    command_handlers: HashMap<u32, CommandHandler<S>>,
    event_appliers: HashMap<u32, EventApplier<S>>,
    opts: AggregateOptions<S>,
    inner: tokio::sync::RwLock<AggregateState<S>>,
    reload_lock: tokio::sync::Mutex<()>,
    process_lock: tokio::sync::Mutex<()>,
}

impl<S> std::fmt::Debug for Aggregate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate").field("id", &self.id).finish()
    }
}

impl<S> Aggregate<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(
        id: AggregateId,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        initial_state: S,
        opts: AggregateOptions<S>,
    ) -> Self {
        Self {
            id,
            store,
            bus,
            command_handlers: HashMap::new(),
            event_appliers: HashMap::new(),
            opts,
            inner: tokio::sync::RwLock::new(AggregateState { version: 0, state: initial_state }),
            reload_lock: tokio::sync::Mutex::new(()),
            process_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn register_command_handler(&mut self, command_type: u32, handler: CommandHandler<S>) {
        self.command_handlers.insert(command_type, handler);
    }

    pub fn register_event_handler(&mut self, event_type: u32, applier: EventApplier<S>) {
        self.event_appliers.insert(event_type, applier);
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub async fn version(&self) -> u32 {
        self.inner.read().await.version
    }

    pub async fn state(&self) -> S {
        self.inner.read().await.state.clone()
    }

    /// Bring the in-memory fold up to date: pick up a newer snapshot if one
    /// exists, then replay the tail of the log. Events without a registered
    /// handler are skipped silently.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let _guard = self.reload_lock.lock().await;

        let (mut version, mut state) = {
            let inner = self.inner.read().await;
            (inner.version, inner.state.clone())
        };

        if let Some(snapshot) = self
            .store
            .find_latest_snapshot(AggregateRef::new(self.id, version))
            .await?
        {
            state = (self.opts.deserialize_state)(&snapshot.state)
                .map_err(|e| EngineError::State(e.to_string()))?;
            version = snapshot.aggregate.version;
        }

        let mut events = self.store.list_events(EventQuery::aggregate_after(self.id, version));
        while let Some(event) = events.try_next().await? {
            if let Some(applier) = self.event_appliers.get(&event.event_type) {
                state = applier(state, event.clone()).await.map_err(EngineError::Domain)?;
            }
            version = event.aggregate.version;
        }

        let mut inner = self.inner.write().await;
        // Never regress: a racing process() may have advanced further.
        if version >= inner.version {
            inner.version = version;
            inner.state = state;
        }
        Ok(())
    }

    /// Run a command through the full pipeline and return the committed
    /// events. See the module docs for the flow.
    pub async fn process(
        &self,
        command: Command,
        meta: Option<EventMeta>,
        opts: ProcessOptions,
    ) -> Result<Vec<Event>, EngineError> {
        let _guard = self.process_lock.lock().await;

        if !opts.no_reload {
            self.reload().await?;
        }

        let max_attempts = self.opts.retry_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let (version, state) = {
                let inner = self.inner.read().await;
                (inner.version, inner.state.clone())
            };

            let handler = self
                .command_handlers
                .get(&command.command_type)
                .ok_or(EngineError::CommandHandlerMissing(command.command_type))?
                .clone();

            let timestamp = Utc::now();
            let ctx = CommandContext {
                aggregate: AggregateRef::new(self.id, version),
                state,
                timestamp,
            };

            let drafts = handler(ctx, meta.clone(), command.args.clone())
                .await
                .map_err(EngineError::Domain)?;
            if drafts.is_empty() {
                return Ok(Vec::new());
            }

            let events: Vec<Event> = drafts
                .into_iter()
                .enumerate()
                .map(|(offset, draft)| Event {
                    id: EventId::generate(),
                    event_type: draft.event_type,
                    aggregate: AggregateRef::new(self.id, version + 1 + offset as u32),
                    body: draft.body,
                    meta: draft.meta,
                    timestamp,
                })
                .collect();

            let batch = EventBatch {
                aggregate: AggregateRef::new(self.id, version + 1),
                timestamp,
                events,
                meta: meta.clone(),
            };

            match self.store.save_events(batch).await {
                Ok(saved) => {
                    // Advance the fold exactly as replay would.
                    let mut state = { self.inner.read().await.state.clone() };
                    for event in &saved {
                        if let Some(applier) = self.event_appliers.get(&event.event_type) {
                            state = applier(state, event.clone()).await.map_err(EngineError::Domain)?;
                        }
                    }
                    let head = saved.last().expect("batch is non-empty").aggregate.version;
                    {
                        let mut inner = self.inner.write().await;
                        inner.version = head;
                        inner.state = state.clone();
                    }

                    self.bus
                        .send_events(vec![StreamBatch {
                            stream: MAIN_STREAM.to_string(),
                            events: saved.clone(),
                        }])
                        .await?;

                    self.maybe_snapshot(head, &state, timestamp);

                    return Ok(saved);
                }
                Err(err) if err.is_version_conflict() && attempt + 1 < max_attempts => {
                    attempt += 1;
                    debug!(aggregate_id = %self.id, attempt, "version conflict, reloading");
                    self.reload().await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Snapshot policy, fire-and-forget relative to the command's success.
    fn maybe_snapshot(&self, version: u32, state: &S, timestamp: DateTime<Utc>) {
        let interval = self.opts.snapshot_interval;
        if interval == 0 {
            return;
        }
        let take = match &self.opts.should_take_snapshot {
            Some(predicate) => predicate(state, version),
            None => version % interval == 0,
        };
        if !take {
            return;
        }

        let state = match (self.opts.serialize_state)(state) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(aggregate_id = %self.id, %err, "state serialization failed, skipping snapshot");
                return;
            }
        };

        let store = self.store.clone();
        let id = self.id;
        let snapshot = Snapshot {
            aggregate: AggregateRef::new(id, version),
            state,
            timestamp,
        };
        tokio::spawn(async move {
            if let Err(err) = store.save_snapshot(snapshot).await {
                warn!(aggregate_id = %id, %err, "snapshot write failed");
            }
        });
    }
}
