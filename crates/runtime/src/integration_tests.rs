//! Integration tests for the full pipeline:
//! command -> store -> `main` -> broker -> subscriber streams -> projections.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arque_core::{AGGREGATE_ID_LEN, AggregateId, CTX_META_KEY, Event, EventMeta, Value};
use arque_engine::{
    Aggregate, AggregateOptions, Command, CommandContext, EventDraft, ProcessOptions,
    command_handler, event_applier,
};
use arque_infra::{EventBus, InMemoryEventBus, InMemoryEventStore, InMemoryStreamRegistry, StreamBatch};

use crate::broker::Broker;
use crate::projection::{Projection, ProjectionContext, projection_handler};

const EMIT: u32 = 1;
const T1: u32 = 11;
const T2: u32 = 12;
const T3: u32 = 13;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Tally {
    emitted: u32,
}

type Seen = Arc<Mutex<Vec<u32>>>;

fn emitting_aggregate(
    id: AggregateId,
    store: Arc<InMemoryEventStore>,
    bus: Arc<InMemoryEventBus>,
) -> Aggregate<Tally> {
    let mut aggregate = Aggregate::new(id, store, bus, Tally { emitted: 0 }, AggregateOptions::default());

    aggregate.register_command_handler(
        EMIT,
        command_handler(|ctx: CommandContext<Tally>, _meta, args: Vec<Value>| async move {
            let event_type = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("missing event type argument"))? as u32;
            Ok(vec![EventDraft {
                event_type,
                body: Some(Value::Map(BTreeMap::from([(
                    "emitted".to_string(),
                    Value::Int(i64::from(ctx.state.emitted + 1)),
                )]))),
                meta: EventMeta::new(),
            }])
        }),
    );
    for event_type in [T1, T2, T3] {
        aggregate.register_event_handler(
            event_type,
            event_applier(|state: Tally, _event: Event| async move {
                Ok(Tally { emitted: state.emitted + 1 })
            }),
        );
    }
    aggregate
}

fn recording_projection(
    store: Arc<InMemoryEventStore>,
    bus: Arc<InMemoryEventBus>,
    registry: Arc<InMemoryStreamRegistry>,
    projection_id: &str,
    event_types: &[u32],
    seen: Seen,
) -> Projection<Seen> {
    let handlers = event_types
        .iter()
        .map(|&event_type| {
            projection_handler(event_type, move |ctx: ProjectionContext<Seen>, event: Event| async move {
                ctx.state.lock().unwrap().push(event.event_type);
                Ok(())
            })
        })
        .collect();

    Projection::new(store, bus, registry, handlers, projection_id, seen)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn command_meta(ctx: &str) -> Option<EventMeta> {
    let mut meta = EventMeta::new();
    meta.insert(CTX_META_KEY.to_string(), Value::from(ctx));
    Some(meta)
}

#[tokio::test]
async fn commands_fan_out_to_interested_projections_exactly_once() {
    arque_observability::init();
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = Arc::new(InMemoryStreamRegistry::new());

    let seen_a: Seen = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Seen = Arc::new(Mutex::new(Vec::new()));

    // Projections register first so the broker can route from the start.
    let projection_a =
        recording_projection(store.clone(), bus.clone(), registry.clone(), "proj-a", &[T1, T2], seen_a.clone());
    let projection_b =
        recording_projection(store.clone(), bus.clone(), registry.clone(), "proj-b", &[T2, T3], seen_b.clone());
    projection_a.start().await.unwrap();
    projection_b.start().await.unwrap();

    let broker = Broker::new(bus.clone(), registry.clone());
    let broker_handle = broker.start().await.unwrap();

    let id = AggregateId::from_bytes([7; AGGREGATE_ID_LEN]);
    let aggregate = emitting_aggregate(id, store.clone(), bus.clone());
    for event_type in [T1, T2, T3] {
        aggregate
            .process(
                Command::new(EMIT, vec![Value::Int(i64::from(event_type))]),
                command_meta("acct-7"),
                ProcessOptions::default(),
            )
            .await
            .unwrap();
    }

    wait_until(|| seen_a.lock().unwrap().len() == 2 && seen_b.lock().unwrap().len() == 2).await;
    projection_a.wait_until_settled(Duration::from_millis(100)).await;
    projection_b.wait_until_settled(Duration::from_millis(100)).await;

    assert_eq!(*seen_a.lock().unwrap(), vec![T1, T2]);
    assert_eq!(*seen_b.lock().unwrap(), vec![T2, T3]);

    // The log itself ends at version 3 with all three events.
    assert_eq!(aggregate.version().await, 3);

    broker_handle.stop().await;
    projection_a.stop().await;
    projection_b.stop().await;
}

#[tokio::test]
async fn duplicate_ingress_does_not_duplicate_projection_effects() {
    arque_observability::init();
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = Arc::new(InMemoryStreamRegistry::new());

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let projection =
        recording_projection(store.clone(), bus.clone(), registry.clone(), "proj", &[T1], seen.clone());
    projection.start().await.unwrap();

    let broker = Broker::new(bus.clone(), registry.clone());
    let broker_handle = broker.start().await.unwrap();

    let id = AggregateId::from_bytes([8; AGGREGATE_ID_LEN]);
    let aggregate = emitting_aggregate(id, store.clone(), bus.clone());
    let saved = aggregate
        .process(
            Command::new(EMIT, vec![Value::Int(i64::from(T1))]),
            command_meta("acct-8"),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

    // A cross-epoch producer retry replays the same committed event onto
    // the ingress stream.
    bus.send_events(vec![StreamBatch { stream: "main".to_string(), events: saved }])
        .await
        .unwrap();

    projection.wait_until_settled(Duration::from_millis(150)).await;
    assert_eq!(*seen.lock().unwrap(), vec![T1]);

    broker_handle.stop().await;
    projection.stop().await;
}

#[tokio::test]
async fn projections_resume_against_the_checkpoint_after_restart() {
    arque_observability::init();
    let store = Arc::new(InMemoryEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let registry = Arc::new(InMemoryStreamRegistry::new());

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let projection =
        recording_projection(store.clone(), bus.clone(), registry.clone(), "proj", &[T1], seen.clone());
    projection.start().await.unwrap();

    let broker = Broker::new(bus.clone(), registry.clone());
    let broker_handle = broker.start().await.unwrap();

    let id = AggregateId::from_bytes([9; AGGREGATE_ID_LEN]);
    let aggregate = emitting_aggregate(id, store.clone(), bus.clone());
    let first = aggregate
        .process(Command::new(EMIT, vec![Value::Int(i64::from(T1))]), command_meta("acct-9"), ProcessOptions::default())
        .await
        .unwrap();

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    projection.stop().await;

    // Restart: the old events replayed onto the stream are skipped via the
    // checkpoint, new ones apply.
    let restarted =
        recording_projection(store.clone(), bus.clone(), registry.clone(), "proj", &[T1], seen.clone());
    restarted.start().await.unwrap();

    bus.send_events(vec![StreamBatch { stream: "proj".to_string(), events: first }])
        .await
        .unwrap();
    aggregate
        .process(Command::new(EMIT, vec![Value::Int(i64::from(T1))]), command_meta("acct-9"), ProcessOptions::default())
        .await
        .unwrap();

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    restarted.wait_until_settled(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock().unwrap(), vec![T1, T1]);

    broker_handle.stop().await;
    restarted.stop().await;
}
