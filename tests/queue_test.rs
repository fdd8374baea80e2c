/// Mutation queue behaviour, driven directly against the in-memory fake backend.
///
/// These tests bypass the engine so each drain pass can be inspected on its own:
/// ordering, retry accounting, skipping of operations whose references are not
/// synced yet, and dropping of operations that no longer have anything to send.
mod common;

use chrono::Utc;
use std::sync::Arc;

use common::{remote_event_type, FakeBackend};
use trendy_sync::id_mapping::IdMappings;
use trendy_sync::models::{
    EntityKind, EventLocal, EventPayload, EventTypeLocal, EventTypePayload, Geofence, LocalId,
    Operation, OperationKind,
};
use trendy_sync::queue::MutationQueue;
use trendy_sync::storage::LocalStore;

fn setup() -> (Arc<LocalStore>, MutationQueue, IdMappings) {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let queue = MutationQueue::new(store.clone(), 5);
    (store, queue, IdMappings::default())
}

fn stored_event_type(store: &LocalStore, name: &str) -> EventTypeLocal {
    let event_type = EventTypeLocal::new(name.into(), "#112233".into(), "star".into());
    store.upsert(event_type.clone()).unwrap();
    event_type
}

fn enqueue_create(queue: &MutationQueue, event_type: &EventTypeLocal) {
    queue
        .enqueue(
            &Operation::CreateEventType(EventTypePayload::from(event_type)),
            &event_type.id_local,
        )
        .unwrap();
}

#[tokio::test]
async fn test_drain_sends_oldest_first() {
    let backend = FakeBackend::new();
    let (store, queue, mut mappings) = setup();
    let first = stored_event_type(&store, "Alpha");
    let second = stored_event_type(&store, "Beta");
    enqueue_create(&queue, &first);
    enqueue_create(&queue, &second);

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(
        backend.calls(),
        vec!["create_event_type:Alpha", "create_event_type:Beta"]
    );
    assert!(queue.is_empty().unwrap());
    assert_eq!(mappings.event_types.len(), 2);
}

#[tokio::test]
async fn test_failed_operation_is_discarded_after_five_attempts() {
    let backend = FakeBackend::new();
    backend.state().fail_creates = Some(500);
    let (store, queue, mut mappings) = setup();
    let event_type = stored_event_type(&store, "Alpha");
    enqueue_create(&queue, &event_type);

    for attempt in 1..=4 {
        let report = queue.drain(&*backend, &mut mappings).await.unwrap();
        assert_eq!(report.failed, 1);
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, attempt);
        assert!(pending[0].last_error.is_some());
    }

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();
    assert_eq!(report.discarded, 1);
    assert!(queue.is_empty().unwrap());
    assert_eq!(backend.calls_to("create_event_type"), 5);
}

#[tokio::test]
async fn test_unresolved_reference_is_skipped_without_counting_an_attempt() {
    let backend = FakeBackend::new();
    let (store, queue, mut mappings) = setup();
    let event_type = stored_event_type(&store, "Alpha");
    let event_type_id: LocalId = event_type.id_local.parse().unwrap();
    let event = EventLocal::new(&event_type_id, Utc::now());
    store.upsert(event.clone()).unwrap();
    queue
        .enqueue(
            &Operation::CreateEvent(EventPayload::from_local(&event).unwrap()),
            &event.id_local,
        )
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(queue.pending().unwrap()[0].attempts, 0);
    assert_eq!(backend.calls_to("create_event"), 0);

    mappings.event_types.set_mapping(event_type_id, "et_1");
    let report = queue.drain(&*backend, &mut mappings).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(queue.is_empty().unwrap());
    let event_id: LocalId = event.id_local.parse().unwrap();
    assert!(mappings.events.backend_id(&event_id).is_some());
    assert_eq!(backend.state().events[0].event_type_id, "et_1");
}

#[tokio::test]
async fn test_create_for_deleted_entity_is_obsolete() {
    let backend = FakeBackend::new();
    let (store, queue, mut mappings) = setup();
    let event_type = stored_event_type(&store, "Alpha");
    enqueue_create(&queue, &event_type);
    store
        .remove::<EventTypeLocal>(&event_type.id_local)
        .unwrap();
    queue
        .enqueue(&Operation::DeleteEventType, &event_type.id_local)
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.obsolete, 2);
    assert!(queue.is_empty().unwrap());
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_delete_waits_for_pending_create() {
    let backend = FakeBackend::new();
    backend.state().fail_creates = Some(503);
    let (store, queue, mut mappings) = setup();
    let event_type = stored_event_type(&store, "Alpha");
    enqueue_create(&queue, &event_type);
    queue
        .enqueue(&Operation::DeleteEventType, &event_type.id_local)
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[1].kind, OperationKind::DeleteEventType);
    assert_eq!(pending[1].attempts, 0);
}

#[tokio::test]
async fn test_conflict_counts_as_delivered() {
    let backend = FakeBackend::new();
    backend
        .state()
        .event_types
        .push(remote_event_type("et_9", "Coffee"));
    let (store, queue, mut mappings) = setup();
    let event_type = stored_event_type(&store, "coffee");
    enqueue_create(&queue, &event_type);

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(queue.is_empty().unwrap());
    assert!(mappings.event_types.is_empty());
}

#[tokio::test]
async fn test_delete_of_missing_backend_record_is_done() {
    let backend = FakeBackend::new();
    let (_store, queue, mut mappings) = setup();
    let event_id = LocalId::new();
    mappings.events.set_mapping(event_id, "ev_gone");
    queue
        .enqueue(&Operation::DeleteEvent, &event_id.to_string())
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(mappings.events.backend_id(&event_id).is_none());
    assert_eq!(backend.calls(), vec!["delete_event:ev_gone"]);
}

#[tokio::test]
async fn test_geofence_delete_uses_captured_backend_id() {
    let backend = FakeBackend::new();
    backend.state().geofences.push(Geofence {
        id: "gf_1".into(),
        name: "Office".into(),
        latitude: 40.0,
        longitude: -74.0,
        radius: 120.0,
        event_type_entry_id: None,
        event_type_exit_id: None,
        is_active: true,
        notify_on_entry: false,
        notify_on_exit: false,
    });
    let (_store, queue, mut mappings) = setup();
    let geofence_id = LocalId::new().to_string();
    queue
        .enqueue(
            &Operation::DeleteGeofence {
                backend_id: Some("gf_1".into()),
            },
            &geofence_id,
        )
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(backend.state().geofences.is_empty());
}

#[tokio::test]
async fn test_update_is_sent_once_mapped() {
    let backend = FakeBackend::new();
    backend
        .state()
        .event_types
        .push(remote_event_type("et_1", "Alpha"));
    let (store, queue, mut mappings) = setup();
    let mut event_type = stored_event_type(&store, "Alpha");
    let event_type_id: LocalId = event_type.id_local.parse().unwrap();
    mappings.event_types.set_mapping(event_type_id, "et_1");

    event_type.color = "#abcdef".into();
    queue
        .enqueue(
            &Operation::UpdateEventType(EventTypePayload::from(&event_type)),
            &event_type.id_local,
        )
        .unwrap();

    let report = queue.drain(&*backend, &mut mappings).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(backend.state().event_types[0].color, "#abcdef");
}

#[tokio::test]
async fn test_pending_deletes_are_reported_by_kind() {
    let (_store, queue, _) = setup();
    let event_id = LocalId::new().to_string();
    let event_type_id = LocalId::new().to_string();
    queue.enqueue(&Operation::DeleteEvent, &event_id).unwrap();
    queue
        .enqueue(&Operation::DeleteEventType, &event_type_id)
        .unwrap();

    let events = queue.pending_deletes(EntityKind::Event).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events.contains(&event_id));
    assert!(queue
        .pending_deletes(EntityKind::EventType)
        .unwrap()
        .contains(&event_type_id));
}

#[tokio::test]
async fn test_pending_geofence_deletes_carry_backend_ids() {
    let (store, queue, _) = setup();
    queue
        .enqueue(
            &Operation::DeleteGeofence {
                backend_id: Some("gf_1".into()),
            },
            &LocalId::new().to_string(),
        )
        .unwrap();
    queue
        .enqueue(
            &Operation::DeleteGeofence { backend_id: None },
            &LocalId::new().to_string(),
        )
        .unwrap();
    let event_type = stored_event_type(&store, "Walk");
    enqueue_create(&queue, &event_type);

    let backend_ids = queue.pending_geofence_deletes().unwrap();
    assert_eq!(backend_ids.len(), 1);
    assert!(backend_ids.contains("gf_1"));

    let creates = queue.pending_creates(EntityKind::EventType).unwrap();
    assert!(creates.contains(&event_type.id_local));
    assert!(queue.pending_creates(EntityKind::Event).unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let event_type = EventTypeLocal::new("Alpha".into(), "#000".into(), "a".into());

    {
        let store = Arc::new(LocalStore::open(&path).unwrap());
        let queue = MutationQueue::new(store, 5);
        enqueue_create(&queue, &event_type);
    }

    let store = Arc::new(LocalStore::open(&path).unwrap());
    let queue = MutationQueue::new(store, 5);
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].idempotency_key, event_type.id_local);
    assert_eq!(
        Operation::decode(&pending[0].payload).unwrap(),
        Operation::CreateEventType(EventTypePayload::from(&event_type))
    );
}
