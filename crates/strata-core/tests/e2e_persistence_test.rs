//! E2E Test: Persist and rehydrate
//!
//! Drives a controller through several epochs, restarts it over the same
//! store, and checks the rebuilt object graph.

use strata_core::storage::MemoryStore;
use strata_core::{
    DeltaController, DeltaStore, Envelope, Epoch, ManagedObject, ObjectHandle, PersistenceConfig,
    PersistenceError, PersistenceReference, SequenceNumbers, SubscriberState, Value,
};

fn controller(store: &MemoryStore) -> DeltaController<MemoryStore> {
    DeltaController::new("agent-1", store.clone(), PersistenceConfig::default())
}

fn add(objects: &[&ObjectHandle]) -> Epoch {
    let mut envelope = Envelope::new();
    for object in objects {
        envelope.add(object);
    }
    Epoch::new().with_envelope(envelope)
}

/// Restart over `store` and return the live objects
fn restart(store: &MemoryStore) -> Vec<ObjectHandle> {
    let mut live = Envelope::new();
    controller(store)
        .rehydrate(&mut live)
        .expect("Rehydration should succeed")
        .expect("State should exist");
    live.objects().cloned().collect()
}

fn of_kind(objects: &[ObjectHandle], kind: &str) -> Vec<ObjectHandle> {
    objects.iter().filter(|o| o.kind() == kind).cloned().collect()
}

fn target(object: &ObjectHandle, field: &str) -> ObjectHandle {
    object
        .get(field)
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_else(|| panic!("{} should reference an object", field))
}

/// E2E test: A {x:1} → B {y:2}, then A changed to {x:3}
#[test]
fn e2e_changed_object_rewritten_referenced_object_not() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let b = ManagedObject::builder("b").field("y", 2).build();
    let a = ManagedObject::builder("a").field("x", 1).field("b", &b).build();

    ctl.persist(add(&[&a, &b])).unwrap();
    a.set("x", 3);
    let outcome = ctl
        .persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
        .unwrap();
    assert_eq!(outcome.written, vec![ctl.reference_of(&a).unwrap()]);

    let summary = strata_core::inspect_delta(&mut store.open_input(1).unwrap(), 1).unwrap();
    assert_eq!(summary.kinds.get("a"), Some(&1));
    assert!(summary.kinds.get("b").is_none(), "B must be written once");

    let live = restart(&store);
    let a_live = of_kind(&live, "a");
    let b_live = of_kind(&live, "b");
    assert_eq!(a_live.len(), 1);
    assert_eq!(b_live.len(), 1);
    assert_eq!(a_live[0].get("x"), Some(Value::Int(3)));
    assert_eq!(b_live[0].get("y"), Some(Value::Int(2)));
    assert!(ManagedObject::same(&target(&a_live[0], "b"), &b_live[0]));
}

/// E2E test: An object mentioned by several deltas has one instance
#[test]
fn e2e_identity_is_unique_across_deltas() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let task = ManagedObject::builder("task").field("verb", "load").build();
    let first = ManagedObject::builder("plan_element").field("task", &task).build();
    ctl.persist(add(&[&first, &task])).unwrap();

    let second = ManagedObject::builder("plan_element").field("task", &task).build();
    ctl.persist(add(&[&second])).unwrap();
    task.set("verb", "unload");
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&task)))
        .unwrap();

    let live = restart(&store);
    let tasks = of_kind(&live, "task");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].get("verb"), Some(Value::from("unload")));
    for element in of_kind(&live, "plan_element") {
        assert!(ManagedObject::same(&target(&element, "task"), &tasks[0]));
    }
}

/// E2E test: The last delta to write an object wins
#[test]
fn e2e_last_writer_wins() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let counter = ManagedObject::builder("counter").field("n", 0).build();
    ctl.persist(add(&[&counter])).unwrap();

    for n in 1..=5 {
        counter.set("n", n);
        ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&counter)))
            .unwrap();
    }

    let live = restart(&store);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].get("n"), Some(Value::Int(5)));
}

/// E2E test: Removed and never-added objects are not part of the live set
#[test]
fn e2e_active_set_excludes_removed_objects() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let kept = ManagedObject::builder("task").field("name", "kept").build();
    let removed = ManagedObject::builder("task").field("name", "removed").build();
    let detail = ManagedObject::builder("detail").build();
    kept.set("detail", &detail);

    ctl.persist(add(&[&kept, &removed])).unwrap();
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_remove(&removed)))
        .unwrap();

    let live = restart(&store);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].get("name"), Some(Value::from("kept")));
    // Never added, but still reachable from a live object.
    assert_eq!(target(&live[0], "detail").kind(), "detail");
}

/// E2E test: A dependency written after its dependent resolves to the same instance
#[test]
fn e2e_dependency_after_dependent() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let task = ManagedObject::builder("task").build();
    let element = ManagedObject::builder("plan_element").field("task", &task).build();
    task.set("plan_element", &element);

    // The element is registered first, so it is written before the task.
    ctl.persist(add(&[&element, &task])).unwrap();
    assert!(ctl.reference_of(&element).unwrap() < ctl.reference_of(&task).unwrap());

    let live = restart(&store);
    let element = &of_kind(&live, "plan_element")[0];
    let task = &of_kind(&live, "task")[0];
    assert!(ManagedObject::same(&target(element, "task"), task));
    assert!(ManagedObject::same(&target(task, "plan_element"), element));
}

/// E2E test: An object that cannot be serialized reads back as a null placeholder
#[test]
fn e2e_unserializable_object_becomes_placeholder() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let socket = ManagedObject::builder("connection")
        .field("handle", Value::Transient("TcpStream".into()))
        .build();
    let holder = ManagedObject::builder("task").field("peer", &socket).build();

    let outcome = ctl.persist(add(&[&holder, &socket])).unwrap();
    assert_eq!(outcome.written, vec![ctl.reference_of(&holder).unwrap()]);
    assert_eq!(outcome.skipped, vec![ctl.reference_of(&socket).unwrap()]);

    let live = restart(&store);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].get("peer"), Some(Value::Null));
}

/// E2E test: A failed write leaves no trace and the state of the last commit
#[test]
fn e2e_aborted_delta_is_invisible() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let a = ManagedObject::builder("a").field("x", 1).build();
    ctl.persist(add(&[&a])).unwrap();

    a.set("x", 2);
    store.fail_next_write_after(8);
    let err = ctl
        .persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::TransactionAborted { delta: 1, .. }));
    assert_eq!(store.delta_count(), 1);
    assert_eq!(
        store.read_sequence_numbers().unwrap(),
        Some(SequenceNumbers::new(0, 1))
    );

    let live = restart(&store);
    assert_eq!(live[0].get("x"), Some(Value::Int(1)));

    // The next epoch retries delta 1 with the same write-set.
    let outcome = ctl.persist(Epoch::new()).unwrap();
    assert_eq!(outcome.delta, 1);
    let live = restart(&store);
    assert_eq!(live[0].get("x"), Some(Value::Int(2)));
}

/// E2E test: A restarted agent keeps writing on top of its rehydrated state
#[test]
fn e2e_rehydrated_state_round_trips() {
    let store = MemoryStore::new();
    let a = ManagedObject::builder("a").field("x", 1).build();
    controller(&store).persist(add(&[&a])).unwrap();

    let second = controller(&store);
    let mut live = Envelope::new();
    second.rehydrate(&mut live).unwrap();
    let a2 = live.objects().next().cloned().unwrap();
    let c = ManagedObject::builder("c").field("a", &a2).build();
    let outcome = second.persist(add(&[&c])).unwrap();
    assert!(!outcome.full);
    assert_eq!(outcome.delta, 1);
    assert!(second.reference_of(&c).unwrap() > second.reference_of(&a2).unwrap());

    let live = restart(&store);
    assert_eq!(live.len(), 2);
    let c3 = &of_kind(&live, "c")[0];
    let a3 = &of_kind(&live, "a")[0];
    assert!(ManagedObject::same(&target(c3, "a"), a3));
    assert_eq!(a3.get("x"), Some(Value::Int(1)));
}

/// E2E test: Undistributed envelopes, subscriber queues and message state survive
#[test]
fn e2e_trailing_sections_survive_restart() {
    let store = MemoryStore::new();
    let ctl = controller(&store);
    let queued = ManagedObject::builder("task").field("verb", "ship").build();
    let in_flight = ManagedObject::builder("task").field("verb", "pack").build();

    let mut subscriber = SubscriberState::new("allocator");
    subscriber.in_flight.push(Envelope::new().with_add(&in_flight));
    ctl.persist(
        Epoch::new()
            .with_undistributed(Envelope::new().with_add(&queued))
            .with_subscriber(subscriber)
            .with_message_state(b"seq=41".to_vec()),
    )
    .unwrap();

    let restarted = controller(&store);
    let mut live = Envelope::new();
    let state = restarted.rehydrate(&mut live).unwrap().unwrap();

    // Neither object was ever added, so neither is live.
    assert!(live.is_empty());
    assert_eq!(state.message_state.as_deref(), Some(&b"seq=41"[..]));
    let undistributed: Vec<_> = state.undistributed[0].objects().cloned().collect();
    assert_eq!(undistributed[0].get("verb"), Some(Value::from("ship")));
    assert_eq!(state.subscriber_states[0].subscriber, "allocator");
    let pending: Vec<_> = state.subscriber_states[0].objects().cloned().collect();
    assert_eq!(pending[0].get("verb"), Some(Value::from("pack")));
}

/// E2E test: Corrupted storage halts rehydration with an integrity error
#[test]
fn e2e_corrupted_delta_poisons_controller() {
    let store = MemoryStore::new();
    let a = ManagedObject::builder("a").field("x", 1).build();
    controller(&store).persist(add(&[&a])).unwrap();

    // Last payload byte, just ahead of an empty tail (8 + 4 + 1 bytes).
    store.tamper(0, |bytes| {
        let at = bytes.len() - 14;
        bytes[at] ^= 0xff;
    });

    let restarted = controller(&store);
    let err = restarted.rehydrate(&mut Envelope::new()).unwrap_err();
    assert!(matches!(err, PersistenceError::RehydrationFailed { delta: 0, .. }));
    assert!(err.is_stream_integrity());
    assert!(restarted.is_poisoned());
}

/// E2E test: A new run must read the committed state before adding to it
#[test]
fn e2e_persist_before_rehydrate_keeps_identities_apart() {
    let store = MemoryStore::new();
    let a = ManagedObject::builder("a").field("name", "A").build();
    controller(&store).persist(add(&[&a])).unwrap();

    let second = controller(&store);
    let c = ManagedObject::builder("c").field("name", "C").build();
    let err = second.persist(add(&[&c])).unwrap_err();
    assert!(matches!(err, PersistenceError::NotRehydrated { .. }));
    assert_eq!(store.list_deltas().unwrap(), vec![0]);

    let mut live = Envelope::new();
    second.rehydrate(&mut live).unwrap();
    let outcome = second.persist(add(&[&c])).unwrap();
    assert_eq!(outcome.written, vec![PersistenceReference::new(1)]);

    let live = restart(&store);
    assert_eq!(live.len(), 2);
    assert_eq!(of_kind(&live, "a")[0].get("name"), Some(Value::from("A")));
    assert_eq!(of_kind(&live, "c")[0].get("name"), Some(Value::from("C")));
}

/// E2E test: A rehydrated plan element / task pair is reclaimed once dropped
#[test]
fn e2e_linked_pair_is_reclaimed_after_rehydrate() {
    let store = MemoryStore::new();
    let task = ManagedObject::builder("task").build();
    let element = ManagedObject::builder("plan_element").field("task", &task).build();
    // The back-pointer is left out; link repair restores it on rehydration.
    controller(&store).persist(add(&[&element, &task])).unwrap();

    let restarted = controller(&store);
    let mut live = Envelope::new();
    let state = restarted.rehydrate(&mut live).unwrap().unwrap();
    assert_eq!(state.repaired, 1);
    let objects: Vec<_> = live.objects().cloned().collect();
    let element = of_kind(&objects, "plan_element").remove(0);
    let task = of_kind(&objects, "task").remove(0);
    let back = task.get("plan_element").unwrap();
    assert!(matches!(back, Value::Link(_)));
    assert!(ManagedObject::same(&back.target().unwrap(), &element));

    restarted
        .persist(Epoch::new().with_envelope(Envelope::new().with_remove(&element).with_remove(&task)))
        .unwrap();
    drop((live, objects, element, task, back));
    restarted.persist(Epoch::new()).unwrap();
    assert!(restarted.with_identity_table(|table| table.is_empty()));
}
