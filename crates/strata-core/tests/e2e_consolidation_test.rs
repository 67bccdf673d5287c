//! E2E Test: Consolidation
//!
//! Every `consolidation_period` deltas the controller writes a full snapshot
//! and drops the deltas it supersedes. Rehydrated state must not change.

use strata_core::storage::{FileStore, MemoryStore};
use strata_core::{
    DeltaController, DeltaStore, Envelope, Epoch, ManagedObject, ObjectHandle, PersistenceConfig,
    SequenceNumbers, Value,
};
use tempfile::TempDir;

fn rehydrate<S: DeltaStore>(ctl: &DeltaController<S>) -> Vec<ObjectHandle> {
    let mut live = Envelope::new();
    ctl.rehydrate(&mut live)
        .expect("Rehydration should succeed")
        .expect("State should exist");
    live.objects().cloned().collect()
}

fn find(objects: &[ObjectHandle], name: &str) -> ObjectHandle {
    objects
        .iter()
        .find(|o| o.get("name") == Some(Value::from(name)))
        .cloned()
        .unwrap_or_else(|| panic!("{} should be live", name))
}

/// E2E test: Eleven deltas with period 10 leave only delta 10
#[test]
fn e2e_consolidation_after_eleven_deltas() {
    let store = MemoryStore::new();
    let ctl = DeltaController::new("agent-1", store.clone(), PersistenceConfig::default());

    // Written once in delta 0, never touched again.
    let static_ref = ManagedObject::builder("resource").field("name", "crane").build();
    let counter = ManagedObject::builder("counter")
        .field("name", "counter")
        .field("n", 0)
        .field("uses", &static_ref)
        .build();
    let retired = ManagedObject::builder("task").field("name", "retired").build();
    ctl.persist(
        Epoch::new().with_envelope(
            Envelope::new()
                .with_add(&counter)
                .with_add(&static_ref)
                .with_add(&retired),
        ),
    )
    .unwrap();
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_remove(&retired)))
        .unwrap();

    for n in 2..=10 {
        counter.set("n", n);
        let outcome = ctl
            .persist(Epoch::new().with_envelope(Envelope::new().with_change(&counter)))
            .unwrap();
        assert_eq!(outcome.delta, n as u32);
        if n == 10 {
            assert!(outcome.full);
            assert_eq!(outcome.consolidated, Some(SequenceNumbers::new(0, 10)));
        } else {
            assert!(outcome.consolidated.is_none());
        }
    }

    assert_eq!(
        store.read_sequence_numbers().unwrap(),
        Some(SequenceNumbers::new(10, 11))
    );
    assert_eq!(store.list_deltas().unwrap(), vec![10]);
    for delta in 0..10 {
        assert!(store.delta_bytes(delta).is_none(), "delta {} should be gone", delta);
    }

    let restarted = DeltaController::new("agent-1", store, PersistenceConfig::default());
    let live = rehydrate(&restarted);
    assert_eq!(live.len(), 2);
    let counter = find(&live, "counter");
    let crane = find(&live, "crane");
    assert_eq!(counter.get("n"), Some(Value::Int(10)));
    let uses = counter.get("uses").and_then(|v| v.as_object().cloned()).unwrap();
    assert!(ManagedObject::same(&uses, &crane));
    assert_eq!(restarted.sequence_numbers(), Some(SequenceNumbers::new(10, 11)));
}

/// E2E test: Consolidation on disk, across a restart in the middle
#[test]
fn e2e_file_store_consolidates_across_restart() {
    let tmp = TempDir::new().unwrap();
    let config = PersistenceConfig::default().with_consolidation_period(4);
    let counter = ManagedObject::builder("counter")
        .field("name", "counter")
        .field("n", 0)
        .build();

    {
        let store = FileStore::open(tmp.path(), "agent-1").unwrap();
        let ctl = DeltaController::new("agent-1", store, config.clone());
        ctl.persist(Epoch::new().with_envelope(Envelope::new().with_add(&counter)))
            .unwrap();
        for n in 1..3 {
            counter.set("n", n);
            ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&counter)))
                .unwrap();
        }
    }

    let store = FileStore::open(tmp.path(), "agent-1").unwrap();
    let ctl = DeltaController::new("agent-1", store.clone(), config);
    let live = rehydrate(&ctl);
    let counter = find(&live, "counter");
    assert_eq!(counter.get("n"), Some(Value::Int(2)));

    for n in 3..7 {
        counter.set("n", n);
        ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&counter)))
            .unwrap();
    }

    // Delta 4 consolidated [0, 4); deltas 5 and 6 are incremental on top.
    assert_eq!(store.list_deltas().unwrap(), vec![4, 5, 6]);
    assert_eq!(
        store.read_sequence_numbers().unwrap(),
        Some(SequenceNumbers::new(4, 7))
    );

    let restarted = DeltaController::new(
        "agent-1",
        FileStore::open(tmp.path(), "agent-1").unwrap(),
        PersistenceConfig::default().with_consolidation_period(4),
    );
    let live = rehydrate(&restarted);
    assert_eq!(live.len(), 1);
    assert_eq!(find(&live, "counter").get("n"), Some(Value::Int(6)));
}

/// E2E test: A period of zero never consolidates
#[test]
fn e2e_zero_period_disables_consolidation() {
    let store = MemoryStore::new();
    let ctl = DeltaController::new(
        "agent-1",
        store.clone(),
        PersistenceConfig::default().with_consolidation_period(0),
    );
    let a = ManagedObject::builder("a").field("name", "a").build();
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_add(&a)))
        .unwrap();
    for _ in 0..12 {
        ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
            .unwrap();
    }

    assert_eq!(store.delta_count(), 13);
    assert_eq!(
        store.read_sequence_numbers().unwrap(),
        Some(SequenceNumbers::new(0, 13))
    );
}

/// E2E test: Consolidation waits while a durable object cannot be rewritten
#[test]
fn e2e_skipped_object_postpones_consolidation() {
    let store = MemoryStore::new();
    let config = PersistenceConfig::default().with_consolidation_period(3);
    let ctl = DeltaController::new("agent-1", store.clone(), config.clone());
    let b = ManagedObject::builder("b").field("name", "b").field("y", 2).build();
    let a = ManagedObject::builder("a")
        .field("name", "a")
        .field("n", 0)
        .field("b", &b)
        .build();
    ctl.persist(Epoch::new().with_envelope(Envelope::new().with_add(&a).with_add(&b)))
        .unwrap();

    b.set("sock", Value::Transient("TcpStream".into()));
    for n in 1..=3 {
        a.set("n", n);
        let outcome = ctl
            .persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
            .unwrap();
        if n == 3 {
            assert!(outcome.full);
            assert_eq!(outcome.skipped, vec![ctl.reference_of(&b).unwrap()]);
            assert!(outcome.consolidated.is_none());
        }
    }
    assert_eq!(store.list_deltas().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(
        store.read_sequence_numbers().unwrap(),
        Some(SequenceNumbers::new(0, 4))
    );

    // B comes back as last written, before the transient field appeared.
    let restarted = DeltaController::new("agent-1", store.clone(), config.clone());
    let live = rehydrate(&restarted);
    let b_live = find(&live, "b");
    assert_eq!(find(&live, "a").get("n"), Some(Value::Int(3)));
    assert_eq!(b_live.get("y"), Some(Value::Int(2)));
    assert_eq!(b_live.get("sock"), None);

    // Once B is serializable again the next period consolidates.
    b.remove("sock");
    for n in 4..=6 {
        a.set("n", n);
        ctl.persist(Epoch::new().with_envelope(Envelope::new().with_change(&a)))
            .unwrap();
    }
    assert_eq!(store.list_deltas().unwrap(), vec![6]);

    let restarted = DeltaController::new("agent-1", store, config);
    let live = rehydrate(&restarted);
    assert_eq!(live.len(), 2);
    let uses = find(&live, "a").get("b").and_then(|v| v.target()).unwrap();
    assert!(ManagedObject::same(&uses, &find(&live, "b")));
}
