//! Unit of work commit semantics across several data sources

mod common;

use common::{memory_sources, model, target, Country, Customer, RecordingStore, Tag};
use parking_lot::Mutex;
use persistence_uow::contract::{PersistenceError, StoreError};
use persistence_uow::domain::{DataSources, EntityContext, Filter};
use persistence_uow::{ContextOptions, MemoryStore, UnitOfWork, UnitOfWorkState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn print_test_header(test_name: &str, purpose: &str) {
    println!("\n🧪 TEST: {}", test_name);
    println!("📋 PURPOSE: {}", purpose);
}

/// Three recording data sources `a`, `b` and `c` sharing one log
fn recording_sources() -> (Arc<DataSources>, Vec<RecordingStore>, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stores: Vec<RecordingStore> = ["a", "b", "c"]
        .iter()
        .map(|label| RecordingStore::new(label, log.clone()))
        .collect();
    let mut sources = DataSources::new(ContextOptions::default());
    for store in &stores {
        sources.register(store.label.clone(), model(), Arc::new(store.clone()));
    }
    (Arc::new(sources), stores, log)
}

fn stage_customer(uow: &mut UnitOfWork, source: &str, name: &str) {
    uow.repository::<Customer>(source)
        .unwrap()
        .insert(Customer::new(name))
        .unwrap();
}

#[tokio::test]
async fn commit_flushes_contexts_in_join_order() {
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);

    stage_customer(&mut uow, "c", "third");
    stage_customer(&mut uow, "a", "first");
    stage_customer(&mut uow, "b", "second");
    uow.commit().await.unwrap();

    let flushed: Vec<String> = log.lock().iter().map(|e| e[..1].to_string()).collect();
    assert_eq!(flushed, ["c", "a", "b"]);
    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    for store in &stores {
        assert_eq!(store.inner.rows(&target("customer")).len(), 1);
    }
}

#[tokio::test]
async fn commit_stops_at_first_failure() {
    print_test_header(
        "commit_stops_at_first_failure",
        "Earlier contexts stay durable, the failing and later contexts are not written",
    );
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    for source in ["a", "b", "c"] {
        stage_customer(&mut uow, source, source);
    }
    stores[1].fail_next_apply();

    let err = uow.commit().await.unwrap_err();

    match &err {
        PersistenceError::CommitFailed {
            context, flushed, ..
        } => {
            assert_eq!(context, "b");
            assert_eq!(flushed, &["a".to_string()]);
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(matches!(err.store_error(), Some(StoreError::Unavailable(_))));
    assert_eq!(log.lock().len(), 2);
    assert_eq!(stores[0].inner.rows(&target("customer")).len(), 1);
    assert!(stores[1].inner.rows(&target("customer")).is_empty());
    assert!(stores[2].inner.rows(&target("customer")).is_empty());

    assert_eq!(uow.state(), UnitOfWorkState::Failed);
    assert!(matches!(
        uow.context("a"),
        Err(PersistenceError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn concurrent_commit_flushes_every_context() {
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    for source in ["a", "b", "c"] {
        stage_customer(&mut uow, source, source);
    }
    stores[1].fail_next_apply();

    let err = uow.commit_concurrent().await.unwrap_err();

    match err {
        PersistenceError::CommitFailed {
            context, flushed, ..
        } => {
            assert_eq!(context, "b");
            assert_eq!(flushed, ["a".to_string(), "c".to_string()]);
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert_eq!(log.lock().len(), 3);
    assert_eq!(stores[2].inner.rows(&target("customer")).len(), 1);
    assert_eq!(uow.state(), UnitOfWorkState::Failed);
}

#[tokio::test]
async fn concurrent_commit_succeeds() {
    let (sources, stores, _log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    stage_customer(&mut uow, "a", "x");
    stage_customer(&mut uow, "c", "y");

    uow.commit_concurrent().await.unwrap();

    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    assert_eq!(stores[0].inner.apply_count(), 1);
    assert_eq!(stores[1].inner.apply_count(), 0);
    assert_eq!(stores[2].inner.apply_count(), 1);
}

#[tokio::test]
async fn context_names_are_case_insensitive() {
    let store = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("Sales", &store)]));

    stage_customer(&mut uow, "sales", "one");
    stage_customer(&mut uow, "SALES", "two");

    let contexts: Vec<&EntityContext> = uow.active_contexts().collect();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].name(), "Sales");
    assert_eq!(contexts[0].tracked_count(), 2);
}

#[tokio::test]
async fn units_of_work_are_isolated() {
    let store = MemoryStore::default();
    let sources = memory_sources(&[("main", &store)]);
    let mut writer = UnitOfWork::new(sources.clone());
    let mut reader = UnitOfWork::new(sources);

    stage_customer(&mut writer, "main", "pending");
    let before = reader
        .repository::<Customer>("main")
        .unwrap()
        .count()
        .await
        .unwrap();
    assert_eq!(before, 0);
    assert_eq!(reader.context("main").unwrap().tracked_count(), 0);

    writer.commit().await.unwrap();
    let after = reader
        .repository::<Customer>("main")
        .unwrap()
        .single(Filter::eq("name", "pending"))
        .await
        .unwrap();
    assert_eq!(after.id, 1);
}

#[tokio::test]
async fn lifecycle_state_machine() {
    let store = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("main", &store)]));
    assert_eq!(uow.state(), UnitOfWorkState::Created);

    uow.context("main").unwrap();
    assert_eq!(uow.state(), UnitOfWorkState::Active);

    // nothing staged: commit succeeds without writing
    uow.commit().await.unwrap();
    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    assert_eq!(store.apply_count(), 0);

    assert!(matches!(
        uow.commit().await,
        Err(PersistenceError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn unknown_data_source_is_reported() {
    let store = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("main", &store)]));

    let err = uow.context("missing").unwrap_err();
    assert!(matches!(err, PersistenceError::UnknownDataSource(name) if name == "missing"));
    assert_eq!(uow.state(), UnitOfWorkState::Created);
}

#[tokio::test]
async fn registered_contexts_join_the_commit() {
    let main = MemoryStore::default();
    let extra = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("main", &main)]));

    let mut context = memory_sources(&[("Extra", &extra)])
        .open_context("extra")
        .unwrap();
    context.add(Country::new("FR", "France")).unwrap();
    uow.register_context(context).unwrap();

    let duplicate = memory_sources(&[("EXTRA", &extra)])
        .open_context("extra")
        .unwrap();
    assert!(matches!(
        uow.register_context(duplicate),
        Err(PersistenceError::InvalidOperation(_))
    ));

    uow.commit().await.unwrap();
    assert_eq!(extra.rows(&target("country")).len(), 1);
    assert_eq!(main.apply_count(), 0);
}

#[tokio::test]
async fn cancelled_commit_writes_nothing() {
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    stage_customer(&mut uow, "a", "x");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = uow.commit_with_cancel(&cancel).await.unwrap_err();

    match err {
        PersistenceError::CommitFailed { source, flushed, .. } => {
            assert!(matches!(*source, PersistenceError::Cancelled));
            assert!(flushed.is_empty());
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(log.lock().is_empty());
    assert_eq!(stores[0].inner.apply_count(), 0);
    assert_eq!(uow.state(), UnitOfWorkState::Failed);
}

#[tokio::test]
async fn cancellation_after_first_context_leaves_the_rest_unflushed() {
    print_test_header(
        "cancellation_after_first_context_leaves_the_rest_unflushed",
        "A token fired once context a is written stops b and c from being flushed",
    );
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    for source in ["a", "b", "c"] {
        stage_customer(&mut uow, source, source);
    }
    let cancel = CancellationToken::new();
    stores[0].cancel_after_next_apply(cancel.clone());

    let err = uow.commit_with_cancel(&cancel).await.unwrap_err();

    match err {
        PersistenceError::CommitFailed {
            context,
            flushed,
            source,
        } => {
            assert_eq!(context, "b");
            assert_eq!(flushed, ["a".to_string()]);
            assert!(matches!(*source, PersistenceError::Cancelled));
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert_eq!(log.lock().len(), 1);
    assert_eq!(stores[0].inner.rows(&target("customer")).len(), 1);
    assert!(stores[1].inner.rows(&target("customer")).is_empty());
    assert!(stores[2].inner.rows(&target("customer")).is_empty());
    assert_eq!(uow.state(), UnitOfWorkState::Failed);
}

#[tokio::test]
async fn cancelled_concurrent_commit_writes_nothing() {
    let (sources, stores, log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    stage_customer(&mut uow, "a", "x");
    stage_customer(&mut uow, "c", "y");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = uow.commit_concurrent_with_cancel(&cancel).await.unwrap_err();

    match err {
        PersistenceError::CommitFailed {
            context,
            flushed,
            source,
        } => {
            assert_eq!(context, "a");
            assert!(flushed.is_empty());
            assert!(matches!(*source, PersistenceError::Cancelled));
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(log.lock().is_empty());
    assert_eq!(stores[0].inner.apply_count(), 0);
    assert_eq!(stores[2].inner.apply_count(), 0);
    assert_eq!(uow.state(), UnitOfWorkState::Failed);
}

#[tokio::test]
async fn concurrent_commit_with_live_token_flushes_everything() {
    let (sources, stores, _log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    stage_customer(&mut uow, "a", "x");
    stage_customer(&mut uow, "b", "y");

    uow.commit_concurrent_with_cancel(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    assert_eq!(stores[0].inner.rows(&target("customer")).len(), 1);
    assert_eq!(stores[1].inner.rows(&target("customer")).len(), 1);
}

#[tokio::test]
async fn commit_with_unreadable_key_counts_the_context_as_flushed() {
    let store = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("main", &store)]));
    let mut tags = uow.repository::<Tag>("main").unwrap();
    for n in 0..256 {
        let tag = Tag {
            id: 0,
            label: format!("tag {n}"),
        };
        tags.insert(tag).unwrap();
    }

    let err = uow.commit().await.unwrap_err();

    match &err {
        PersistenceError::CommitFailed {
            context,
            flushed,
            source,
        } => {
            assert_eq!(context, "main");
            assert_eq!(flushed, &["main".to_string()]);
            assert!(source.is_durable());
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert_eq!(store.rows(&target("tag")).len(), 256);
    assert_eq!(store.apply_count(), 1);
}

#[tokio::test]
async fn commit_with_live_token_behaves_like_commit() {
    let (sources, stores, _log) = recording_sources();
    let mut uow = UnitOfWork::new(sources);
    stage_customer(&mut uow, "b", "x");

    uow.commit_with_cancel(&CancellationToken::new()).await.unwrap();

    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    assert_eq!(stores[1].inner.rows(&target("customer")).len(), 1);
}

#[tokio::test]
async fn generated_keys_are_visible_after_commit() {
    let store = MemoryStore::default();
    let mut uow = UnitOfWork::new(memory_sources(&[("main", &store)]));

    let handle = uow
        .repository::<Customer>("main")
        .unwrap()
        .insert(Customer::new("Ada"))
        .unwrap();
    uow.commit().await.unwrap();

    let context = uow.active_contexts().next().unwrap();
    assert_eq!(context.get(&handle).unwrap().id, 1);
    assert!(!context.is_tracked(&handle));
}

#[tokio::test]
async fn earlier_unit_of_work_survives_a_later_failure() {
    let first_store = MemoryStore::default();
    let second_store = MemoryStore::default();
    let mut first = UnitOfWork::new(memory_sources(&[("main", &first_store)]));
    let mut second = UnitOfWork::new(memory_sources(&[("main", &second_store)]));

    stage_customer(&mut first, "main", "durable");
    stage_customer(&mut second, "main", "lost");
    second_store.set_offline(true);

    first.commit().await.unwrap();
    assert!(second.commit().await.is_err());

    let mut check = UnitOfWork::new(memory_sources(&[("main", &first_store)]));
    let kept = check
        .repository::<Customer>("main")
        .unwrap()
        .single(Filter::eq("name", "durable"))
        .await
        .unwrap();
    assert_eq!(kept.id, 1);
}
