//! Claiming and running operations to a fixpoint
//!
//! Run with:
//!   cargo test --test percolation

mod common;

use std::sync::{Arc, Mutex};

use percolator::operation::OperationState;
use percolator::store::{DocumentStore, Filter, ReturnDocument, Update};
use percolator::{
    Engine, InterruptHandle, Node, NodeSpec, OperationSpec, PercolatorError, Percolator, Registry,
};
use serde_json::json;

use common::{is_stale, memory_engine, pets_fixture, pets_registry, stored_field};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `value = source.value + 1` between `cell` nodes
fn increment_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_node(NodeSpec::new("cell")).unwrap();
    registry
        .register_operation(
            OperationSpec::builder("increment")
                .parent("source", "cell")
                .depends_on("source.value")
                .owned_by("cell")
                .compute(|ctx| {
                    let value: Option<i64> = ctx.input_as("source.value")?;
                    ctx.node_mut()?.set("value", json!(value.map(|v| v + 1)));
                    Ok(())
                })
                .finalize()
                .unwrap(),
        )
        .unwrap();
    registry
}

/// Registry with a parentless `stamp` effect that records its owner's name
fn stamp_registry(
    log: Arc<Mutex<Vec<String>>>,
    interrupt: Arc<Mutex<Option<InterruptHandle>>>,
) -> Registry {
    let mut registry = Registry::new();
    registry
        .register_operation(
            OperationSpec::builder("stamp")
                .owned_by("ledger")
                .compute(move |ctx| {
                    let node = ctx.node_mut()?;
                    let name = node.get_as::<String>("name")?.unwrap_or_default();
                    node.set("stamped", true);
                    log.lock().unwrap().push(name);
                    if let Some(handle) = interrupt.lock().unwrap().as_ref() {
                        handle.interrupt();
                    }
                    Ok(())
                })
                .finalize()
                .unwrap(),
        )
        .unwrap();
    registry
}

async fn add_ledger(engine: &Engine, name: &str, priority: Option<i64>) -> Node {
    let mut ledger = Node::new("ledger").with("name", name);
    engine.save_node(&mut ledger).await.unwrap();
    let mut op = engine.new_operation("stamp", Some(&ledger)).unwrap();
    if let Some(priority) = priority {
        op.set_priority(priority);
    }
    engine.create_operation(&mut op).await.unwrap();
    ledger
}

// ---------------------------------------------------------------------------
// Fixpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pets_scenario() {
    let mut fx = pets_fixture(memory_engine(pets_registry())).await;

    let summary = fx.percolator.percolate().await.unwrap();
    assert_eq!(summary.operations, 1);
    assert!(!summary.interrupted);
    assert!(summary.percolation_time() >= chrono::Duration::zero());
    assert_eq!(
        stored_field(&fx.engine, fx.list.id, "pets").await,
        json!(["binturong", "pig", "sloth"])
    );
    assert_eq!(fx.engine.count_stale().await.unwrap(), 0);

    fx.animals.set("farm", json!(["pig", "hog"]));
    fx.engine.save_node(&mut fx.animals).await.unwrap();
    assert_eq!(fx.engine.count_stale().await.unwrap(), 1);

    let summary = fx.percolator.percolate().await.unwrap();
    assert_eq!(summary.operations, 1);
    assert_eq!(
        stored_field(&fx.engine, fx.list.id, "pets").await,
        json!(["binturong", "hog", "pig", "sloth"])
    );
    assert_eq!(fx.engine.count_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn test_chain_reaches_fixpoint() {
    let engine = memory_engine(increment_registry());
    let percolator = Percolator::new(engine.clone());

    let mut a = Node::new("cell").with("value", 1);
    let mut b = Node::new("cell");
    let mut c = Node::new("cell");
    for node in [&mut a, &mut b, &mut c] {
        engine.save_node(node).await.unwrap();
    }

    let mut first = engine.new_operation("increment", Some(&b)).unwrap();
    first.set_parent("source", Some(&a)).unwrap();
    engine.create_operation(&mut first).await.unwrap();

    let mut second = engine.new_operation("increment", Some(&c)).unwrap();
    second.set_parent("source", Some(&b)).unwrap();
    engine.create_operation(&mut second).await.unwrap();

    let summary = percolator.percolate().await.unwrap();
    assert_eq!(summary.operations, 2);
    assert_eq!(stored_field(&engine, c.id, "value").await, json!(3));

    a.set("value", 10);
    engine.save_node(&mut a).await.unwrap();
    let summary = percolator.percolate().await.unwrap();
    assert_eq!(summary.operations, 2);
    assert_eq!(stored_field(&engine, b.id, "value").await, json!(11));
    assert_eq!(stored_field(&engine, c.id, "value").await, json!(12));
    assert_eq!(engine.count_stale().await.unwrap(), 0);

    // Nothing changed, nothing runs.
    assert_eq!(percolator.percolate().await.unwrap().operations, 0);
}

#[tokio::test]
async fn test_effect_waits_for_owner() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = memory_engine(stamp_registry(log.clone(), Arc::new(Mutex::new(None))));
    let percolator = Percolator::new(engine.clone());

    let mut ledger = Node::new("ledger").with("name", "only");
    let mut op = engine.new_operation("stamp", Some(&ledger)).unwrap();
    engine.create_operation(&mut op).await.unwrap();
    assert_eq!(op.state(), OperationState::Naive);
    assert_eq!(percolator.percolate().await.unwrap().operations, 0);

    engine.save_node(&mut ledger).await.unwrap();
    let matured = engine.find_operation(op.id()).await.unwrap().unwrap();
    assert_eq!(matured.state(), OperationState::Available);
    assert!(matured.is_stale());

    assert_eq!(percolator.percolate().await.unwrap().operations, 1);
    assert_eq!(stored_field(&engine, ledger.id, "stamped").await, json!(true));
    assert_eq!(percolator.percolate().await.unwrap().operations, 0);
    assert_eq!(*log.lock().unwrap(), vec!["only".to_string()]);
}

// ---------------------------------------------------------------------------
// Failure and state
// ---------------------------------------------------------------------------

fn moody_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_operation(
            OperationSpec::builder("mirror_mood")
                .parent("person", "person")
                .depends_on("person.mood")
                .owned_by("mirror")
                .compute(|ctx| {
                    let mood: String = ctx.input_as("person.mood")?;
                    if mood == "grumpy" {
                        anyhow::bail!("refusing to mirror a grumpy mood");
                    }
                    ctx.node_mut()?.set("mood", mood);
                    Ok(())
                })
                .finalize()
                .unwrap(),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_failed_compute_chokes_until_revived() {
    let engine = memory_engine(moody_registry());
    let percolator = Percolator::new(engine.clone());

    let mut person = Node::new("person").with("mood", "grumpy");
    engine.save_node(&mut person).await.unwrap();
    let mut mirror = Node::new("mirror");
    engine.save_node(&mut mirror).await.unwrap();
    let mut op = engine.new_operation("mirror_mood", Some(&mirror)).unwrap();
    op.set_parent("person", Some(&person)).unwrap();
    engine.create_operation(&mut op).await.unwrap();

    let err = percolator.percolate().await.unwrap_err();
    assert!(matches!(err, PercolatorError::Compute { operation, .. } if operation == op.id()));

    let failed = engine.find_operation(op.id()).await.unwrap().unwrap();
    assert_eq!(failed.state(), OperationState::Error);
    assert!(failed.is_stale());

    // Skipped while in error.
    assert_eq!(percolator.percolate().await.unwrap().operations, 0);

    person.set("mood", "cheerful");
    engine.save_node(&mut person).await.unwrap();
    assert_eq!(percolator.percolate().await.unwrap().operations, 0);

    engine.revive(op.id()).await.unwrap();
    assert_eq!(percolator.percolate().await.unwrap().operations, 1);
    assert_eq!(stored_field(&engine, mirror.id, "mood").await, json!("cheerful"));

    assert!(matches!(
        engine.revive(op.id()).await,
        Err(PercolatorError::State(_))
    ));
}

#[tokio::test]
async fn test_perform_by_id() {
    let fx = pets_fixture(memory_engine(pets_registry())).await;
    fx.percolator.percolate().await.unwrap();

    // Performing directly runs even a fresh operation.
    fx.engine.perform(fx.op).await.unwrap();
    assert!(!is_stale(&fx.engine, fx.op).await);

    fx.engine
        .store()
        .atomic_update(
            &fx.engine.config().operations_collection,
            &Filter::Id(fx.op),
            &Update::new().set("state", "held"),
            None,
            ReturnDocument::After,
        )
        .await
        .unwrap();
    assert!(matches!(
        fx.engine.perform(fx.op).await,
        Err(PercolatorError::State(_))
    ));
}

#[tokio::test]
async fn test_operation_lifecycle_errors() {
    let fx = pets_fixture(memory_engine(pets_registry())).await;

    let mut op = fx.engine.find_operation(fx.op).await.unwrap().unwrap();
    assert!(matches!(
        fx.engine.create_operation(&mut op).await,
        Err(PercolatorError::State(_))
    ));

    let mut again = fx.engine.new_operation("pets", Some(&fx.list)).unwrap();
    assert!(matches!(
        fx.engine.create_operation(&mut again).await,
        Err(PercolatorError::Collision(_))
    ));

    assert!(matches!(
        fx.engine.new_operation("pets", Some(&fx.animals)),
        Err(PercolatorError::Composition(_))
    ));
    assert!(matches!(
        fx.engine.new_operation("pets", None),
        Err(PercolatorError::Composition(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_owner_destroyed_mid_compute_stays_gone() {
    let slot: Arc<Mutex<Option<Engine>>> = Arc::new(Mutex::new(None));
    let inner = slot.clone();

    let mut registry = Registry::new();
    registry
        .register_operation(
            OperationSpec::builder("self_destruct")
                .owned_by("ledger")
                .compute(move |ctx| {
                    let engine = inner.lock().unwrap().clone().expect("engine is set");
                    let owner = ctx.node().expect("owned").id;
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(engine.destroy_node(owner))
                    })?;
                    ctx.node_mut()?.set("stamped", true);
                    Ok(())
                })
                .finalize()
                .unwrap(),
        )
        .unwrap();
    let engine = memory_engine(registry);
    *slot.lock().unwrap() = Some(engine.clone());
    let percolator = Percolator::new(engine.clone());

    let mut ledger = Node::new("ledger");
    engine.save_node(&mut ledger).await.unwrap();
    let mut op = engine.new_operation("self_destruct", Some(&ledger)).unwrap();
    engine.create_operation(&mut op).await.unwrap();

    assert_eq!(percolator.percolate().await.unwrap().operations, 1);
    assert!(engine.find_node(ledger.id).await.unwrap().is_none());
    assert!(engine.find_operation(op.id()).await.unwrap().is_none());
    assert_eq!(engine.count_stale().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_claim_once() {
    let fx = pets_fixture(memory_engine(pets_registry())).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let percolator = Percolator::new(fx.engine.clone());
        handles.push(tokio::spawn(async move {
            percolator.acquire_and_perform().await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            claimed.push(id);
        }
    }
    assert_eq!(claimed, vec![fx.op]);
    assert_eq!(
        stored_field(&fx.engine, fx.list.id, "pets").await,
        json!(["binturong", "pig", "sloth"])
    );
}

#[tokio::test]
async fn test_priority_then_insertion_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = memory_engine(stamp_registry(log.clone(), Arc::new(Mutex::new(None))));
    let percolator = Percolator::new(engine.clone());

    add_ledger(&engine, "low", Some(5)).await;
    add_ledger(&engine, "first_default", None).await;
    add_ledger(&engine, "urgent", Some(-1)).await;
    add_ledger(&engine, "second_default", None).await;

    assert_eq!(percolator.percolate().await.unwrap().operations, 4);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["urgent", "first_default", "second_default", "low"]
    );
}

#[tokio::test]
async fn test_interrupt_stops_between_operations() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::new(Mutex::new(None));
    let engine = memory_engine(stamp_registry(log.clone(), slot.clone()));
    let percolator = Percolator::new(engine.clone());

    for name in ["a", "b", "c"] {
        add_ledger(&engine, name, None).await;
    }

    *slot.lock().unwrap() = Some(percolator.interrupt_handle());
    let summary = percolator.percolate().await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.operations, 1);
    assert_eq!(engine.count_stale().await.unwrap(), 2);

    // A leftover interrupt does not stop the next run.
    *slot.lock().unwrap() = None;
    assert!(percolator.interrupt_handle().is_interrupted());
    let summary = percolator.percolate().await.unwrap();
    assert!(!summary.interrupted);
    assert_eq!(summary.operations, 2);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_iteration_limit() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = memory_engine(stamp_registry(log, Arc::new(Mutex::new(None))));
    let percolator = Percolator::new(engine.clone());

    for name in ["a", "b", "c"] {
        add_ledger(&engine, name, None).await;
    }

    let summary = percolator.percolate_with_limit(Some(2)).await.unwrap();
    assert_eq!(summary.operations, 2);
    assert!(summary.limit_reached);
    assert_eq!(engine.count_stale().await.unwrap(), 1);

    let summary = percolator.percolate().await.unwrap();
    assert_eq!(summary.operations, 1);
    assert!(!summary.limit_reached);
}
