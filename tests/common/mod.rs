//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use percolator::{
    DocumentStore, Engine, EngineConfig, MemoryStore, Node, NodeId, NodeSpec, OperationId,
    OperationSpec, Percolator, Registry,
};
use serde_json::{json, Value};

pub fn memory_engine(registry: Registry) -> Engine {
    Engine::new(Arc::new(MemoryStore::new()), registry, EngineConfig::default())
}

pub fn engine_on(store: Arc<dyn DocumentStore>, registry: Registry) -> Engine {
    Engine::new(store, registry, EngineConfig::default())
}

/// `pets = sorted(farm ∪ wild)` on a `pet_list` node, reading an `animals` parent
pub fn pets_spec() -> OperationSpec {
    OperationSpec::builder("pets")
        .parent("parent", "animals")
        .depends_on("parent.farm")
        .depends_on("parent.wild")
        .owned_by("pet_list")
        .compute(|ctx| {
            let mut pets: Vec<String> = ctx
                .input_as::<Option<Vec<String>>>("parent.farm")?
                .unwrap_or_default();
            pets.extend(
                ctx.input_as::<Option<Vec<String>>>("parent.wild")?
                    .unwrap_or_default(),
            );
            pets.sort();
            pets.dedup();
            ctx.node_mut()?.set("pets", json!(pets));
            Ok(())
        })
        .finalize()
        .unwrap()
}

pub fn pets_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_node(NodeSpec::new("animals")).unwrap();
    registry.register_node(NodeSpec::new("pet_list")).unwrap();
    registry.register_operation(pets_spec()).unwrap();
    registry
}

pub struct PetsFixture {
    pub engine: Engine,
    pub percolator: Percolator,
    pub animals: Node,
    pub list: Node,
    pub op: OperationId,
}

/// Saved `animals` and `pet_list` nodes joined by a stale `pets` operation
pub async fn pets_fixture(engine: Engine) -> PetsFixture {
    let mut animals = Node::new("animals")
        .with("wild", json!(["sloth", "binturong"]))
        .with("farm", json!(["pig"]));
    engine.save_node(&mut animals).await.unwrap();

    let mut list = Node::new("pet_list");
    engine.save_node(&mut list).await.unwrap();

    let mut op = engine.new_operation("pets", Some(&list)).unwrap();
    op.set_parent("parent", Some(&animals)).unwrap();
    engine.create_operation(&mut op).await.unwrap();

    PetsFixture {
        percolator: Percolator::new(engine.clone()),
        engine,
        animals,
        list,
        op: op.id(),
    }
}

/// A field of a node as currently stored
pub async fn stored_field(engine: &Engine, id: NodeId, field: &str) -> Value {
    engine
        .find_node(id)
        .await
        .unwrap()
        .expect("node should exist")
        .get(field)
        .cloned()
        .unwrap_or(Value::Null)
}

pub async fn is_stale(engine: &Engine, op: OperationId) -> bool {
    engine
        .find_operation(op)
        .await
        .unwrap()
        .expect("operation should exist")
        .is_stale()
}
