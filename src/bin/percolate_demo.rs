//! Pets demo: one derived field kept up to date as its parent changes
//!
//! Run with: cargo run --bin percolate_demo
//! Set RUST_LOG=debug to watch claims and propagation.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use percolator::{
    Engine, EngineConfig, MemoryStore, Node, NodeSpec, OperationSpec, Percolator, Registry,
};

fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register_node(NodeSpec::new("animals"))?;
    registry.register_node(NodeSpec::new("pet_list"))?;
    registry.register_operation(
        OperationSpec::builder("pets")
            .parent("parent", "animals")
            .depends_on("parent.farm")
            .depends_on("parent.wild")
            .owned_by("pet_list")
            .compute(|ctx| {
                let mut pets: Vec<String> = ctx.input_as::<Option<Vec<String>>>("parent.farm")?
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
            .finalize()?,
    )?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        registry()?,
        EngineConfig::default(),
    );
    let percolator = Percolator::new(engine.clone());

    let mut animals = Node::new("animals")
        .with("wild", json!(["sloth", "binturong"]))
        .with("farm", json!(["pig"]));
    engine.save_node(&mut animals).await?;

    let mut list = Node::new("pet_list");
    engine.save_node(&mut list).await?;

    let mut op = engine.new_operation("pets", Some(&list))?;
    op.set_parent("parent", Some(&animals))?;
    engine.create_operation(&mut op).await?;

    let summary = percolator.percolate().await?;
    engine.reload_node(&mut list).await?;
    println!(
        "After {} operation(s): pets = {}",
        summary.operations,
        list.get("pets").cloned().unwrap_or_default()
    );

    animals.set("farm", json!(["pig", "hog"]));
    engine.save_node(&mut animals).await?;
    println!("Stale operations after adding a hog: {}", engine.count_stale().await?);

    let summary = percolator.percolate().await?;
    engine.reload_node(&mut list).await?;
    println!(
        "After {} operation(s) in {} ms: pets = {}",
        summary.operations,
        summary.percolation_time().num_milliseconds(),
        list.get("pets").cloned().unwrap_or_default()
    );

    Ok(())
}
