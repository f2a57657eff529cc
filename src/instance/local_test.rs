use std::collections::BTreeMap;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::instance::local::LocalInstanceFactory;
use crate::instance::{InstanceFactory, InstanceOptions, InstanceState};
use crate::models::{InstanceCommand, ProgramId, RunId, StageKey, ARG_INSTANCES, ARG_INSTANCE_ID};

fn options(instance_id: u32, instances: u32) -> InstanceOptions {
    InstanceOptions::new(
        ProgramId::flow("default", "purchases", "purchase-flow"),
        RunId::generate(),
        StageKey::new("parser", instance_id),
        instances,
        &BTreeMap::new(),
        BTreeMap::new(),
    )
}

#[tokio::test]
async fn local_instance_lifecycle() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let factory = LocalInstanceFactory::new(shutdown_tx);

    let instance = factory.start(options(1, 2)).await?;
    assert_eq!(instance.state(), InstanceState::Alive);

    instance.suspend().await?;
    assert_eq!(instance.state(), InstanceState::Suspended);
    instance.command(InstanceCommand::Instances(4)).await?;
    instance.resume().await?;
    assert_eq!(instance.state(), InstanceState::Alive);

    instance.stop().await?;
    assert_eq!(instance.state(), InstanceState::Stopped);
    // Stopping twice is a no-op.
    instance.stop().await?;
    // Stopped instances reject further lifecycle requests.
    assert!(instance.suspend().await.is_err(), "expected suspend of a stopped instance to fail");

    Ok(())
}

#[tokio::test]
async fn local_instance_rejects_instance_count_excluding_itself() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let factory = LocalInstanceFactory::new(shutdown_tx);
    let instance = factory.start(options(2, 3)).await?;

    let res = instance.command(InstanceCommand::Instances(2)).await;

    assert!(res.is_err(), "expected instance #2 to reject an instance count of 2");
    assert_eq!(instance.state(), InstanceState::Alive);
    instance.stop().await?;
    Ok(())
}

#[tokio::test]
async fn local_instance_start_rejects_out_of_range_id() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let factory = LocalInstanceFactory::new(shutdown_tx);

    let res = factory.start(options(3, 3)).await;

    assert!(res.is_err(), "expected start of instance #3 of 3 to fail");
}

#[test]
fn instance_options_carry_instance_system_args() {
    let opts = options(1, 5);

    assert_eq!(opts.system_args.get(ARG_INSTANCE_ID).map(String::as_str), Some("1"));
    assert_eq!(opts.system_args.get(ARG_INSTANCES).map(String::as_str), Some("5"));
}

#[tokio::test]
async fn local_instances_stop_on_shutdown_signal() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let factory = LocalInstanceFactory::new(shutdown_tx.clone());
    let instance = factory.start(options(0, 1)).await?;

    let _ = shutdown_tx.send(());
    let timeout = std::time::Duration::from_secs(5);
    tokio::time::timeout(timeout, async {
        while instance.state() != InstanceState::Stopped {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
}
