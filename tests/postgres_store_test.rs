//! Postgres store coverage. Skipped unless `JOBMILL_DATABASE_URL` points at a
//! disposable database.

use std::collections::HashMap;
use std::env;

use anyhow::Result;
use serial_test::serial;

use jobmill::{
    EnqueueRequest, Error, InstanceState, NewBinding, NewJobDefinition, NewNode, NewQueue, PgStore,
    QueueId, Store,
};

async fn setup_store() -> Option<PgStore> {
    let database_url = match env::var("JOBMILL_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: JOBMILL_DATABASE_URL not set");
            return None;
        }
    };
    let store = PgStore::connect(&database_url).await.ok()?;
    cleanup(&store).await.ok()?;
    Some(store)
}

async fn cleanup(store: &PgStore) -> Result<()> {
    sqlx::query(
        "TRUNCATE queue, node, job_def, job_def_parameter, deployment, job_instance,
                  instance_parameter, message, deliverable, job_history RESTART IDENTITY CASCADE",
    )
    .execute(store.pool())
    .await?;
    Ok(())
}

async fn seed(store: &PgStore) -> Result<(QueueId, jobmill::NodeId)> {
    let queue = store
        .create_queue(NewQueue {
            name: "default".to_string(),
            description: String::new(),
            default_priority: 0,
            max_size: 0,
        })
        .await?;
    let node = store
        .create_node(NewNode {
            name: "n0".to_string(),
            host: "localhost".to_string(),
            port: 1789,
            repo_path: "/tmp/jobmill/repo".into(),
            tmp_path: "/tmp/jobmill/work".into(),
            dl_repo: "/tmp/jobmill/dl".into(),
        })
        .await?;
    store
        .create_job_definition(NewJobDefinition {
            application_name: "app".to_string(),
            entry_point: "app.Main".to_string(),
            artifact_path: "/dev/null".to_string(),
            default_queue: queue,
            can_restart: false,
            highlander: false,
            max_time_running_ms: None,
            default_parameters: HashMap::from([("base".to_string(), "def".to_string())]),
        })
        .await?;
    store
        .create_binding(NewBinding {
            node,
            queue,
            max_concurrent: 2,
            poll_interval_ms: None,
            enabled: true,
        })
        .await?;
    Ok((queue, node))
}

#[tokio::test]
#[serial]
async fn reservation_orders_and_locks_rows() -> Result<()> {
    let Some(store) = setup_store().await else {
        return Ok(());
    };
    let (queue, node) = seed(&store).await?;

    let low = store
        .enqueue(EnqueueRequest::new("app").with_priority(1))
        .await?;
    let high = store
        .enqueue(
            EnqueueRequest::new("app")
                .with_priority(9)
                .parameter("p1", "X"),
        )
        .await?;

    let reserved = store.reserve_next(node, queue, 10).await?;
    assert_eq!(
        reserved.iter().map(|i| i.id).collect::<Vec<_>>(),
        vec![high, low]
    );
    assert_eq!(reserved[0].attributed_node, Some(node));
    // Definition defaults stay out of the instance row; only enqueue-time
    // values travel with it.
    assert_eq!(reserved[0].parameters.get("p1").map(String::as_str), Some("X"));

    // Nothing left to reserve.
    assert!(store.reserve_next(node, queue, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn queue_bound_and_cas_semantics_hold() -> Result<()> {
    let Some(store) = setup_store().await else {
        return Ok(());
    };
    let (_, node) = seed(&store).await?;
    let bounded = store
        .create_queue(NewQueue {
            name: "bounded".to_string(),
            description: String::new(),
            default_priority: 0,
            max_size: 1,
        })
        .await?;

    let first = store
        .enqueue(EnqueueRequest::new("app").on_queue(bounded))
        .await?;
    let err = store
        .enqueue(EnqueueRequest::new("app").on_queue(bounded))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull(ref name) if name == "bounded"));

    store.reserve_next(node, bounded, 1).await?;
    let err = store
        .transition(first, InstanceState::Submitted, InstanceState::Hold, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StateConflict { .. }));

    store
        .transition(first, InstanceState::Attributed, InstanceState::Running, None)
        .await?;
    store
        .transition(
            first,
            InstanceState::Running,
            InstanceState::Ended,
            Some("ok".to_string()),
        )
        .await?;
    store.archive_terminal(first).await?;

    assert!(store.get_instance(first).await?.is_none());
    let record = store.get_history(first).await?.expect("archived");
    assert_eq!(record.instance.state, InstanceState::Ended);
    assert_eq!(store.get_state(first).await?, InstanceState::Ended);
    Ok(())
}

#[tokio::test]
#[serial]
async fn recover_crashed_archives_everything_owned_by_the_node() -> Result<()> {
    let Some(store) = setup_store().await else {
        return Ok(());
    };
    let (queue, node) = seed(&store).await?;

    let a = store.enqueue(EnqueueRequest::new("app")).await?;
    let b = store.enqueue(EnqueueRequest::new("app")).await?;
    store.reserve_next(node, queue, 2).await?;
    store
        .transition(a, InstanceState::Attributed, InstanceState::Running, None)
        .await?;

    assert_eq!(store.recover_crashed(node).await?, 2);
    for id in [a, b] {
        assert_eq!(store.get_state(id).await?, InstanceState::Crashed);
        assert!(store.get_history(id).await?.is_some());
    }
    assert_eq!(store.recover_crashed(node).await?, 0);
    Ok(())
}
