//! End-to-end scenarios over the in-memory store: one engine per test, real
//! pollers and runners, payloads registered as closures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use jobmill::{
    BindingId, Client, Config, Engine, EnqueueRequest, Error, InstanceFilter, InstanceId,
    InstanceState, MemoryStore, NewBinding, NewJobDefinition, NewNode, NewQueue, PayloadRegistry,
    QueueId, Store, UserTags,
};

struct World {
    store: Arc<MemoryStore>,
    payloads: Arc<PayloadRegistry>,
    config: Config,
    node: jobmill::NodeId,
    artifact: String,
    _tmp: TempDir,
}

impl World {
    async fn new() -> Result<World> {
        let tmp = TempDir::new()?;
        let store = Arc::new(MemoryStore::new());
        let node = store
            .create_node(NewNode {
                name: "n0".to_string(),
                host: "localhost".to_string(),
                port: 1789,
                repo_path: tmp.path().join("repo"),
                tmp_path: tmp.path().join("work"),
                dl_repo: tmp.path().join("dl"),
            })
            .await?;
        let artifact_file = tmp.path().join("app.bundle");
        tokio::fs::write(&artifact_file, b"deployable").await?;
        let config = Config {
            poll_interval_ms: 10,
            drain_timeout_ms: 2_000,
            ..Config::default()
        };
        Ok(World {
            store,
            payloads: Arc::new(PayloadRegistry::new()),
            config,
            node,
            artifact: artifact_file.to_string_lossy().into_owned(),
            _tmp: tmp,
        })
    }

    async fn queue(&self, name: &str, priority: i32, max_size: i32) -> Result<QueueId> {
        Ok(self
            .store
            .create_queue(NewQueue {
                name: name.to_string(),
                description: String::new(),
                default_priority: priority,
                max_size,
            })
            .await?)
    }

    async fn define(&self, app: &str, entry: &str, queue: QueueId) -> Result<()> {
        self.define_full(app, entry, queue, |d| d).await
    }

    async fn define_full(
        &self,
        app: &str,
        entry: &str,
        queue: QueueId,
        tweak: impl FnOnce(NewJobDefinition) -> NewJobDefinition,
    ) -> Result<()> {
        let def = tweak(NewJobDefinition {
            application_name: app.to_string(),
            entry_point: entry.to_string(),
            artifact_path: self.artifact.clone(),
            default_queue: queue,
            can_restart: false,
            highlander: false,
            max_time_running_ms: None,
            default_parameters: HashMap::new(),
        });
        self.store.create_job_definition(def).await?;
        Ok(())
    }

    async fn bind(&self, queue: QueueId, max_concurrent: i32) -> Result<BindingId> {
        Ok(self
            .store
            .create_binding(NewBinding {
                node: self.node,
                queue,
                max_concurrent,
                poll_interval_ms: None,
                enabled: true,
            })
            .await?)
    }

    async fn start(&self) -> Result<Engine> {
        Ok(Engine::start(
            self.store.clone(),
            self.node,
            self.payloads.clone(),
            &self.config,
        )
        .await?)
    }

    fn client(&self) -> Client {
        Client::new(self.store.clone())
    }
}

async fn wait_for_state(
    client: &Client,
    id: InstanceId,
    wanted: InstanceState,
) -> Result<()> {
    for _ in 0..300 {
        if client.get_state(id).await? == wanted {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("instance {id} never reached {wanted}");
}

#[tokio::test]
async fn happy_path_runs_to_ended_with_merged_parameters() -> Result<()> {
    let world = World::new().await?;
    let vip = world.queue("VIPQueue", 42, 100).await?;
    world
        .define_full("TestApp", "test.App", vip, |mut d| {
            d.default_parameters
                .insert("greeting".to_string(), "hello".to_string());
            d
        })
        .await?;
    world.bind(vip, 3).await?;

    let seen: Arc<Mutex<HashMap<String, String>>> = Arc::default();
    let seen_in_payload = seen.clone();
    world.payloads.register_fn("test.App", move |ctx| {
        let seen = seen_in_payload.clone();
        async move {
            *seen.lock().unwrap() = ctx.parameters().clone();
            ctx.send_message("doing the work").await?;
            ctx.send_progress(100).await?;
            Ok(())
        }
    });

    let engine = world.start().await?;
    let client = world.client();
    let id = client
        .enqueue_request(EnqueueRequest::new("TestApp").parameter("p1", "POUPETTE"))
        .await?;
    let state = client.await_terminal(id).await?;
    assert_eq!(state, InstanceState::Ended);

    let observed = seen.lock().unwrap().clone();
    assert_eq!(observed.get("p1").map(String::as_str), Some("POUPETTE"));
    assert_eq!(observed.get("greeting").map(String::as_str), Some("hello"));

    let history = world.store.get_history(id).await?.expect("history record");
    assert_eq!(history.instance.state, InstanceState::Ended);
    assert_eq!(history.instance.priority, 42);

    // Messages are persisted asynchronously; give the writer a moment, then
    // check they survived archival.
    let mut message_seen = false;
    for _ in 0..100 {
        if client
            .get_messages(id)
            .await?
            .iter()
            .any(|m| m.body == "doing the work")
        {
            message_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(message_seen, "payload message never persisted");
    let deliverables = client.get_deliverables(id).await?;
    assert!(deliverables
        .iter()
        .any(|d| d.label.as_deref() == Some("run log")));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn higher_priority_starts_first_under_a_single_slot() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("NormalQueue", 0, 0).await?;
    world.define("OrderedApp", "ordered.App", queue).await?;
    world.bind(queue, 1).await?;

    let order: Arc<Mutex<Vec<String>>> = Arc::default();
    let order_in_payload = order.clone();
    world.payloads.register_fn("ordered.App", move |ctx| {
        let order = order_in_payload.clone();
        async move {
            let name = ctx.parameter("name").unwrap_or("?").to_string();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    });

    // Both waiting before the engine boots, so reservation order decides.
    let client = world.client();
    let a = client
        .enqueue_request(
            EnqueueRequest::new("OrderedApp")
                .parameter("name", "A")
                .with_priority(7),
        )
        .await?;
    let b = client
        .enqueue_request(
            EnqueueRequest::new("OrderedApp")
                .parameter("name", "B")
                .with_priority(42),
        )
        .await?;

    let engine = world.start().await?;
    client.await_terminal(a).await?;
    client.await_terminal(b).await?;
    assert_eq!(*order.lock().unwrap(), vec!["B".to_string(), "A".to_string()]);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn highlander_definition_never_runs_twice_at_once() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("HQueue", 0, 0).await?;
    world
        .define_full("Single", "single.App", queue, |mut d| {
            d.highlander = true;
            d
        })
        .await?;
    world.bind(queue, 3).await?;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_p, peak_p) = (current.clone(), peak.clone());
    world.payloads.register_fn("single.App", move |_ctx| {
        let current = current_p.clone();
        let peak = peak_p.clone();
        async move {
            let live = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let client = world.client();
    let first = client.enqueue_request(EnqueueRequest::new("Single")).await?;
    let second = client.enqueue_request(EnqueueRequest::new("Single")).await?;

    let engine = world.start().await?;
    client.await_terminal(first).await?;
    client.await_terminal(second).await?;

    assert_eq!(peak.load(Ordering::SeqCst), 1);

    // The second could only be attributed after the first was terminal.
    let first_end = world
        .store
        .get_history(first)
        .await?
        .unwrap()
        .instance
        .end_time
        .unwrap();
    let second_attributed = world
        .store
        .get_history(second)
        .await?
        .unwrap()
        .instance
        .attribution_time
        .unwrap();
    assert!(second_attributed >= first_end);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn kill_lands_at_the_next_yield_point() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("KQueue", 0, 0).await?;
    world.define("Loyal", "loyal.App", queue).await?;
    world.define("Deaf", "deaf.App", queue).await?;
    world.bind(queue, 2).await?;

    // Yields on every lap, so a kill lands quickly.
    world.payloads.register_fn("loyal.App", |ctx| async move {
        loop {
            ctx.yield_now().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    // Never yields: runs to completion no matter what.
    world.payloads.register_fn("deaf.App", |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok(())
    });

    let engine = world.start().await?;
    let client = world.client();

    let loyal = client.enqueue_request(EnqueueRequest::new("Loyal")).await?;
    wait_for_state(&client, loyal, InstanceState::Running).await?;
    client.kill(loyal).await?;
    let err = client.await_terminal(loyal).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(client.get_state(loyal).await?, InstanceState::Killed);

    let deaf = client.enqueue_request(EnqueueRequest::new("Deaf")).await?;
    wait_for_state(&client, deaf, InstanceState::Running).await?;
    client.kill(deaf).await?;
    // The marker is set but never observed; the payload finishes normally.
    let state = client.await_terminal(deaf).await?;
    assert_eq!(state, InstanceState::Ended);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn boot_recovery_crashes_stranded_instances_first() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("RQueue", 0, 0).await?;
    world.define("Stranded", "stranded.App", queue).await?;
    world.bind(queue, 2).await?;
    world
        .payloads
        .register_fn("stranded.App", |_ctx| async move { Ok(()) });

    // Simulate a previous engine run that died mid-flight.
    let client = world.client();
    let a = client.enqueue_request(EnqueueRequest::new("Stranded")).await?;
    let b = client.enqueue_request(EnqueueRequest::new("Stranded")).await?;
    let reserved = world.store.reserve_next(world.node, queue, 2).await?;
    assert_eq!(reserved.len(), 2);
    world
        .store
        .transition(a, InstanceState::Attributed, InstanceState::Running, None)
        .await?;

    let engine = world.start().await?;
    // Both were recovered before any poller ticked.
    for id in [a, b] {
        assert_eq!(client.get_state(id).await?, InstanceState::Crashed);
        let record = world.store.get_history(id).await?.expect("archived");
        assert_eq!(
            record.instance.end_reason.as_deref(),
            Some("node crash recovery")
        );
    }
    assert!(world
        .store
        .list_instances(InstanceFilter::default())
        .await?
        .is_empty());

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn full_queue_rejects_the_fourth_request() -> Result<()> {
    let world = World::new().await?;
    let slow = world.queue("SlowQueue", 0, 3).await?;
    world.define("Slow", "slow.App", slow).await?;
    world.bind(slow, 1).await?;
    world
        .payloads
        .register_fn("slow.App", |_ctx| async move { Ok(()) });

    let client = world.client();
    let mut accepted = Vec::new();
    for _ in 0..3 {
        accepted.push(client.enqueue_request(EnqueueRequest::new("Slow")).await?);
    }
    let err = client
        .enqueue_request(EnqueueRequest::new("Slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull(ref name) if name == "SlowQueue"));

    let engine = world.start().await?;
    for id in accepted {
        assert_eq!(client.await_terminal(id).await?, InstanceState::Ended);
    }
    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn crash_restart_chain_is_bounded() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("CQueue", 0, 0).await?;
    world
        .define_full("Flaky", "flaky.App", queue, |mut d| {
            d.can_restart = true;
            d
        })
        .await?;
    world.bind(queue, 1).await?;
    world.payloads.register_fn("flaky.App", |_ctx| async move {
        Err(jobmill::JobError::failed("boom"))
    });

    let engine = world.start().await?;
    let client = world.client();
    let original = client.enqueue_request(EnqueueRequest::new("Flaky")).await?;
    assert_eq!(client.await_terminal(original).await?, InstanceState::Crashed);

    // Exactly one restart (max_restart_chain = 1), which crashes too and is
    // not restarted again.
    let restarted = wait_for_descendant(&world, original).await?;
    assert_eq!(client.await_terminal(restarted).await?, InstanceState::Crashed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let all = world
        .store
        .list_instances(InstanceFilter {
            include_history: true,
            ..InstanceFilter::default()
        })
        .await?;
    assert_eq!(all.len(), 2);
    let child = all.iter().find(|i| i.id == restarted).unwrap();
    assert_eq!(child.parent, Some(original));
    assert_eq!(child.restart_count, 1);

    engine.shutdown().await;
    Ok(())
}

async fn wait_for_descendant(world: &World, parent: InstanceId) -> Result<InstanceId> {
    for _ in 0..300 {
        let all = world
            .store
            .list_instances(InstanceFilter {
                include_history: true,
                ..InstanceFilter::default()
            })
            .await?;
        if let Some(child) = all.iter().find(|i| i.parent == Some(parent)) {
            return Ok(child.id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("no restart of {parent} appeared");
}

#[tokio::test]
async fn run_deadline_kills_with_timeout_reason() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("TQueue", 0, 0).await?;
    world
        .define_full("Endless", "endless.App", queue, |mut d| {
            d.max_time_running_ms = Some(100);
            d
        })
        .await?;
    world.bind(queue, 1).await?;
    world.payloads.register_fn("endless.App", |ctx| async move {
        loop {
            ctx.yield_now().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let engine = world.start().await?;
    let client = world.client();
    let id = client.enqueue_request(EnqueueRequest::new("Endless")).await?;
    let err = client.await_terminal(id).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    let record = world.store.get_history(id).await?.unwrap();
    assert_eq!(record.instance.state, InstanceState::Killed);
    assert_eq!(record.instance.end_reason.as_deref(), Some("timeout"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn paused_instances_wait_for_resume() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("PQueue", 0, 0).await?;
    world.define("Patient", "patient.App", queue).await?;
    world.bind(queue, 1).await?;
    world
        .payloads
        .register_fn("patient.App", |_ctx| async move { Ok(()) });

    let client = world.client();
    let id = client.enqueue_request(EnqueueRequest::new("Patient")).await?;
    client.pause(id).await?;

    let engine = world.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.get_state(id).await?, InstanceState::Hold);

    client.resume(id).await?;
    assert_eq!(client.await_terminal(id).await?, InstanceState::Ended);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn kill_of_a_waiting_instance_cancels_it() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("WQueue", 0, 0).await?;
    world.define("Waiting", "waiting.App", queue).await?;

    let client = world.client();
    let id = client.enqueue_request(EnqueueRequest::new("Waiting")).await?;
    client.kill(id).await?;

    assert_eq!(client.get_state(id).await?, InstanceState::Cancelled);
    assert!(world.store.get_history(id).await?.is_some());
    let err = client.await_terminal(id).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    Ok(())
}

#[tokio::test]
async fn payloads_can_enqueue_children_and_capture_deliverables() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("FQueue", 0, 0).await?;
    world.define("Parent", "parent.App", queue).await?;
    world.define("Child", "child.App", queue).await?;
    world.bind(queue, 2).await?;

    world.payloads.register_fn("parent.App", |ctx| async move {
        let report = ctx.work_dir().join("result.txt");
        tokio::fs::write(&report, b"42").await?;
        ctx.add_deliverable(&report, "result").await?;
        ctx.enqueue(EnqueueRequest::new("Child")).await?;
        Ok(())
    });
    world
        .payloads
        .register_fn("child.App", |_ctx| async move { Ok(()) });

    let engine = world.start().await?;
    let client = world.client();
    let parent = client
        .enqueue(
            "Parent",
            UserTags {
                user: Some("tester".to_string()),
                ..UserTags::default()
            },
            HashMap::new(),
        )
        .await?;
    assert_eq!(client.await_terminal(parent).await?, InstanceState::Ended);

    let child = wait_for_descendant(&world, parent).await?;
    assert_eq!(client.await_terminal(child).await?, InstanceState::Ended);

    let deliverables = client.get_deliverables(parent).await?;
    let result = deliverables
        .iter()
        .find(|d| d.label.as_deref() == Some("result"))
        .expect("user deliverable");
    assert_eq!(client.download_deliverable(result.id).await?, b"42");
    assert_eq!(result.size, 2);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn panicking_payload_crashes_only_its_instance() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("XQueue", 0, 0).await?;
    world.define("Bomb", "bomb.App", queue).await?;
    world.define("Calm", "calm.App", queue).await?;
    world.bind(queue, 2).await?;

    world.payloads.register_fn("bomb.App", |_ctx| async move {
        panic!("payload bug")
    });
    world
        .payloads
        .register_fn("calm.App", |_ctx| async move { Ok(()) });

    let engine = world.start().await?;
    let client = world.client();
    let bomb = client.enqueue_request(EnqueueRequest::new("Bomb")).await?;
    let calm = client.enqueue_request(EnqueueRequest::new("Calm")).await?;

    assert_eq!(client.await_terminal(bomb).await?, InstanceState::Crashed);
    assert_eq!(client.await_terminal(calm).await?, InstanceState::Ended);

    let record = world.store.get_history(bomb).await?.unwrap();
    assert_eq!(record.instance.end_reason.as_deref(), Some("payload panicked"));

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reconfigure_restarts_deployments_without_stranding_instances() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("RcQueue", 0, 0).await?;
    world.define("Steady", "steady.App", queue).await?;
    let binding_id = world.bind(queue, 1).await?;

    let completed = Arc::new(AtomicUsize::new(0));
    let completed_p = completed.clone();
    world.payloads.register_fn("steady.App", move |_ctx| {
        let completed = completed_p.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let engine = world.start().await?;
    let client = world.client();
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(client.enqueue_request(EnqueueRequest::new("Steady")).await?);
    }

    // Raise the concurrency while instances are mid-flight; the changed
    // binding restarts its deployment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut binding = world.store.get_binding(binding_id).await?;
    binding.max_concurrent = 3;
    world.store.update_binding(binding.clone()).await?;
    engine.reconfigure().await?;

    // Disable and re-enable mid-run; neither step may lose work.
    let mut binding = world.store.get_binding(binding_id).await?;
    binding.enabled = false;
    world.store.update_binding(binding.clone()).await?;
    engine.reconfigure().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    binding.enabled = true;
    world.store.update_binding(binding).await?;
    engine.reconfigure().await?;

    // Every instance still reaches a terminal state; the restarts must not
    // leave anything stuck in ATTRIBUTED with no poller to own it.
    for id in ids {
        let state = tokio::time::timeout(Duration::from_secs(10), client.await_terminal(id))
            .await??;
        assert_eq!(state, InstanceState::Ended);
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    let stranded = world
        .store
        .list_instances(InstanceFilter {
            states: Some(vec![InstanceState::Attributed]),
            ..InstanceFilter::default()
        })
        .await?;
    assert!(stranded.is_empty(), "instances stranded: {stranded:?}");

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unregistered_entry_point_crashes_without_restart() -> Result<()> {
    let world = World::new().await?;
    let queue = world.queue("UQueue", 0, 0).await?;
    world
        .define_full("Ghost", "ghost.App", queue, |mut d| {
            d.can_restart = true;
            d
        })
        .await?;
    world.bind(queue, 1).await?;

    let engine = world.start().await?;
    let client = world.client();
    let id = client.enqueue_request(EnqueueRequest::new("Ghost")).await?;
    assert_eq!(client.await_terminal(id).await?, InstanceState::Crashed);

    // Configuration errors are not retried even for restartable definitions.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let all = world
        .store
        .list_instances(InstanceFilter {
            include_history: true,
            ..InstanceFilter::default()
        })
        .await?;
    assert_eq!(all.len(), 1);

    engine.shutdown().await;
    Ok(())
}
