//! Client → broker → service round trips over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rock_broker::{Broker, BrokerConfig, BrokerResult, BrokerStats};
use rock_client::{Client, ClientConfig, RpcProxy, WorkerConfig};
use rock_core::ShutdownHandle;
use rock_protocol::Codec;
use rock_service::{
    Dispatcher, HandlerError, MemoryStore, Service, ServiceBuilder, ServiceConfig, ServiceResult,
    Store, TaskPool,
};

const WAIT: Duration = Duration::from_secs(5);

struct RunningBroker {
    address: String,
    shutdown: ShutdownHandle,
    stats: watch::Receiver<BrokerStats>,
    task: JoinHandle<BrokerResult<()>>,
}

impl RunningBroker {
    async fn start() -> Self {
        let shutdown = ShutdownHandle::new();
        let config = BrokerConfig::new("e2e").with_heartbeat(Duration::from_millis(50), 3);
        let mut broker = Broker::new(config).with_shutdown(shutdown.clone());
        let endpoint = broker.bind("tcp://127.0.0.1:0").await.unwrap();
        let stats = broker.subscribe_stats();
        let task = tokio::spawn(async move { broker.mediate().await });
        Self {
            address: endpoint.to_string(),
            shutdown,
            stats,
            task,
        }
    }

    async fn wait_idle_workers(&mut self, count: usize) {
        tokio::time::timeout(WAIT, self.stats.wait_for(|s| s.idle_workers == count))
            .await
            .expect("worker count reached")
            .expect("broker alive");
    }

    async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(WAIT, self.task).await;
    }
}

struct RunningService {
    shutdown: ShutdownHandle,
    task: JoinHandle<ServiceResult<()>>,
}

impl RunningService {
    fn start(dispatcher: Dispatcher, broker: &str) -> Self {
        Self::start_with(Service::new(dispatcher, service_config(broker)))
    }

    fn start_with(service: Service) -> Self {
        let shutdown = service.shutdown_handle();
        let task = tokio::spawn(service.run());
        Self { shutdown, task }
    }

    async fn stop(self) {
        self.shutdown.trigger();
        let result = tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}

fn service_config(broker: &str) -> ServiceConfig {
    ServiceConfig::default().with_broker(broker).with_worker(
        WorkerConfig::default()
            .with_heartbeat(Duration::from_millis(50), 3)
            .with_reconnect_delay(Duration::from_millis(20)),
    )
}

fn echo() -> Dispatcher {
    ServiceBuilder::new("echo")
        .version("0.9.0")
        .method("echo", &[], |args| async move {
            Ok(Value::Object(args.into_inner()))
        })
        .method("fail", &["why"], |args| async move {
            let why: String = args.get("why")?;
            Err(HandlerError::new("ValueError", why))
        })
        .method("sleep", &["ms"], |args| async move {
            let ms: u64 = args.get("ms")?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })
        .build()
}

async fn proxy(broker: &str, config: ClientConfig) -> RpcProxy {
    let client = Client::connect(broker, config).await.unwrap();
    RpcProxy::new(client, "echo")
}

fn client_config() -> ClientConfig {
    ClientConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_retries(2)
}

#[tokio::test]
async fn echo_round_trip() {
    let mut broker = RunningBroker::start().await;
    let service = RunningService::start(echo(), &broker.address);
    broker.wait_idle_workers(1).await;

    let mut echo = proxy(&broker.address, client_config()).await;
    let reply = echo.call("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(reply, json!({"x": 1, "ok": true}));

    let mut packed = proxy(&broker.address, client_config())
        .await
        .with_codec(Codec::MsgPack);
    let reply = packed.call("echo", json!({"y": [1, 2]})).await.unwrap();
    assert_eq!(reply, json!({"y": [1, 2], "ok": true}));

    service.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn errors_come_back_as_envelopes() {
    let mut broker = RunningBroker::start().await;
    let service = RunningService::start(echo(), &broker.address);
    broker.wait_idle_workers(1).await;

    let mut echo = proxy(&broker.address, client_config()).await;

    let reply = echo.call("nope", json!({})).await.unwrap();
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"], "MethodNotFound");

    let reply = echo.call("fail", json!({"why": "bad input"})).await.unwrap();
    insta::assert_json_snapshot!(reply, @r#"
    {
      "detail": "bad input",
      "error": "ValueError",
      "ok": false
    }
    "#);

    let reply = echo.call("fail", json!({})).await.unwrap();
    assert_eq!(reply["error"], "TypeError");

    // The worker is still there after failures.
    let reply = echo.call("echo", json!({"still": "alive"})).await.unwrap();
    assert_eq!(reply["ok"], true);

    service.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn info_describes_the_service() {
    let mut broker = RunningBroker::start().await;
    let service = RunningService::start(echo(), &broker.address);
    broker.wait_idle_workers(1).await;

    let mut echo = proxy(&broker.address, client_config()).await;
    let info = echo.info().await.unwrap();
    assert_eq!(info["ok"], true);
    assert_eq!(info["service"], "echo");
    assert_eq!(info["version"], "0.9.0");
    let methods: Vec<&str> = info["rpc"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["method"].as_str().unwrap())
        .collect();
    assert_eq!(methods, vec!["echo", "fail", "sleep"]);

    service.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn slow_handler_outlives_liveness_window() {
    let mut broker = RunningBroker::start().await;
    let service = RunningService::start(echo(), &broker.address);
    broker.wait_idle_workers(1).await;

    // 400ms is well past the broker's 150ms liveness window.
    let mut echo = proxy(&broker.address, client_config()).await;
    let reply = echo.call("sleep", json!({"ms": 400})).await.unwrap();
    assert_eq!(reply, json!({"slept_ms": 400, "ok": true}));

    service.stop().await;
    broker.stop().await;
}

#[tokio::test]
async fn stopped_service_means_no_reply() {
    let mut broker = RunningBroker::start().await;
    let service = RunningService::start(echo(), &broker.address);
    broker.wait_idle_workers(1).await;

    service.stop().await;
    broker.wait_idle_workers(0).await;

    let fast = ClientConfig::default()
        .with_timeout(Duration::from_millis(100))
        .with_retries(2);
    let mut echo = proxy(&broker.address, fast).await;
    let reply = echo.call("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(reply["error"], "ResponseTimedOut");

    broker.stop().await;
}

#[tokio::test]
async fn handlers_use_store_and_tasks() {
    let mut broker = RunningBroker::start().await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel(4);
    let tasks = TaskPool::builder()
        .task("user:created", move |data| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(data).await;
                Ok(())
            }
        })
        .start();
    let events = tasks.emitter();

    let users = Arc::clone(&store);
    let dispatcher = ServiceBuilder::new("echo")
        .method("create", &["name"], move |args| {
            let users = Arc::clone(&users);
            let events = events.clone();
            async move {
                let name: String = args.get("name")?;
                let id = users.put("main", "users", json!({ "name": name })).await?;
                events.emit("user:created", json!({ "id": id })).await;
                Ok(json!({ "id": id }))
            }
        })
        .build();

    let service = RunningService::start_with(
        Service::new(dispatcher, service_config(&broker.address))
            .with_tasks(tasks)
            .with_store(Arc::clone(&store)),
    );
    broker.wait_idle_workers(1).await;

    let mut echo = proxy(&broker.address, client_config()).await;
    let reply = echo.call("create", json!({"name": "ada"})).await.unwrap();
    let id = reply["id"].as_str().unwrap().to_string();

    let event = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, json!({ "id": id }));
    let stored = store.get("main", "users", &id).await.unwrap().unwrap();
    assert_eq!(stored["name"], "ada");

    // Stopping the service closes the store.
    service.stop().await;
    assert!(store.get("main", "users", &id).await.is_err());

    broker.stop().await;
}
