use async_trait::async_trait;
use homeline::integrations::{
    Integration, IntegrationDescriptor, IntegrationError, IntegrationRuntime, IntegrationStatus,
    IntegrationSupervisor, Registry,
};
use homeline::mqtt::{InboundMessage, MqttConfig, PresenceTopics, SessionHandle, SessionRequest};
use homeline::persistence::{State, StateStore};
use homeline::routing::HandlerError;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Alarm {
    armed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Integration for Alarm {
    fn canonical_name(&self) -> &'static str {
        "alarm"
    }

    async fn init(&self, runtime: &IntegrationRuntime) -> Result<(), IntegrationError> {
        let armed = self.armed.clone();
        runtime.route_command("cmd/<panel>", move |info, command| {
            let armed = armed.clone();
            async move {
                match command.name.as_str() {
                    "arm" => {
                        armed.lock().push(info.params["panel"].clone());
                        Ok(())
                    }
                    other => Err(HandlerError::UnknownCommand(other.to_string())),
                }
            }
        })
    }
}

struct Broken;

#[async_trait]
impl Integration for Broken {
    fn canonical_name(&self) -> &'static str {
        "broken"
    }

    async fn init(&self, _runtime: &IntegrationRuntime) -> Result<(), IntegrationError> {
        Err(IntegrationError::Init("vendor api unreachable".to_string()))
    }
}

fn detached_runtime(
    name: &'static str,
) -> (IntegrationRuntime, mpsc::UnboundedReceiver<SessionRequest>) {
    let (session, requests) = SessionHandle::detached(name, PresenceTopics::new("homeline", "test"));
    let runtime = IntegrationRuntime::new(name, name, "test", Map::new(), session, StateStore::in_memory());
    (runtime, requests)
}

fn published(requests: &mut mpsc::UnboundedReceiver<SessionRequest>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    while let Ok(request) = requests.try_recv() {
        if let SessionRequest::Publish(msg) = request {
            let body = serde_json::from_slice(&msg.payload).unwrap_or(Value::Null);
            out.push((msg.topic, body));
        }
    }
    out
}

#[tokio::test]
async fn test_malformed_command_reports_error_and_skips_handler() {
    let armed = Arc::new(Mutex::new(Vec::new()));
    let alarm = Alarm { armed: armed.clone() };
    let (runtime, mut requests) = detached_runtime("alarm");
    alarm.init(&runtime).await.unwrap();

    runtime
        .dispatch(&alarm, InboundMessage::new("cmd/1", "not json"))
        .await;

    assert!(armed.lock().is_empty());
    let published = published(&mut requests);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "cmd/1/error");
    assert_eq!(published[0].1["payload"], json!("not json"));
    assert!(published[0].1["error"].is_string());
}

#[tokio::test]
async fn test_unknown_command_is_reported_under_its_id() {
    let armed = Arc::new(Mutex::new(Vec::new()));
    let alarm = Alarm { armed: armed.clone() };
    let (runtime, mut requests) = detached_runtime("alarm");
    alarm.init(&runtime).await.unwrap();

    runtime
        .dispatch(
            &alarm,
            InboundMessage::new("cmd/1", r#"{"id":"42","name":"selfdestruct"}"#),
        )
        .await;
    runtime
        .dispatch(&alarm, InboundMessage::new("cmd/2", r#"{"name":"arm"}"#))
        .await;

    assert_eq!(*armed.lock(), vec!["2".to_string()]);
    let published = published(&mut requests);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "cmd/1/cid/42/error");
    assert_eq!(published[0].1["name"], json!("selfdestruct"));
    assert_eq!(published[0].1["id"], json!("42"));
}

#[tokio::test]
async fn test_failing_init_leaves_other_integration_running() {
    let mut supervisor = IntegrationSupervisor::new(
        Registry::new(),
        MqttConfig::default(),
        "test",
        StateStore::in_memory(),
    );

    let adapters: [(&str, Arc<dyn Integration>); 2] = [
        ("broken", Arc::new(Broken) as Arc<dyn Integration>),
        (
            "alarm",
            Arc::new(Alarm {
                armed: Arc::new(Mutex::new(Vec::new())),
            }) as Arc<dyn Integration>,
        ),
    ];
    let mut keep = Vec::new();
    for (id, adapter) in adapters {
        let (session, requests) =
            SessionHandle::detached(id, PresenceTopics::new("homeline", "test"));
        let (_tx, inbound) = mpsc::unbounded_channel();
        let descriptor = IntegrationDescriptor {
            id: id.to_string(),
            module: id.to_string(),
            config: Map::new(),
        };
        supervisor.attach(&descriptor, adapter, session, inbound);
        keep.push(requests);
    }

    supervisor.init_all().await;

    assert!(matches!(
        supervisor.status("broken"),
        Some(IntegrationStatus::Failed(_))
    ));
    assert_eq!(supervisor.status("alarm"), Some(IntegrationStatus::Running));
    assert_eq!(
        supervisor.runtime("alarm").unwrap().session().subscriptions(),
        vec!["cmd/+".to_string()]
    );

    supervisor.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("homeline.json");
    let path = path.to_str().unwrap();

    {
        let store = StateStore::open(path).await.unwrap();
        let mut first = State::new();
        first.insert("token".to_string(), json!("abc"));
        store.set_state("alarm", first).await.unwrap();

        let mut second = State::new();
        second.insert("systems".to_string(), json!([1, 2]));
        store.set_state("alarm", second).await.unwrap();

        let mut other = State::new();
        other.insert("bridge".to_string(), json!("10.0.0.2"));
        store.set_state("lights", other).await.unwrap();
    }

    let reopened = StateStore::open(path).await.unwrap();
    assert_eq!(
        Value::Object(reopened.get_state("alarm").await),
        json!({"token": "abc", "systems": [1, 2]})
    );
    assert_eq!(
        Value::Object(reopened.get_state("lights").await),
        json!({"bridge": "10.0.0.2"})
    );
}
