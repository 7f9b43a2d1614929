//! Echo adapter: publishes a heartbeat on a test topic and logs what
//! comes back. Useful to check broker connectivity end to end.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, Instrument};

use super::loader::IntegrationDescriptor;
use super::{Integration, IntegrationError, IntegrationRuntime};
use crate::mqtt::InboundMessage;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    pub topic: String,
    pub interval_secs: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            topic: "test/echo".to_string(),
            interval_secs: 1,
        }
    }
}

pub struct EchoIntegration {
    config: EchoConfig,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl EchoIntegration {
    pub const NAME: &'static str = "echo";

    pub fn new(config: EchoConfig) -> Self {
        Self {
            config,
            ticker: Mutex::new(None),
        }
    }

    pub fn from_descriptor(descriptor: &IntegrationDescriptor) -> Result<Self, IntegrationError> {
        let config = serde_json::from_value(serde_json::Value::Object(descriptor.config.clone()))
            .map_err(|e| IntegrationError::InvalidConfig {
                id: descriptor.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }
}

#[async_trait]
impl Integration for EchoIntegration {
    fn canonical_name(&self) -> &'static str {
        Self::NAME
    }

    async fn init(&self, runtime: &IntegrationRuntime) -> Result<(), IntegrationError> {
        runtime.subscribe(&self.config.topic)?;

        let rt = runtime.clone();
        let topic = self.config.topic.clone();
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let ticker = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    let payload = format!("Echo - {}", chrono::Utc::now().timestamp_millis());
                    if let Err(e) = rt.publish_raw(&topic, payload) {
                        rt.error(format!("Echo publish failed: {}", e));
                        break;
                    }
                }
                debug!("Echo ticker stopped");
            }
            .in_current_span(),
        );

        if let Some(old) = self.ticker.lock().replace(ticker) {
            old.abort();
        }
        Ok(())
    }

    async fn destroy(&self, _runtime: &IntegrationRuntime) -> Result<(), IntegrationError> {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        Ok(())
    }

    async fn on_message(&self, runtime: &IntegrationRuntime, message: InboundMessage) {
        runtime.log(message.text());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{PresenceTopics, SessionHandle, SessionRequest};
    use crate::persistence::StateStore;
    use serde_json::Map;

    #[tokio::test]
    async fn test_echo_subscribes_and_publishes() {
        let (session, mut rx) =
            SessionHandle::detached("echo", PresenceTopics::new("homeline", "test"));
        let runtime = IntegrationRuntime::new(
            "echo",
            EchoIntegration::NAME,
            "test",
            Map::new(),
            session,
            StateStore::in_memory(),
        );
        let echo = EchoIntegration::new(EchoConfig::default());

        echo.init(&runtime).await.unwrap();
        assert_eq!(runtime.session().subscriptions(), vec!["test/echo".to_string()]);

        let Some(SessionRequest::Publish(msg)) = rx.recv().await else {
            panic!("expected a heartbeat");
        };
        assert_eq!(msg.topic, "test/echo");
        assert!(msg.text().starts_with("Echo - "));

        echo.destroy(&runtime).await.unwrap();
    }

    #[test]
    fn test_config_defaults() {
        let descriptor = IntegrationDescriptor {
            id: "e".to_string(),
            module: "echo".to_string(),
            config: Map::new(),
        };
        let echo = EchoIntegration::from_descriptor(&descriptor).unwrap();
        assert_eq!(echo.config(), &EchoConfig::default());
    }
}
