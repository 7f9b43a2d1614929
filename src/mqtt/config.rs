use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings shared by every integration session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// First topic level of the presence topics
    pub root_namespace: String,
    pub keep_alive_secs: u64,
    /// Pause between reconnect attempts after a transport error
    pub reconnect_delay_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            root_namespace: "homeline".to_string(),
            keep_alive_secs: 5,
            reconnect_delay_ms: 5000,
            username: None,
            password: None,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn presence_topics(&self, device_id: &str) -> PresenceTopics {
        PresenceTopics::new(&self.root_namespace, device_id)
    }
}

/// Topics of the online/offline liveness pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceTopics {
    pub online: String,
    pub offline: String,
}

impl PresenceTopics {
    pub fn new(root_namespace: &str, device_id: &str) -> Self {
        Self {
            online: format!("{}/{}/online", root_namespace, device_id),
            offline: format!("{}/{}/offline", root_namespace, device_id),
        }
    }
}
