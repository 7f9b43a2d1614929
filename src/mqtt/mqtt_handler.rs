use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, PresenceTopics};
use super::message_manager::{InboundMessage, OutboundMessage, SessionRequest};

const CLIENT_PREFIX: &str = "homeline";
const CLIENT_CAPACITY: usize = 100;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub connects: usize,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level failure; the session keeps reconnecting
    #[error("Connection error: {0}")]
    Connection(String),

    /// The client rejected a request
    #[error("Client error: {0}")]
    Client(String),

    /// The session task is gone, nothing can be sent anymore
    #[error("Session {0} is closed")]
    Closed(String),
}

/// Connection state machine and subscription set of one session
///
/// Pure bookkeeping: every transition returns the requests the transport
/// has to carry out, so the same logic drives a live client and a test.
#[derive(Debug)]
pub struct SessionCore {
    state: ConnectionState,
    subscriptions: Vec<String>,
    presence: PresenceTopics,
    shutting_down: bool,
}

impl SessionCore {
    pub fn new(presence: PresenceTopics) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            subscriptions: Vec::new(),
            presence,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn presence(&self) -> &PresenceTopics {
        &self.presence
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn start(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Adds a topic to the set. Only a connected session subscribes right
    /// away; otherwise the next handshake picks it up.
    pub fn add_subscription(&mut self, topic: &str) -> Option<SessionRequest> {
        if self.subscriptions.iter().any(|t| t == topic) {
            return None;
        }
        self.subscriptions.push(topic.to_string());
        (self.state == ConnectionState::Connected).then(|| SessionRequest::Subscribe(topic.to_string()))
    }

    /// Handshake succeeded: resubscribe everything, then announce presence.
    ///
    /// Broker-side subscriptions are not assumed to survive a reconnect.
    pub fn on_connected(&mut self) -> Vec<SessionRequest> {
        if self.shutting_down {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;

        let mut requests: Vec<SessionRequest> = self
            .subscriptions
            .iter()
            .cloned()
            .map(SessionRequest::Subscribe)
            .collect();
        requests.push(SessionRequest::Publish(OutboundMessage::new(
            self.presence.online.clone(),
            Bytes::new(),
        )));
        requests
    }

    /// Transport dropped. No presence message, it could not be delivered.
    pub fn on_connection_lost(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Reconnecting;
        }
        self.state
    }

    /// Explicit shutdown: offline presence first, then the session is done.
    pub fn on_shutdown(&mut self) -> Vec<SessionRequest> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;
        self.state = ConnectionState::Disconnected;
        vec![
            SessionRequest::Publish(OutboundMessage::new(
                self.presence.offline.clone(),
                Bytes::new(),
            )),
            SessionRequest::Disconnect,
        ]
    }

    /// Closes without touching presence. A clean disconnect also keeps the
    /// broker from firing the last will.
    pub fn on_close(&mut self) -> Vec<SessionRequest> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;
        self.state = ConnectionState::Disconnected;
        vec![SessionRequest::Disconnect]
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// Cheap, cloneable access to one session
///
/// Runtimes and adapters hold this; the session tasks own the client.
#[derive(Clone)]
pub struct SessionHandle {
    name: String,
    core: Arc<Mutex<SessionCore>>,
    requests: mpsc::UnboundedSender<SessionRequest>,
    status: Arc<watch::Sender<SessionStatus>>,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl SessionHandle {
    fn new(
        name: &str,
        presence: PresenceTopics,
        requests: mpsc::UnboundedSender<SessionRequest>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            name: name.to_string(),
            core: Arc::new(Mutex::new(SessionCore::new(presence))),
            requests,
            status: Arc::new(status),
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// A session without a broker. The caller receives every request the
    /// session would have sent to the transport.
    pub fn detached(
        name: &str,
        presence: PresenceTopics,
    ) -> (Self, mpsc::UnboundedReceiver<SessionRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self::new(name, presence, tx);
        handle.stopped.cancel();
        (handle, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.core.lock().state()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.core.lock().subscriptions().to_vec()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        debug!("Subscribing to {}", topic);
        let request = self.core.lock().add_subscription(topic);
        match request {
            Some(request) => self.send(request),
            None => Ok(()),
        }
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        debug!("> {}", topic);
        self.send(SessionRequest::Publish(OutboundMessage::new(topic, payload)))
    }

    /// Publishes the offline presence and closes the connection.
    ///
    /// Best-effort: waits at most `deadline` for the transport to flush,
    /// then stops the session tasks regardless.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SessionError> {
        let requests = self.core.lock().on_shutdown();
        self.finish(requests, deadline).await
    }

    /// Disconnects without announcing the device offline.
    ///
    /// For a single integration that gives up while the rest of the
    /// device keeps running.
    pub async fn close(&self, deadline: Duration) -> Result<(), SessionError> {
        let requests = self.core.lock().on_close();
        self.finish(requests, deadline).await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    async fn finish(&self, requests: Vec<SessionRequest>, deadline: Duration) -> Result<(), SessionError> {
        self.set_state(ConnectionState::Disconnected);

        let mut result = Ok(());
        for request in requests {
            if let Err(e) = self.send(request) {
                result = Err(e);
                break;
            }
        }

        if tokio::time::timeout(deadline, self.stopped.cancelled())
            .await
            .is_err()
        {
            warn!(
                "Session {} did not close within {:?}, dropping connection",
                self.name, deadline
            );
        }
        self.stop.cancel();
        result
    }

    fn send(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.requests
            .send(request)
            .map_err(|_| SessionError::Closed(self.name.clone()))
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.connection_state = state);
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|status| status.last_error = Some(message));
    }
}

/// One broker connection: a poll task driving the event loop and a
/// forwarder task carrying out requests on the client.
pub struct ConnectionSession;

impl ConnectionSession {
    /// Creates the client and spawns both session tasks.
    ///
    /// The offline presence is registered as the last will so the broker
    /// announces it for us after an abnormal disconnect.
    pub fn spawn(
        config: &MqttConfig,
        device_id: &str,
        name: &str,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<InboundMessage>) {
        let presence = config.presence_topics(device_id);
        let client_id = client_id(name);

        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                presence.offline.clone(),
                "",
                QoS::AtMostOnce,
                false,
            ));
        if let (Some(user), Some(pw)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pw.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle::new(name, presence, request_tx);
        handle.core.lock().start();
        handle.set_state(ConnectionState::Connecting);

        info!(
            "Connecting {} to mqtt://{}:{} as {}",
            name, config.host, config.port, client_id
        );

        tokio::spawn(forward_requests(handle.clone(), client, request_rx));
        tokio::spawn(poll_events(
            handle.clone(),
            eventloop,
            inbound_tx,
            config.reconnect_delay(),
        ));

        (handle, inbound_rx)
    }
}

fn client_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}/_{}+{}", CLIENT_PREFIX, &suffix[..8], name)
}

async fn forward_requests(
    handle: SessionHandle,
    client: AsyncClient,
    mut requests: mpsc::UnboundedReceiver<SessionRequest>,
) {
    loop {
        let request = tokio::select! {
            _ = handle.stop.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = match request {
            SessionRequest::Subscribe(topic) => {
                debug!("Subscribed to {}", topic);
                client.subscribe(topic, QoS::AtMostOnce).await
            }
            SessionRequest::Publish(msg) => {
                let sent = client
                    .publish(msg.topic, QoS::AtMostOnce, msg.retain, msg.payload.to_vec())
                    .await;
                if sent.is_ok() {
                    handle.status.send_modify(|status| {
                        status.messages_sent += 1;
                        status.last_activity = Some(chrono::Local::now());
                    });
                }
                sent
            }
            SessionRequest::Disconnect => {
                if let Err(e) = client.disconnect().await {
                    warn!("Disconnect of {} failed: {}", handle.name, e);
                }
                break;
            }
        };

        if let Err(e) = result {
            error!("{}: {}", handle.name, SessionError::Client(e.to_string()));
        }
    }
    debug!("Request forwarder of {} stopped", handle.name);
}

async fn poll_events(
    handle: SessionHandle,
    mut eventloop: EventLoop,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    reconnect_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = handle.stop.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let requests = handle.core.lock().on_connected();
                if requests.is_empty() {
                    continue;
                }
                info!("{} connected", handle.name);
                handle.status.send_modify(|status| {
                    status.connection_state = ConnectionState::Connected;
                    status.connects += 1;
                });
                for request in requests {
                    if handle.send(request).is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(chrono::Local::now());
                });
                if inbound
                    .send(InboundMessage::new(publish.topic, publish.payload))
                    .is_err()
                {
                    debug!("Inbound receiver of {} dropped", handle.name);
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("{} disconnected", handle.name);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if handle.core.lock().is_shutting_down() {
                    debug!("{} closed during shutdown: {}", handle.name, e);
                    break;
                }
                let err = SessionError::Connection(e.to_string());
                let state = handle.core.lock().on_connection_lost();
                match state {
                    ConnectionState::Reconnecting => warn!("{} lost, reconnecting: {}", handle.name, err),
                    _ => warn!("{} could not connect: {}", handle.name, err),
                }
                handle.set_state(state);
                handle.record_error(err.to_string());

                tokio::select! {
                    _ = handle.stop.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    handle.core.lock().on_closed();
    handle.set_state(ConnectionState::Disconnected);
    handle.stopped.cancel();
    debug!("Event loop of {} stopped", handle.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence() -> PresenceTopics {
        PresenceTopics::new("homeline", "dev1")
    }

    fn online() -> SessionRequest {
        SessionRequest::Publish(OutboundMessage::new("homeline/dev1/online", Bytes::new()))
    }

    #[test]
    fn test_subscriptions_wait_for_connect() {
        let mut core = SessionCore::new(presence());
        core.start();
        assert_eq!(core.state(), ConnectionState::Connecting);
        assert!(core.add_subscription("a/+").is_none());
        assert!(core.add_subscription("a/+").is_none());

        let requests = core.on_connected();
        assert_eq!(core.state(), ConnectionState::Connected);
        assert_eq!(
            requests,
            vec![SessionRequest::Subscribe("a/+".to_string()), online()]
        );
    }

    #[test]
    fn test_subscribe_while_connected_is_immediate() {
        let mut core = SessionCore::new(presence());
        core.start();
        core.on_connected();
        assert_eq!(
            core.add_subscription("b"),
            Some(SessionRequest::Subscribe("b".to_string()))
        );
        assert!(core.add_subscription("b").is_none());
    }

    #[test]
    fn test_reconnect_recomputes_subscriptions() {
        let mut core = SessionCore::new(presence());
        core.start();
        core.add_subscription("first");
        let first = core.on_connected();
        assert_eq!(first.iter().filter(|r| **r == online()).count(), 1);

        assert_eq!(core.on_connection_lost(), ConnectionState::Reconnecting);
        core.add_subscription("second");

        let again = core.on_connected();
        assert_eq!(
            again,
            vec![
                SessionRequest::Subscribe("first".to_string()),
                SessionRequest::Subscribe("second".to_string()),
                online(),
            ]
        );
    }

    #[test]
    fn test_failed_first_connect_stays_connecting() {
        let mut core = SessionCore::new(presence());
        core.start();
        assert_eq!(core.on_connection_lost(), ConnectionState::Connecting);
    }

    #[test]
    fn test_shutdown_publishes_offline_once() {
        let mut core = SessionCore::new(presence());
        core.start();
        core.on_connected();
        let requests = core.on_shutdown();
        assert_eq!(
            requests,
            vec![
                SessionRequest::Publish(OutboundMessage::new(
                    "homeline/dev1/offline",
                    Bytes::new()
                )),
                SessionRequest::Disconnect,
            ]
        );
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.on_shutdown().is_empty());
        assert!(core.on_connected().is_empty());
    }

    #[test]
    fn test_close_skips_presence() {
        let mut core = SessionCore::new(presence());
        core.start();
        core.on_connected();
        assert_eq!(core.on_close(), vec![SessionRequest::Disconnect]);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.on_close().is_empty());
        assert!(core.on_shutdown().is_empty());
    }

    #[tokio::test]
    async fn test_detached_close_sends_only_disconnect() {
        let (handle, mut rx) = SessionHandle::detached("test", presence());
        handle.close(Duration::from_millis(10)).await.unwrap();
        assert_eq!(rx.recv().await, Some(SessionRequest::Disconnect));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_client_id_format() {
        let id = client_id("echo");
        assert!(id.starts_with("homeline/_"));
        assert!(id.ends_with("+echo"));
        assert_eq!(id.len(), "homeline/_".len() + 8 + "+echo".len());
    }

    #[tokio::test]
    async fn test_detached_handle_forwards_requests() {
        let (handle, mut rx) = SessionHandle::detached("test", presence());
        handle.subscribe("x/y").unwrap();
        handle.publish("x/y", "hello").unwrap();
        handle.shutdown(Duration::from_millis(10)).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SessionRequest::Publish(OutboundMessage::new("x/y", "hello")))
        );
        assert!(matches!(rx.recv().await, Some(SessionRequest::Publish(m)) if m.topic == "homeline/dev1/offline"));
        assert_eq!(rx.recv().await, Some(SessionRequest::Disconnect));
        assert_eq!(handle.subscriptions(), vec!["x/y".to_string()]);
    }
}
