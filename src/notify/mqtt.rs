use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use regex::Regex;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use super::{AlertKind, AlertPayload, Notifier};
use crate::error::GuardError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const MAX_TOPIC_LEN: usize = 65_535;

#[derive(Clone, Deserialize)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Broker endpoint (`host:port`, `mqtt://host:port` or `mqtts://host:port`),
/// optional credentials and the topics alerts are published to.
#[derive(Clone, Debug, Deserialize)]
pub struct NotifierSettings {
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Option<MqttCredentials>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub use_tls: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NotifierStatus {
    pub is_configured: bool,
    pub endpoint: Option<String>,
    pub use_tls: bool,
    pub authenticated: bool,
    pub recipient_count: usize,
    pub recipients: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

#[derive(Default)]
struct NotifierState {
    endpoint: Option<MqttEndpoint>,
    credentials: Option<MqttCredentials>,
    recipients: Vec<String>,
}

/// Publishes alerts as JSON at QoS 1 to every recipient topic.
pub struct MqttNotifier {
    state: Mutex<NotifierState>,
    connect_timeout: Duration,
}

impl Default for MqttNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttNotifier {
    pub fn new() -> Self {
        Self::with_connect_timeout(CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(NotifierState::default()),
            connect_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifierState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validates the settings and checks that the broker accepts TCP
    /// connections. On failure the notifier is left unconfigured.
    pub fn configure(&self, settings: NotifierSettings) -> bool {
        match self.try_configure(settings) {
            Ok(endpoint) => {
                log::info!(
                    "MQTT notifier configured for {}:{} (TLS: {})",
                    endpoint.host,
                    endpoint.port,
                    endpoint.use_tls
                );
                true
            }
            Err(e) => {
                log::error!("MQTT notifier configuration failed: {:#}", e);
                let mut state = self.lock();
                state.endpoint = None;
                state.credentials = None;
                false
            }
        }
    }

    fn try_configure(&self, settings: NotifierSettings) -> Result<MqttEndpoint> {
        for topic in &settings.recipients {
            validate_topic(topic)?;
        }
        let endpoint = parse_mqtt_endpoint(&settings.endpoint, settings.use_tls)?;
        probe_tcp(&endpoint, self.connect_timeout)?;

        let mut state = self.lock();
        state.endpoint = Some(endpoint.clone());
        state.credentials = settings.credentials;
        for topic in settings.recipients {
            if !state.recipients.contains(&topic) {
                state.recipients.push(topic);
            }
        }
        Ok(endpoint)
    }

    pub fn add_recipient(&self, topic: &str) -> bool {
        if let Err(e) = validate_topic(topic) {
            log::error!("{}", e);
            return false;
        }
        let mut state = self.lock();
        if !state.recipients.iter().any(|t| t == topic) {
            state.recipients.push(topic.to_string());
            log::info!("added alert recipient {}", topic);
        }
        true
    }

    pub fn remove_recipient(&self, topic: &str) -> bool {
        let mut state = self.lock();
        let before = state.recipients.len();
        state.recipients.retain(|t| t != topic);
        if state.recipients.len() == before {
            log::warn!("alert recipient not found: {}", topic);
            return false;
        }
        log::info!("removed alert recipient {}", topic);
        true
    }

    pub fn clear_configuration(&self) {
        let mut state = self.lock();
        *state = NotifierState::default();
        log::info!("MQTT notifier configuration cleared");
    }

    pub fn configuration_status(&self) -> NotifierStatus {
        let state = self.lock();
        NotifierStatus {
            is_configured: state.endpoint.is_some(),
            endpoint: state
                .endpoint
                .as_ref()
                .map(|e| format!("{}:{}", e.host, e.port)),
            use_tls: state.endpoint.as_ref().map(|e| e.use_tls).unwrap_or(false),
            authenticated: state.credentials.is_some(),
            recipient_count: state.recipients.len(),
            recipients: state.recipients.clone(),
        }
    }

    pub fn send_test_alert(&self) -> bool {
        let detail = {
            let status = self.configuration_status();
            format!(
                "broker {} (TLS: {})",
                status.endpoint.unwrap_or_default(),
                status.use_tls
            )
        };
        self.send_alert(
            AlertKind::Test,
            crate::now_s().unwrap_or_default(),
            None,
            Some(&detail),
        )
    }

    fn publish(&self, payload: &AlertPayload) -> Result<usize> {
        let (endpoint, credentials, recipients) = {
            let state = self.lock();
            let endpoint = state
                .endpoint
                .clone()
                .ok_or_else(|| GuardError::configuration("MQTT notifier not configured"))?;
            (endpoint, state.credentials.clone(), state.recipients.clone())
        };
        if recipients.is_empty() {
            return Err(GuardError::configuration("no alert recipients configured").into());
        }

        let body = serde_json::to_vec(payload)?;
        let runtime = connect_mqtt(&endpoint, credentials.as_ref())?;
        let mut queued = 0usize;
        for topic in &recipients {
            match runtime
                .client
                .publish(topic.as_str(), QoS::AtLeastOnce, false, body.clone())
            {
                Ok(()) => queued += 1,
                Err(e) => log::warn!("publish to {} failed: {}", topic, e),
            }
        }

        let acked = runtime.await_acks(queued, self.connect_timeout);
        if let Err(e) = runtime.disconnect() {
            log::debug!("MQTT disconnect after publish: {}", e);
        }
        let acked = acked?;
        if acked < queued {
            log::warn!("alert acknowledged for {}/{} topic(s)", acked, recipients.len());
        }
        if acked == 0 {
            return Err(anyhow!("alert was not acknowledged by the broker"));
        }
        Ok(acked)
    }
}

impl Notifier for MqttNotifier {
    fn is_configured(&self) -> bool {
        self.lock().endpoint.is_some()
    }

    fn send_alert(
        &self,
        kind: AlertKind,
        timestamp: u64,
        evidence_ref: Option<&Path>,
        detail: Option<&str>,
    ) -> bool {
        if !self.is_configured() {
            log::warn!("MQTT notifier not configured; skipping {} alert", kind);
            return false;
        }
        let payload = AlertPayload::new(kind, timestamp, evidence_ref, detail);
        match self.publish(&payload) {
            Ok(count) => {
                log::info!("{} alert published to {} topic(s)", kind, count);
                true
            }
            Err(e) => {
                log::error!("failed to send {} alert: {:#}", kind, e);
                false
            }
        }
    }
}

/// What the connection thread observed.
#[derive(Debug)]
enum Delivery {
    Connected,
    Acked,
    Refused(String),
    Closed(String),
}

struct MqttRuntime {
    client: Client,
    deliveries: Receiver<Delivery>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let (tx, deliveries) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                if !forward_event(&tx, event) {
                    break;
                }
            }
        });
        Self {
            client,
            deliveries,
            connection_handle: Some(handle),
        }
    }

    /// Waits for the ConnAck and up to `expected` successful PubAcks.
    /// Returns the number of acknowledged publishes.
    fn await_acks(&self, expected: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut connected = false;
        let mut acked = 0usize;
        while acked < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.deliveries.recv_timeout(remaining) {
                Ok(Delivery::Connected) => connected = true,
                Ok(Delivery::Acked) => acked += 1,
                Ok(Delivery::Refused(reason)) => {
                    log::warn!("broker refused alert publish: {}", reason);
                }
                Ok(Delivery::Closed(reason)) => {
                    if !connected {
                        return Err(anyhow!("MQTT connection failed: {}", reason));
                    }
                    log::warn!("MQTT connection closed before all acks: {}", reason);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !connected {
                        return Err(anyhow!("no ConnAck from broker within {:?}", timeout));
                    }
                    log::warn!("timed out waiting for PubAck");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(acked)
    }

    fn disconnect(mut self) -> Result<()> {
        let result = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        result?;
        Ok(())
    }
}

/// Returns false once the connection is finished.
fn forward_event(
    tx: &Sender<Delivery>,
    event: std::result::Result<Event, rumqttc::v5::ConnectionError>,
) -> bool {
    let delivery = match event {
        Ok(Event::Incoming(Packet::ConnAck(_))) => Delivery::Connected,
        Ok(Event::Incoming(Packet::PubAck(ack))) => match ack.reason {
            PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Delivery::Acked,
            other => Delivery::Refused(format!("{:?}", other)),
        },
        Ok(Event::Incoming(Packet::Disconnect(_))) => {
            let _ = tx.send(Delivery::Closed("broker sent disconnect".to_string()));
            return false;
        }
        Ok(_) => return true,
        Err(e) => {
            log::warn!("MQTT connection error: {}", e);
            let _ = tx.send(Delivery::Closed(e.to_string()));
            return false;
        }
    };
    tx.send(delivery).is_ok()
}

fn connect_mqtt(endpoint: &MqttEndpoint, credentials: Option<&MqttCredentials>) -> Result<MqttRuntime> {
    let mut id = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut id);
    let client_id = format!("camguard-{}", hex::encode(id));

    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_start(true);
    if let Some(credentials) = credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    if endpoint.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    let (client, connection) = Client::new(options, 10);
    Ok(MqttRuntime::new(client, connection))
}

fn topic_regex() -> &'static Regex {
    static TOPIC_RE: OnceLock<Regex> = OnceLock::new();
    // Publish topics: no wildcards, no NUL, no empty string.
    TOPIC_RE.get_or_init(|| Regex::new(r"^[^#+\x00]+$").unwrap())
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.len() > MAX_TOPIC_LEN || topic.starts_with('$') || !topic_regex().is_match(topic) {
        return Err(GuardError::validation(format!("invalid alert topic: {:?}", topic)).into());
    }
    Ok(())
}

fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

fn probe_tcp(endpoint: &MqttEndpoint, timeout: Duration) -> Result<()> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}", endpoint.host))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(anyhow!(
            "broker {}:{} unreachable: {}",
            endpoint.host,
            endpoint.port,
            e
        )),
        None => Err(anyhow!("no addresses for {}", endpoint.host)),
    }
}
