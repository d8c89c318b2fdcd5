//! Pub/sub broadcast of refined results.
//!
//! Results are serialised to JSON and published at QoS 0: at most once, no
//! acknowledgement tracking, dropped when the client queue is full.

use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Serialize;

use super::SinkWriter;
use crate::frame::{RefinedResult, PLOC_COLUMNS};

pub const DEFAULT_TOPIC: &str = "edge_bragg/results";

/// Request queue depth of the MQTT client.
const CLIENT_CAPACITY: usize = 64;
const MAX_PACKET_BYTES: u32 = 256 * 1024 * 1024;

/// Wire form of one broadcast result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub unique_id: i64,
    pub psz: usize,
    pub ploc: Vec<[f32; PLOC_COLUMNS]>,
    pub patches: Vec<Vec<f32>>,
}

impl BroadcastMessage {
    pub fn from_result(result: &RefinedResult) -> Self {
        Self {
            unique_id: result.frame_id,
            psz: result.batch.psz,
            ploc: result.ploc(),
            patches: result.batch.patches.iter().map(|p| p.pixels.clone()).collect(),
        }
    }
}

/// Something that can carry a published payload.
pub trait BroadcastTransport: Send {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port`, or the same behind an
/// `mqtt://`, `tcp://`, `mqtts://` or `ssl://` scheme.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        (host, port)
    } else {
        remainder
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// MQTT v5 client with its event loop on a background thread.
pub struct MqttTransport {
    client: Client,
    connection: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn connect(addr: &str, client_id: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(addr)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        options.set_max_packet_size(Some(MAX_PACKET_BYTES));
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, CLIENT_CAPACITY);
        let connection = spawn_event_loop(connection)?;
        log::info!(
            "broadcasting to MQTT broker {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            connection: Some(connection),
        })
    }
}

fn spawn_event_loop(mut connection: Connection) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("mqtt-event-loop".into())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

impl BroadcastTransport for MqttTransport {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish dropped: {}", e))
    }

    fn close(&mut self) -> Result<()> {
        if let Err(err) = self.client.disconnect() {
            log::debug!("MQTT disconnect: {}", err);
        }
        if let Some(handle) = self.connection.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

pub struct BroadcastWriter {
    transport: Box<dyn BroadcastTransport>,
    topic: String,
}

impl BroadcastWriter {
    pub fn new(transport: Box<dyn BroadcastTransport>, topic: &str) -> Self {
        Self {
            transport,
            topic: topic.to_string(),
        }
    }
}

impl SinkWriter for BroadcastWriter {
    type Message = (i64, Vec<u8>);

    fn name(&self) -> String {
        format!("broadcast:{}", self.topic)
    }

    fn prepare(result: &RefinedResult) -> Vec<(i64, Vec<u8>)> {
        match serde_json::to_vec(&BroadcastMessage::from_result(result)) {
            Ok(payload) => vec![(result.frame_id, payload)],
            Err(err) => {
                log::error!("result from frame {} not serialisable: {}", result.frame_id, err);
                Vec::new()
            }
        }
    }

    fn write(&mut self, (frame_id, payload): (i64, Vec<u8>)) -> Result<()> {
        let bytes = payload.len();
        self.transport.publish(&self.topic, payload)?;
        log::info!(
            "result of frame {} ({} bytes) published to {}",
            frame_id,
            bytes,
            self.topic
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.transport.close()
    }
}
