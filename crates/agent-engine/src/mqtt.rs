//! MQTT bus client.
//!
//! The broker library only hands back a packet id in its SUBACK/UNSUBACK
//! notifications, but the states want completions tagged with the topic they
//! asked for. The bus task therefore records the topic *before* handing the
//! request to the client — the event loop may process the request and its
//! acknowledgment at any point after that — and resolves the outgoing packet
//! id against that queue, so acknowledgments can be translated back into
//! topic-tagged inbox events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ota_agent_core::config::{BrokerConfig, TlsMaterial};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{Event, Inbox};

const KEEPALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Requests the states issue against the broker. All job-control traffic is
/// QoS 1.
#[derive(Debug)]
pub enum BusCommand {
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

/// Cloneable handle used by the state machine; the other end is consumed by
/// [`run_bus`] (or held directly by tests).
#[derive(Debug, Clone)]
pub struct BusHandle {
    commands: mpsc::UnboundedSender<BusCommand>,
}

impl BusHandle {
    pub fn channel() -> (BusHandle, mpsc::UnboundedReceiver<BusCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (BusHandle { commands }, rx)
    }

    pub fn subscribe(&self, topic: impl Into<String>, qos: QoS) {
        self.send(BusCommand::Subscribe {
            topic: topic.into(),
            qos,
        });
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) {
        self.send(BusCommand::Unsubscribe {
            topic: topic.into(),
        });
    }

    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.send(BusCommand::Publish {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn disconnect(&self) {
        self.send(BusCommand::Disconnect);
    }

    fn send(&self, command: BusCommand) {
        if self.commands.send(command).is_err() {
            warn!("bus task is gone, dropping command");
        }
    }
}

/// Request→topic bookkeeping.
///
/// `pending_*` holds topics whose request has been queued on the client but
/// whose packet has not been sent yet; once the event loop reports the
/// outgoing packet the topic moves into `inflight_*` keyed by packet id,
/// where the acknowledgment picks it up. `desired` survives all of this so
/// a reconnect can re-issue every live subscription.
#[derive(Debug, Default)]
pub struct BusTables {
    pending_sub: VecDeque<String>,
    inflight_sub: HashMap<u16, String>,
    pending_unsub: VecDeque<String>,
    inflight_unsub: HashMap<u16, String>,
    desired: HashMap<String, QoS>,
}

impl BusTables {
    /// Records a subscribe request. Must run before the client call so a
    /// completion processed concurrently still finds the topic.
    pub fn subscribe_requested(&mut self, topic: String, qos: QoS) {
        self.desired.insert(topic.clone(), qos);
        self.pending_sub.push_back(topic);
    }

    /// Rolls back the pending entry of a subscribe the client refused to
    /// queue. The desired entry stays so a later reconnect retries it.
    pub fn subscribe_rejected(&mut self, topic: &str) {
        remove_last(&mut self.pending_sub, topic);
    }

    pub fn unsubscribe_requested(&mut self, topic: String) {
        self.desired.remove(&topic);
        self.pending_unsub.push_back(topic);
    }

    pub fn unsubscribe_rejected(&mut self, topic: &str) {
        remove_last(&mut self.pending_unsub, topic);
    }

    /// The event loop put a SUBSCRIBE packet on the wire.
    pub fn subscribe_sent(&mut self, pkid: u16) {
        match self.pending_sub.pop_front() {
            // A colliding entry from before a reconnect is simply replaced.
            Some(topic) => {
                self.inflight_sub.insert(pkid, topic);
            }
            None => error!(pkid, "subscribe sent with no pending topic"),
        }
    }

    pub fn unsubscribe_sent(&mut self, pkid: u16) {
        match self.pending_unsub.pop_front() {
            Some(topic) => {
                self.inflight_unsub.insert(pkid, topic);
            }
            None => error!(pkid, "unsubscribe sent with no pending topic"),
        }
    }

    pub fn subscribe_acked(&mut self, pkid: u16) -> Option<String> {
        self.inflight_sub.remove(&pkid)
    }

    pub fn unsubscribe_acked(&mut self, pkid: u16) -> Option<String> {
        self.inflight_unsub.remove(&pkid)
    }

    pub fn desired_subscriptions(&self) -> Vec<(String, QoS)> {
        self.desired
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }
}

fn remove_last(queue: &mut VecDeque<String>, topic: &str) {
    if let Some(idx) = queue.iter().rposition(|t| t == topic) {
        queue.remove(idx);
    }
}

/// Builds the broker transport up front so TLS problems surface as startup
/// errors instead of reconnect loops.
pub fn transport(broker: &BrokerConfig) -> anyhow::Result<Transport> {
    match &broker.tls {
        None => Ok(Transport::Tcp),
        Some(material) => Ok(Transport::Tls(tls_configuration(material)?)),
    }
}

fn tls_configuration(material: &TlsMaterial) -> anyhow::Result<TlsConfiguration> {
    let ca = std::fs::read(&material.cafile)
        .with_context(|| format!("read cafile {}", material.cafile.display()))?;
    let cert = std::fs::read(&material.certfile)
        .with_context(|| format!("read certfile {}", material.certfile.display()))?;
    let key = std::fs::read(&material.keyfile)
        .with_context(|| format!("read keyfile {}", material.keyfile.display()))?;

    // Client certificate authentication on 443/8883 requires the ALPN
    // protocol announced by AWS IoT Core.
    Ok(TlsConfiguration::Simple {
        ca,
        alpn: Some(vec![b"x-amzn-mqtt-ca".to_vec()]),
        client_auth: Some((cert, key)),
    })
}

/// Owns the MQTT client and its event loop until the command channel closes
/// or a disconnect is requested.
pub async fn run_bus(
    broker: BrokerConfig,
    transport: Transport,
    mut commands: mpsc::UnboundedReceiver<BusCommand>,
    inbox: Inbox,
) {
    let mut options = MqttOptions::new(broker.client_id.clone(), broker.host.clone(), broker.port);
    options.set_keep_alive(KEEPALIVE);
    options.set_transport(transport);

    debug!(host = %broker.host, port = broker.port, "connecting to broker");
    let (client, mut event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
    let mut tables = BusTables::default();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(BusCommand::Disconnect) => {
                    let _ = client.try_disconnect();
                    return;
                }
                Some(command) => apply_command(&client, &mut tables, command),
            },
            event = event_loop.poll() => match event {
                Ok(event) => handle_bus_event(&client, &mut tables, &inbox, event),
                Err(err) => {
                    warn!(error = %err, "connection lost, reconnecting in {}s", RECONNECT_DELAY.as_secs());
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }
}

fn apply_command(client: &AsyncClient, tables: &mut BusTables, command: BusCommand) {
    match command {
        BusCommand::Subscribe { topic, qos } => {
            subscribe(client, tables, topic, qos);
        }
        BusCommand::Unsubscribe { topic } => {
            tables.unsubscribe_requested(topic.clone());
            if let Err(err) = client.try_unsubscribe(&topic) {
                tables.unsubscribe_rejected(&topic);
                warn!(topic, error = %err, "unable to unsubscribe");
            }
        }
        BusCommand::Publish { topic, payload } => {
            if let Err(err) = client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
                warn!(topic, error = %err, "unable to publish");
            }
        }
        BusCommand::Disconnect => {
            let _ = client.try_disconnect();
        }
    }
}

fn subscribe(client: &AsyncClient, tables: &mut BusTables, topic: String, qos: QoS) {
    // Record the mapping first; see the module comment.
    tables.subscribe_requested(topic.clone(), qos);
    if let Err(err) = client.try_subscribe(&topic, qos) {
        tables.subscribe_rejected(&topic);
        warn!(topic, error = %err, "unable to subscribe");
    }
}

fn handle_bus_event(client: &AsyncClient, tables: &mut BusTables, inbox: &Inbox, event: MqttEvent) {
    match event {
        MqttEvent::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                info!("connected to broker");
                // The broker dropped our subscriptions with the session;
                // re-issue everything the states still want.
                for (topic, qos) in tables.desired_subscriptions() {
                    subscribe(client, tables, topic, qos);
                }
            } else {
                error!(code = ?ack.code, "broker rejected connection");
            }
        }
        MqttEvent::Incoming(Packet::Publish(publish)) => {
            let _ = inbox.send(Event::MqttMessageReceived {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            });
        }
        MqttEvent::Incoming(Packet::SubAck(ack)) => match tables.subscribe_acked(ack.pkid) {
            Some(topic) => {
                let _ = inbox.send(Event::MqttSubscribed { topic });
            }
            None => error!(pkid = ack.pkid, "no topic mapping found for subscription"),
        },
        MqttEvent::Incoming(Packet::UnsubAck(ack)) => match tables.unsubscribe_acked(ack.pkid) {
            Some(topic) => {
                let _ = inbox.send(Event::MqttUnsubscribed { topic });
            }
            None => error!(pkid = ack.pkid, "no topic mapping found for unsubscription"),
        },
        MqttEvent::Outgoing(Outgoing::Subscribe(pkid)) => tables.subscribe_sent(pkid),
        MqttEvent::Outgoing(Outgoing::Unsubscribe(pkid)) => tables.unsubscribe_sent(pkid),
        _ => {}
    }
}
