/*!
 * BROKER TRANSPORT (MQTT v5)
 *
 * Two clients per tap:
 * - consumer: joins the consumer group through shared subscriptions
 *   (`$share/{group}/{topic}`) and hands each publish to the dispatcher,
 *   one at a time
 * - producer: publishes records with their headers as user properties,
 *   its event loop polled by a background task
 *
 * Inbound `timestamp` and `offset` are read from user properties of the
 * same name. Subscriptions are (re)issued on every ConnAck so a
 * reconnect rejoins the group.
 */

use crate::config::{BrokerConf, NodeConf};
use crate::dispatcher::Dispatcher;
use crate::error::TapError;
use crate::models::{InboundMessage, OutboundRecord};
use crate::produce::Publisher;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

async fn options(conf: &BrokerConf, client_id: String) -> Result<MqttOptions, TapError> {
    let (host, port) = conf.primary()?;
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    if let (Some(user), Some(pass)) = (&conf.username, &conf.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }
    if let Some(tls) = &conf.tls {
        let ca = tokio::fs::read(&tls.ca).await?;
        let client_auth = match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => Some((tokio::fs::read(cert).await?, tokio::fs::read(key).await?)),
            _ => None,
        };
        opts.set_transport(Transport::tls(ca, client_auth, None));
    }
    Ok(opts)
}

fn user_property<'a>(properties: Option<&'a PublishProperties>, name: &str) -> Option<&'a str> {
    properties?
        .user_properties
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Converts a received publish into the dispatcher's input.
pub fn inbound(publish: &Publish) -> InboundMessage {
    let properties = publish.properties.as_ref();
    InboundMessage {
        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
        timestamp: user_property(properties, "timestamp").map(str::to_string),
        offset: user_property(properties, "offset").map(str::to_string),
        value: Some(publish.payload.to_vec()),
    }
}

fn subscribe(client: &AsyncClient, filters: &[String]) {
    for filter in filters {
        if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
            error!("Failed to subscribe to {}: {}", filter, e);
        }
    }
}

pub struct MqttConsumer {
    client: AsyncClient,
    eventloop: EventLoop,
    filters: Vec<String>,
}

impl MqttConsumer {
    pub async fn connect(conf: &BrokerConf, node: &NodeConf, topics: &[String]) -> Result<Self, TapError> {
        let client_id = format!("{}.{}", conf.client_id, node.uuid);
        let opts = options(conf, client_id).await?;
        let (client, eventloop) = AsyncClient::new(opts, topics.len() + 10);
        let filters = topics
            .iter()
            .map(|t| format!("$share/{}/{}", conf.group(), t))
            .collect();
        Ok(Self { client, eventloop, filters })
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Dispatches until `shutdown` flips to true (or its sender is gone).
    pub async fn run(&mut self, dispatcher: &Dispatcher, shutdown: &mut watch::Receiver<bool>) {
        let Self { client, eventloop, filters } = self;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker, joining {} topics", filters.len());
                        subscribe(client, filters);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = inbound(&publish);
                        let report = dispatcher.dispatch(&message).await;
                        if !report.failed.is_empty() {
                            debug!("{} of {} processors failed on {}", report.failed.len(), report.invoked.len(), message.topic);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Consumer connection error: {}", e);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect consumer: {}", e);
            return;
        }
        // One more poll sends the DISCONNECT packet.
        let _ = tokio::time::timeout(RETRY_DELAY, self.eventloop.poll()).await;
        info!("Consumer disconnected");
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub async fn connect(conf: &BrokerConf, node: &NodeConf) -> Result<Self, TapError> {
        let client_id = format!("{}.{}.producer", conf.client_id, node.uuid);
        let opts = options(conf, client_id).await?;
        let (client, mut eventloop) = AsyncClient::new(opts, 100);
        let closing = Arc::new(AtomicBool::new(false));

        let flag = closing.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(_) if flag.load(Ordering::Relaxed) => break,
                    Err(e) => {
                        warn!("Producer connection error: {}", e);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            closing,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to disconnect producer: {}", e);
        }
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(RETRY_DELAY, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("Producer disconnected");
    }
}

#[async_trait::async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<(), TapError> {
        let properties = PublishProperties {
            user_properties: record.headers,
            content_type: Some("application/json".into()),
            ..Default::default()
        };
        self.client
            .publish_with_properties(record.topic.clone(), QoS::AtLeastOnce, false, record.value, properties)
            .await
            .map_err(|e| TapError::Publish {
                topic: record.topic,
                reason: e.to_string(),
            })
    }
}
