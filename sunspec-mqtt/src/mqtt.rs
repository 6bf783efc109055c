use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::Config;
use crate::readings::Readings;
use crate::Error;

/// Requests buffered between the client handle and the event loop.
const CHANNEL_CAPACITY: usize = 32;

/// A sink for published readings.
#[async_trait]
pub trait Publisher: Send {
    /// Open the session, or keep the current one.
    async fn connect(&mut self) -> crate::Result<()>;

    /// Send every reading and wait for the broker to acknowledge them.
    async fn publish(&mut self, readings: &Readings) -> crate::Result<()>;

    /// Drop the session, if any.
    async fn close(&mut self);
}

/// Publishes each reading as its own message: topic `<prefix>/<metric>`, payload the decimal value as text, QoS 1,
/// not retained.
pub struct MqttPublisher {
    options: MqttOptions,
    prefix: String,
    timeout: Duration,
    session: Option<Session>,
}

struct Session {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl MqttPublisher {
    pub fn new(config: &Config) -> Self {
        let mut options = MqttOptions::new(
            config.client_id.as_str(),
            config.mqtt_host.as_str(),
            config.mqtt_port,
        );
        if let Some(user) = &config.mqtt_user {
            options.set_credentials(user.as_str(), config.mqtt_pass.as_deref().unwrap_or_default());
        }
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        MqttPublisher {
            options,
            prefix: config.topic_prefix.clone(),
            timeout: config.timeout,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn topic(&self, metric: &str) -> String {
        format!("{}/{}", self.prefix, metric)
    }
}

async fn handshake(event_loop: &mut EventLoop) -> crate::Result<()> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Incoming::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                ..
            })) => return Ok(()),
            Event::Incoming(Incoming::ConnAck(ConnAck { code, .. })) => {
                return Err(Error::refused(code))
            }
            event => debug!(?event, "Waiting for CONNACK"),
        }
    }
}

/// Hand every message to the client while driving the event loop until all of them are acknowledged.
async fn deliver(
    client: &AsyncClient,
    event_loop: &mut EventLoop,
    messages: Vec<(String, String)>,
) -> crate::Result<()> {
    let expected = messages.len();
    let send = async move {
        for (topic, payload) in messages {
            client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        }
        Ok::<_, rumqttc::ClientError>(())
    };
    tokio::pin!(send);

    let mut sent = expected == 0;
    let mut acknowledged = 0;
    while !sent || acknowledged < expected {
        tokio::select! {
            result = &mut send, if !sent => {
                result?;
                sent = true;
            }
            event = event_loop.poll() => {
                let event = event.map_err(|e| Error::publish(e.to_string()))?;
                if let Event::Incoming(Incoming::PubAck(_)) = event {
                    acknowledged += 1;
                }
            }
        }
    }
    Ok(())
}

async fn disconnect(client: &AsyncClient, event_loop: &mut EventLoop) -> crate::Result<()> {
    client.disconnect().await?;
    loop {
        if let Event::Outgoing(Outgoing::Disconnect) = event_loop.poll().await? {
            return Ok(());
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(broker = ?self.options.broker_address())
    )]
    async fn connect(&mut self) -> crate::Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), CHANNEL_CAPACITY);
        timeout(self.timeout, handshake(&mut event_loop))
            .await
            .map_err(|_| Error::broker("timed out waiting for CONNACK"))??;

        let (host, port) = self.options.broker_address();
        info!(%host, port, client_id = %self.options.client_id(), "Connected to MQTT broker");
        self.session = Some(Session { client, event_loop });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = readings.len()))]
    async fn publish(&mut self, readings: &Readings) -> crate::Result<()> {
        let messages: Vec<(String, String)> = readings
            .iter()
            .map(|(metric, value)| (self.topic(metric), value.to_string()))
            .collect();
        let count = messages.len();

        let Session { client, event_loop } = self
            .session
            .as_mut()
            .ok_or_else(|| Error::publish("not connected to the broker"))?;

        timeout(self.timeout, deliver(client, event_loop, messages))
            .await
            .map_err(|_| {
                Error::publish(format!("timed out waiting for {} acknowledgements", count))
            })??;

        debug!(count, "Published readings");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(Session {
            client,
            mut event_loop,
        }) = self.session.take()
        {
            match timeout(self.timeout, disconnect(&client, &mut event_loop)).await {
                Ok(Ok(())) => debug!("Disconnected from MQTT broker"),
                Ok(Err(error)) => debug!(%error, "Dropping MQTT session"),
                Err(_) => debug!("Timed out disconnecting from MQTT broker"),
            }
        }
    }
}
