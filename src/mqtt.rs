use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(default = "MqttConfig::default_keep_alive", with = "humantime_serde")]
    keep_alive: Duration,
    #[serde(default = "MqttConfig::default_channel_capacity")]
    channel_capacity: usize,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "jkbms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("jkbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive() -> Duration {
        Duration::from_secs(30)
    }

    fn default_channel_capacity() -> usize {
        10
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.qos()?;
        Ok(config)
    }

    pub fn qos(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => bail!("Invalid MQTT QoS {other}, expected 0, 1 or 2"),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                options.set_credentials(username, password);
            }
            (Some(username), None) => {
                options.set_credentials(username, "");
            }
            _ => {}
        }
        options
    }
}

/// Publishes to the broker. The connection is driven by a spawned event loop task.
pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    qos: QoS,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(config.options(), config.channel_capacity);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        log::info!("Connected to MQTT broker ({:?})", ack.code)
                    }
                    Ok(notification) => log::trace!("MQTT event: {notification:?}"),
                    Err(err) => {
                        // polling again reconnects
                        log::error!("MQTT connection error: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            config,
            qos,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );

        self.client
            .publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }
}
