use anyhow::{Context, Result};
use jkbms_lib::ble::{BleConfig, JkBms, Snapshot};
use log::{error, info, warn};
use serde_json::json;
use std::time::Duration;

use crate::{commandline, mqtt};

/// One `(topic, payload)` per field: `<topic>/info/<field>` and `<topic>/cell_data/<field>`.
fn simple_messages(base_topic: &str, snapshot: &Snapshot) -> Vec<(String, String)> {
    let mut messages = Vec::new();
    if let Some(info) = &snapshot.info {
        for (name, value) in info.fields() {
            messages.push((format!("{base_topic}/info/{name}"), value));
        }
    }
    for (name, value) in snapshot.cell_data.text_fields() {
        messages.push((format!("{base_topic}/cell_data/{name}"), value));
    }
    messages
}

fn json_document(snapshot: &Snapshot, timestamp: &str) -> Result<serde_json::Value> {
    let mut cell_data: serde_json::Map<String, serde_json::Value> = snapshot
        .cell_data
        .fields()
        .into_iter()
        .map(|(name, value)| (name, json!(value)))
        .collect();
    cell_data.insert(
        "Uptime".to_string(),
        json!(snapshot.cell_data.uptime.to_string()),
    );
    Ok(json!({
        "timestamp": timestamp,
        "info": serde_json::to_value(&snapshot.info)?,
        "cell_data": cell_data,
    }))
}

fn print_console(snapshot: &Snapshot) {
    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
    if let Some(info) = &snapshot.info {
        for (name, value) in info.fields() {
            println!("{name}: {value}");
        }
    }
    for (name, value) in snapshot.cell_data.text_fields() {
        println!("{name}: {value}");
    }
    println!("--------------------------");
}

async fn publish(
    publisher: &mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    snapshot: &Snapshot,
) -> Result<()> {
    match format {
        commandline::MqttFormat::Json => {
            let document = json_document(snapshot, &chrono::Utc::now().to_rfc3339())?;
            let json_payload = serde_json::to_string(&document)
                .with_context(|| "Failed to serialize data to JSON string")?;
            info!("MQTT output: Attempting to publish data: {json_payload}");
            publisher.publish(publisher.topic(), &json_payload).await?;
            info!("Successfully published data to MQTT.");
        }
        commandline::MqttFormat::Simple => {
            for (topic, payload) in simple_messages(publisher.topic(), snapshot) {
                if let Err(e) = publisher.publish(&topic, &payload).await {
                    error!("Failed to publish message to topic {topic}: {e}");
                }
            }
        }
    }
    Ok(())
}

async fn fetch(config: &BleConfig, timeout: Duration) -> Result<Snapshot> {
    let mut bms = JkBms::connect(config)
        .await
        .with_context(|| format!("Cannot connect to '{}'", config.device_name))?;
    let snapshot = bms.fetch(timeout).await;
    if let Err(e) = bms.disconnect().await {
        warn!("Failed to disconnect: {e}");
    }
    snapshot.with_context(|| "Cannot fetch cell data")
}

pub async fn run(
    config: BleConfig,
    timeout: Duration,
    output: commandline::DaemonOutput,
    interval: Duration,
    error_backoff: Duration,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, error_backoff={error_backoff:?}"
    );

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let snapshot = match fetch(&config, timeout).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Fetching failed, retrying in {error_backoff:?}: {e:#}");
                tokio::time::sleep(error_backoff).await;
                continue;
            }
        };

        match &output {
            commandline::DaemonOutput::Console => print_console(&snapshot),
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mqtt_publisher {
                    if let Err(e) = publish(publisher, format, &snapshot).await {
                        error!("Failed to publish data to MQTT: {e:#}");
                    }
                } else {
                    warn!(
                        "MQTT output selected, but publisher is not initialized. Skipping publish."
                    );
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jkbms_lib::decode::Uptime;
    use jkbms_lib::{CellData, CellEncoding, Info};

    fn snapshot(with_info: bool) -> Snapshot {
        let info = Info {
            vendor_id: "JK_B2A24S15P".to_string(),
            hardware_version: "10.XW".to_string(),
            software_version: "10.07".to_string(),
            uptime: Uptime(93784),
            power_up_count: 5,
            device_name: "JK-B2A24S".to_string(),
            pass_code: "1234".to_string(),
        };
        let cell_data = CellData {
            encoding: CellEncoding::TwoByte,
            cell_voltages: vec![3.3, 3.31],
            wire_resistances: vec![0.05],
            total_voltage: 6.61,
            cell_high: 3.31,
            cell_low: 3.3,
            cell_diff: 0.01,
            average_cell_voltage: Some(3.305),
            delta_cell_voltage: Some(0.01),
            balancer_current: None,
            pack_voltage: 6.61,
            pack_power: 12.123456,
            balance_current: -1.5,
            temperature_1: 21.5,
            temperature_2: 20.0,
            mos_temperature: 30.1,
            state_of_charge: 87,
            remaining_capacity: 180.0,
            nominal_capacity: 280.0,
            cycle_count: 42,
            cycle_capacity: 11760.0,
            uptime: Uptime(93784),
            charge: 0.0,
            discharge: 0.0,
            unknown: vec![Some(0.007), None],
        };
        Snapshot {
            info: with_info.then_some(info),
            cell_data,
        }
    }

    #[test]
    fn simple_topics() {
        let messages = simple_messages("jkbms", &snapshot(true));
        let payload = |topic: &str| {
            messages
                .iter()
                .find(|(t, _)| t == topic)
                .map(|(_, payload)| payload.as_str())
        };
        assert_eq!(payload("jkbms/info/DeviceName"), Some("JK-B2A24S"));
        assert_eq!(payload("jkbms/info/Uptime"), Some("1D2H3M4S"));
        assert_eq!(payload("jkbms/cell_data/B2"), Some("3.31"));
        assert_eq!(payload("jkbms/cell_data/Pack_Power"), Some("12.1235"));
        assert_eq!(payload("jkbms/cell_data/Uptime"), Some("1D2H3M4S"));
        assert_eq!(payload("jkbms/cell_data/unknown_1"), Some("0.007"));
        assert_eq!(payload("jkbms/cell_data/unknown_2"), None);
        assert_eq!(payload("jkbms/cell_data/Balancer_Current"), None);
        assert!(messages.iter().all(|(_, payload)| payload != "1234"));

        let messages = simple_messages("jkbms", &snapshot(false));
        assert!(messages
            .iter()
            .all(|(topic, _)| topic.starts_with("jkbms/cell_data/")));
    }

    #[test]
    fn json_format() {
        let document = json_document(&snapshot(true), "2024-01-01T00:00:00+00:00").unwrap();
        assert_eq!(document["timestamp"], "2024-01-01T00:00:00+00:00");
        assert_eq!(document["info"]["device_name"], "JK-B2A24S");
        assert!(document["info"].get("pass_code").is_none());
        assert_eq!(document["cell_data"]["Total"], 6.61);
        assert_eq!(document["cell_data"]["SOC"], 87.0);
        assert_eq!(document["cell_data"]["Uptime"], "1D2H3M4S");

        let document = json_document(&snapshot(false), "now").unwrap();
        assert!(document["info"].is_null());
    }
}
