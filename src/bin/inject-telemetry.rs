//! BMS Telemetry Injection Utility
//!
//! Publishes one sample telemetry payload (or any JSON you pass) to
//! `<base-topic>/<device-id>` so a running ingestor can be checked end to
//! end.
//!
//! ## Usage
//!
//! ```bash
//! # Sample telemetry for a 16-cell pack
//! inject-telemetry --device-id PACK007 --cells 16
//!
//! # Arbitrary payload
//! inject-telemetry --device-id PACK007 --payload '{"fault": "overheat"}'
//!
//! # Non-default broker and topic
//! inject-telemetry --broker-host mqtt.local --broker-port 1884 \
//!   --base-topic bms/telemetry --device-id PACK001
//! ```

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};

#[derive(Parser)]
#[command(
    name = "inject-telemetry",
    about = "Publish a sample BMS telemetry message for end-to-end checks"
)]
struct Args {
    /// Device serial used as the final topic segment
    #[arg(long, required = true)]
    device_id: String,

    /// Topic prefix the ingestor subscribes under
    #[arg(long, default_value = "bms/telemetry")]
    base_topic: String,

    /// Number of cells in the generated sample
    #[arg(long, default_value = "16")]
    cells: usize,

    /// Publish this JSON instead of a generated sample
    #[arg(long)]
    payload: Option<String>,

    /// MQTT broker host
    #[arg(long, default_value = "localhost", env = "MQTT_HOST")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883", env = "MQTT_PORT")]
    broker_port: u16,

    /// Seconds to wait for the broker to acknowledge
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

/// A plausible reading: voltages around 3.3 V, SoC and temperature varying
/// slightly per cell.
fn sample_telemetry(cells: usize) -> Value {
    let cell_voltages: Vec<f64> = (0..cells)
        .map(|i| 3.300 + (i % 7) as f64 * 0.004)
        .collect();
    let cell_socs: Vec<u32> = (0..cells).map(|i| 78 + (i % 5) as u32).collect();
    let cell_temperatures: Vec<f64> = (0..cells).map(|i| 24.5 + (i % 4) as f64 * 0.5).collect();

    json!({
        "cell_voltages": cell_voltages,
        "cell_socs": cell_socs,
        "cell_temperatures": cell_temperatures,
        "created_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

fn device_topic(base: &str, device_id: &str) -> String {
    format!("{}/{}", base.trim().trim_end_matches('/'), device_id.trim())
}

async fn publish(args: &Args, topic: &str, payload: String) -> Result<(), Box<dyn std::error::Error>> {
    let client_id = format!("inject-telemetry-{}", uuid::Uuid::new_v4().simple());
    let mut options = MqttOptions::new(client_id, &args.broker_host, args.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Ok(username), Ok(password)) = (
        std::env::var("MQTT_USERNAME"),
        std::env::var("MQTT_PASSWORD"),
    ) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client
        .publish(topic, QoS::AtLeastOnce, false, payload)
        .await?;

    println!(
        "Connecting to MQTT broker {}:{}...",
        args.broker_host, args.broker_port
    );
    let wait = timeout(Duration::from_secs(args.timeout_secs), async {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => println!("Connected"),
                Event::Incoming(Packet::PubAck(_)) => return Ok::<(), rumqttc::ConnectionError>(()),
                _ => {}
            }
        }
    })
    .await;

    match wait {
        Ok(Ok(())) => {
            client.disconnect().await.ok();
            Ok(())
        }
        Ok(Err(e)) => Err(format!("broker connection failed: {e}").into()),
        Err(_) => Err("broker did not acknowledge the publish in time".into()),
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let payload = match &args.payload {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("✗ Invalid payload JSON: {e}");
                std::process::exit(1);
            }
        },
        None => sample_telemetry(args.cells),
    };

    let topic = device_topic(&args.base_topic, &args.device_id);
    println!("\n📤 Publishing to {topic}");
    println!("   {payload}");

    if let Err(e) = publish(&args, &topic, payload.to_string()).await {
        eprintln!("✗ Failed to publish telemetry: {e}");
        std::process::exit(1);
    }
    println!("✓ Telemetry published");
}
