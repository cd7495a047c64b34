//! Writes engine events to the terminal.
//!
//! In log mode every event becomes a `tracing` line. In JSON mode each event
//! is printed to stdout as one object, tagged with a timestamp and the
//! device's alias, so the output can be piped into other tools.

use std::collections::HashMap;

use aranet_refresh::transport::normalize_identifier;
use aranet_refresh::{DeviceEvent, EventReceiver};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{Config, OutputFormat};

/// One line of JSON output.
#[derive(Debug, Serialize)]
struct JsonLine<'a> {
    at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<&'a str>,
    #[serde(flatten)]
    event: &'a DeviceEvent,
}

/// Consumes engine events and writes them out.
#[derive(Debug, Clone)]
pub struct EventSink {
    format: OutputFormat,
    aliases: HashMap<String, String>,
}

impl EventSink {
    /// A sink with no aliases.
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            aliases: HashMap::new(),
        }
    }

    /// A sink using the format and aliases from `config`.
    pub fn from_config(config: &Config) -> Self {
        let aliases = config
            .devices
            .iter()
            .filter_map(|d| {
                d.alias
                    .as_ref()
                    .map(|alias| (normalize_identifier(&d.identifier), alias.clone()))
            })
            .collect();
        Self {
            format: config.output.format,
            aliases,
        }
    }

    fn alias(&self, device: &str) -> Option<&str> {
        self.aliases
            .get(&normalize_identifier(device))
            .map(String::as_str)
    }

    /// Label used for `device` in log output.
    fn label<'a>(&'a self, device: &'a str) -> &'a str {
        self.alias(device).unwrap_or(device)
    }

    /// Render an event as a JSON line.
    pub fn render_json(
        &self,
        event: &DeviceEvent,
        at: OffsetDateTime,
    ) -> serde_json::Result<String> {
        let line = JsonLine {
            at: at.format(&Rfc3339).unwrap_or_else(|_| at.to_string()),
            alias: self.alias(event.device()),
            event,
        };
        serde_json::to_string(&line)
    }

    /// Render an event as a human-readable message.
    pub fn describe(&self, event: &DeviceEvent) -> String {
        let device = self.label(event.device());
        match event {
            DeviceEvent::Reading { reading, .. } => format!("{}: {}", device, reading),
            DeviceEvent::IntervalSetting { text, .. } => {
                format!("{}: measurement interval is {}", device, text)
            }
            DeviceEvent::DeviceInfoUpdated { info, .. } => {
                let name = if info.display_name.is_empty() {
                    "unnamed"
                } else {
                    info.display_name.as_str()
                };
                if info.model.is_empty() {
                    format!("{}: device info updated ({})", device, name)
                } else {
                    format!(
                        "{}: device info updated ({}, {} firmware {})",
                        device, name, info.model, info.firmware_version
                    )
                }
            }
            DeviceEvent::AvailabilityChanged {
                available: true, ..
            } => format!("{}: available", device),
            DeviceEvent::AvailabilityChanged { reason, .. } => format!(
                "{}: unavailable ({})",
                device,
                reason.as_deref().unwrap_or("unknown")
            ),
            DeviceEvent::CycleFailed {
                error,
                retry_in_secs,
                failures,
                ..
            } => format!(
                "{}: refresh failed ({}), retry {} in {}s",
                device, error, failures, retry_in_secs
            ),
            other => format!("{}: {:?}", device, other),
        }
    }

    /// Write a single event.
    pub fn emit(&self, event: &DeviceEvent) {
        match self.format {
            OutputFormat::Log => match event {
                DeviceEvent::AvailabilityChanged {
                    available: false, ..
                }
                | DeviceEvent::CycleFailed { .. } => warn!("{}", self.describe(event)),
                _ => info!("{}", self.describe(event)),
            },
            OutputFormat::Json => match self.render_json(event, OffsetDateTime::now_utc()) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
        }
    }

    /// Drain `rx` until every sender is gone.
    pub async fn run(self, mut rx: EventReceiver) {
        loop {
            match rx.recv().await {
                Ok(event) => self.emit(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event output fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use aranet_refresh::{EventDispatcher, SensorReading};

    use super::*;
    use crate::config::DeviceConfig;

    fn reading() -> SensorReading {
        SensorReading {
            co2: 800,
            temperature: 22.5,
            pressure: 1013.2,
            humidity: 45,
            battery: 85,
            interval: 300,
            age: 120,
        }
    }

    /// 2024-03-01T12:00:00Z
    fn noon() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_709_294_400).unwrap()
    }

    fn sink_with_alias(format: OutputFormat) -> EventSink {
        let config = Config {
            output: crate::config::OutputSection { format },
            devices: vec![DeviceConfig {
                identifier: "AA:BB:CC:DD:EE:FF".to_string(),
                alias: Some("Office".to_string()),
            }],
            ..Config::default()
        };
        EventSink::from_config(&config)
    }

    #[test]
    fn test_json_line_shape() {
        let sink = sink_with_alias(OutputFormat::Json);
        let event = DeviceEvent::IntervalSetting {
            device: "aa:bb:cc:dd:ee:ff".to_string(),
            text: "5 minutes".to_string(),
        };

        let line = sink.render_json(&event, noon()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["at"], "2024-03-01T12:00:00Z");
        assert_eq!(value["alias"], "Office");
        assert_eq!(value["type"], "interval_setting");
        assert_eq!(value["text"], "5 minutes");
    }

    #[test]
    fn test_json_line_without_alias() {
        let sink = EventSink::new(OutputFormat::Json);
        let event = DeviceEvent::Reading {
            device: "11:22".to_string(),
            reading: reading(),
        };

        let line = sink.render_json(&event, noon()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert!(value.get("alias").is_none());
        assert_eq!(value["device"], "11:22");
        assert_eq!(value["reading"]["co2"], 800);
    }

    #[test]
    fn test_describe_uses_alias() {
        let sink = sink_with_alias(OutputFormat::Log);
        let text = sink.describe(&DeviceEvent::AvailabilityChanged {
            device: "AA:BB:CC:DD:EE:FF".to_string(),
            available: false,
            reason: Some("last seen: 3 minutes ago".to_string()),
        });
        assert_eq!(text, "Office: unavailable (last seen: 3 minutes ago)");
    }

    #[test]
    fn test_alias_matches_any_identifier_spelling() {
        let config = Config {
            devices: vec![DeviceConfig {
                identifier: "aabbccddeeff".to_string(),
                alias: Some("Bedroom".to_string()),
            }],
            ..Config::default()
        };
        let sink = EventSink::from_config(&config);
        let event = DeviceEvent::IntervalSetting {
            device: "AA:BB:CC:DD:EE:FF".to_string(),
            text: "1 minute".to_string(),
        };

        let line = sink.render_json(&event, noon()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["alias"], "Bedroom");
        assert_eq!(
            sink.describe(&event),
            "Bedroom: measurement interval is 1 minute"
        );
    }

    #[test]
    fn test_describe_cycle_failure() {
        let sink = EventSink::new(OutputFormat::Log);
        let text = sink.describe(&DeviceEvent::CycleFailed {
            device: "AA:BB".to_string(),
            error: "Not connected".to_string(),
            retry_in_secs: 10,
            failures: 2,
        });
        assert_eq!(text, "AA:BB: refresh failed (Not connected), retry 2 in 10s");
    }

    #[tokio::test]
    async fn test_run_ends_when_senders_dropped() {
        let dispatcher = EventDispatcher::new(8);
        let rx = dispatcher.subscribe();
        let task = tokio::spawn(EventSink::new(OutputFormat::Log).run(rx));

        dispatcher.send(DeviceEvent::IntervalSetting {
            device: "AA:BB".to_string(),
            text: "1 minute".to_string(),
        });
        drop(dispatcher);

        task.await.unwrap();
    }
}
