//! Event rendering: colored text lines or JSON lines.

use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use serde::Serialize;

use gattlink_core::{ConnectionEvent, ConnectionState};

use crate::cli::{ColorMode, GlobalOpts, OutputFormat};
use crate::error::CliError;

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a ConnectionEvent,
}

/// Writes one line per event to stdout.
pub struct EventPrinter {
    format: OutputFormat,
    color: bool,
    quiet: bool,
}

impl EventPrinter {
    pub fn new(global: &GlobalOpts) -> Self {
        Self {
            format: global.output,
            color: should_color(global.color),
            quiet: global.quiet,
        }
    }

    pub fn print(&self, event: &ConnectionEvent) -> Result<(), CliError> {
        if self.quiet {
            return Ok(());
        }
        let line = self.render(event, Utc::now())?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{line}")?;
        Ok(())
    }

    fn render(&self, event: &ConnectionEvent, at: DateTime<Utc>) -> Result<String, CliError> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string(&EventLine {
                timestamp: at,
                event,
            })?),
            OutputFormat::Text => Ok(format!(
                "{}  {}  {}",
                at.to_rfc3339_opts(SecondsFormat::Millis, true),
                event.identity(),
                self.describe(event)
            )),
        }
    }

    fn describe(&self, event: &ConnectionEvent) -> String {
        let plain = match event {
            ConnectionEvent::StateChanged { state, .. } => format!("→ {state}"),
            ConnectionEvent::ConnectFailed { reason, .. } => format!("connect failed: {reason}"),
            ConnectionEvent::ConnectTimeout { kind, .. } => format!("timeout: {kind}"),
        };
        if !self.color {
            return plain;
        }
        match event {
            ConnectionEvent::StateChanged { state, .. } => match state {
                ConnectionState::ServiceDiscovered => plain.green().bold().to_string(),
                ConnectionState::Disconnected | ConnectionState::Released => {
                    plain.dimmed().to_string()
                }
                _ => plain.cyan().to_string(),
            },
            ConnectionEvent::ConnectFailed { .. } => plain.red().to_string(),
            ConnectionEvent::ConnectTimeout { .. } => plain.yellow().to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gattlink_core::{DeviceIdentity, TimeoutKind};

    fn printer(format: OutputFormat) -> EventPrinter {
        EventPrinter {
            format,
            color: false,
            quiet: false,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn tag() -> DeviceIdentity {
        DeviceIdentity::parse("AA:BB:CC:DD:EE:01", "Tag").unwrap()
    }

    #[test]
    fn json_line_flattens_event() {
        let event = ConnectionEvent::ConnectTimeout {
            identity: tag(),
            kind: TimeoutKind::DeviceNotFound,
        };
        let line = printer(OutputFormat::Json).render(&event, at()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "connect_timeout");
        assert_eq!(value["kind"], "device_not_found");
        assert_eq!(value["timestamp"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn text_line_names_device_and_state() {
        let event = ConnectionEvent::StateChanged {
            identity: tag(),
            state: ConnectionState::Connecting,
        };
        let line = printer(OutputFormat::Text).render(&event, at()).unwrap();

        assert!(line.starts_with("2026-01-02T03:04:05.000Z"));
        assert!(line.contains("Tag (AA:BB:CC:DD:EE:01)"));
        assert!(line.ends_with("→ connecting"));
    }
}
