use core::str::FromStr;

use embedded_hal::digital::OutputPin;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{CommandError, INVALID_JSON, MISSING_FIELDS},
    relay::{RelayEngine, RelayTransition},
    types::ChannelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    On,
    Off,
    Reset,
}

impl RelayAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Reset => "RESET",
        }
    }
}

impl FromStr for RelayAction {
    type Err = CommandError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("ON") {
            Ok(Self::On)
        } else if value.eq_ignore_ascii_case("OFF") {
            Ok(Self::Off)
        } else if value.eq_ignore_ascii_case("RESET") {
            Ok(Self::Reset)
        } else {
            Err(CommandError::InvalidAction(value.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    pub channel: ChannelId,
    pub action: RelayAction,
}

#[derive(Debug, Deserialize)]
struct RawRelayCommand {
    #[serde(alias = "relay")]
    channel: Option<i64>,
    action: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawActionPayload {
    action: Option<Value>,
}

/// Device-level requests on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    PublishStatus,
    Relay(RelayCommand),
}

#[derive(Debug, Deserialize)]
struct RawDeviceCommand {
    command: Option<String>,
}

/// Parses `{"channel"|"relay": n, "action": "ON"|"OFF"|"RESET"}`.
pub fn parse_relay_command(payload: &[u8]) -> Result<RelayCommand, CommandError> {
    let raw: RawRelayCommand = serde_json::from_slice(payload).map_err(invalid_json)?;

    let Some(channel) = raw.channel else {
        return Err(CommandError::MalformedCommand(MISSING_FIELDS.to_string()));
    };
    let channel = ChannelId::try_from(channel)?;
    let action = parse_action_value(raw.action)?;

    Ok(RelayCommand { channel, action })
}

/// Parses a per-channel control payload: a bare action or `{"action": "..."}`.
pub fn parse_action_payload(payload: &str) -> Result<RelayAction, CommandError> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return trimmed.parse();
    }

    let raw: RawActionPayload = serde_json::from_str(trimmed).map_err(invalid_json)?;
    parse_action_value(raw.action)
}

pub fn parse_device_command(payload: &[u8]) -> Result<DeviceCommand, CommandError> {
    let raw: RawDeviceCommand = serde_json::from_slice(payload).map_err(invalid_json)?;

    match raw.command.as_deref() {
        Some(command) if command.eq_ignore_ascii_case("status") => {
            Ok(DeviceCommand::PublishStatus)
        }
        Some(other) => Err(CommandError::InvalidAction(other.to_string())),
        None => parse_relay_command(payload).map(DeviceCommand::Relay),
    }
}

// Any JSON type is accepted here so that `{"action": 5}` reads as an unknown action.
fn parse_action_value(action: Option<Value>) -> Result<RelayAction, CommandError> {
    match action {
        Some(Value::String(action)) => action.parse(),
        Some(other) => Err(CommandError::InvalidAction(other.to_string())),
        None => Err(CommandError::InvalidAction(String::new())),
    }
}

fn invalid_json(err: serde_json::Error) -> CommandError {
    debug!("unparseable command payload: {err}");
    CommandError::MalformedCommand(INVALID_JSON.to_string())
}

/// Applies an already validated command to the engine.
pub fn dispatch<P: OutputPin>(
    engine: &RelayEngine<P>,
    command: RelayCommand,
    now_ms: u64,
) -> RelayTransition {
    match command.action {
        RelayAction::On => engine.activate(command.channel, now_ms),
        RelayAction::Off => engine.deactivate(command.channel, now_ms),
        RelayAction::Reset => engine.reset(command.channel, now_ms),
    }
}

/// Parse, validate and apply in one step; rejected payloads leave the engine untouched.
pub fn dispatch_payload<P: OutputPin>(
    engine: &RelayEngine<P>,
    payload: &[u8],
    now_ms: u64,
) -> Result<(RelayCommand, RelayTransition), CommandError> {
    let command = parse_relay_command(payload)?;
    Ok((command, dispatch(engine, command, now_ms)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_relay_key_from_web_clients() {
        let command = parse_relay_command(br#"{"relay": 2, "action": "RESET"}"#).unwrap();

        assert_eq!(
            command,
            RelayCommand {
                channel: ChannelId::TWO,
                action: RelayAction::Reset,
            }
        );
    }

    #[test]
    fn parses_channel_key() {
        let command = parse_relay_command(br#"{"channel": 1, "action": "on"}"#).unwrap();

        assert_eq!(command.channel, ChannelId::ONE);
        assert_eq!(command.action, RelayAction::On);
    }

    #[test]
    fn rejects_out_of_range_channel() {
        assert_eq!(
            parse_relay_command(br#"{"channel": 3, "action": "ON"}"#),
            Err(CommandError::InvalidChannel(3))
        );
    }

    #[test]
    fn rejects_unknown_or_missing_action() {
        assert_eq!(
            parse_relay_command(br#"{"channel": 1, "action": "TOGGLE"}"#),
            Err(CommandError::InvalidAction("TOGGLE".to_string()))
        );
        assert_eq!(
            parse_relay_command(br#"{"channel": 1}"#),
            Err(CommandError::InvalidAction(String::new()))
        );
    }

    #[test]
    fn rejects_garbage_as_malformed() {
        assert_eq!(
            parse_relay_command(b"not json"),
            Err(CommandError::MalformedCommand(INVALID_JSON.to_string()))
        );
        assert_eq!(
            parse_relay_command(br#"{"channel": "one", "action": "ON"}"#),
            Err(CommandError::MalformedCommand(INVALID_JSON.to_string()))
        );
        assert_eq!(
            parse_relay_command(br#"{"action": "ON"}"#),
            Err(CommandError::MalformedCommand(MISSING_FIELDS.to_string()))
        );
    }

    #[test]
    fn non_string_action_is_an_unknown_action() {
        assert_eq!(
            parse_relay_command(br#"{"relay": 1, "action": 5}"#),
            Err(CommandError::InvalidAction("5".to_string()))
        );
        assert_eq!(
            parse_action_payload(r#"{"action": true}"#),
            Err(CommandError::InvalidAction("true".to_string()))
        );
    }

    #[test]
    fn client_messages_carry_no_payload_detail() {
        let messages = [
            parse_relay_command(br#"{"relay": 7, "action": "ON"}"#),
            parse_relay_command(br#"{"relay": 1, "action": "TOGGLE"}"#),
            parse_relay_command(b"{\"relay\": 1,"),
            parse_relay_command(br#"{"action": "ON"}"#),
        ]
        .map(|result| result.unwrap_err().to_string());

        assert_eq!(
            messages,
            [
                "Invalid relay number",
                "Invalid action",
                "Invalid JSON",
                "Missing required fields",
            ]
        );
    }

    #[test]
    fn control_topic_accepts_bare_and_json_actions() {
        assert_eq!(parse_action_payload("ON"), Ok(RelayAction::On));
        assert_eq!(parse_action_payload(" off\n"), Ok(RelayAction::Off));
        assert_eq!(
            parse_action_payload(r#"{"action":"RESET"}"#),
            Ok(RelayAction::Reset)
        );
        assert_eq!(
            parse_action_payload("BLINK"),
            Err(CommandError::InvalidAction("BLINK".to_string()))
        );
    }

    #[test]
    fn command_topic_status_request() {
        assert_eq!(
            parse_device_command(br#"{"command": "status"}"#),
            Ok(DeviceCommand::PublishStatus)
        );
        assert_eq!(
            parse_device_command(br#"{"relay": 1, "action": "OFF"}"#),
            Ok(DeviceCommand::Relay(RelayCommand {
                channel: ChannelId::ONE,
                action: RelayAction::Off,
            }))
        );
        assert_eq!(
            parse_device_command(br#"{"command": "reboot"}"#),
            Err(CommandError::InvalidAction("reboot".to_string()))
        );
    }
}
