//! The value-sharing protocol spoken over the adapter comm.
//!
//! The in-kernel handler exchanges JSON envelopes inside `comm_msg.data`:
//! the payload is a map with a `commandOrEvent` key holding a JSON string
//! of `{ commandType/eventType, command/event }`, camelCase throughout.
//! Decode is total — malformed payloads become [`AdapterProtocolError`],
//! never a panic, and negotiation treats them as "capability absent".

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::message::CommData;

/// Key under which the JSON-encoded envelope travels in `comm_msg.data`.
const PAYLOAD_KEY: &str = "commandOrEvent";

/// Errors decoding an adapter protocol payload.
#[derive(Debug, Error)]
pub enum AdapterProtocolError {
    #[error("comm payload has no '{PAYLOAD_KEY}' entry")]
    MissingPayload,

    #[error("comm payload envelope has no event type")]
    MissingEventType,

    #[error("comm payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown adapter event type: {0}")]
    UnknownEvent(String),
}

/// A value rendered for transfer, tagged with its mime type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedValue {
    pub mime_type: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Name and native type of an in-kernel variable, as the kernel reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelValueInfo {
    pub name: String,
    #[serde(default)]
    pub native_type: Option<String>,
}

/// Commands sent to the in-kernel handler.
#[derive(Clone, Debug)]
pub enum ValueAdapterCommand {
    RequestValue { name: String, mime_type: String },
    RequestValueInfos,
    SendValue { name: String, formatted_value: FormattedValue },
}

impl ValueAdapterCommand {
    /// The handler-side command type name.
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::RequestValue { .. } => "RequestValue",
            Self::RequestValueInfos => "RequestValueInfos",
            Self::SendValue { .. } => "SendValue",
        }
    }

    /// Encode into a `comm_msg.data` payload.
    pub fn to_comm_data(&self) -> Result<CommData, AdapterProtocolError> {
        let command = match self {
            Self::RequestValue { name, mime_type } => {
                json!({ "name": name, "mimeType": mime_type })
            }
            Self::RequestValueInfos => json!({}),
            Self::SendValue { name, formatted_value } => {
                json!({ "name": name, "formattedValue": formatted_value })
            }
        };
        let envelope = json!({
            "commandType": self.command_type(),
            "command": command,
        });

        let mut data = CommData::new();
        data.insert(PAYLOAD_KEY.to_string(), Value::String(envelope.to_string()));
        Ok(data)
    }
}

/// Events received from the in-kernel handler.
#[derive(Clone, Debug)]
pub enum ValueAdapterEvent {
    /// The handler finished initializing; the negotiation ack.
    KernelReady,
    CommandSucceeded,
    CommandFailed {
        message: String,
    },
    ValueProduced {
        name: String,
        value: Value,
        formatted_value: FormattedValue,
    },
    ValueInfosProduced {
        value_infos: Vec<KernelValueInfo>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueProducedBody {
    name: String,
    #[serde(default)]
    value: Value,
    formatted_value: FormattedValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueInfosProducedBody {
    #[serde(default)]
    value_infos: Vec<KernelValueInfo>,
}

#[derive(Deserialize)]
struct CommandFailedBody {
    #[serde(default)]
    message: String,
}

impl ValueAdapterEvent {
    /// Decode from a `comm_msg.data` payload.
    ///
    /// The envelope may carry extra keys (the handler echoes the causing
    /// command); only `eventType` and `event` are consulted.
    pub fn from_comm_data(data: &CommData) -> Result<Self, AdapterProtocolError> {
        let payload = data
            .get(PAYLOAD_KEY)
            .and_then(Value::as_str)
            .ok_or(AdapterProtocolError::MissingPayload)?;

        let envelope: Value = serde_json::from_str(payload)?;
        let event_type = envelope
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or(AdapterProtocolError::MissingEventType)?;
        let body = envelope.get("event").cloned().unwrap_or_else(|| json!({}));

        match event_type {
            "KernelReady" => Ok(Self::KernelReady),
            "CommandSucceeded" => Ok(Self::CommandSucceeded),
            "CommandFailed" => {
                let body: CommandFailedBody = serde_json::from_value(body)?;
                Ok(Self::CommandFailed { message: body.message })
            }
            "ValueProduced" => {
                let body: ValueProducedBody = serde_json::from_value(body)?;
                Ok(Self::ValueProduced {
                    name: body.name,
                    value: body.value,
                    formatted_value: body.formatted_value,
                })
            }
            "ValueInfosProduced" => {
                let body: ValueInfosProducedBody = serde_json::from_value(body)?;
                Ok(Self::ValueInfosProduced { value_infos: body.value_infos })
            }
            other => Err(AdapterProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm_data_for(envelope: Value) -> CommData {
        let mut data = CommData::new();
        data.insert(PAYLOAD_KEY.to_string(), Value::String(envelope.to_string()));
        data
    }

    #[test]
    fn decodes_kernel_ready_ack() {
        // The handler sends `event: null` and echoes `command` for unit events.
        let data = comm_data_for(json!({ "eventType": "KernelReady", "event": null, "command": null }));
        let event = ValueAdapterEvent::from_comm_data(&data).unwrap();
        assert!(matches!(event, ValueAdapterEvent::KernelReady));
    }

    #[test]
    fn decodes_value_produced() {
        let data = comm_data_for(json!({
            "eventType": "ValueProduced",
            "event": {
                "name": "x",
                "value": 42,
                "formattedValue": { "mimeType": "application/json", "value": null }
            }
        }));
        match ValueAdapterEvent::from_comm_data(&data).unwrap() {
            ValueAdapterEvent::ValueProduced { name, value, formatted_value } => {
                assert_eq!(name, "x");
                assert_eq!(value, json!(42));
                assert_eq!(formatted_value.mime_type, "application/json");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_value_infos_produced() {
        let data = comm_data_for(json!({
            "eventType": "ValueInfosProduced",
            "event": { "valueInfos": [{ "name": "df", "nativeType": "<class 'pandas.DataFrame'>" }] }
        }));
        match ValueAdapterEvent::from_comm_data(&data).unwrap() {
            ValueAdapterEvent::ValueInfosProduced { value_infos } => {
                assert_eq!(value_infos.len(), 1);
                assert_eq!(value_infos[0].name, "df");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn missing_payload_key_is_an_error() {
        let err = ValueAdapterEvent::from_comm_data(&CommData::new()).unwrap_err();
        assert!(matches!(err, AdapterProtocolError::MissingPayload));
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        let mut data = CommData::new();
        data.insert(PAYLOAD_KEY.to_string(), Value::String("{not json".into()));
        assert!(ValueAdapterEvent::from_comm_data(&data).is_err());
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let data = comm_data_for(json!({ "eventType": "SomethingElse", "event": {} }));
        assert!(matches!(
            ValueAdapterEvent::from_comm_data(&data).unwrap_err(),
            AdapterProtocolError::UnknownEvent(_)
        ));
    }

    #[test]
    fn command_encodes_with_camel_case_tags() {
        let cmd = ValueAdapterCommand::RequestValue {
            name: "df".into(),
            mime_type: "application/json".into(),
        };
        let data = cmd.to_comm_data().unwrap();
        let payload = data.get(PAYLOAD_KEY).and_then(Value::as_str).unwrap();
        assert!(payload.contains("\"commandType\":\"RequestValue\""));
        assert!(payload.contains("\"mimeType\""));
    }

    #[test]
    fn send_value_encodes_the_formatted_value() {
        let cmd = ValueAdapterCommand::SendValue {
            name: "x".into(),
            formatted_value: FormattedValue {
                mime_type: "application/json".into(),
                value: Some(Value::String("[1, 2]".into())),
            },
        };
        let data = cmd.to_comm_data().unwrap();
        let payload = data.get(PAYLOAD_KEY).and_then(Value::as_str).unwrap();
        assert!(payload.contains("\"commandType\":\"SendValue\""));
        assert!(payload.contains("\"formattedValue\""));
        assert!(payload.contains("\"mimeType\":\"application/json\""));
    }
}
