//! Line-delimited JSON messages exchanged with a device.
//!
//! Every line is one [`Envelope`]:
//! ```text
//! {"id": "1", "type": "start_run", "msg": {"op_time": 100000, "sample_rate": 100000}}
//! ```
//! and is answered by exactly one [`Reply`] carrying the same `id` and
//! `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::circuit::ConfigTree;
use crate::error::{HybridError, Result};

/// Raw request as read from the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub msg: Value,
}

/// Payload of `set_circuit`/`set_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCircuit {
    /// Entity path of the addressed device; empty addresses the emulated one
    #[serde(default)]
    pub entity: Vec<String>,
    pub config: ConfigTree,
}

/// Payload of `start_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRun {
    /// Operation time in nanoseconds
    pub op_time: u64,
    /// ADC sample rate in Hz
    pub sample_rate: u64,
}

/// Requests understood by the emulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetEntities,
    ResetCircuit,
    SetCircuit(SetCircuit),
    GetCircuit,
    StartRun(StartRun),
}

impl Request {
    /// Decode the payload of a request of the given type.
    pub fn parse(kind: &str, msg: Value) -> Result<Self> {
        let request = match kind {
            "get_entities" => Request::GetEntities,
            "reset_circuit" => Request::ResetCircuit,
            "set_circuit" | "set_config" => Request::SetCircuit(serde_json::from_value(msg)?),
            "get_circuit" => Request::GetCircuit,
            "start_run" => Request::StartRun(serde_json::from_value(msg)?),
            other => {
                return Err(HybridError::UnknownRequest {
                    kind: other.to_string(),
                })
            }
        };
        Ok(request)
    }

    /// Wire name of the request type.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetEntities => "get_entities",
            Request::ResetCircuit => "reset_circuit",
            Request::SetCircuit(_) => "set_circuit",
            Request::GetCircuit => "get_circuit",
            Request::StartRun(_) => "start_run",
        }
    }
}

impl TryFrom<Envelope> for Request {
    type Error = HybridError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        Request::parse(&envelope.kind, envelope.msg)
    }
}

/// Answer to a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub msg: Value,
}

impl Reply {
    pub fn ok(id: Option<String>, kind: impl Into<String>, msg: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            error: None,
            msg,
        }
    }

    pub fn error(id: Option<String>, kind: impl Into<String>, error: &HybridError) -> Self {
        Self {
            id,
            kind: kind.into(),
            error: Some(error.to_string()),
            msg: Value::Null,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_requests() {
        assert_eq!(Request::parse("get_entities", Value::Null).unwrap(), Request::GetEntities);

        let run = Request::parse("start_run", json!({"op_time": 1000, "sample_rate": 10})).unwrap();
        assert_eq!(
            run,
            Request::StartRun(StartRun {
                op_time: 1000,
                sample_rate: 10
            })
        );

        let set = Request::parse("set_config", json!({"config": {"M1": {"multipliers": [true, false, false, false]}}}))
            .unwrap();
        let Request::SetCircuit(set) = set else {
            panic!("expected set_circuit");
        };
        assert!(set.entity.is_empty());
        assert_eq!(set.config.m1.unwrap().multipliers, [true, false, false, false]);
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(matches!(
            Request::parse("reboot", Value::Null).unwrap_err(),
            HybridError::UnknownRequest { .. }
        ));
        assert!(matches!(
            Request::parse("start_run", json!({"op_time": -1})).unwrap_err(),
            HybridError::Json(_)
        ));
    }

    #[test]
    fn test_envelope_and_reply_wire_names() {
        let envelope: Envelope = serde_json::from_str(r#"{"type": "get_circuit"}"#).unwrap();
        assert_eq!(envelope.kind, "get_circuit");
        assert!(envelope.id.is_none());
        assert_eq!(Request::try_from(envelope).unwrap().kind(), "get_circuit");

        let reply = Reply::ok(Some("7".into()), "get_circuit", json!({}));
        let line = serde_json::to_string(&reply).unwrap();
        assert_eq!(line, r#"{"id":"7","type":"get_circuit","msg":{}}"#);
    }
}
