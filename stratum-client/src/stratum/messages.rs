//! Stratum message types and JSON-RPC serialization.
//!
//! This module defines the wire format for the Stratum protocol using serde.
//! Every message is one JSON object on one line. Outbound messages are always
//! [`Request`]s; inbound lines are classified into an [`Incoming`] value by a
//! two-pass decode: a cheap look at whether the object carries a numeric `id`,
//! then a full decode into either a [`Response`] or a [`Notification`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

use crate::error::{Error, Result};

/// Protocol version advertised on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Methods this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
pub enum Method {
    #[strum(serialize = "mining.authorize")]
    Authorize,
    #[strum(serialize = "mining.subscribe")]
    Subscribe,
    #[strum(serialize = "mining.notify")]
    Notify,
    #[strum(serialize = "mining.set_difficulty")]
    SetDifficulty,
    #[strum(serialize = "submit")]
    Submit,
    #[strum(serialize = "mining.ping")]
    Ping,
}

/// Outbound JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Message ID (null for notifications)
    pub id: Option<u64>,
    /// Remote method name
    pub method: String,
    /// Method parameters
    pub params: Value,
    /// Always "2.0"
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

impl Request {
    /// Create a request with the given message ID.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
            jsonrpc: jsonrpc_version(),
        }
    }

    /// Serialize to a single JSON line, without the trailing newline.
    ///
    /// The line codec appends the terminator when the request is written.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error codes defined by the Stratum protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum StratumErrorCode {
    /// 20 - Other/Unknown
    Unknown,
    /// 21 - Job not found (=stale)
    JobNotFound,
    /// 22 - Duplicate share
    DuplicateShare,
    /// 23 - Low difficulty share
    LowDifficultyShare,
    /// 24 - Unauthorized worker
    UnauthorizedWorker,
    /// 25 - Not subscribed
    NotSubscribed,
    /// Anything a pool invents outside the standard range
    Other(i64),
}

impl From<i64> for StratumErrorCode {
    fn from(code: i64) -> Self {
        match code {
            20 => Self::Unknown,
            21 => Self::JobNotFound,
            22 => Self::DuplicateShare,
            23 => Self::LowDifficultyShare,
            24 => Self::UnauthorizedWorker,
            25 => Self::NotSubscribed,
            other => Self::Other(other),
        }
    }
}

impl From<StratumErrorCode> for i64 {
    fn from(code: StratumErrorCode) -> Self {
        match code {
            StratumErrorCode::Unknown => 20,
            StratumErrorCode::JobNotFound => 21,
            StratumErrorCode::DuplicateShare => 22,
            StratumErrorCode::LowDifficultyShare => 23,
            StratumErrorCode::UnauthorizedWorker => 24,
            StratumErrorCode::NotSubscribed => 25,
            StratumErrorCode::Other(other) => other,
        }
    }
}

impl fmt::Display for StratumErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Error object returned by a pool in place of a result.
///
/// Accepts both the structured form `{"code", "message", "traceback"}` and
/// the `[code, "message", traceback]` array form many pools send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(try_from = "RawStratumError")]
#[error("code={code} msg={message} traceback={traceback}")]
pub struct StratumError {
    pub code: StratumErrorCode,
    pub message: String,
    pub traceback: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStratumError {
    Object {
        code: i64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        traceback: Value,
    },
    Array(Vec<Value>),
}

impl TryFrom<RawStratumError> for StratumError {
    type Error = String;

    fn try_from(raw: RawStratumError) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawStratumError::Object {
                code,
                message,
                traceback,
            } => Ok(Self {
                code: code.into(),
                message,
                traceback,
            }),
            RawStratumError::Array(items) => {
                let code = items
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or("error code not an integer")?;
                let message = items
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let traceback = items.get(2).cloned().unwrap_or(Value::Null);
                Ok(Self {
                    code: code.into(),
                    message,
                    traceback,
                })
            }
        }
    }
}

/// Response to a request we issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Message ID matching the request
    pub id: Option<u64>,
    /// Error object (present on failure)
    #[serde(default)]
    pub error: Option<StratumError>,
    /// Method echoed by some pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Params echoed by some pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Response {
    /// Return the result payload, or the pool's error.
    ///
    /// A response with neither yields `Value::Null`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(Error::Pool(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// True when the pool answered with no error and a `true` result.
    pub fn is_accepted(&self) -> bool {
        self.error.is_none() && matches!(self.result, Some(Value::Bool(true)))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Server-initiated message (no id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

impl Incoming {
    /// Classify and decode one line received from the pool.
    ///
    /// Returns [`Error::Json`] if the line is not a JSON object at all, and
    /// [`Error::Protocol`] if it is an object that fits neither shape. The
    /// dispatch loop treats the former as a broken stream and the latter as
    /// a single bad message.
    pub fn parse(line: &str) -> Result<Self> {
        let object: Map<String, Value> = serde_json::from_str(line)?;

        let is_response = matches!(object.get("id"), Some(Value::Number(_)));
        let value = Value::Object(object);

        if is_response {
            serde_json::from_value(value)
                .map(Incoming::Response)
                .map_err(|e| Error::Protocol(format!("bad response: {}, line: {}", e, line)))
        } else {
            serde_json::from_value(value)
                .map(Incoming::Notification)
                .map_err(|e| Error::Protocol(format!("bad notification: {}, line: {}", e, line)))
        }
    }
}

/// Result of the `mining.subscribe` handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Subscription id for mining.notify
    pub notify_id: String,
    /// Subscription id for mining.set_difficulty
    pub set_difficulty_id: String,
    /// Hex nonce prefix issued by the pool
    pub extranonce1: String,
    /// Bytes of nonce2 space the client fills
    pub extranonce2_size: usize,
}

impl Subscribe {
    /// Decode the nested-array subscribe result.
    ///
    /// The subscription pairs live at `result[0][0]` and `result[0][1]`.
    /// Extranonce1 and its size follow them inside `result[0]`; pools using
    /// the conventional layout put them at `result[1]` and `result[2]`
    /// instead.
    pub fn from_result(result: &Value) -> Result<Self> {
        let bad = |what: &str| Error::Protocol(format!("subscribe result: {}: {}", what, result));

        let head = result
            .get(0)
            .and_then(Value::as_array)
            .ok_or_else(|| bad("result[0] not an array"))?;

        let subscription_id = |index: usize| {
            head.get(index)
                .and_then(|pair| pair.get(1))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let notify_id = subscription_id(0).ok_or_else(|| bad("missing notify subscription"))?;
        let set_difficulty_id =
            subscription_id(1).ok_or_else(|| bad("missing set_difficulty subscription"))?;

        let extranonce = |items: &[Value], at: usize| -> Option<(String, usize)> {
            let extranonce1 = items.get(at)?.as_str()?.to_string();
            let size = usize::try_from(items.get(at + 1)?.as_u64()?).ok()?;
            Some((extranonce1, size))
        };

        let root = result.as_array().map(Vec::as_slice).unwrap_or_default();
        let (extranonce1, extranonce2_size) = extranonce(head.as_slice(), 2)
            .or_else(|| extranonce(root, 1))
            .ok_or_else(|| bad("missing extranonce1/extranonce2_size"))?;

        Ok(Self {
            notify_id,
            set_difficulty_id,
            extranonce1,
            extranonce2_size,
        })
    }
}

/// Parameters of a `submit` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    /// Session id
    pub id: String,
    /// Job this share solves
    pub job_id: String,
    /// Hex of the 4 nonce bytes, in buffer order
    pub nonce: String,
    /// Resulting hash, as produced by the miner
    pub result: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new(7, Method::Authorize.as_ref(), json!(["worker", "x"]));
        let line = request.encode().unwrap();
        assert!(!line.ends_with('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "method": "mining.authorize",
                "params": ["worker", "x"],
                "jsonrpc": "2.0"
            })
        );
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Submit.as_ref(), "submit");
        assert_eq!(Method::SetDifficulty.to_string(), "mining.set_difficulty");
        assert_eq!("mining.notify".parse::<Method>().unwrap(), Method::Notify);
        assert!("mining.configure".parse::<Method>().is_err());
    }

    #[test]
    fn test_parse_response_with_result() {
        let incoming = Incoming::parse(r#"{"id":1,"result":true,"error":null}"#).unwrap();
        match incoming {
            Incoming::Response(response) => {
                assert_eq!(response.id, Some(1));
                assert_eq!(response.result, Some(json!(true)));
                assert!(response.error.is_none());
                assert!(response.is_accepted());
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_with_structured_error() {
        let line = r#"{"id":4,"result":null,"error":{"code":21,"message":"Job not found","traceback":null}}"#;
        let Incoming::Response(response) = Incoming::parse(line).unwrap() else {
            panic!("Expected response");
        };
        let error = response.error.clone().expect("error should be present");
        assert_eq!(error.code, StratumErrorCode::JobNotFound);
        assert_eq!(error.message, "Job not found");
        assert!(!response.is_accepted());

        match response.into_result() {
            Err(Error::Pool(e)) => assert_eq!(e.code, StratumErrorCode::JobNotFound),
            other => panic!("Expected pool error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_with_array_error() {
        let line = r#"{"id":5,"result":null,"error":[23,"Low difficulty share",null]}"#;
        let Incoming::Response(response) = Incoming::parse(line).unwrap() else {
            panic!("Expected response");
        };
        let error = response.error.unwrap();
        assert_eq!(error.code, StratumErrorCode::LowDifficultyShare);
        assert_eq!(error.message, "Low difficulty share");
        assert_eq!(
            error.to_string(),
            "code=23 msg=Low difficulty share traceback=null"
        );
    }

    #[test]
    fn test_nonstandard_error_code_preserved() {
        let error: StratumError =
            serde_json::from_value(json!({"code": -3, "message": "Method not found"})).unwrap();
        assert_eq!(error.code, StratumErrorCode::Other(-3));
        assert_eq!(serde_json::to_value(&error).unwrap()["code"], json!(-3));
    }

    #[test]
    fn test_parse_notification_without_id() {
        let line = r#"{"method":"mining.notify","params":{"job_id":"1","blob":"00"}}"#;
        match Incoming::parse(line).unwrap() {
            Incoming::Notification(n) => {
                assert_eq!(n.method, "mining.notify");
                assert_eq!(n.params["job_id"], "1");
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification_with_null_id() {
        let line = r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#;
        assert!(matches!(
            Incoming::parse(line).unwrap(),
            Incoming::Notification(Notification { ref method, .. }) if method == "mining.set_difficulty"
        ));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(Incoming::parse("not json"), Err(Error::Json(_))));
        assert!(matches!(Incoming::parse("[1, 2]"), Err(Error::Json(_))));
    }

    #[test]
    fn test_parse_object_of_neither_shape() {
        // Numeric id but a result-bearing shape with a wrongly typed error.
        assert!(matches!(
            Incoming::parse(r#"{"id":3,"error":"oops"}"#),
            Err(Error::Protocol(_))
        ));
        // No id and no method.
        assert!(matches!(
            Incoming::parse(r#"{"params":[]}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_subscribe_wrapped_layout() {
        let result = json!([[
            ["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"],
            ["mining.set_difficulty", "b4b6693b72a50c7116db18d6497cac52"],
            "08000002",
            4
        ]]);
        let sub = Subscribe::from_result(&result).unwrap();
        assert_eq!(sub.notify_id, "ae6812eb4cd7735a302a8a9dd95cf71f");
        assert_eq!(sub.set_difficulty_id, "b4b6693b72a50c7116db18d6497cac52");
        assert_eq!(sub.extranonce1, "08000002");
        assert_eq!(sub.extranonce2_size, 4);
    }

    #[test]
    fn test_subscribe_conventional_layout() {
        let result = json!([
            [
                ["mining.set_difficulty", "deadbeef"],
                ["mining.notify", "cafebabe"]
            ],
            "f000000f",
            8
        ]);
        let sub = Subscribe::from_result(&result).unwrap();
        assert_eq!(sub.notify_id, "deadbeef");
        assert_eq!(sub.set_difficulty_id, "cafebabe");
        assert_eq!(sub.extranonce1, "f000000f");
        assert_eq!(sub.extranonce2_size, 8);
    }

    #[test]
    fn test_subscribe_bad_shapes() {
        for result in [
            json!(true),
            json!([]),
            json!([[["mining.notify", "a"]], "00", 4]),
            json!([[["mining.notify", "a"], ["mining.set_difficulty", "b"]]]),
            json!([[["mining.notify", "a"], ["mining.set_difficulty", "b"]], 17, "4"]),
        ] {
            assert!(
                matches!(Subscribe::from_result(&result), Err(Error::Protocol(_))),
                "shape should be rejected: {}",
                result
            );
        }
    }

    #[test]
    fn test_submit_params_serialization() {
        let params = SubmitParams {
            id: "session".to_string(),
            job_id: "job123".to_string(),
            nonce: "deadbeef".to_string(),
            result: "00ff".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"id": "session", "job_id": "job123", "nonce": "deadbeef", "result": "00ff"})
        );
    }

    #[test]
    fn test_response_display_is_json() {
        let response = Response {
            id: Some(1),
            error: None,
            method: None,
            result: Some(json!(false)),
            params: None,
        };
        assert_eq!(
            response.to_string(),
            r#"{"id":1,"error":null,"result":false}"#
        );
    }
}
