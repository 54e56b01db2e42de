use crate::error::{ConnectorError, Result};
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Error code a device answers with when a frame lacks valid credentials
pub const UNAUTHORIZED: i64 = 401;

const DIGEST_ALGORITHM: &str = "SHA-256";

/// RPC request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    pub id: u64,
    pub src: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<DigestAuth>,
}

/// Digest credentials attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestAuth {
    pub realm: String,
    pub username: String,
    pub nonce: u64,
    pub cnonce: u64,
    pub response: String,
    pub nc: u32,
    pub algorithm: String,
}

/// Inbound frame: either a call response or an unsolicited notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Error object of a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Push methods a device sends without being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Status,
    FullStatus,
    Event,
}

impl Notification {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "NotifyStatus" => Some(Self::Status),
            "NotifyFullStatus" => Some(Self::FullStatus),
            "NotifyEvent" => Some(Self::Event),
            _ => None,
        }
    }
}

impl WsFrame {
    /// Create a new frame with the given id, source and method
    pub fn new(id: u64, src: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id,
            src: src.into(),
            method: method.into(),
            params: None,
            auth: None,
        }
    }

    /// Set the call parameters
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach digest credentials
    pub fn with_auth(mut self, auth: DigestAuth) -> Self {
        self.auth = Some(auth);
        self
    }
}

impl WsResponse {
    /// Unsolicited push (no correlation id, carries a method)
    pub fn notification(&self) -> Option<Notification> {
        if self.id.is_some() {
            return None;
        }
        self.method.as_deref().and_then(Notification::parse)
    }

    /// Whether the device asked for (new) digest credentials
    pub fn is_unauthorized(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.code == UNAUTHORIZED)
    }

    /// Turn the frame into the call result
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(ConnectorError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Digest challenge carried in the message of a 401 error
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DigestChallenge {
    #[serde(default)]
    pub auth_type: Option<String>,
    pub nonce: u64,
    #[serde(default)]
    pub nc: Option<u32>,
    pub realm: String,
    pub algorithm: String,
}

impl DigestChallenge {
    /// Parse the challenge out of an RPC error
    pub fn from_error(error: &RpcError) -> Result<Self> {
        if error.code != UNAUTHORIZED {
            return Err(ConnectorError::Protocol(format!(
                "expected authentication challenge, got error {}",
                error.code
            )));
        }
        serde_json::from_str(&error.message)
            .map_err(|e| ConnectorError::AuthRejected(format!("malformed challenge: {}", e)))
    }
}

/// Digest authentication state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsSession {
    pub realm: String,
    pub username: String,
    pub nonce: u64,
    pub cnonce: u64,
    pub response: String,
    pub nc: u32,
    pub algorithm: String,
}

impl WsSession {
    /// Answer a challenge with the given credentials
    pub fn authenticate(
        challenge: &DigestChallenge,
        credentials: &Credentials,
        cnonce: u64,
    ) -> Result<Self> {
        if !challenge.algorithm.eq_ignore_ascii_case(DIGEST_ALGORITHM) {
            return Err(ConnectorError::AuthRejected(format!(
                "unsupported digest algorithm {}",
                challenge.algorithm
            )));
        }

        let nc = challenge.nc.unwrap_or(1);
        let response = digest_response(
            &credentials.username,
            &credentials.password,
            &challenge.realm,
            challenge.nonce,
            nc,
            cnonce,
        );

        Ok(Self {
            realm: challenge.realm.clone(),
            username: credentials.username.clone(),
            nonce: challenge.nonce,
            cnonce,
            response,
            nc,
            algorithm: DIGEST_ALGORITHM.to_string(),
        })
    }

    /// Credentials block for outgoing frames
    pub fn auth(&self) -> DigestAuth {
        DigestAuth {
            realm: self.realm.clone(),
            username: self.username.clone(),
            nonce: self.nonce,
            cnonce: self.cnonce,
            response: self.response.clone(),
            nc: self.nc,
            algorithm: self.algorithm.clone(),
        }
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `H(H(user:realm:password):nonce:nc:cnonce:auth:H(dummy_method:dummy_uri))`
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: u64,
    nc: u32,
    cnonce: u64,
) -> String {
    let ha1 = sha256_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = sha256_hex("dummy_method:dummy_uri");
    sha256_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_omits_empty_params_and_auth() {
        let frame = WsFrame::new(7, "connector", "Shelly.GetStatus");
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, r#"{"id":7,"src":"connector","method":"Shelly.GetStatus"}"#);

        let decoded: Value = serde_json::from_str(&text).unwrap();
        let object = decoded.as_object().unwrap();
        assert!(!object.contains_key("params"));
        assert!(!object.contains_key("auth"));

        let back: WsFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_frame_preserves_params_and_auth() {
        let mut params = Map::new();
        params.insert("id".into(), json!(0));
        params.insert("on".into(), json!(true));
        let frame = WsFrame::new(42, "connector", "Switch.Set")
            .with_params(params)
            .with_auth(DigestAuth {
                realm: "shellyplus2pm-441793ad07e8".into(),
                username: "admin".into(),
                nonce: 1625038762,
                cnonce: 313273957,
                response: "abc".into(),
                nc: 1,
                algorithm: "SHA-256".into(),
            });

        let text = serde_json::to_string(&frame).unwrap();
        let back: WsFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_digest_response() {
        let challenge = DigestChallenge::from_error(&RpcError {
            code: 401,
            message: r#"{"auth_type": "digest", "nonce": 1625038762, "nc": 1, "realm": "shellyplus2pm-441793ad07e8", "algorithm": "SHA-256"}"#.into(),
        })
        .unwrap();
        let credentials = Credentials {
            username: "admin".into(),
            password: "secret".into(),
        };
        let session = WsSession::authenticate(&challenge, &credentials, 313273957).unwrap();
        assert_eq!(
            session.response,
            "1ea14d8cf1d34f3049c7be76fa72ae1db8dc99158d1525c66c51bd09d48adbdb"
        );
        assert_eq!(session.auth().nc, 1);
        assert_eq!(session.realm, "shellyplus2pm-441793ad07e8");
    }

    #[test]
    fn test_unsupported_algorithm() {
        let challenge = DigestChallenge {
            auth_type: Some("digest".into()),
            nonce: 1,
            nc: None,
            realm: "r".into(),
            algorithm: "MD5".into(),
        };
        let credentials = Credentials {
            username: "admin".into(),
            password: "secret".into(),
        };
        assert!(matches!(
            WsSession::authenticate(&challenge, &credentials, 1),
            Err(ConnectorError::AuthRejected(_))
        ));
    }

    #[test]
    fn test_notification_detection() {
        let push: WsResponse = serde_json::from_value(json!({
            "src": "shellyplus2pm-441793ad07e8",
            "dst": "connector",
            "method": "NotifyStatus",
            "params": {"ts": 1.0, "switch:0": {"id": 0, "output": true}}
        }))
        .unwrap();
        assert_eq!(push.notification(), Some(Notification::Status));

        let reply: WsResponse = serde_json::from_value(json!({
            "id": 3, "src": "x", "dst": "connector", "result": {"was_on": false}
        }))
        .unwrap();
        assert_eq!(reply.notification(), None);
        assert_eq!(reply.into_result().unwrap(), json!({"was_on": false}));
    }
}
