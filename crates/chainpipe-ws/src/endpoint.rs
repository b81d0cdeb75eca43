//! Stream endpoints and their wire protocols.

use serde_json::{json, Map, Value};
use url::Url;

use crate::error::StreamError;

/// PumpPortal real-time data feed.
pub const PUMP_PORTAL_URL: &str = "wss://pumpportal.fun/api/data";

/// How subscribe requests and notifications are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// JSON-RPC 2.0 pubsub: `xSubscribe` requests, `xNotification` pushes
    /// tagged with a server-assigned subscription id.
    JsonRpc,
    /// Bare JSON objects `{"method": ..., "keys": [...]}`; pushes carry no
    /// subscription id and go to every handler.
    Plain,
}

impl WireProtocol {
    /// Method name used to cancel a subscription made with `method`.
    pub fn unsubscribe_method(&self, method: &str) -> String {
        match self {
            Self::JsonRpc => method.replacen("Subscribe", "Unsubscribe", 1),
            Self::Plain => {
                let mut chars = method.chars();
                match chars.next() {
                    Some(first) => format!("un{}{}", first.to_ascii_lowercase(), chars.as_str()),
                    None => String::new(),
                }
            }
        }
    }

    /// Notification method that answers a `method` subscription.
    pub fn notification_method(&self, method: &str) -> String {
        method.replacen("Subscribe", "Notification", 1)
    }

    /// Subscribe frame for `method`.
    ///
    /// JSON-RPC params must be an array (`null` means none). Bare-JSON params
    /// may be an object merged into the frame or an array sent as `keys`.
    pub fn subscribe_message(&self, request_id: u64, method: &str, params: &Value) -> Value {
        match self {
            Self::JsonRpc => json!({
                "jsonrpc": "2.0",
                "id": request_id,
                "method": method,
                "params": rpc_params(params),
            }),
            Self::Plain => plain_message(method, params),
        }
    }

    /// Unsubscribe frame. JSON-RPC needs the server id; bare JSON repeats the
    /// original params.
    pub fn unsubscribe_message(
        &self,
        request_id: u64,
        method: &str,
        params: &Value,
        server_id: Option<u64>,
    ) -> Option<Value> {
        let unsub = self.unsubscribe_method(method);
        match self {
            Self::JsonRpc => server_id.map(|sid| {
                json!({
                    "jsonrpc": "2.0",
                    "id": request_id,
                    "method": unsub,
                    "params": [sid],
                })
            }),
            Self::Plain => Some(plain_message(&unsub, params)),
        }
    }
}

fn rpc_params(params: &Value) -> Value {
    match params {
        Value::Null => Value::Array(vec![]),
        Value::Array(_) => params.clone(),
        other => Value::Array(vec![other.clone()]),
    }
}

fn plain_message(method: &str, params: &Value) -> Value {
    let mut frame = match params {
        Value::Object(obj) => obj.clone(),
        Value::Array(keys) => {
            let mut m = Map::new();
            m.insert("keys".into(), Value::Array(keys.clone()));
            m
        }
        _ => Map::new(),
    };
    frame.insert("method".into(), Value::String(method.to_string()));
    Value::Object(frame)
}

/// Where to connect, how, and in which dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    /// HTTP forward proxy (`http://host:port`) used for a CONNECT tunnel.
    pub proxy: Option<String>,
    pub protocol: WireProtocol,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, protocol: WireProtocol) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            protocol,
        }
    }

    /// Helius pubsub for `network` (`mainnet` or `devnet`).
    pub fn helius(network: &str, api_key: &str) -> Result<Self, StreamError> {
        if !matches!(network, "mainnet" | "devnet") {
            return Err(StreamError::InvalidEndpoint(format!(
                "unsupported network '{network}', expected mainnet or devnet"
            )));
        }
        if api_key.is_empty() {
            return Err(StreamError::InvalidEndpoint("empty api key".into()));
        }
        Ok(Self::new(
            format!("wss://{network}.helius-rpc.com/?api-key={api_key}"),
            WireProtocol::JsonRpc,
        ))
    }

    pub fn pump_portal() -> Self {
        Self::new(PUMP_PORTAL_URL, WireProtocol::Plain)
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.is_empty());
        self
    }

    /// Parse and check the URL scheme.
    pub fn parsed_url(&self) -> Result<Url, StreamError> {
        let url = Url::parse(&self.url).map_err(|e| StreamError::InvalidEndpoint(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(StreamError::InvalidEndpoint(format!(
                "scheme '{other}' is not ws or wss"
            ))),
        }
    }

    /// URL safe for logs: credential-looking query values are masked.
    pub fn redacted_url(&self) -> String {
        let Ok(mut url) = Url::parse(&self.url) else {
            return self.url.clone();
        };
        if url.query().is_none() {
            return url.to_string();
        }
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let masked = if k.contains("key") || k.contains("token") {
                    "***".to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), masked)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helius_url_and_network_check() {
        let ep = Endpoint::helius("devnet", "k1").unwrap();
        assert_eq!(ep.url, "wss://devnet.helius-rpc.com/?api-key=k1");
        assert_eq!(ep.protocol, WireProtocol::JsonRpc);
        assert!(Endpoint::helius("testnet", "k1").is_err());
        assert!(Endpoint::helius("mainnet", "").is_err());
    }

    #[test]
    fn redaction_hides_api_key() {
        let ep = Endpoint::helius("mainnet", "secret").unwrap();
        let shown = ep.redacted_url();
        assert!(!shown.contains("secret"), "{shown}");
        assert!(shown.contains("mainnet.helius-rpc.com"));
    }

    #[test]
    fn method_names() {
        let rpc = WireProtocol::JsonRpc;
        assert_eq!(rpc.unsubscribe_method("slotSubscribe"), "slotUnsubscribe");
        assert_eq!(rpc.notification_method("slotSubscribe"), "slotNotification");
        let plain = WireProtocol::Plain;
        assert_eq!(plain.unsubscribe_method("subscribeNewToken"), "unsubscribeNewToken");
    }

    #[test]
    fn jsonrpc_subscribe_frame() {
        let msg = WireProtocol::JsonRpc.subscribe_message(3, "slotSubscribe", &Value::Null);
        assert_eq!(msg, json!({"jsonrpc": "2.0", "id": 3, "method": "slotSubscribe", "params": []}));
    }

    #[test]
    fn plain_subscribe_frame_with_keys() {
        let msg = WireProtocol::Plain.subscribe_message(0, "subscribeTokenTrade", &json!(["mintA"]));
        assert_eq!(msg, json!({"method": "subscribeTokenTrade", "keys": ["mintA"]}));
    }

    #[test]
    fn jsonrpc_unsubscribe_needs_server_id() {
        let rpc = WireProtocol::JsonRpc;
        assert!(rpc.unsubscribe_message(1, "slotSubscribe", &Value::Null, None).is_none());
        let msg = rpc
            .unsubscribe_message(1, "slotSubscribe", &Value::Null, Some(99))
            .unwrap();
        assert_eq!(msg["method"], "slotUnsubscribe");
        assert_eq!(msg["params"], json!([99]));
    }

    #[test]
    fn scheme_is_checked() {
        assert!(Endpoint::pump_portal().parsed_url().is_ok());
        assert!(Endpoint::new("https://x.io", WireProtocol::Plain).parsed_url().is_err());
    }
}
