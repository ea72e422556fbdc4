//! RPC proxies: call a service method by name.

use serde_json::{Value, json};

use rock_protocol::{Codec, RpcRequest, decode_body, encode_body};

use crate::aclient::AsyncClient;
use crate::client::Client;
use crate::error::ClientResult;

/// Reply returned when the broker produced nothing within the retry budget.
pub fn timed_out_reply() -> Value {
    json!({
        "ok": false,
        "error": "ResponseTimedOut",
        "detail": "service server may not be running",
    })
}

fn request_body(codec: Codec, method: &str, args: Value) -> ClientResult<Vec<bytes::Bytes>> {
    Ok(encode_body(codec, &RpcRequest::new(method, args)?)?)
}

fn decode_reply(reply: Option<Vec<bytes::Bytes>>) -> ClientResult<Value> {
    match reply {
        Some(body) => {
            let (_, value) = decode_body(&body)?;
            Ok(value)
        }
        None => Ok(timed_out_reply()),
    }
}

/// Calls methods on one service through a [`Client`].
///
/// ```rust,no_run
/// use rock_client::{Client, ClientConfig, RpcProxy};
/// use serde_json::json;
///
/// # async fn run() -> rock_client::ClientResult<()> {
/// let client = Client::connect("tcp://localhost:5555", ClientConfig::default()).await?;
/// let mut users = RpcProxy::new(client, "users");
/// let reply = users.call("create", json!({"name": "ada"})).await?;
/// println!("{reply}");
/// # Ok(())
/// # }
/// ```
pub struct RpcProxy {
    client: Client,
    service: String,
    codec: Codec,
}

impl RpcProxy {
    /// Creates a proxy using the client's configured codec.
    pub fn new(client: Client, service: impl Into<String>) -> Self {
        let codec = client.config().codec;
        Self {
            client,
            service: service.into(),
            codec,
        }
    }

    /// Builder: override the codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// The target service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Calls `method` with keyword `args` (a JSON object, or `null` for
    /// none). Any other value fails with `ProtocolError::InvalidArgs`
    /// before anything is sent.
    ///
    /// When no reply arrives the result is the `ResponseTimedOut` envelope,
    /// not an error.
    pub async fn call(&mut self, method: &str, args: Value) -> ClientResult<Value> {
        let body = request_body(self.codec, method, args)?;
        let reply = self.client.send(&self.service, body).await?;
        decode_reply(reply)
    }

    /// Calls the built-in `info` method.
    pub async fn info(&mut self) -> ClientResult<Value> {
        self.call("info", json!({})).await
    }

    /// Returns the underlying client.
    pub fn into_inner(self) -> Client {
        self.client
    }
}

/// Calls methods on one service through an [`AsyncClient`], one at a time.
pub struct AsyncRpcProxy {
    client: AsyncClient,
    service: String,
    codec: Codec,
}

impl AsyncRpcProxy {
    /// Creates a proxy using the client's configured codec.
    pub fn new(client: AsyncClient, service: impl Into<String>) -> Self {
        let codec = client.config().codec;
        Self {
            client,
            service: service.into(),
            codec,
        }
    }

    /// Builder: override the codec.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Sends the call without waiting.
    pub async fn send(&mut self, method: &str, args: Value) -> ClientResult<()> {
        let body = request_body(self.codec, method, args)?;
        self.client.send(&self.service, body).await
    }

    /// Waits for the reply to the last `send`.
    pub async fn recv(&mut self) -> ClientResult<Value> {
        let reply = self.client.recv().await?;
        decode_reply(reply)
    }

    /// Sends then waits.
    pub async fn call(&mut self, method: &str, args: Value) -> ClientResult<Value> {
        self.send(method, args).await?;
        self.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use bytes::Bytes;
    use rock_protocol::ProtocolError;

    #[test]
    fn missing_reply_maps_to_timeout_envelope() {
        insta::assert_json_snapshot!(decode_reply(None).unwrap(), @r#"
        {
          "detail": "service server may not be running",
          "error": "ResponseTimedOut",
          "ok": false
        }
        "#);
    }

    #[test]
    fn reply_decodes_with_its_own_header() {
        let reply = encode_body(Codec::MsgPack, &json!({"ok": true, "n": 3})).unwrap();
        assert_eq!(decode_reply(Some(reply)).unwrap(), json!({"ok": true, "n": 3}));
    }

    #[test]
    fn garbage_reply_is_an_error() {
        let reply = vec![Bytes::from_static(b"json"), Bytes::from_static(b"not json")];
        assert!(decode_reply(Some(reply)).is_err());
    }

    #[test]
    fn request_body_layout() {
        let body = request_body(Codec::Json, "add", json!({"a": 1})).unwrap();
        assert_eq!(body[0], Bytes::from_static(b"json"));
        assert_eq!(body[1], Bytes::from_static(br#"{"method":"add","args":{"a":1}}"#));
    }

    #[test]
    fn list_args_fail_before_sending() {
        assert!(matches!(
            request_body(Codec::Json, "add", json!([1, 2])),
            Err(ClientError::Protocol(ProtocolError::InvalidArgs("array")))
        ));
    }
}
