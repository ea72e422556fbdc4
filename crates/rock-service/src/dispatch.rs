//! RPC dispatch: method table, argument access, error envelopes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use rock_protocol::{Codec, ProtocolError, RpcRequest, decode_body, encode_body};

use crate::error::StoreError;

/// Name of the method every service answers.
pub const INFO_METHOD: &str = "info";

/// A failed call, sent back as `{ok: false, error: kind, detail}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub kind: String,
    pub detail: String,
}

impl HandlerError {
    /// Creates an error of the given kind.
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    /// Unknown method name.
    pub fn method_not_found(method: &str) -> Self {
        Self::new("MethodNotFound", format!("no method named {method:?}"))
    }

    /// Request body could not be decoded.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("BadRequest", detail)
    }

    /// Missing or mistyped argument.
    pub fn type_error(detail: impl Into<String>) -> Self {
        Self::new("TypeError", detail)
    }

    /// Generic failure.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new("InternalError", detail)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for HandlerError {}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::NotFound { .. } => "NotFound",
            StoreError::InvalidDocument(_) => "ValueError",
            StoreError::UnknownDriver(_) | StoreError::Closed => "StoreError",
        };
        Self::new(kind, err.to_string())
    }
}

/// Result of a handler.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed handler future.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A registered method.
pub type Handler = Arc<dyn Fn(Args) -> HandlerFuture + Send + Sync>;

/// Keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Map<String, Value>);

impl Args {
    pub fn new(args: Map<String, Value>) -> Self {
        Self(args)
    }

    /// Required argument converted to `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| HandlerError::type_error(format!("missing required argument {name:?}")))?;
        T::deserialize(value)
            .map_err(|e| HandlerError::type_error(format!("argument {name:?}: {e}")))
    }

    /// Optional argument; missing and `null` are both `None`.
    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(name).map(Some),
        }
    }

    /// Raw argument value.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Outcome of a dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Ok(Value),
    Err(HandlerError),
}

impl RpcReply {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// The reply envelope. Object results gain `ok: true`; anything else is
    /// wrapped as `{result, ok: true}`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Ok(Value::Object(mut map)) => {
                map.insert("ok".into(), Value::Bool(true));
                Value::Object(map)
            }
            Self::Ok(other) => json!({ "result": other, "ok": true }),
            Self::Err(HandlerError { kind, detail }) => {
                json!({ "ok": false, "error": kind, "detail": detail })
            }
        }
    }
}

impl From<HandlerResult> for RpcReply {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::Err(err),
        }
    }
}

struct Method {
    name: String,
    args: Vec<String>,
    handler: Handler,
}

/// Declares a service's methods.
///
/// ```rust
/// use rock_service::ServiceBuilder;
/// use serde_json::json;
///
/// let dispatcher = ServiceBuilder::new("math")
///     .version("1.2.0")
///     .method("add", &["a", "b"], |args| async move {
///         let a: i64 = args.get("a")?;
///         let b: i64 = args.get("b")?;
///         Ok(json!(a + b))
///     })
///     .build();
/// assert_eq!(dispatcher.methods().collect::<Vec<_>>(), vec!["add"]);
/// ```
pub struct ServiceBuilder {
    name: String,
    version: String,
    methods: Vec<Method>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            methods: Vec::new(),
        }
    }

    /// Version reported by `info`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Registers `name` with its argument names, for `info`.
    ///
    /// Re-registering a name replaces the earlier handler. `info` is reserved.
    pub fn method<F, Fut>(mut self, name: &str, args: &[&str], handler: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if name == INFO_METHOD {
            warn!(service = %self.name, "Method name 'info' is reserved, ignoring");
            return self;
        }
        let method = Method {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        };
        match self.methods.iter_mut().find(|m| m.name == name) {
            Some(existing) => *existing = method,
            None => self.methods.push(method),
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        let index = self
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();
        Dispatcher {
            name: self.name,
            version: self.version,
            started_at: Utc::now(),
            methods: self.methods,
            index,
        }
    }
}

/// Routes decoded requests to handlers.
pub struct Dispatcher {
    name: String,
    version: String,
    started_at: DateTime<Utc>,
    methods: Vec<Method>,
    index: HashMap<String, usize>,
}

impl Dispatcher {
    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered method names, in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }

    /// The `info` payload.
    pub fn info(&self) -> Value {
        let rpc: Vec<Value> = self
            .methods
            .iter()
            .map(|m| json!({ "method": m.name, "args": m.args }))
            .collect();
        json!({
            "service": self.name,
            "version": self.version,
            "started_at": self.started_at.to_rfc3339(),
            "system": {
                "arch": std::env::consts::ARCH,
                "os": std::env::consts::OS,
            },
            "rpc": rpc,
        })
    }

    /// Runs one call. Never fails: every problem becomes an error reply.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcReply {
        let RpcRequest { method, args } = request;
        let started = Instant::now();

        let reply = if method == INFO_METHOD {
            RpcReply::Ok(self.info())
        } else {
            match self.index.get(&method) {
                Some(&i) => {
                    let call = (self.methods[i].handler)(Args::new(args));
                    match AssertUnwindSafe(call).catch_unwind().await {
                        Ok(result) => result.into(),
                        Err(panic) => {
                            RpcReply::Err(HandlerError::internal(panic_message(&*panic)))
                        }
                    }
                }
                None => RpcReply::Err(HandlerError::method_not_found(&method)),
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &reply {
            RpcReply::Ok(_) => {
                info!(service = %self.name, method = %method, "{method} {elapsed_ms:.2}ms")
            }
            RpcReply::Err(err) => warn!(
                service = %self.name,
                method = %method,
                error = %err,
                "{method} failed in {elapsed_ms:.2}ms"
            ),
        }
        reply
    }

    /// Decodes a request body, dispatches it and encodes the reply with the
    /// codec the caller used.
    pub async fn handle(&self, body: &[Bytes]) -> Vec<Bytes> {
        let (codec, reply) = match decode_body::<RpcRequest>(body) {
            Ok((codec, request)) => (codec, self.dispatch(request).await),
            Err(e) => {
                let codec = body
                    .first()
                    .and_then(|h| Codec::from_header(h).ok())
                    .unwrap_or_default();
                warn!(service = %self.name, error = %e, "Malformed request");
                (codec, RpcReply::Err(HandlerError::bad_request(e.to_string())))
            }
        };
        encode_reply(codec, reply)
    }
}

fn encode_reply(codec: Codec, reply: RpcReply) -> Vec<Bytes> {
    let value = reply.into_value();
    match encode_body(codec, &value) {
        Ok(body) => body,
        Err(e) => fallback_reply(codec, e),
    }
}

/// Encoding a reply failed; send an error envelope that always encodes.
fn fallback_reply(codec: Codec, err: ProtocolError) -> Vec<Bytes> {
    let value = RpcReply::Err(HandlerError::internal(err.to_string())).into_value();
    let payload = codec
        .encode(&value)
        .unwrap_or_else(|_| Bytes::from_static(br#"{"ok":false,"error":"InternalError"}"#));
    vec![codec.header_frame(), payload]
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
