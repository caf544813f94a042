//! Request and response messages carried inside the protocol envelope.
//!
//! Every message body is a JSON document with camelCase fields. The envelope's
//! `type` field names the message; it is the only dispatch key in both
//! directions:
//!
//! - Responses to unary calls are decoded through a [`ResponseRegistry`] that
//!   maps type names to decoders.
//! - Server pushes are decoded by the push handler registered for their type
//!   (see [`crate::handler`]).
//!
//! Application messages implement [`RequestMessage`] / [`ResponseMessage`];
//! the object-safe [`RpcRequest`] / [`RpcResponse`] traits follow from blanket
//! impls.

use std::{any::Any, collections::HashMap, fmt};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::ResultExt;
use xgrpc_proto::proto::Payload;

use crate::error::{Result, SerializationSnafu, UnsupportedResponseTypeSnafu};

/// Result code of a successful response.
pub const RESPONSE_CODE_SUCCESS: i32 = 200;
/// Result code of a failed response.
pub const RESPONSE_CODE_FAIL: i32 = 500;

/// Fields shared by every request.
///
/// Headers travel in the envelope metadata, not in the JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestBase {
    /// Identifier echoed by acknowledgements.
    pub request_id: String,
    /// Envelope headers.
    #[serde(skip)]
    pub headers: HashMap<String, String>,
}

/// Fields shared by every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseBase {
    /// `200` on success, `500` on failure.
    pub result_code: i32,
    /// Application error code; `0` when unset.
    pub error_code: i32,
    /// Redundant success flag kept for wire compatibility.
    pub success: bool,
    /// Optional human-readable message.
    pub message: Option<String>,
    /// Identifier of the request this response answers.
    pub request_id: String,
}

impl ResponseBase {
    /// A successful response base.
    #[must_use]
    pub fn success() -> Self {
        Self {
            result_code: RESPONSE_CODE_SUCCESS,
            error_code: 0,
            success: true,
            message: None,
            request_id: String::new(),
        }
    }

    /// A failed response base.
    #[must_use]
    pub fn failure(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            result_code: RESPONSE_CODE_FAIL,
            error_code,
            success: false,
            message: Some(message.into()),
            request_id: String::new(),
        }
    }

    /// Returns true when the result code is `200`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result_code == RESPONSE_CODE_SUCCESS
    }
}

impl Default for ResponseBase {
    fn default() -> Self {
        Self::success()
    }
}

/// A typed request message.
pub trait RequestMessage:
    Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
    /// Type name used on the wire.
    const TYPE: &'static str;

    /// Shared request fields.
    fn base(&self) -> &RequestBase;

    /// Shared request fields, mutably.
    fn base_mut(&mut self) -> &mut RequestBase;

    /// Tenant and group the request is signed for.
    ///
    /// Empty by default, which signs the timestamp alone.
    fn sign_target(&self) -> (&str, &str) {
        ("", "")
    }
}

/// A typed response message.
pub trait ResponseMessage:
    Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
    /// Type name used on the wire.
    const TYPE: &'static str;

    /// Shared response fields.
    fn base(&self) -> &ResponseBase;

    /// Shared response fields, mutably.
    fn base_mut(&mut self) -> &mut ResponseBase;
}

/// Object-safe view of an outbound request.
pub trait RpcRequest: Send + Sync + fmt::Debug {
    /// Type name used on the wire.
    fn request_type(&self) -> &str;

    /// Envelope headers.
    fn headers(&self) -> &HashMap<String, String>;

    /// Envelope headers, mutably.
    fn headers_mut(&mut self) -> &mut HashMap<String, String>;

    /// Tenant and group the call is signed for.
    fn resource(&self) -> (&str, &str);

    /// Serializes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Serialization`](crate::SdkError::Serialization) if encoding fails.
    fn encode_body(&self) -> Result<Vec<u8>>;
}

impl<T: RequestMessage> RpcRequest for T {
    fn request_type(&self) -> &str {
        T::TYPE
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.base().headers
    }

    fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.base_mut().headers
    }

    fn resource(&self) -> (&str, &str) {
        self.sign_target()
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context(SerializationSnafu)
    }
}

/// Object-safe view of a decoded response.
pub trait RpcResponse: Send + Sync + fmt::Debug {
    /// Type name used on the wire.
    fn response_type(&self) -> &str;

    /// Shared response fields.
    fn base(&self) -> &ResponseBase;

    /// Serializes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Serialization`](crate::SdkError::Serialization) if encoding fails.
    fn encode_body(&self) -> Result<Vec<u8>>;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Owned upcast for downcasting to the concrete type.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: ResponseMessage> RpcResponse for T {
    fn response_type(&self) -> &str {
        T::TYPE
    }

    fn base(&self) -> &ResponseBase {
        ResponseMessage::base(self)
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context(SerializationSnafu)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn RpcResponse {
    /// Returns the concrete response if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: ResponseMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Converts into the concrete response if it is a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::UnsupportedResponseType`](crate::SdkError::UnsupportedResponseType)
    /// naming the actual type when it is not a `T`.
    pub fn downcast<T: ResponseMessage>(self: Box<Self>) -> Result<T> {
        let actual = self.response_type().to_owned();
        match self.into_any().downcast::<T>() {
            Ok(typed) => Ok(*typed),
            Err(_) => UnsupportedResponseTypeSnafu { request_type: T::TYPE, response_type: actual }
                .fail(),
        }
    }
}

/// Decodes a response body into a boxed response.
pub type ResponseDecoder = fn(&[u8]) -> Result<Box<dyn RpcResponse>>;

fn decode_response<T: ResponseMessage>(body: &[u8]) -> Result<Box<dyn RpcResponse>> {
    let response: T = serde_json::from_slice(body).context(SerializationSnafu)?;
    Ok(Box::new(response))
}

/// Maps response type names to decoders.
///
/// Populated once at startup and shared read-only by every connection.
#[derive(Clone)]
pub struct ResponseRegistry {
    decoders: HashMap<&'static str, ResponseDecoder>,
}

impl ResponseRegistry {
    /// Creates a registry with no decoders.
    #[must_use]
    pub fn empty() -> Self {
        Self { decoders: HashMap::new() }
    }

    /// Creates a registry with decoders for the built-in protocol responses.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::empty()
            .with::<ServerCheckResponse>()
            .with::<HealthCheckResponse>()
            .with::<ErrorResponse>()
            .with::<ConnectResetResponse>()
            .with::<ClientDetectionResponse>()
    }

    /// Adds the decoder for `T`, replacing any previous one for the same name.
    #[must_use]
    pub fn with<T: ResponseMessage>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Adds the decoder for `T`, replacing any previous one for the same name.
    pub fn register<T: ResponseMessage>(&mut self) {
        self.decoders.insert(T::TYPE, decode_response::<T>);
    }

    /// Returns true if a decoder is registered for `response_type`.
    #[must_use]
    pub fn contains(&self, response_type: &str) -> bool {
        self.decoders.contains_key(response_type)
    }

    /// Decodes a response payload by its declared type.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::UnsupportedResponseType`](crate::SdkError::UnsupportedResponseType)
    /// when no decoder is registered, or a serialization error for a malformed body.
    pub fn decode(&self, request_type: &str, payload: &Payload) -> Result<Box<dyn RpcResponse>> {
        let response_type = payload.message_type();
        match self.decoders.get(response_type) {
            Some(decode) => decode(payload.body_bytes()),
            None => UnsupportedResponseTypeSnafu { request_type, response_type }.fail(),
        }
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("ResponseRegistry").field("types", &names).finish()
    }
}

/// Wraps a request into a protocol envelope.
///
/// # Errors
///
/// Returns a serialization error if the body cannot be encoded.
pub fn encode_request(request: &dyn RpcRequest, client_ip: &str) -> Result<Payload> {
    Ok(Payload::new(
        request.request_type(),
        request.headers().clone(),
        client_ip,
        request.encode_body()?,
    ))
}

/// Wraps a response into a protocol envelope.
///
/// # Errors
///
/// Returns a serialization error if the body cannot be encoded.
pub fn encode_response(response: &dyn RpcResponse, client_ip: &str) -> Result<Payload> {
    Ok(Payload::new(response.response_type(), HashMap::new(), client_ip, response.encode_body()?))
}

/// Decodes a pushed request, restoring its headers from the envelope.
///
/// # Errors
///
/// Returns a serialization error if the body does not match `T`.
pub fn decode_request<T: RequestMessage>(payload: &Payload) -> Result<T> {
    let body = payload.body_bytes();
    let mut request: T =
        serde_json::from_slice(if body.is_empty() { b"{}" } else { body }).context(SerializationSnafu)?;
    if let Some(headers) = payload.headers() {
        request.base_mut().headers = headers.clone();
    }
    Ok(request)
}

macro_rules! request_message {
    ($name:ident) => {
        impl RequestMessage for $name {
            const TYPE: &'static str = stringify!($name);

            fn base(&self) -> &RequestBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut RequestBase {
                &mut self.base
            }
        }
    };
}

macro_rules! response_message {
    ($name:ident) => {
        impl ResponseMessage for $name {
            const TYPE: &'static str = stringify!($name);

            fn base(&self) -> &ResponseBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut ResponseBase {
                &mut self.base
            }
        }
    };
}

/// Handshake asking the server for a connection id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCheckRequest {
    /// Shared fields.
    #[serde(flatten)]
    pub base: RequestBase,
}
request_message!(ServerCheckRequest);

/// Answer to [`ServerCheckRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerCheckResponse {
    /// Shared fields.
    #[serde(flatten)]
    pub base: ResponseBase,
    /// Server-assigned connection id.
    pub connection_id: String,
}
response_message!(ServerCheckResponse);

/// First message written on a new bidirectional stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSetupRequest {
    /// Shared fields.
    #[serde(flatten)]
    pub base: RequestBase,
    /// SDK version string.
    pub client_version: String,
    /// Namespace the client works in.
    pub tenant: String,
    /// Client labels.
    pub labels: HashMap<String, String>,
}
request_message!(ConnectionSetupRequest);

/// Keep-alive probe sent by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckRequest {
    /// Shared fields.
    #[serde(flatten)]
    pub base: RequestBase,
}
request_message!(HealthCheckRequest);

/// Answer to [`HealthCheckRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckResponse {
    /// Shared fields.
    #[serde(flatten)]
    pub base: ResponseBase,
}
response_message!(HealthCheckResponse);

/// Server push asking the client to reconnect, optionally to a given server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectResetRequest {
    /// Shared fields.
    #[serde(flatten)]
    pub base: RequestBase,
    /// Target server IP; empty means any server.
    pub server_ip: String,
    /// Target server port as a decimal string; empty means the default port.
    pub server_port: String,
}
request_message!(ConnectResetRequest);

/// Acknowledgement of [`ConnectResetRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectResetResponse {
    /// Shared fields.
    #[serde(flatten)]
    pub base: ResponseBase,
}
response_message!(ConnectResetResponse);

/// Server push probing client liveness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientDetectionRequest {
    /// Shared fields.
    #[serde(flatten)]
    pub base: RequestBase,
}
request_message!(ClientDetectionRequest);

/// Acknowledgement of [`ClientDetectionRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientDetectionResponse {
    /// Shared fields.
    #[serde(flatten)]
    pub base: ResponseBase,
}
response_message!(ClientDetectionResponse);

/// Generic failure answer the server may send for any request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorResponse {
    /// Shared fields.
    #[serde(flatten)]
    pub base: ResponseBase,
}
response_message!(ErrorResponse);
