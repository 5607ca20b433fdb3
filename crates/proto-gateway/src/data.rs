//! Wire messages exchanged between the gateway and executor deployments.
//!
//! These are hand-maintained prost messages: the executor data plane is the
//! only consumer and keeping them in Rust avoids a protoc toolchain step.
//! Tag numbers are frozen; only append new fields.

/// gRPC method path of the streaming executor call.
pub const PROCESS_DATA_PATH: &str = "/gateway.Executor/ProcessData";
/// gRPC method path of the unary executor call.
pub const PROCESS_SINGLE_DATA_PATH: &str = "/gateway.Executor/ProcessSingleData";

/// A document flowing through the gateway. Documents are opaque to the
/// gateway except for their `id`, which keys reduction at topology fan-in.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Doc {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub text: ::prost::alloc::string::String,
    /// Dense vector representation, set and consumed by executors.
    #[prost(float, repeated, tag = "3")]
    pub embedding: ::prost::alloc::vec::Vec<f32>,
    #[prost(map = "string, message", tag = "4")]
    pub attributes: ::std::collections::HashMap<::prost::alloc::string::String, AttrValue>,
    /// Child documents, concatenated (never merged) at fan-in.
    #[prost(message, repeated, tag = "5")]
    pub chunks: ::prost::alloc::vec::Vec<Doc>,
}

/// A loosely-typed attribute value, in the shape of `google.protobuf.Value`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttrValue {
    #[prost(oneof = "attr_value::Kind", tags = "1, 2, 3, 4")]
    pub kind: ::core::option::Option<attr_value::Kind>,
}

pub mod attr_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "1")]
        Text(::prost::alloc::string::String),
        #[prost(double, tag = "2")]
        Number(f64),
        #[prost(bool, tag = "3")]
        Flag(bool),
        /// Escape hatch for structured values, as serialized JSON.
        #[prost(string, tag = "4")]
        Json(::prost::alloc::string::String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    /// Executor endpoint which should process this request, like "/index".
    #[prost(string, optional, tag = "2")]
    pub exec_endpoint: ::core::option::Option<::prost::alloc::string::String>,
    /// Regex over deployment names. Non-matching deployments pass the
    /// request through without invoking their executor.
    #[prost(string, optional, tag = "3")]
    pub target_executor: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataRequest {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<RequestHeader>,
    #[prost(map = "string, message", tag = "2")]
    pub parameters: ::std::collections::HashMap<::prost::alloc::string::String, AttrValue>,
    #[prost(message, repeated, tag = "3")]
    pub docs: ::prost::alloc::vec::Vec<Doc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataResponse {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<RequestHeader>,
    #[prost(map = "string, message", tag = "2")]
    pub parameters: ::std::collections::HashMap<::prost::alloc::string::String, AttrValue>,
    #[prost(message, repeated, tag = "3")]
    pub docs: ::prost::alloc::vec::Vec<Doc>,
    #[prost(message, optional, tag = "4")]
    pub status: ::core::option::Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "status::Code", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub description: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub exception: ::core::option::Option<Exception>,
}

pub mod status {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Code {
        Ok = 0,
        Error = 1,
    }

    impl Code {
        pub fn as_str_name(&self) -> &'static str {
            match self {
                Code::Ok => "OK",
                Code::Error => "ERROR",
            }
        }
    }
}

/// An executor-reported failure, carried as response data rather than
/// raised through the transport.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exception {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "3")]
    pub stacks: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Name of the executor (deployment) which raised it.
    #[prost(string, tag = "4")]
    pub executor: ::prost::alloc::string::String,
}

impl Doc {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl AttrValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: Some(attr_value::Kind::Text(value.into())),
        }
    }

    pub fn number(value: f64) -> Self {
        Self {
            kind: Some(attr_value::Kind::Number(value)),
        }
    }

    pub fn flag(value: bool) -> Self {
        Self {
            kind: Some(attr_value::Kind::Flag(value)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.kind {
            Some(attr_value::Kind::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match &self.kind {
            Some(attr_value::Kind::Number(n)) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::text(value)
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::number(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::flag(value)
    }
}

impl DataResponse {
    /// An OK response echoing `header` and `docs`.
    pub fn ok(header: Option<RequestHeader>, docs: Vec<Doc>) -> Self {
        Self {
            header,
            parameters: Default::default(),
            docs,
            status: Some(Status {
                code: status::Code::Ok as i32,
                ..Default::default()
            }),
        }
    }

    /// An ERROR response carrying `exception`.
    pub fn from_exception(header: Option<RequestHeader>, exception: Exception) -> Self {
        Self {
            header,
            parameters: Default::default(),
            docs: Vec::new(),
            status: Some(Status {
                code: status::Code::Error as i32,
                description: exception.args.first().cloned().unwrap_or_default(),
                exception: Some(exception),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.code() == status::Code::Error)
            .unwrap_or(false)
    }

    pub fn exception(&self) -> Option<&Exception> {
        self.status.as_ref().and_then(|s| s.exception.as_ref())
    }
}
