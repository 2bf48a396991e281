//! Wire types and framing shared between the host and the worker process.
//!
//! This mirrors the role `hyperlight-js-common` plays for the host/guest
//! flatbuffer RPC: a small, dependency-light crate that both sides of the
//! process boundary can depend on without pulling in the JS engine or the
//! pool manager.

mod framing;

pub use framing::{read_message, write_message, FramingError};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Static description of a plugin: what to load and how to configure it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginDescriptor {
    pub id: String,
    /// URI identifying the code to import (a filesystem path in this
    /// implementation; resolved relative to the current working directory).
    pub module: String,
    #[serde(default)]
    pub globals: HashMap<String, serde_json::Value>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

fn default_concurrency() -> u32 {
    1
}

/// A single log line captured from `console.log`/`console.error` etc. during
/// one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// A record of one outbound `fetch()` call made during an invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchRecord {
    /// The request URL's scheme (`"https"`, `"http"`), lowercased.
    pub scheme: String,
    /// The request URL's host, without port.
    pub host: String,
    pub method: String,
    pub status: Option<u16>,
    /// The HTTP reason phrase (`"OK"`, `"Not Found"`, ...), when a response
    /// was received.
    #[serde(rename = "statusText")]
    pub status_text: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "endTime")]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Bytes written to the outgoing request body; `0` for bodyless
    /// requests such as a plain `GET`.
    #[serde(rename = "sentBytes")]
    pub sent_bytes: u64,
    /// Bytes read from the response body as it was consumed.
    #[serde(rename = "receivedBytes")]
    pub received_bytes: u64,
    pub error: Option<String>,
}

/// The taxonomy of errors that can be reported back across the worker
/// boundary. `kind` distinguishes the categories enumerated in the error
/// handling design: load failures, missing exports, bad arguments, runtime
/// exceptions thrown by plugin code, execution aborted by the caller,
/// worker terminated out from under the invocation, and internal host
/// faults that are not the plugin's fault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ErrorDetails {
    #[error("load error: {message}")]
    Load { message: String },
    #[error("function not found: {message}")]
    NotFound { message: String },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("runtime error: {name}: {message}")]
    Runtime {
        /// The thrown JS value's constructor name (`"TypeError"`, `"RangeError"`,
        /// plain `"Error"`, ...), not a host-level category.
        #[serde(default = "default_error_name")]
        name: String,
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    #[error("invocation aborted: {message}")]
    Abort { message: String },
    #[error("worker terminated: {message}")]
    Terminate { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl ErrorDetails {
    pub fn internal(message: impl Into<String>) -> Self {
        ErrorDetails::Internal {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>, stack: Option<String>) -> Self {
        ErrorDetails::Runtime {
            name: default_error_name(),
            message: message.into(),
            stack,
        }
    }

    pub fn runtime_named(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        ErrorDetails::Runtime {
            name: name.into(),
            message: message.into(),
            stack,
        }
    }

    /// The JS-style error name associated with this failure, per the
    /// `ErrorDetails.name` field callers observe at the testable boundary
    /// (`"AbortError"`, `"TerminateError"`, the thrown error's own name, ...).
    pub fn name(&self) -> &str {
        match self {
            ErrorDetails::Load { .. } => "LoadError",
            ErrorDetails::NotFound { .. } => "NotFoundError",
            ErrorDetails::InvalidArgument { .. } => "InvalidArgumentError",
            ErrorDetails::Runtime { name, .. } => name,
            ErrorDetails::Abort { .. } => "AbortError",
            ErrorDetails::Terminate { .. } => "TerminateError",
            ErrorDetails::Internal { .. } => "InternalError",
        }
    }
}

/// Result of attempting to load a plugin module into a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    /// Names of functions the module exported, when `ok`.
    #[serde(default)]
    pub exports: Vec<String>,
}

/// Result of running one invocation to completion (success or failure).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default)]
    pub fetches: Vec<FetchRecord>,
}

impl InvokeResult {
    pub fn success(value: serde_json::Value, logs: Vec<LogRecord>, fetches: Vec<FetchRecord>) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
            logs,
            fetches,
        }
    }

    pub fn failure(error: ErrorDetails, logs: Vec<LogRecord>, fetches: Vec<FetchRecord>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error),
            logs,
            fetches,
        }
    }
}

/// Messages the host sends to a worker over its stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Load {
        plugin: PluginDescriptor,
    },
    Invoke {
        token: Uuid,
        /// Caller-supplied tracing id propagated into outbound `fetch`
        /// headers; distinct from `token`, which only correlates this
        /// message to its reply (see the design notes on the two ids).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        function: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Ask a worker to abort the invocation identified by `token`, if still
    /// running. The worker answers with an `InvokeResult` carrying
    /// `ErrorDetails::Abort` for that token, same as any other completion.
    Abort {
        token: Uuid,
    },
}

/// Messages a worker sends back to the host over its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Loaded {
        result: LoadResult,
    },
    Invoked {
        token: Uuid,
        result: InvokeResult,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_descriptor_defaults_concurrency_to_one() {
        let json = r#"{"id":"p","module":"./m.js"}"#;
        let desc: PluginDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.concurrency, 1);
        assert!(desc.globals.is_empty());
    }

    #[test]
    fn error_details_round_trip_through_json() {
        let err = ErrorDetails::runtime("boom", Some("at foo.js:1:1".into()));
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: ErrorDetails = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }

    #[test]
    fn invoke_result_omits_value_on_failure() {
        let result = InvokeResult::failure(ErrorDetails::internal("x"), vec![], vec![]);
        let encoded = serde_json::to_value(&result).unwrap();
        assert!(encoded.get("value").is_none());
    }

    #[test]
    fn host_message_tags_are_camel_case() {
        let msg = HostMessage::Invoke {
            token: Uuid::nil(),
            invocation_id: None,
            function: "handler".into(),
            args: serde_json::json!({"a": 1}),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"invoke\""));
    }
}
