use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ipc::EndpointId;
use crate::{RequestPath, Result, WeftError};

/// Bus message type names used by channels. Each is suffixed with the
/// receiver's unique path.
pub mod message_types {
    pub const MESSAGE: &str = "channel.message:";
    pub const REQUEST_MESSAGE_TYPES: &str = "channel.requestMessageTypes:";
    pub const MESSAGE_TYPES: &str = "channel.messageTypes:";
    pub const MOVED: &str = "channel.moved:";
    pub const STATE: &str = "channel.state:";

    pub fn message(key: &str) -> String {
        format!("{MESSAGE}{key}")
    }

    pub fn request_message_types(key: &str) -> String {
        format!("{REQUEST_MESSAGE_TYPES}{key}")
    }

    pub fn message_types(key: &str) -> String {
        format!("{MESSAGE_TYPES}{key}")
    }

    pub fn moved(key: &str) -> String {
        format!("{MOVED}{key}")
    }

    pub fn state(key: &str) -> String {
        format!("{STATE}{key}")
    }
}

/// Key of the error marker a receiver answers with when a handler fails.
pub const ERROR_MARKER: &str = "$error";

/// One method invocation as seen by a receiver handler.
#[derive(Debug, Clone)]
pub struct ChannelCall {
    pub sender_id: Option<RequestPath>,
    pub sub_channel: Option<String>,
    pub method: String,
    pub args: Vec<Value>,
}

impl ChannelCall {
    /// Argument `index`, `Value::Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
pub type MethodHandler = Arc<dyn Fn(ChannelCall) -> MethodFuture + Send + Sync>;

/// Name → handler table a receiver exposes.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use weft_core::channel::MethodTable;
///
/// let table = MethodTable::new()
///     .with("add", |call| async move {
///         let a = call.arg(0).as_i64().unwrap_or(0);
///         let b = call.arg(1).as_i64().unwrap_or(0);
///         Ok(json!(a + b))
///     });
/// assert_eq!(table.names(), vec!["add".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: HashMap<String, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ChannelCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.insert(name, handler);
        self
    }

    pub fn insert<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ChannelCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |call| Box::pin(handler(call)) as MethodFuture);
        self.handlers.insert(name.into(), handler);
    }

    /// Adds every entry of `other`, replacing handlers with the same name.
    pub fn merge(mut self, other: MethodTable) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn get(&self, name: &str) -> Option<MethodHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.names())
            .finish()
    }
}

/// Implemented by module types that can be called through a channel.
///
/// The table is declared explicitly; modules built from parts compose the
/// parts' tables with `MethodTable::merge`.
pub trait ExposesChannelMethods: Send + Sync + 'static {
    fn channel_methods(self: Arc<Self>) -> MethodTable;
}

/// Payload of `channel.message:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub sender_id: Option<RequestPath>,
    pub sub_channel_id: Option<String>,
    pub method_name: String,
    pub args: Vec<Value>,
}

/// Method advertisement of a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTypes {
    pub endpoint: EndpointId,
    pub enabled: bool,
    pub global: Vec<String>,
    pub sub_channels: BTreeMap<String, Vec<String>>,
}

impl MessageTypes {
    /// Method names callable through `sub_channel`, or `None` when that sub-channel does not exist.
    pub fn methods_for(&self, sub_channel: Option<&str>) -> Option<BTreeSet<String>> {
        let mut names: BTreeSet<String> = self.global.iter().cloned().collect();
        if let Some(sub) = sub_channel {
            names.extend(self.sub_channels.get(sub)?.iter().cloned());
        }
        Some(names)
    }
}

pub(crate) fn error_marker(error: &WeftError) -> Value {
    json!({ ERROR_MARKER: error.to_string() })
}

/// Turns a receiver's answer back into a result.
pub(crate) fn from_wire_result(value: Value) -> Result<Value> {
    match value.get(ERROR_MARKER).and_then(Value::as_str) {
        Some(message) => Err(WeftError::Remote(message.to_string())),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_for_missing_sub_channel_is_none() {
        let types = MessageTypes {
            endpoint: EndpointId(1),
            enabled: true,
            global: vec!["foo".into()],
            sub_channels: BTreeMap::from([("editor".to_string(), vec!["bar".to_string()])]),
        };
        assert!(types.methods_for(Some("viewer")).is_none());
        let names = types.methods_for(Some("editor")).unwrap();
        assert!(names.contains("foo") && names.contains("bar"));
        assert_eq!(types.methods_for(None).unwrap().len(), 1);
    }

    #[test]
    fn error_marker_round_trips() {
        let marker = error_marker(&WeftError::Channel("boom".into()));
        assert!(matches!(from_wire_result(marker), Err(WeftError::Remote(m)) if m.contains("boom")));
        assert_eq!(from_wire_result(json!(5)).unwrap(), json!(5));
    }
}
