//! Typed method-call channels between modules.
//!
//! A `ChannelReceiver` exposes a module's `MethodTable` under the module's
//! unique request path. A `ChannelSender` discovers the receiver's methods
//! with a handshake over the message bus and then calls them, directly when
//! both live on the same endpoint and over the bus otherwise.
//!
//! Wire messages, all suffixed with the receiver's unique path:
//!
//! | message type                     | payload              | answer              |
//! |----------------------------------|----------------------|---------------------|
//! | `channel.message:<id>`           | `ChannelMessage`     | result or `$error`  |
//! | `channel.requestMessageTypes:<id>` | none               | `MessageTypes`      |
//! | `channel.messageTypes:<id>`      | `MessageTypes`       | none                |
//! | `channel.moved:<id>`             | `{"endpoint": n}`    | none                |
//! | `channel.state:<id>`             | `{"enabled": bool}`  | none                |

mod hub;
mod receiver;
mod sender;
mod types;

pub use hub::ChannelHub;
pub use receiver::ChannelReceiver;
pub use sender::ChannelSender;
pub use types::{
    message_types, ChannelCall, ChannelMessage, ExposesChannelMethods, MessageTypes, MethodFuture,
    MethodHandler, MethodTable, ERROR_MARKER,
};
