// Device Connections
//
// This crate defines the connection capability the gateway supervises and
// the bridge transport that implements it.

pub mod adapter;
pub mod platforms;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{
    Connection, ConnectionInfo, Connector, InboundTextMessage, MessageHandler, MessageInfo,
    OutgoingMessage, TransportError, TransportErrorKind,
};
pub use platforms::bridge::{BridgeConnection, BridgeConnector};
