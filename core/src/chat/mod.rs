pub mod connection;
pub mod manager;
/// Realtime chat channel modules
pub mod protocol;

pub use connection::{
    Channel, ChannelEvent, Connection, ConnectionState, Connector, FrameSink, FrameStream,
    WsConnector,
};
pub use manager::ConnectionManager;
pub use protocol::{decode_inbound, InboundFrame, OutboundFrame, MAX_MESSAGE_LEN};
