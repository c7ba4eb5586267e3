pub mod config;
pub mod error;
pub mod interface;
pub mod packet;
pub mod scenario;
pub mod units;

pub use config::{
    BUFFER_BYTES, CLIENT_START, LINK_DELAY, MAX_PACKET_SIZE, RunConfig, RunParameters,
    SEGMENT_DURATION, SERVER_PORT, SERVER_START, TransportDefaults, TransportFamily,
};
pub use error::{SetupError, TransportError};
pub use interface::{AppContext, Application, CloseReason, StreamId};
pub use packet::{Packet, PacketHeader, flags};
pub use scenario::SweepPlan;
pub use units::{DataRate, NodeId, SimTime};
