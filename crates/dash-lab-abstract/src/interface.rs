use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddrV4;

use crate::error::TransportError;
use crate::units::{NodeId, SimTime};

/// Logical stream within a connection. The reliable family only uses stream 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection stopped carrying data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Too many consecutive retransmission timeouts.
    TimedOut,
    /// The handshake never completed.
    ConnectFailed,
}

/// The capability the simulator hands to an application for the duration of one callback.
pub trait AppContext {
    /// Current simulated time.
    fn now(&self) -> SimTime;

    /// Node the application runs on.
    fn node(&self) -> NodeId;

    /// Accept one incoming connection on `port`.
    fn listen(&mut self, port: u16);

    /// Open a connection to `peer`. Completion is signalled by [`Application::on_connected`].
    fn connect(&mut self, peer: SocketAddrV4) -> Result<(), TransportError>;

    /// Queue bytes on `stream`. Returns how many bytes the send buffer accepted;
    /// the rest must be offered again after [`Application::on_send_space`].
    fn send(&mut self, stream: StreamId, data: Bytes) -> usize;

    /// Free send buffer space for `stream`.
    fn send_space(&self, stream: StreamId) -> usize;

    /// Arm application timer `timer_id`. Re-arming an armed timer replaces it.
    fn start_timer(&mut self, delay: SimTime, timer_id: u32);

    /// Cancel a running timer.
    fn cancel_timer(&mut self, timer_id: u32);

    /// Log a message to the simulator's output, prefixed with the node.
    fn log(&mut self, message: &str);

    /// Record a numeric sample for the run report.
    fn record_metric(&mut self, _name: &str, _value: f64) {}
}

/// An application installed on one node of the topology.
pub trait Application {
    /// Called at the application's scheduled start time.
    fn start(&mut self, ctx: &mut dyn AppContext);

    /// The connection this node opened is established.
    fn on_connected(&mut self, _ctx: &mut dyn AppContext) {}

    /// A peer connected to the port this node listens on.
    fn on_accept(&mut self, _ctx: &mut dyn AppContext, _peer: SocketAddrV4) {}

    /// In-order bytes arrived on `stream`.
    fn on_data(&mut self, ctx: &mut dyn AppContext, stream: StreamId, data: Bytes);

    /// Send buffer space was freed by acknowledgements.
    fn on_send_space(&mut self, _ctx: &mut dyn AppContext) {}

    /// A timer armed through [`AppContext::start_timer`] fired.
    fn on_timer(&mut self, _ctx: &mut dyn AppContext, _timer_id: u32) {}

    /// The connection failed and will carry no more data.
    fn on_closed(&mut self, _ctx: &mut dyn AppContext, _reason: CloseReason) {}

    /// Called once at teardown. No further events can be scheduled.
    fn stop(&mut self) {}
}
