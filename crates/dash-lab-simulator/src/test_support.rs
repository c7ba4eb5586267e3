//! Fixtures shared by the unit tests of this crate.

use bytes::Bytes;
use dash_lab_abstract::{AppContext, Application, CloseReason, DataRate, SimTime, StreamId, TransportFamily};
use std::cell::RefCell;
use std::net::SocketAddrV4;
use std::rc::Rc;

use crate::link::attach_loss_model;
use crate::topology::{Network, assign_addresses, build_topology};
use crate::transport::TransportConfigurator;

/// Two addressed nodes with a stack of `family` on both.
pub fn connected_network(family: TransportFamily, bps: u64, loss: f64) -> Network {
    let rate = DataRate::from_bps(bps).unwrap();
    let mut network = build_topology(rate, SimTime::from_millis(2));
    attach_loss_model(network.link_mut(), loss, 1);
    network.install_stack(&TransportConfigurator::new(family).build());
    assign_addresses(&mut network).unwrap();
    network
}

#[derive(Debug, Default)]
pub struct RecorderState {
    pub started_at: Option<SimTime>,
    pub connected_at: Option<SimTime>,
    pub accepted: Option<SocketAddrV4>,
    pub received: usize,
    pub last_data_at: Option<SimTime>,
    pub closed: Option<CloseReason>,
}

/// Optionally listens or connects, then sends `to_send` bytes and records what happens.
#[derive(Default)]
pub struct Recorder {
    pub state: Rc<RefCell<RecorderState>>,
    pub listen: Option<u16>,
    pub connect: Option<SocketAddrV4>,
    pub to_send: usize,
    pub stream: StreamId,
}

impl Recorder {
    fn pump(&mut self, ctx: &mut dyn AppContext) {
        while self.to_send > 0 {
            let chunk = self.to_send.min(16 * 1024);
            let sent = ctx.send(self.stream, Bytes::from(vec![0u8; chunk]));
            self.to_send -= sent;
            if sent < chunk {
                break;
            }
        }
    }
}

impl Application for Recorder {
    fn start(&mut self, ctx: &mut dyn AppContext) {
        self.state.borrow_mut().started_at = Some(ctx.now());
        if let Some(port) = self.listen {
            ctx.listen(port);
        }
        if let Some(peer) = self.connect {
            ctx.connect(peer).unwrap();
        }
    }

    fn on_connected(&mut self, ctx: &mut dyn AppContext) {
        self.state.borrow_mut().connected_at = Some(ctx.now());
        self.pump(ctx);
    }

    fn on_accept(&mut self, ctx: &mut dyn AppContext, peer: SocketAddrV4) {
        self.state.borrow_mut().accepted = Some(peer);
        self.pump(ctx);
    }

    fn on_data(&mut self, ctx: &mut dyn AppContext, _stream: StreamId, data: Bytes) {
        let mut state = self.state.borrow_mut();
        state.received += data.len();
        state.last_data_at = Some(ctx.now());
    }

    fn on_send_space(&mut self, ctx: &mut dyn AppContext) {
        self.pump(ctx);
    }

    fn on_closed(&mut self, _ctx: &mut dyn AppContext, reason: CloseReason) {
        self.state.borrow_mut().closed = Some(reason);
    }
}
