use bytes::{Buf, Bytes, BytesMut};
use dash_lab_abstract::{AppContext, Application, StreamId};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use tracing::info;

/// Requests are one big-endian u64: the number of bytes wanted.
pub const REQUEST_LEN: usize = 8;

static ZEROS: [u8; 64 * 1024] = [0; 64 * 1024];

struct Response {
    stream: StreamId,
    remaining: u64,
}

/// Answers every request with the asked-for number of zero bytes on the
/// stream the request arrived on.
pub struct SegmentServer {
    port: u16,
    inbound: HashMap<StreamId, BytesMut>,
    responses: VecDeque<Response>,
    requests: u64,
    bytes_served: u64,
}

impl SegmentServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inbound: HashMap::new(),
            responses: VecDeque::new(),
            requests: 0,
            bytes_served: 0,
        }
    }

    fn pump(&mut self, ctx: &mut dyn AppContext) {
        while let Some(response) = self.responses.front_mut() {
            if response.remaining == 0 {
                self.responses.pop_front();
                continue;
            }
            let chunk = response.remaining.min(ZEROS.len() as u64) as usize;
            let sent = ctx.send(response.stream, Bytes::from_static(&ZEROS[..chunk]));
            response.remaining -= sent as u64;
            self.bytes_served += sent as u64;
            if sent < chunk {
                break;
            }
        }
    }
}

impl Application for SegmentServer {
    fn start(&mut self, ctx: &mut dyn AppContext) {
        ctx.listen(self.port);
        ctx.log(&format!("listening on port {}", self.port));
    }

    fn on_accept(&mut self, ctx: &mut dyn AppContext, peer: SocketAddrV4) {
        ctx.log(&format!("accepted connection from {peer}"));
        self.pump(ctx);
    }

    fn on_data(&mut self, ctx: &mut dyn AppContext, stream: StreamId, data: Bytes) {
        let buffer = self.inbound.entry(stream).or_default();
        buffer.extend_from_slice(&data);
        while buffer.len() >= REQUEST_LEN {
            let size = buffer.get_u64();
            self.requests += 1;
            self.responses.push_back(Response {
                stream,
                remaining: size,
            });
        }
        self.pump(ctx);
    }

    fn on_send_space(&mut self, ctx: &mut dyn AppContext) {
        self.pump(ctx);
    }

    fn stop(&mut self) {
        info!(
            "Server answered {} requests with {} bytes",
            self.requests, self.bytes_served
        );
    }
}
