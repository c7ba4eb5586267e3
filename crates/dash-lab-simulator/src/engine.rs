use bytes::Bytes;
use dash_lab_abstract::{
    AppContext, Application, NodeId, Packet, SetupError, SimTime, StreamId, TransportError,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info};

use crate::topology::Network;
use crate::trace::{DeviceReport, SimulationReport, TransportReport};
use crate::transport::{TimerKind, TimerRequest, TransportEvent, TransportStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    App(u32),
    Transport(TimerKind),
}

#[derive(Debug)]
enum EventType {
    AppStart {
        node: NodeId,
    },
    TransmitComplete {
        node: NodeId,
    },
    PacketArrival {
        to: NodeId,
        packet: Packet,
    },
    TimerExpiry {
        node: NodeId,
        key: TimerKey,
        generation: u64,
    },
}

#[derive(Debug)]
struct Event {
    time: SimTime,
    event_type: EventType,
    id: u64, // Unique ID to differentiate events at same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for time: smallest time is Greater in BinaryHeap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

enum TimerOp {
    Start(SimTime, u32),
    Cancel(u32),
}

/// Actions buffered during an application callback
#[derive(Default)]
struct ActionBuffer {
    timers: Vec<TimerOp>,
    logs: Vec<String>,
    metrics: Vec<(String, f64)>,
}

/// Context handed to an application for one callback
struct ScopedContext<'a> {
    buffer: &'a mut ActionBuffer,
    stack: &'a mut TransportStack,
    local: Option<Ipv4Addr>,
    node: NodeId,
    now: SimTime,
}

impl AppContext for ScopedContext<'_> {
    fn now(&self) -> SimTime {
        self.now
    }

    fn node(&self) -> NodeId {
        self.node
    }

    fn listen(&mut self, port: u16) {
        self.stack.listen(port);
    }

    fn connect(&mut self, peer: SocketAddrV4) -> Result<(), TransportError> {
        self.stack.connect(self.local, peer, self.now)
    }

    fn send(&mut self, stream: StreamId, data: Bytes) -> usize {
        self.stack.write(stream, data, self.now)
    }

    fn send_space(&self, stream: StreamId) -> usize {
        self.stack.send_space(stream)
    }

    fn start_timer(&mut self, delay: SimTime, timer_id: u32) {
        self.buffer.timers.push(TimerOp::Start(delay, timer_id));
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.buffer.timers.push(TimerOp::Cancel(timer_id));
    }

    fn log(&mut self, message: &str) {
        self.buffer.logs.push(message.to_string());
    }

    fn record_metric(&mut self, name: &str, value: f64) {
        self.buffer.metrics.push((name.to_string(), value));
    }
}

/// Handle returned when an application is installed on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppHandle {
    node: NodeId,
}

impl AppHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

struct InstalledApp {
    app: Box<dyn Application>,
    start: SimTime,
}

/// Single-threaded discrete-event driver over a [`Network`].
///
/// Events are ordered by time, ties by insertion order. Application timers
/// and transport timers use generation counters: re-arming or cancelling a
/// timer invalidates every earlier expiry of the same key.
pub struct Simulator {
    time: SimTime,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,
    events_processed: u64,
    started: bool,
    stop_time: Option<SimTime>,

    network: Network,
    apps: [Option<InstalledApp>; 2],

    /// Arbitrary time-series metrics recorded via `AppContext::record_metric`
    metrics: BTreeMap<String, Vec<(SimTime, f64)>>,

    /// Timer generations to handle cancellation.
    timer_generations: HashMap<(NodeId, TimerKey), u64>,
}

impl Simulator {
    pub fn new(network: Network) -> Self {
        Self {
            time: SimTime::ZERO,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            events_processed: 0,
            started: false,
            stop_time: None,
            network,
            apps: [None, None],
            metrics: BTreeMap::new(),
            timer_generations: HashMap::new(),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Install `app` on `node`. The node needs a transport stack and hosts at
    /// most one application.
    pub fn install_application(
        &mut self,
        node: NodeId,
        app: Box<dyn Application>,
    ) -> Result<AppHandle, SetupError> {
        if self.network.node(node).stack().is_none() {
            return Err(SetupError::StackNotInstalled(node));
        }
        let slot = &mut self.apps[node.index()];
        if slot.is_some() {
            return Err(SetupError::NodeOccupied(node));
        }
        *slot = Some(InstalledApp {
            app,
            start: SimTime::ZERO,
        });
        Ok(AppHandle { node })
    }

    pub fn set_start_time(&mut self, handle: &AppHandle, start: SimTime) {
        if let Some(installed) = self.apps[handle.node.index()].as_mut() {
            installed.start = start;
        }
    }

    pub fn start_time(&self, handle: &AppHandle) -> Option<SimTime> {
        self.apps[handle.node.index()]
            .as_ref()
            .map(|installed| installed.start)
    }

    /// Events scheduled after `stop` are discarded instead of executed.
    pub fn set_stop_time(&mut self, stop: SimTime) {
        self.stop_time = Some(stop);
    }

    pub fn peek_next_event_time(&self) -> Option<SimTime> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn current_time(&self) -> SimTime {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn metric_series(&self, name: &str) -> Option<&[(SimTime, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    fn push_event(&mut self, time: SimTime, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    fn init(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let mut starts: Vec<(SimTime, NodeId)> = NodeId::ALL
            .into_iter()
            .filter_map(|node| self.apps[node.index()].as_ref().map(|a| (a.start, node)))
            .collect();
        starts.sort_by_key(|(time, _)| *time);
        for (time, node) in starts {
            self.push_event(time, EventType::AppStart { node });
        }
    }

    /// Run until no events remain or the stop time is reached.
    pub fn run(&mut self) {
        self.init();
        while self.step() {}
    }

    /// Process the next event. Returns false once there is nothing left to do.
    pub fn step(&mut self) -> bool {
        self.init();
        if let (Some(stop), Some(next)) = (self.stop_time, self.peek_next_event_time())
            && next > stop
        {
            debug!("Stop time {} reached, discarding {} events", stop, self.event_queue.len());
            self.event_queue.clear();
            self.time = stop;
            return false;
        }
        let Some(event) = self.event_queue.pop() else {
            return false;
        };

        self.time = event.time;
        self.events_processed += 1;

        match event.event_type {
            EventType::AppStart { node } => {
                debug!("[{:?}] application start at {}", node, self.time);
                self.invoke_app(node, |app, ctx| app.start(ctx));
                self.flush_transport(node);
            }
            EventType::TransmitComplete { node } => {
                if let Some(next) = self.network.link_mut().device_mut(node).transmit_complete() {
                    self.start_transmit(node, next);
                }
            }
            EventType::PacketArrival { to, packet } => {
                let now = self.time;
                if !self.network.link_mut().device_mut(to).receive(now, &packet) {
                    return true;
                }
                let events = match self.network.stack_mut(to) {
                    Some(stack) => stack.on_packet(packet, now),
                    None => Vec::new(),
                };
                self.dispatch(to, events);
            }
            EventType::TimerExpiry {
                node,
                key,
                generation,
            } => {
                // Check if this timer event is still valid by comparing generations
                let current = self.timer_generations.get(&(node, key)).copied();
                if current != Some(generation) {
                    debug!("Skipping cancelled timer {:?} on {:?}", key, node);
                    return true;
                }
                match key {
                    TimerKey::App(id) => {
                        self.invoke_app(node, |app, ctx| app.on_timer(ctx, id));
                        self.flush_transport(node);
                    }
                    TimerKey::Transport(kind) => {
                        let now = self.time;
                        let events = match self.network.stack_mut(node) {
                            Some(stack) => stack.on_timer(kind, now),
                            None => Vec::new(),
                        };
                        self.dispatch(node, events);
                    }
                }
            }
        }
        true
    }

    /// Stop every application and produce the run report. Consuming the
    /// simulator guarantees nothing is scheduled afterwards.
    pub fn teardown(mut self) -> SimulationReport {
        for installed in self.apps.iter_mut().flatten() {
            installed.app.stop();
        }
        self.network.flush_captures();
        info!(
            "Teardown at {} after {} events",
            self.time, self.events_processed
        );

        let link = self.network.link();
        let devices = NodeId::ALL
            .iter()
            .map(|&node| {
                let device = link.device(node);
                DeviceReport {
                    node,
                    stats: device.stats().clone(),
                    loss_rate: device.receive_error_model().map(|m| m.rate()),
                    capture: device.capture().map(|p| p.to_path_buf()),
                }
            })
            .collect();
        let transports = NodeId::ALL
            .iter()
            .filter_map(|&node| {
                self.network.node(node).stack().map(|stack| TransportReport {
                    node,
                    family: stack.family(),
                    stats: stack.stats(),
                })
            })
            .collect();

        SimulationReport {
            duration: self.time,
            events_processed: self.events_processed,
            devices,
            transports,
            metrics: self.metrics,
        }
    }

    fn invoke_app<F>(&mut self, node: NodeId, f: F)
    where
        F: FnOnce(&mut dyn Application, &mut dyn AppContext),
    {
        let now = self.time;
        let Some(installed) = self.apps[node.index()].as_mut() else {
            return;
        };
        let (local, stack) = self.network.host_mut(node);
        let Some(stack) = stack else {
            return;
        };
        let mut buffer = ActionBuffer::default();
        {
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                stack,
                local,
                node,
                now,
            };
            f(installed.app.as_mut(), &mut ctx);
        }
        self.process_actions(node, buffer);
    }

    fn dispatch(&mut self, node: NodeId, events: Vec<TransportEvent>) {
        for event in events {
            match event {
                TransportEvent::Connected => self.invoke_app(node, |app, ctx| app.on_connected(ctx)),
                TransportEvent::Accepted(peer) => {
                    self.invoke_app(node, |app, ctx| app.on_accept(ctx, peer))
                }
                TransportEvent::Data(stream, data) => {
                    self.invoke_app(node, |app, ctx| app.on_data(ctx, stream, data))
                }
                TransportEvent::SendSpace => self.invoke_app(node, |app, ctx| app.on_send_space(ctx)),
                TransportEvent::Closed(reason) => {
                    self.invoke_app(node, |app, ctx| app.on_closed(ctx, reason))
                }
            }
        }
        self.flush_transport(node);
    }

    fn process_actions(&mut self, source_node: NodeId, buffer: ActionBuffer) {
        // First, fold metrics into simulator-wide store
        for (name, value) in buffer.metrics {
            self.metrics
                .entry(name)
                .or_default()
                .push((self.time, value));
        }

        for log in buffer.logs {
            info!("[{:?}] {}", source_node, log);
        }

        for op in buffer.timers {
            match op {
                TimerOp::Start(delay, id) => {
                    self.schedule_timer(source_node, TimerKey::App(id), self.time + delay)
                }
                TimerOp::Cancel(id) => self.cancel_timer(source_node, TimerKey::App(id)),
            }
        }
    }

    /// Apply the timer requests and transmit the packets a stack produced.
    fn flush_transport(&mut self, node: NodeId) {
        let Some(stack) = self.network.stack_mut(node) else {
            return;
        };
        let outbox = stack.take_outbox();
        for request in outbox.timers {
            match request {
                TimerRequest::Arm(kind, at) => self.schedule_timer(node, TimerKey::Transport(kind), at),
                TimerRequest::Cancel(kind) => self.cancel_timer(node, TimerKey::Transport(kind)),
            }
        }
        for packet in outbox.packets {
            self.send_from(node, packet);
        }
    }

    fn schedule_timer(&mut self, node: NodeId, key: TimerKey, at: SimTime) {
        let generation = self.timer_generations.entry((node, key)).or_insert(0);
        *generation += 1;
        let generation = *generation;
        self.push_event(
            at.max(self.time),
            EventType::TimerExpiry {
                node,
                key,
                generation,
            },
        );
    }

    fn cancel_timer(&mut self, node: NodeId, key: TimerKey) {
        // Increment the generation to invalidate existing timer events
        *self.timer_generations.entry((node, key)).or_insert(0) += 1;
    }

    fn send_from(&mut self, node: NodeId, packet: Packet) {
        if let Some(packet) = self.network.link_mut().device_mut(node).enqueue(packet) {
            self.start_transmit(node, packet);
        }
    }

    fn start_transmit(&mut self, node: NodeId, packet: Packet) {
        let now = self.time;
        let link = self.network.link_mut();
        let delay = link.delay();
        let tx_time = link.device_mut(node).begin_transmit(now, &packet);
        self.push_event(now + tx_time, EventType::TransmitComplete { node });
        self.push_event(
            now + tx_time + delay,
            EventType::PacketArrival {
                to: node.peer(),
                packet,
            },
        );
    }
}
