//! RDA client source stage
//!
//! Connects to an RDA server and turns the received stream back into blocks.
//! An IO thread owns the socket and follows the server's lifecycle: START and
//! the first IMP_DATA after IMP_START start this stage, STOP and IMP_STOP stop
//! it. Data messages are handed to the stage worker through a bounded queue
//! and re-blocked to about 50 ms per block.

use super::protocol::{
    DEFAULT_PORT, DataBlock, HEADER_SIZE, Header, ImpedanceEntry, MAX_BODY_SIZE, Message, StartInfo,
};
use crate::runtime::block::{ChannelDescriptor, IMPEDANCE_DATA, IMPEDANCE_GND, IMPEDANCE_INVALID, IMPEDANCE_REF};
use crate::runtime::block::{Marker, RecordingMode, SampleMatrix, StreamBlock};
use crate::runtime::errors::{Severity, StageError, StageResult};
use crate::runtime::event::{EventKind, EventSink, ModuleEvent};
use crate::runtime::node::{LifecycleRequest, Module, ModuleContext, Output};
use crate::runtime::stage::StageHandle;
use chrono::{DateTime, Local, TimeDelta};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Command event connecting the client; a non-empty value replaces the address
pub const CONNECT_COMMAND: &str = "RdaConnect";
pub const DISCONNECT_COMMAND: &str = "RdaDisconnect";

/// Received messages the IO thread may queue for the stage worker
pub const INPUT_QUEUE_SIZE: usize = 100;

/// Target duration of an output block
const BLOCK_DURATION: f64 = 0.05;
const MIN_BLOCK_SAMPLES: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(50);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdaClientSettings {
    /// Server address as host:port
    pub address: String,
    /// Connect again after the connection was lost
    pub auto_reconnect: bool,
    /// Connect as soon as the stage is created
    pub connect: bool,
}

impl Default for RdaClientSettings {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", DEFAULT_PORT),
            auto_reconnect: false,
            connect: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Idle,
        }
    }
}

/// Stream layout announced by the server
#[derive(Clone, Debug, Default)]
struct Session {
    channels: Vec<ChannelDescriptor>,
    resolutions: Vec<f64>,
    sample_rate: f64,
    mode: RecordingMode,
    /// A START was received and not yet stopped
    valid: bool,
    /// IMP_START received, layout follows with the first IMP_DATA
    impedance_pending: bool,
    /// Row and column of every IMP_DATA entry
    impedance_cells: Vec<(usize, usize)>,
}

impl Session {
    fn apply_start(&mut self, start: &StartInfo) {
        self.channels = start
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| ChannelDescriptor::signal(i + 1, name.clone()))
            .collect();
        self.resolutions = start.resolutions.clone();
        self.resolutions.resize(self.channels.len(), 1.0);
        self.sample_rate = start.sample_rate();
        self.mode = RecordingMode::Normal;
        self.valid = true;
        self.impedance_pending = false;
    }

    /// Electrodes from the entry names: `X+` and `X-` are the data and
    /// reference slots of channel X, `GND` the ground shared by all channels
    fn apply_impedance_layout(&mut self, entries: &[ImpedanceEntry]) {
        let mut channels: Vec<ChannelDescriptor> = Vec::new();
        let mut cells = Vec::with_capacity(entries.len());
        let mut ground = false;
        for entry in entries {
            if entry.name == "GND" {
                ground = true;
                cells.push((usize::MAX, IMPEDANCE_GND));
                continue;
            }
            let (base, column) = if let Some(base) = entry.name.strip_suffix('-') {
                (base, IMPEDANCE_REF)
            } else {
                (entry.name.strip_suffix('+').unwrap_or(&entry.name), IMPEDANCE_DATA)
            };
            let row = match channels.iter().position(|c| c.name == base) {
                Some(row) => row,
                None => {
                    channels.push(ChannelDescriptor::signal(channels.len() + 1, base));
                    channels.len() - 1
                }
            };
            if column == IMPEDANCE_REF {
                channels[row].impedance.reference = true;
            } else {
                channels[row].impedance.data = true;
            }
            cells.push((row, column));
        }
        if ground {
            for channel in channels.iter_mut() {
                channel.impedance.ground = true;
            }
        }
        self.channels = channels;
        self.resolutions = vec![1.0; self.channels.len()];
        self.impedance_cells = cells;
        self.mode = RecordingMode::Impedance;
        self.valid = true;
        self.impedance_pending = false;
    }

    fn params(&self) -> StreamBlock {
        let mut params = StreamBlock::empty(self.channels.clone(), self.sample_rate);
        params.mode = self.mode;
        params
    }
}

enum Inbound {
    Data(DataBlock),
    Impedance(Vec<ImpedanceEntry>),
}

/// State shared by the stage and its IO thread
struct ClientShared {
    running: AtomicBool,
    state: AtomicU8,
    address: Mutex<String>,
    auto_reconnect: bool,
    session: Mutex<Session>,
    stage: Mutex<StageHandle>,
    events: Mutex<EventSink>,
    data_tx: Sender<Inbound>,
}

impl ClientShared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn events(&self) -> EventSink {
        self.events.lock().unwrap().clone()
    }

    fn stage(&self) -> StageHandle {
        self.stage.lock().unwrap().clone()
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let address = self.address.lock().unwrap().clone();
        let mut last_error = std::io::Error::new(ErrorKind::NotFound, format!("cannot resolve {}", address));
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(READ_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn start_stage(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let stage = self.stage();
        if stage.is_running() {
            stage.stop();
        }
        if let Err(e) = stage.start() {
            warn!("[RDA Client] Start failed: {}", e);
        }
    }

    fn stop_stage(&self) {
        if self.running.load(Ordering::Acquire) {
            self.stage().stop();
        }
    }

    fn forward(&self, item: Inbound) {
        match self.data_tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self
                .events()
                .error("RDA input queue FULL, overrun!", Severity::Notify),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Handle one message received from the server
    fn dispatch(&self, header: Header, body: &[u8]) -> StageResult {
        if !header.is_valid() {
            return Err(StageError::Protocol("Invalid data type (GUID)".to_string()));
        }
        let channels = self.session.lock().unwrap().channels.len();
        match Message::decode(header.kind, body, channels)? {
            Message::Start(start) => {
                self.session.lock().unwrap().apply_start(&start);
                debug!(
                    "[RDA Client] START {} channels at {} Hz",
                    start.names.len(),
                    start.sample_rate()
                );
                self.start_stage();
            }
            Message::ImpStart => {
                let mut session = self.session.lock().unwrap();
                session.impedance_pending = true;
                session.mode = RecordingMode::Impedance;
            }
            Message::ImpData(entries) => {
                if self.stage().is_running() {
                    self.forward(Inbound::Impedance(entries));
                } else {
                    let pending = {
                        let mut session = self.session.lock().unwrap();
                        if session.impedance_pending {
                            session.apply_impedance_layout(&entries);
                        }
                        session.valid && session.mode == RecordingMode::Impedance
                    };
                    if pending {
                        self.start_stage();
                        self.forward(Inbound::Impedance(entries));
                    }
                }
            }
            Message::Stop | Message::ImpStop => {
                {
                    let mut session = self.session.lock().unwrap();
                    session.valid = false;
                    session.impedance_pending = false;
                }
                self.stop_stage();
            }
            Message::Data32(data) | Message::Data16(data) => {
                if self.stage().is_running() {
                    self.forward(Inbound::Data(data));
                }
            }
            Message::NewState(state) => debug!("[RDA Client] Server state {}", state),
            Message::Info(_) | Message::Handshake | Message::KeepAlive => {}
        }
        Ok(())
    }

    /// Connection lost or dropped on purpose
    fn disconnected(&self, reason: &str) {
        info!("[RDA Client] Disconnected: {}", reason);
        self.stop_stage();
        self.session.lock().unwrap().valid = false;
        self.events().log_message(format!("RDA disconnected: {}", reason));
        self.events().status("Connection", "disconnected");
    }
}

/// Reassembles header and body from a socket with read timeout
#[derive(Default)]
struct FrameReader {
    head: [u8; HEADER_SIZE],
    header: Option<Header>,
    body: Vec<u8>,
    filled: usize,
}

impl FrameReader {
    /// Complete frame, or `None` if the read timed out first. Invalid headers
    /// are returned without body; a body above `MAX_BODY_SIZE` is an
    /// `InvalidData` error.
    fn poll(&mut self, stream: &mut impl Read) -> std::io::Result<Option<(Header, Vec<u8>)>> {
        loop {
            match self.header {
                None if self.filled == HEADER_SIZE => {
                    let header = Header::decode(&self.head);
                    self.filled = 0;
                    if !header.is_valid() {
                        return Ok(Some((header, Vec::new())));
                    }
                    if header.body_len() > MAX_BODY_SIZE {
                        return Err(std::io::Error::new(
                            ErrorKind::InvalidData,
                            format!("message body of {} bytes exceeds the limit", header.body_len()),
                        ));
                    }
                    self.header = Some(header);
                    self.body = vec![0u8; header.body_len()];
                    continue;
                }
                Some(header) if self.filled == self.body.len() => {
                    self.header = None;
                    self.filled = 0;
                    return Ok(Some((header, std::mem::take(&mut self.body))));
                }
                _ => {}
            }

            let buffer = match self.header {
                None => &mut self.head[self.filled..],
                Some(_) => &mut self.body[self.filled..],
            };
            match stream.read(buffer) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "connection closed by server",
                    ));
                }
                Ok(n) => self.filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

fn io_loop(shared: Arc<ClientShared>, done: Sender<()>) {
    let mut connection: Option<(TcpStream, FrameReader)> = None;
    while shared.running.load(Ordering::Acquire) {
        match shared.state() {
            ConnectionState::Idle => {
                if let Some((stream, _)) = connection.take() {
                    let _ = stream.shutdown(Shutdown::Both);
                    shared.disconnected("closed by user");
                }
                thread::sleep(IDLE_POLL);
            }
            ConnectionState::Connecting => match shared.connect() {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    connection = Some((stream, FrameReader::default()));
                    shared.set_state(ConnectionState::Connected);
                    info!("[RDA Client] Connected to {}", peer);
                    let events = shared.events();
                    events.log_message(format!("RDA connected to {}", peer));
                    events.status("Connection", peer);
                }
                Err(e) => {
                    debug!("[RDA Client] Connect failed: {}", e);
                    thread::sleep(RETRY_INTERVAL);
                }
            },
            ConnectionState::Connected => {
                let Some((stream, reader)) = connection.as_mut() else {
                    shared.set_state(ConnectionState::Idle);
                    continue;
                };
                let failure = match reader.poll(stream) {
                    Ok(Some((header, body))) => match shared.dispatch(header, &body) {
                        Ok(()) => None,
                        Err(e) => {
                            shared.events().error(e.to_string(), Severity::Notify);
                            Some((e.to_string(), matches!(e, StageError::Protocol(_))))
                        }
                    },
                    Ok(None) => None,
                    Err(e) if e.kind() == ErrorKind::InvalidData => {
                        shared.events().error(e.to_string(), Severity::Notify);
                        Some((e.to_string(), true))
                    }
                    Err(e) => Some((e.to_string(), false)),
                };
                if let Some((reason, protocol_error)) = failure {
                    if let Some((stream, _)) = connection.take() {
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                    shared.disconnected(&reason);
                    let next = if shared.auto_reconnect && !protocol_error {
                        ConnectionState::Connecting
                    } else {
                        ConnectionState::Idle
                    };
                    shared.set_state(next);
                }
            }
        }
    }
    if let Some((stream, _)) = connection.take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
    let _ = done.send(());
    debug!("[RDA Client] IO thread finished");
}

pub struct RdaClient {
    settings: RdaClientSettings,
    shared: Arc<ClientShared>,
    events: EventSink,
    data_rx: Receiver<Inbound>,
    io_done: Option<Receiver<()>>,
    /// Samples of the data messages not yet handed out, interleaved
    buffer: Vec<f32>,
    buffered: usize,
    markers: Vec<Marker>,
    last_block: Option<u32>,
    sample_counter: u64,
    start_time: DateTime<Local>,
}

impl RdaClient {
    pub fn new(settings: RdaClientSettings) -> StageResult<Self> {
        let (data_tx, data_rx) = bounded(INPUT_QUEUE_SIZE);
        let initial = if settings.connect {
            ConnectionState::Connecting
        } else {
            ConnectionState::Idle
        };
        let shared = Arc::new(ClientShared {
            running: AtomicBool::new(true),
            state: AtomicU8::new(initial as u8),
            address: Mutex::new(settings.address.clone()),
            auto_reconnect: settings.auto_reconnect,
            session: Mutex::new(Session::default()),
            stage: Mutex::new(StageHandle::default()),
            events: Mutex::new(EventSink::default()),
            data_tx,
        });

        let (done_tx, done_rx) = bounded(1);
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("rda-client".to_string())
            .spawn(move || io_loop(thread_shared, done_tx))?;

        Ok(Self {
            settings,
            shared,
            events: EventSink::default(),
            data_rx,
            io_done: Some(done_rx),
            buffer: Vec::new(),
            buffered: 0,
            markers: Vec::new(),
            last_block: None,
            sample_counter: 0,
            start_time: Local::now(),
        })
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        let settings = if settings.is_null() {
            RdaClientSettings::default()
        } else {
            serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))?
        };
        Self::new(settings)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn connect(&self, address: Option<&str>) {
        if let Some(address) = address {
            *self.shared.address.lock().unwrap() = address.to_string();
        }
        if self.shared.state() == ConnectionState::Idle {
            self.shared.set_state(ConnectionState::Connecting);
        }
    }

    pub fn disconnect(&self) {
        self.shared.set_state(ConnectionState::Idle);
    }

    fn session(&self) -> Session {
        self.shared.session.lock().unwrap().clone()
    }

    fn block_size(sample_rate: f64) -> usize {
        ((sample_rate * BLOCK_DURATION).round() as usize).max(MIN_BLOCK_SAMPLES)
    }

    fn check_block_number(&mut self, block: u32) {
        if let Some(last) = self.last_block {
            let missing = block.wrapping_sub(last).wrapping_sub(1);
            if missing != 0 {
                self.events
                    .error(format!("Missing samples: {} Block(s)", missing), Severity::Notify);
            }
        }
        self.last_block = Some(block);
    }

    fn collect(&mut self, data: DataBlock) {
        let first = self.sample_counter + self.buffered as u64;
        self.markers.extend(data.markers.into_iter().map(|m| {
            let mut marker = Marker::new(first as i64 + m.position as i64, m.kind, m.description);
            marker.points = m.points;
            marker.channel = m.channel;
            marker
        }));
        self.buffer.extend(data.samples);
        self.buffered += data.points as usize;
    }

    /// Block from the buffered samples, scaled by the channel resolutions
    fn data_block(&mut self, session: &Session) -> StageResult<StreamBlock> {
        let n = session.channels.len();
        let points = self.buffered;
        if self.buffer.len() != n * points {
            self.reset_buffer();
            return Err(StageError::Shape(format!(
                "{} samples received for {} channels x {} points",
                self.buffer.len(),
                n,
                points
            )));
        }
        let mut matrix = SampleMatrix::zeros(n, points);
        for (c, &resolution) in session.resolutions.iter().enumerate().take(n) {
            let row = matrix.row_mut(c);
            for (s, value) in row.iter_mut().enumerate() {
                *value = self.buffer[s * n + c] as f64 * resolution;
            }
        }
        let first = self.sample_counter;
        let counter: Vec<u64> = (first..first + points as u64).collect();
        let mut block = StreamBlock::new(session.sample_rate, session.channels.clone(), matrix, vec![0; points], counter)?;
        block.markers = std::mem::take(&mut self.markers);
        block.mode = session.mode;
        self.sample_counter += points as u64;
        block.sample_counter = self.sample_counter;
        let offset = first as f64 / session.sample_rate;
        block.block_time = self.start_time + TimeDelta::microseconds((offset * 1e6) as i64);
        self.buffer.clear();
        self.buffered = 0;
        Ok(block)
    }

    fn impedance_block(&self, session: &Session, entries: &[ImpedanceEntry]) -> StageResult<StreamBlock> {
        let mut matrix = SampleMatrix::zeros(session.channels.len(), 3);
        for (entry, &(row, column)) in entries.iter().zip(&session.impedance_cells) {
            let ohm = if entry.value < 0 {
                IMPEDANCE_INVALID
            } else {
                entry.value as f64 * 1000.0
            };
            if row == usize::MAX {
                for r in 0..matrix.rows() {
                    matrix.row_mut(r)[column] = ohm;
                }
            } else if row < matrix.rows() {
                matrix.row_mut(row)[column] = ohm;
            }
        }
        let mut block = StreamBlock::impedance(session.channels.clone(), matrix)?;
        block.sample_rate = session.sample_rate;
        Ok(block)
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.buffered = 0;
        self.markers.clear();
    }
}

impl Module for RdaClient {
    fn name(&self) -> &str {
        "RDA Client"
    }

    fn kind(&self) -> &str {
        "rda_client"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        *self.shared.events.lock().unwrap() = ctx.events.clone();
        *self.shared.stage.lock().unwrap() = ctx.stage;
        self.events = ctx.events;
    }

    fn on_start(&mut self) -> StageResult {
        while self.data_rx.try_recv().is_ok() {}
        self.reset_buffer();
        self.last_block = None;
        self.sample_counter = 0;
        self.start_time = Local::now();

        let session = self.session();
        if session.mode == RecordingMode::Impedance {
            self.events.log_message("Start impedance check");
        } else {
            self.events.log_message(format!(
                "Start recording with {:.0}Hz and {} channels",
                session.sample_rate,
                session.channels.len()
            ));
        }
        self.events.status("Mode", format!("{:?}", session.mode));
        Ok(())
    }

    fn on_stop(&mut self) -> StageResult {
        let mode = {
            let mut session = self.shared.session.lock().unwrap();
            session.impedance_pending = false;
            session.mode
        };
        if mode == RecordingMode::Impedance {
            self.events.log_message("Stop impedance check");
        } else {
            self.events.log_message("Stop recording");
        }
        self.events.status("Mode", "Stopped");
        Ok(())
    }

    fn configuration(&self) -> Option<StreamBlock> {
        let session = self.session();
        if session.channels.is_empty() {
            return None;
        }
        Some(session.params())
    }

    fn on_input(&mut self, _block: StreamBlock) -> StageResult {
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        let session = self.session();
        let target = Self::block_size(session.sample_rate);
        while self.buffered < target {
            match self.data_rx.try_recv() {
                Ok(Inbound::Data(data)) => {
                    self.check_block_number(data.block);
                    self.collect(data);
                }
                Ok(Inbound::Impedance(entries)) => {
                    return Ok(Output::Block(self.impedance_block(&session, &entries)?));
                }
                Err(_) => break,
            }
        }
        if self.buffered < target {
            return Ok(Output::NoData);
        }
        Ok(Output::Block(self.data_block(&session)?))
    }

    fn on_event(&mut self, event: &ModuleEvent) -> Option<LifecycleRequest> {
        if let EventKind::Command(value) = &event.kind {
            if event.info == CONNECT_COMMAND {
                self.connect(Some(value.as_str()).filter(|v| !v.is_empty()));
            } else if event.info == DISCONNECT_COMMAND {
                self.disconnect();
            }
        }
        None
    }

    fn settings(&self) -> Option<Value> {
        let mut settings = self.settings.clone();
        settings.address = self.shared.address.lock().unwrap().clone();
        serde_json::to_value(&settings).ok()
    }

    fn terminate(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(done) = self.io_done.take() {
            match done.recv_timeout(TERMINATE_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => warn!("[RDA Client] IO thread did not finish"),
            }
        }
    }
}

impl Drop for RdaClient {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rda::protocol::{GUID, WireMarker, kind};
    use crate::rda::server::{RdaServer, RdaServerSettings};
    use crate::runtime::stage::Stage;
    use crate::runtime::testing::{Collector, block_with_counter};
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Instant;

    fn offline() -> RdaClient {
        RdaClient::new(RdaClientSettings {
            connect: false,
            ..RdaClientSettings::default()
        })
        .unwrap()
    }

    fn started(client: &mut RdaClient, rate: f64, names: &[&str]) -> Receiver<ModuleEvent> {
        let (events, rx) = EventSink::channel("RDA Client");
        client.attach(ModuleContext {
            events,
            stage: StageHandle::default(),
        });
        client.shared.session.lock().unwrap().apply_start(&StartInfo {
            sampling_interval: 1e6 / rate,
            resolutions: vec![0.5; names.len()],
            names: names.iter().map(|n| n.to_string()).collect(),
        });
        client.on_start().unwrap();
        rx
    }

    fn data(block: u32, points: u32, channels: usize) -> Inbound {
        Inbound::Data(DataBlock {
            block,
            points,
            samples: (0..points as usize * channels).map(|v| v as f32).collect(),
            markers: Vec::new(),
        })
    }

    /// Client pointed at a local listener, connecting with events captured
    fn listening_client(listener: &TcpListener, auto_reconnect: bool) -> (RdaClient, Receiver<ModuleEvent>) {
        let mut client = RdaClient::new(RdaClientSettings {
            address: listener.local_addr().unwrap().to_string(),
            auto_reconnect,
            connect: false,
        })
        .unwrap();
        let (events, rx) = EventSink::channel("RDA Client");
        client.attach(ModuleContext {
            events,
            stage: StageHandle::default(),
        });
        client.connect(None);
        (client, rx)
    }

    fn accept_within(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match listener.accept() {
                Ok((stream, _)) => return Some(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        None
    }

    fn notifications(rx: &Receiver<ModuleEvent>) -> Vec<String> {
        rx.try_iter()
            .filter(|e| e.kind == EventKind::Error(Severity::Notify))
            .map(|e| e.info)
            .collect()
    }

    #[test]
    fn test_block_gap_raises_one_notification() {
        let mut client = offline();
        let rx = started(&mut client, 1000.0, &["Cz"]);
        for block in [5, 6, 8] {
            client.shared.data_tx.send(data(block, 10, 1)).unwrap();
        }
        assert!(matches!(client.on_output().unwrap(), Output::NoData));
        assert_eq!(notifications(&rx), vec!["Missing samples: 1 Block(s)"]);
    }

    #[test]
    fn test_blocks_are_collected_to_target_size() {
        let mut client = offline();
        let _rx = started(&mut client, 200.0, &["C3", "C4"]);
        // 200 Hz -> 10 samples per block
        client.shared.data_tx.send(data(1, 4, 2)).unwrap();
        assert!(matches!(client.on_output().unwrap(), Output::NoData));

        let mut with_marker = DataBlock {
            block: 2,
            points: 6,
            samples: vec![1.0; 12],
            markers: Vec::new(),
        };
        with_marker.markers.push(WireMarker {
            position: 2,
            points: 1,
            channel: 0,
            kind: "Stimulus".to_string(),
            description: "S  1".to_string(),
        });
        client.shared.data_tx.send(Inbound::Data(with_marker)).unwrap();

        let Output::Block(block) = client.on_output().unwrap() else {
            panic!("expected a block");
        };
        assert_eq!(block.samples(), 10);
        assert_eq!(block.sample_rate, 200.0);
        assert_eq!(block.counter[0], 0);
        assert_eq!(block.sample_counter, 10);
        // interleaved 0..8 of the first message, scaled by 0.5
        assert_eq!(block.data.row(0)[..4], [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(block.data.row(1)[..4], [0.5, 1.5, 2.5, 3.5]);
        assert_eq!(block.markers.len(), 1);
        assert_eq!(block.markers[0].position, 6);
    }

    #[test]
    fn test_impedance_layout_from_first_message() {
        let entry = |name: &str, value: i32| ImpedanceEntry {
            x: 0.0,
            y: 0.0,
            value,
            name: name.to_string(),
        };
        let entries = vec![entry("Fp1+", 4), entry("Fp1-", 13), entry("Fp2", -1), entry("GND", 2)];
        let client = offline();
        let mut session = Session::default();
        session.apply_impedance_layout(&entries);
        assert_eq!(session.channels.len(), 2);
        assert!(session.channels[0].impedance.reference);
        assert!(!session.channels[1].impedance.reference);

        let block = client.impedance_block(&session, &entries).unwrap();
        assert_eq!(block.mode, RecordingMode::Impedance);
        assert_eq!(block.data.row(0), &[4_000.0, 13_000.0, 2_000.0]);
        assert_eq!(block.data.row(1), &[IMPEDANCE_INVALID, 0.0, 2_000.0]);
    }

    #[test]
    fn test_frame_reader_assembles_split_messages() {
        let mut bytes = Message::NewState(1).encode();
        bytes.extend(Message::Stop.encode());
        let mut reader = FrameReader::default();
        let mut chunks = std::io::Cursor::new(bytes);

        let (header, body) = reader.poll(&mut chunks).unwrap().unwrap();
        assert_eq!(Message::decode(header.kind, &body, 0).unwrap(), Message::NewState(1));
        let (header, body) = reader.poll(&mut chunks).unwrap().unwrap();
        assert_eq!(Message::decode(header.kind, &body, 0).unwrap(), Message::Stop);
        assert!(reader.poll(&mut chunks).is_err());
    }

    #[test]
    fn test_frame_reader_rejects_oversized_body() {
        let mut bytes = GUID.to_vec();
        bytes.extend((HEADER_SIZE as u32 + MAX_BODY_SIZE as u32 + 1).to_le_bytes());
        bytes.extend(kind::DATA32.to_le_bytes());
        let mut reader = FrameReader::default();

        let err = reader.poll(&mut std::io::Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_lost_connection_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (client, _events) = listening_client(&listener, true);

        let first = accept_within(&listener, Duration::from_secs(5)).expect("client should connect");
        drop(first);

        let second = accept_within(&listener, Duration::from_secs(5));
        assert!(second.is_some(), "client should connect again after the server closed");
        assert_ne!(client.connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn test_bad_guid_disconnects_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (client, events) = listening_client(&listener, true);
        let mut peer = accept_within(&listener, Duration::from_secs(5)).expect("client should connect");

        let mut header = vec![0u8; 16];
        header.extend((HEADER_SIZE as u32).to_le_bytes());
        header.extend(kind::STOP.to_le_bytes());
        peer.write_all(&header).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.connection_state() != ConnectionState::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.connection_state(), ConnectionState::Idle);
        let notes = notifications(&events);
        assert!(notes.iter().any(|n| n.contains("GUID")), "got: {:?}", notes);
        assert!(accept_within(&listener, Duration::from_millis(500)).is_none());
    }

    #[test]
    fn test_streams_from_server() {
        let mut server = RdaServer::new(RdaServerSettings {
            address: "127.0.0.1:0".to_string(),
        })
        .unwrap();
        server
            .on_update(StreamBlock::empty(vec![ChannelDescriptor::signal(1, "Cz")], 100.0))
            .unwrap();
        server.on_start().unwrap();

        let client = RdaClient::new(RdaClientSettings {
            address: server.local_addr().to_string(),
            auto_reconnect: false,
            connect: true,
        })
        .unwrap();
        let stage = Stage::detached("RDA Client", Box::new(client));
        let (collector, blocks) = Collector::new();
        stage.add_receiver(Stage::detached("Collector", Box::new(collector)));

        let deadline = Instant::now() + Duration::from_secs(10);
        while !stage.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stage.is_running(), "START must start the client stage");

        let mut next = 0;
        while blocks.lock().unwrap().is_empty() && Instant::now() < deadline {
            server.on_input(block_with_counter(next, 5)).unwrap();
            next += 5;
            thread::sleep(Duration::from_millis(20));
        }
        let first = blocks.lock().unwrap().first().cloned().expect("no block received");
        assert_eq!(first.channels[0].name, "Cz");
        assert_eq!(first.sample_rate, 100.0);
        assert_eq!(first.samples(), 5);

        server.on_stop().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while stage.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!stage.is_running(), "STOP must stop the client stage");

        stage.terminate();
        server.terminate();
    }
}
