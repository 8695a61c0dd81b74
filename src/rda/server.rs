//! RDA server stage
//!
//! Mirrors the stream passing through the stage to any number of TCP clients.
//! An accept thread greets new clients with the current state, so a client
//! joining mid-recording can follow without replay. Every client gets its own
//! bounded queue and transmit thread; a slow or dead client only overflows its
//! own queue.

use super::protocol::{self, DEFAULT_PORT, Message, state};
use crate::runtime::block::{RecordingMode, StreamBlock};
use crate::runtime::errors::{Severity, StageError, StageResult};
use crate::runtime::event::EventSink;
use crate::runtime::node::{Module, ModuleContext, Output};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Messages a client may have queued before it counts as overrun
pub const CLIENT_QUEUE_SIZE: usize = 20;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const TRANSMIT_POLL: Duration = Duration::from_millis(100);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdaServerSettings {
    /// Listen address
    pub address: String,
}

impl Default for RdaServerSettings {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{}", DEFAULT_PORT),
        }
    }
}

/// One connected client and its transmit thread
struct ClientConnection {
    addr: SocketAddr,
    queue: Sender<Arc<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    stream: TcpStream,
    transmitter: Option<JoinHandle<()>>,
}

impl ClientConnection {
    fn new(stream: TcpStream, addr: SocketAddr) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let (queue, rx) = bounded(CLIENT_QUEUE_SIZE);
        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let transmitter = thread::Builder::new()
            .name(format!("rda-tx-{}", addr))
            .spawn(move || transmit(writer, rx, flag))?;
        Ok(Self {
            addr,
            queue,
            connected,
            stream,
            transmitter: Some(transmitter),
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, message: Arc<Vec<u8>>) -> Result<(), String> {
        if !self.is_connected() {
            return Err(format!("RDA Client {} is disconnected", self.addr));
        }
        match self.queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(format!("RDA Client {} queue FULL, overrun!", self.addr)),
            Err(TrySendError::Disconnected(_)) => Err(format!("RDA Client {} is disconnected", self.addr)),
        }
    }

    fn terminate(&mut self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.transmitter.take() {
            let _ = handle.join();
        }
    }
}

/// Drains the client queue into the socket until the client goes away
fn transmit(mut stream: TcpStream, queue: Receiver<Arc<Vec<u8>>>, connected: Arc<AtomicBool>) {
    while connected.load(Ordering::Acquire) {
        let message = match queue.recv_timeout(TRANSMIT_POLL) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let mut sent = 0;
        while sent < message.len() {
            match stream.write(&message[sent..]) {
                Ok(0) => {
                    connected.store(false, Ordering::Release);
                    break;
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("[RDA] Send failed: {}", e);
                    connected.store(false, Ordering::Release);
                    break;
                }
            }
        }
    }
    connected.store(false, Ordering::Release);
}

/// State shared by the stage and its accept thread
struct ServerShared {
    running: AtomicBool,
    acquiring: AtomicBool,
    params: Mutex<Option<StreamBlock>>,
    clients: Mutex<Vec<ClientConnection>>,
    events: Mutex<EventSink>,
}

impl ServerShared {
    fn events(&self) -> EventSink {
        self.events.lock().unwrap().clone()
    }

    /// Messages announcing the current acquisition state
    fn state_messages(&self, params: &StreamBlock) -> Vec<Message> {
        if !self.acquiring.load(Ordering::Acquire) {
            return vec![Message::NewState(state::IDLE)];
        }
        if params.mode == RecordingMode::Impedance {
            vec![Message::NewState(state::IMPEDANCE), Message::ImpStart]
        } else {
            vec![Message::NewState(state::RUNNING), protocol::start_message(params)]
        }
    }

    fn welcome(&self, stream: TcpStream, addr: SocketAddr) {
        let Some(params) = self.params.lock().unwrap().clone() else {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };
        let events = self.events();

        let mut clients = self.clients.lock().unwrap();
        let client = match ClientConnection::new(stream, addr) {
            Ok(client) => client,
            Err(e) => {
                events.error(format!("RDA Client {}: {}", addr, e), Severity::Ignorable);
                return;
            }
        };
        let mut greeting = vec![Message::Handshake, protocol::info_message(&params)];
        greeting.extend(self.state_messages(&params));
        for message in greeting {
            if let Err(e) = client.send(Arc::new(message.encode())) {
                events.error(e, Severity::Ignorable);
            }
        }
        clients.push(client);
        drop(clients);

        info!("[RDA] Client connected: {}", addr);
        events.log_message(format!("RDA Client connected: {}", addr));
    }

    /// Sends `messages` to every client; failures are reported per client
    fn broadcast(&self, messages: &[Message]) {
        let encoded: Vec<Arc<Vec<u8>>> = messages.iter().map(|m| Arc::new(m.encode())).collect();
        let clients = self.clients.lock().unwrap();
        if clients.is_empty() {
            return;
        }
        let events = self.events();
        for client in clients.iter().filter(|c| c.is_connected()) {
            for message in &encoded {
                if let Err(e) = client.send(Arc::clone(message)) {
                    events.error(e, Severity::Ignorable);
                    break;
                }
            }
        }
    }

    fn remove_disconnected(&self) {
        let mut gone = Vec::new();
        {
            let mut clients = self.clients.lock().unwrap();
            let mut i = 0;
            while i < clients.len() {
                if clients[i].is_connected() {
                    i += 1;
                } else {
                    gone.push(clients.swap_remove(i));
                }
            }
        }
        if gone.is_empty() {
            return;
        }
        let events = self.events();
        for mut client in gone {
            client.terminate();
            info!("[RDA] Client disconnected: {}", client.addr);
            events.log_message(format!("RDA Client disconnected: {}", client.addr));
        }
    }

    fn needs_keep_alive(&self) -> bool {
        if !self.acquiring.load(Ordering::Acquire) {
            return true;
        }
        self.params
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| p.mode == RecordingMode::Impedance)
    }

    fn close_all(&self) {
        let clients: Vec<ClientConnection> = self.clients.lock().unwrap().drain(..).collect();
        for mut client in clients {
            client.terminate();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    let mut last_keep_alive = Instant::now();
    while shared.running.load(Ordering::Acquire) {
        // clients are only accepted once the channel layout is known
        if shared.params.lock().unwrap().is_some() {
            match listener.accept() {
                Ok((stream, addr)) => shared.welcome(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => warn!("[RDA] Accept failed: {}", e),
            }
        }

        if last_keep_alive.elapsed() >= KEEP_ALIVE_INTERVAL {
            last_keep_alive = Instant::now();
            if shared.needs_keep_alive() {
                shared.broadcast(&[Message::KeepAlive]);
            }
        }

        shared.remove_disconnected();
        thread::sleep(ACCEPT_POLL);
    }
    debug!("[RDA] Accept thread finished");
}

pub struct RdaServer {
    settings: RdaServerSettings,
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
    block_count: u32,
    pending: Option<StreamBlock>,
}

impl RdaServer {
    /// Binds the listen socket and starts accepting clients
    pub fn new(settings: RdaServerSettings) -> StageResult<Self> {
        let listener = TcpListener::bind(&settings.address).map_err(|e| {
            StageError::Io(std::io::Error::new(
                e.kind(),
                format!("RDA server cannot listen on {}: {}", settings.address, e),
            ))
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            acquiring: AtomicBool::new(false),
            params: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            events: Mutex::new(EventSink::default()),
        });
        let thread_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name("rda-accept".to_string())
            .spawn(move || accept_loop(listener, thread_shared))?;
        info!("[RDA] Listening on {}", local_addr);

        Ok(Self {
            settings,
            shared,
            local_addr,
            acceptor: Some(acceptor),
            block_count: 0,
            pending: None,
        })
    }

    pub fn from_settings(settings: &Value) -> StageResult<Self> {
        let settings = if settings.is_null() {
            RdaServerSettings::default()
        } else {
            serde_json::from_value(settings.clone()).map_err(|e| StageError::Config(e.to_string()))?
        };
        Self::new(settings)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    fn mode(&self) -> RecordingMode {
        self.shared
            .params
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.mode)
            .unwrap_or_default()
    }
}

impl Module for RdaServer {
    fn name(&self) -> &str {
        "RDA"
    }

    fn kind(&self) -> &str {
        "rda_server"
    }

    fn attach(&mut self, ctx: ModuleContext) {
        *self.shared.events.lock().unwrap() = ctx.events;
    }

    fn on_update(&mut self, params: StreamBlock) -> StageResult<StreamBlock> {
        let info = protocol::info_message(&params);
        *self.shared.params.lock().unwrap() = Some(params.clone());
        self.shared.broadcast(&[info]);
        Ok(params)
    }

    fn on_start(&mut self) -> StageResult {
        self.block_count = 0;
        self.shared.acquiring.store(true, Ordering::Release);
        let params = self.shared.params.lock().unwrap().clone();
        if let Some(params) = params {
            let messages = self.shared.state_messages(&params);
            self.shared.broadcast(&messages);
        }
        Ok(())
    }

    fn on_stop(&mut self) -> StageResult {
        let stop = if self.mode() == RecordingMode::Impedance {
            Message::ImpStop
        } else {
            Message::Stop
        };
        self.shared.acquiring.store(false, Ordering::Release);
        self.shared.broadcast(&[Message::NewState(state::IDLE), stop]);
        Ok(())
    }

    fn on_input(&mut self, block: StreamBlock) -> StageResult {
        self.block_count = self.block_count.wrapping_add(1);
        let message = if block.mode == RecordingMode::Impedance {
            protocol::impedance_message(&block)
        } else {
            protocol::data_message(self.block_count, &block)
        };
        self.shared.broadcast(&[message]);
        self.pending = Some(block);
        Ok(())
    }

    fn on_output(&mut self) -> StageResult<Output> {
        Ok(Output::from_pending(&mut self.pending))
    }

    fn settings(&self) -> Option<Value> {
        serde_json::to_value(&self.settings).ok()
    }

    fn terminate(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        self.shared.close_all();
    }
}

impl Drop for RdaServer {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rda::protocol::{HEADER_SIZE, Header, kind};
    use crate::runtime::block::{ChannelDescriptor, SampleMatrix};
    use crate::runtime::event::EventKind;
    use crate::runtime::stage::StageHandle;
    use crate::runtime::testing::block_with_counter;
    use std::io::Read;

    fn server() -> RdaServer {
        RdaServer::new(RdaServerSettings {
            address: "127.0.0.1:0".to_string(),
        })
        .unwrap()
    }

    fn read_message(stream: &mut TcpStream) -> (u32, Vec<u8>) {
        let mut head = [0u8; HEADER_SIZE];
        stream.read_exact(&mut head).unwrap();
        let header = Header::decode(&head);
        assert!(header.is_valid());
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body).unwrap();
        (header.kind, body)
    }

    /// Next message that is not a keep-alive
    fn next_message(stream: &mut TcpStream) -> (u32, Vec<u8>) {
        loop {
            let message = read_message(stream);
            if message.0 != kind::KEEP_ALIVE {
                return message;
            }
        }
    }

    fn connect(server: &RdaServer) -> TcpStream {
        let stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    #[test]
    fn test_late_joiner_gets_current_state() {
        let mut server = server();
        let params = StreamBlock::empty(vec![ChannelDescriptor::signal(1, "Cz")], 100.0);
        server.on_update(params).unwrap();
        server.on_start().unwrap();

        let mut stream = connect(&server);
        let kinds: Vec<u32> = (0..4).map(|_| next_message(&mut stream).0).collect();
        assert_eq!(kinds, vec![kind::HANDSHAKE, kind::INFO, kind::NEWSTATE, kind::START]);

        // wait until the accept thread registered the client
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        server.on_input(block_with_counter(0, 10)).unwrap();
        let (data_kind, body) = next_message(&mut stream);
        assert_eq!(data_kind, kind::DATA32);
        let Message::Data32(data) = Message::decode(data_kind, &body, 1).unwrap() else {
            panic!("expected DATA32");
        };
        assert_eq!(data.block, 1);
        assert_eq!(data.points, 10);
        assert_eq!(data.samples[9], 9.0);

        assert!(matches!(server.on_output().unwrap(), Output::Block(_)));
        server.terminate();
    }

    #[test]
    fn test_idle_client_gets_idle_state_then_stop() {
        let mut server = server();
        server
            .on_update(StreamBlock::empty(vec![ChannelDescriptor::signal(1, "Cz")], 100.0))
            .unwrap();

        let mut stream = connect(&server);
        let (_, _) = next_message(&mut stream);
        let (_, _) = next_message(&mut stream);
        let (state_kind, body) = next_message(&mut stream);
        assert_eq!(state_kind, kind::NEWSTATE);
        assert_eq!(Message::decode(state_kind, &body, 0).unwrap(), Message::NewState(state::IDLE));

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        server.on_start().unwrap();
        server.on_stop().unwrap();
        let kinds: Vec<u32> = (0..4).map(|_| next_message(&mut stream).0).collect();
        assert_eq!(kinds, vec![kind::NEWSTATE, kind::START, kind::NEWSTATE, kind::STOP]);
        server.terminate();
    }

    fn wait_for_clients(server: &RdaServer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.client_count(), count);
    }

    #[test]
    fn test_stalled_client_does_not_hold_back_others() {
        const CHANNELS: usize = 64;
        const BLOCKS: u32 = 200;

        let mut server = server();
        let (events, rx) = EventSink::channel("RDA");
        server.attach(ModuleContext {
            events,
            stage: StageHandle::default(),
        });
        let channels: Vec<ChannelDescriptor> = (1..=CHANNELS)
            .map(|i| ChannelDescriptor::signal(i, format!("E{}", i)))
            .collect();
        server.on_update(StreamBlock::empty(channels.clone(), 1000.0)).unwrap();
        server.on_start().unwrap();

        // never reads, so its socket buffers and then its queue fill up
        let stalled = connect(&server);
        let mut reader = connect(&server);
        wait_for_clients(&server, 2);

        let reading = thread::spawn(move || {
            let mut blocks = Vec::new();
            loop {
                let (data_kind, body) = next_message(&mut reader);
                if data_kind != kind::DATA32 {
                    continue;
                }
                let Message::Data32(data) = Message::decode(data_kind, &body, CHANNELS).unwrap() else {
                    panic!("expected DATA32");
                };
                blocks.push(data.block);
                if data.block == BLOCKS {
                    return blocks;
                }
            }
        });

        // 64 x 1000 samples, 256 KB per message
        for i in 0..BLOCKS {
            let block = StreamBlock::new(
                1000.0,
                channels.clone(),
                SampleMatrix::zeros(CHANNELS, 1000),
                vec![0; 1000],
                (0..1000).map(|c| u64::from(i) * 1000 + c).collect(),
            )
            .unwrap();
            server.on_input(block).unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        let received = reading.join().expect("reading client should get the last block");
        assert!(received.len() as u32 > BLOCKS / 2, "only {} blocks arrived", received.len());

        let stalled_addr = stalled.local_addr().unwrap().to_string();
        let overruns: Vec<String> = rx
            .try_iter()
            .filter(|e| e.kind == EventKind::Error(Severity::Ignorable))
            .map(|e| e.info)
            .collect();
        assert!(
            overruns
                .iter()
                .any(|e| e.contains(&stalled_addr) && e.contains("queue FULL")),
            "no overrun reported for {}",
            stalled_addr
        );
        server.terminate();
    }

    #[test]
    fn test_idle_server_sends_keep_alive() {
        let mut server = server();
        server
            .on_update(StreamBlock::empty(vec![ChannelDescriptor::signal(1, "Cz")], 100.0))
            .unwrap();
        let mut stream = connect(&server);

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut kinds = Vec::new();
        while Instant::now() < deadline {
            let (message_kind, _) = read_message(&mut stream);
            kinds.push(message_kind);
            if message_kind == kind::KEEP_ALIVE {
                break;
            }
        }
        assert_eq!(kinds.first(), Some(&kind::HANDSHAKE));
        assert_eq!(kinds.last(), Some(&kind::KEEP_ALIVE), "got {:?}", kinds);
        server.terminate();
    }

    #[test]
    fn test_bind_conflict_is_an_io_error() {
        let server = server();
        let result = RdaServer::new(RdaServerSettings {
            address: server.local_addr().to_string(),
        });
        match result {
            Err(StageError::Io(e)) => assert!(e.to_string().contains("cannot listen")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("second bind must fail"),
        }
    }
}
