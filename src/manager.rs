//! The Manager: connection table, I/O driver and event dispatcher for
//! one cooperative loop.
//!
//! Exactly one thread calls [`Manager::poll`]; every handler, parser,
//! buffer access and timer firing happens on that thread. The only
//! cross-thread entry point is a [`Wakeup`] handle.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Token};

use crate::connection::{Connection, Proto, Socket};
use crate::error::{Error, Result};
use crate::event::{deliver, Event, EventHandler};
use crate::http;
use crate::mqtt::{self, MqttOpts};
use crate::object_pool::ObjectPool;
use crate::poll::Poller;
use crate::sntp;
use crate::thread_pool::ThreadPool;
use crate::timer::{TimerId, TimerList, TimerOpts};
use crate::tls::HandshakeStatus;
use crate::url;
use crate::wakeup::{Wakeup, WakeupChannel, WAKEUP_TOKEN};
use crate::ws;

const READ_CHUNK: usize = 8192;
const READ_POOL_SIZE: usize = 8;

/// Tunables for one manager.
#[derive(Clone)]
pub struct ManagerConfig {
    /// High-water mark for recv buffers; reads stop above it and
    /// resume once consumption brings the level under half of it.
    pub recv_soft_limit: usize,
    pub max_ws_frame_len: usize,
    pub max_mqtt_packet_len: usize,
    /// Create the cross-thread wakeup channel at init.
    pub enable_wakeup: bool,
    /// Background worker threads for [`Manager::spawn`]; 0 disables
    /// the pool.
    pub worker_threads: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            recv_soft_limit: 16 * 1024,
            max_ws_frame_len: 1024 * 1024,
            max_mqtt_packet_len: 1024 * 1024,
            enable_wakeup: false,
            worker_threads: 0,
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ManagerConfigBuilder {
    recv_soft_limit: Option<usize>,
    max_ws_frame_len: Option<usize>,
    max_mqtt_packet_len: Option<usize>,
    enable_wakeup: Option<bool>,
    worker_threads: Option<usize>,
}

impl ManagerConfigBuilder {
    pub fn recv_soft_limit(mut self, bytes: usize) -> Self {
        self.recv_soft_limit = Some(bytes);
        self
    }

    pub fn max_ws_frame_len(mut self, bytes: usize) -> Self {
        self.max_ws_frame_len = Some(bytes);
        self
    }

    pub fn max_mqtt_packet_len(mut self, bytes: usize) -> Self {
        self.max_mqtt_packet_len = Some(bytes);
        self
    }

    pub fn enable_wakeup(mut self, enabled: bool) -> Self {
        self.enable_wakeup = Some(enabled);
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn build(self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            recv_soft_limit: self.recv_soft_limit.unwrap_or(defaults.recv_soft_limit),
            max_ws_frame_len: self.max_ws_frame_len.unwrap_or(defaults.max_ws_frame_len),
            max_mqtt_packet_len: self
                .max_mqtt_packet_len
                .unwrap_or(defaults.max_mqtt_packet_len),
            enable_wakeup: self.enable_wakeup.unwrap_or(defaults.enable_wakeup),
            worker_threads: self.worker_threads.unwrap_or(defaults.worker_threads),
        }
    }
}

/// Per-tick copies of the config limits, so the driver passes plain
/// values around instead of re-borrowing the manager.
#[derive(Clone, Copy)]
struct Limits {
    recv_soft_limit: usize,
    max_ws_frame: usize,
    max_mqtt_packet: usize,
}

enum ReadOutcome {
    Eof,
    Data(usize, Option<SocketAddr>),
    WouldBlock,
    Retry,
    Failed(std::io::Error),
}

/// Root container for a single cooperative loop.
pub struct Manager {
    poller: Poller,
    conns: HashMap<u64, Connection>,
    /// Insertion order; POLL and sweeps walk this.
    ids: Vec<u64>,
    next_id: u64,
    timers: TimerList,
    wakeup: Option<WakeupChannel>,
    default_handler: Option<Rc<dyn EventHandler>>,
    read_pool: ObjectPool<Vec<u8>>,
    workers: Option<ThreadPool>,
    cfg: ManagerConfig,
    closed: bool,
}

impl Manager {
    pub fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(cfg: ManagerConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let wakeup = if cfg.enable_wakeup {
            let mut channel = WakeupChannel::new()?;
            poller.register(channel.receiver_mut(), WAKEUP_TOKEN, Interest::READABLE)?;
            Some(channel)
        } else {
            None
        };
        let workers = (cfg.worker_threads > 0).then(|| ThreadPool::new(cfg.worker_threads));
        Ok(Self {
            poller,
            conns: HashMap::new(),
            ids: Vec::new(),
            next_id: 1,
            timers: TimerList::default(),
            wakeup,
            default_handler: None,
            read_pool: ObjectPool::new(READ_POOL_SIZE, || vec![0u8; READ_CHUNK]),
            workers,
            cfg,
            closed: false,
        })
    }

    /// Handler used by connections that carry none of their own.
    pub fn set_default_handler<H: EventHandler + 'static>(&mut self, handler: H) {
        self.default_handler = Some(Rc::new(handler));
    }

    /// Opens a listener for `url` (`http://`, `ws://`, `mqtt://`,
    /// `tcp://`, `udp://`, TLS variants) and returns its connection id.
    pub fn listen<H: EventHandler + 'static>(&mut self, url_s: &str, handler: H) -> Result<u64> {
        self.listen_with(url_s, Some(Rc::new(handler)))
    }

    pub fn listen_with(
        &mut self,
        url_s: &str,
        handler: Option<Rc<dyn EventHandler>>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let parsed = url::parse(url_s)?;
        let addr = resolve_authority(&parsed)?;
        let fallback = self.default_handler.clone();
        let id = self.alloc_id();
        let proto = proto_for(&parsed.scheme);

        if parsed.is_udp() {
            let mut sock = UdpSocket::bind(addr)?;
            self.poller
                .register(&mut sock, Token(id as usize), Interest::READABLE)?;
            let local = sock.local_addr().ok();
            let mut conn = Connection::new(id, Socket::Udp(sock));
            conn.udp = true;
            conn.listening = true;
            conn.writable = true;
            conn.readable = true;
            conn.local_addr = local;
            conn.handler = handler;
            conn.proto = proto;
            self.insert(conn, &fallback);
        } else {
            let mut listener = TcpListener::bind(addr)?;
            self.poller
                .register(&mut listener, Token(id as usize), Interest::READABLE)?;
            let local = listener.local_addr().ok();
            let mut conn = Connection::new(id, Socket::Listener(listener));
            conn.listening = true;
            conn.local_addr = local;
            conn.tls_required = parsed.is_tls();
            conn.handler = handler;
            conn.proto = proto;
            self.insert(conn, &fallback);
        }
        log::info!("listening on {} (connection {})", url_s, id);
        Ok(id)
    }

    /// Listener sugar for MQTT broker endpoints.
    pub fn mqtt_listen<H: EventHandler + 'static>(&mut self, url_s: &str, handler: H) -> Result<u64> {
        let parsed = url::parse(url_s)?;
        if !matches!(parsed.scheme.as_str(), "mqtt" | "mqtts") {
            return Err(Error::Usage("mqtt_listen requires an mqtt:// url"));
        }
        self.listen(url_s, handler)
    }

    /// Opens an outbound connection. Hostname resolution is performed
    /// here (synchronously); RESOLVE fires when a lookup actually ran,
    /// CONNECT once the TCP handshake completes.
    pub fn connect<H: EventHandler + 'static>(&mut self, url_s: &str, handler: H) -> Result<u64> {
        self.connect_with(url_s, Some(Rc::new(handler)))
    }

    pub fn connect_with(
        &mut self,
        url_s: &str,
        handler: Option<Rc<dyn EventHandler>>,
    ) -> Result<u64> {
        let parsed = url::parse(url_s)?;
        let proto = proto_for(&parsed.scheme);
        let ws_req = matches!(parsed.scheme.as_str(), "ws" | "wss")
            .then(|| (parsed.authority(), parsed.uri.clone()));
        self.connect_impl(&parsed, handler, proto, None, ws_req)
    }

    /// Connects to an MQTT endpoint; CONNECT is emitted on the wire as
    /// soon as the transport is up, and the CONNACK return code
    /// arrives as `Event::MqttOpen`.
    pub fn mqtt_connect<H: EventHandler + 'static>(
        &mut self,
        url_s: &str,
        opts: MqttOpts,
        handler: H,
    ) -> Result<u64> {
        let parsed = url::parse(url_s)?;
        if !matches!(parsed.scheme.as_str(), "mqtt" | "mqtts") {
            return Err(Error::Usage("mqtt_connect requires an mqtt:// url"));
        }
        self.connect_impl(
            &parsed,
            Some(Rc::new(handler)),
            Proto::Mqtt,
            Some(opts),
            None,
        )
    }

    /// Opens an SNTP association over UDP; call
    /// [`Connection::sntp_request`] to solicit `Event::SntpTime`.
    pub fn sntp_connect<H: EventHandler + 'static>(&mut self, url_s: &str, handler: H) -> Result<u64> {
        let parsed = url::parse(url_s)?;
        if !parsed.is_udp() {
            return Err(Error::Usage("sntp_connect requires a udp:// url"));
        }
        self.connect_impl(&parsed, Some(Rc::new(handler)), Proto::Sntp, None, None)
    }

    fn connect_impl(
        &mut self,
        parsed: &url::Url,
        handler: Option<Rc<dyn EventHandler>>,
        proto: Proto,
        mqtt_opts: Option<MqttOpts>,
        ws_req: Option<(String, String)>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let fallback = self.default_handler.clone();
        let limits = self.limits();
        let needs_lookup = parsed.host.parse::<std::net::IpAddr>().is_err();
        let addr = resolve_authority(parsed)?;
        let id = self.alloc_id();

        if parsed.is_udp() {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().expect("literal addr")
            } else {
                "[::]:0".parse().expect("literal addr")
            };
            let mut sock = UdpSocket::bind(bind)?;
            sock.connect(addr)?;
            self.poller
                .register(&mut sock, Token(id as usize), Interest::READABLE)?;
            let local = sock.local_addr().ok();
            let mut conn = Connection::new(id, Socket::Udp(sock));
            conn.udp = true;
            conn.client = true;
            conn.writable = true;
            conn.readable = true;
            conn.peer_addr = Some(addr);
            conn.local_addr = local;
            conn.handler = handler;
            conn.proto = proto;
            conn.mqtt_opts = mqtt_opts;
            self.insert(conn, &fallback);

            if let Some(conn) = self.conns.get_mut(&id) {
                if needs_lookup {
                    deliver(conn, fallback.as_ref(), Event::Resolve);
                }
                // No transport handshake on UDP.
                deliver(conn, fallback.as_ref(), Event::Connect);
                kickoff(conn, fallback.as_ref(), limits);
            }
        } else {
            let mut stream = TcpStream::connect(addr)?;
            self.poller.register(
                &mut stream,
                Token(id as usize),
                Interest::READABLE | Interest::WRITABLE,
            )?;
            let mut conn = Connection::new(id, Socket::Stream(stream));
            conn.client = true;
            conn.connecting = true;
            conn.peer_addr = Some(addr);
            conn.tls_required = parsed.is_tls();
            conn.handler = handler;
            conn.proto = proto;
            conn.mqtt_opts = mqtt_opts;
            conn.ws_connect_req = ws_req;
            self.insert(conn, &fallback);

            if needs_lookup {
                if let Some(conn) = self.conns.get_mut(&id) {
                    deliver(conn, fallback.as_ref(), Event::Resolve);
                }
            }
        }
        Ok(id)
    }

    /// Access to a live connection between polls (loop thread only).
    pub fn conn(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn conn_ref(&self, id: u64) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn conn_ids(&self) -> Vec<u64> {
        self.ids.clone()
    }

    /// Thread-safe producer handle for `Event::Wakeup` injection.
    pub fn wakeup_handle(&self) -> Result<Wakeup> {
        self.wakeup
            .as_ref()
            .map(|channel| channel.handle())
            .ok_or(Error::WakeupDisabled)
    }

    /// Schedules a timer serviced inside `poll`.
    pub fn timer_add<F: FnMut() + 'static>(
        &mut self,
        period_ms: u64,
        opts: TimerOpts,
        callback: F,
    ) -> TimerId {
        self.timers.add(period_ms, opts, Box::new(callback))
    }

    pub fn timer_cancel(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Runs a job on the background worker pool.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) -> Result<()> {
        self.workers
            .as_ref()
            .ok_or(Error::Usage("worker pool disabled; set worker_threads"))?
            .exec(job)
    }

    /// One driver tick: waits at most `timeout_ms` for readiness, then
    /// accepts, completes connects, reads, writes, services timers and
    /// wakeups, emits POLL, and sweeps closed connections.
    pub fn poll(&mut self, timeout_ms: u64) -> Result<()> {
        self.ensure_open()?;
        let fallback = self.default_handler.clone();
        let limits = self.limits();

        let ready = self
            .poller
            .wait(Some(Duration::from_millis(timeout_ms)))?;

        let mut wakeup_ready = false;
        let mut accept_ids = Vec::new();
        let mut connect_ids = Vec::new();
        for r in ready {
            if r.token == WAKEUP_TOKEN {
                wakeup_ready = true;
                continue;
            }
            let id = r.token.0 as u64;
            if let Some(conn) = self.conns.get_mut(&id) {
                if r.readable {
                    conn.readable = true;
                    if conn.listening && !conn.udp {
                        accept_ids.push(id);
                    }
                }
                if r.writable {
                    conn.writable = true;
                    if conn.connecting {
                        connect_ids.push(id);
                    }
                }
            }
        }

        for id in accept_ids {
            self.accept_pass(id, &fallback);
        }
        for id in connect_ids {
            self.finalize_connect(id, &fallback, limits);
        }
        for id in self.ids.clone() {
            self.read_pass(id, &fallback, limits);
        }
        for id in self.ids.clone() {
            self.write_pass(id, &fallback);
        }

        self.timers.tick(Instant::now());

        if wakeup_ready {
            self.wakeup_pass(&fallback);
        }

        for id in self.ids.clone() {
            if let Some(conn) = self.conns.get_mut(&id) {
                if conn.full && conn.recv.len() < limits.recv_soft_limit / 2 {
                    conn.full = false;
                }
                if !conn.closing {
                    deliver(conn, fallback.as_ref(), Event::Poll);
                }
            }
        }

        // Queued errors surface before the close sweep so ERROR always
        // precedes CLOSE.
        for id in self.ids.clone() {
            if let Some(conn) = self.conns.get_mut(&id) {
                if let Some(msg) = conn.pending_error.take() {
                    deliver(conn, fallback.as_ref(), Event::Error(&msg));
                }
            }
        }
        for id in self.ids.clone() {
            if self.conns.get(&id).map_or(false, |c| c.closing) {
                self.remove_conn(id, &fallback);
            }
        }
        Ok(())
    }

    /// Closes every connection (each observes CLOSE) and renders the
    /// manager unusable. Runs automatically on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let fallback = self.default_handler.clone();
        for id in self.ids.clone() {
            self.remove_conn(id, &fallback);
        }
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Usage("manager is closed"));
        }
        Ok(())
    }

    fn limits(&self) -> Limits {
        Limits {
            recv_soft_limit: self.cfg.recv_soft_limit,
            max_ws_frame: self.cfg.max_ws_frame_len,
            max_mqtt_packet: self.cfg.max_mqtt_packet_len,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, conn: Connection, fallback: &Option<Rc<dyn EventHandler>>) {
        let id = conn.id;
        self.ids.push(id);
        self.conns.insert(id, conn);
        if let Some(conn) = self.conns.get_mut(&id) {
            deliver(conn, fallback.as_ref(), Event::Open);
        }
    }

    fn accept_pass(&mut self, listener_id: u64, fallback: &Option<Rc<dyn EventHandler>>) {
        loop {
            let accepted = {
                let Some(conn) = self.conns.get_mut(&listener_id) else {
                    return;
                };
                match &mut conn.sock {
                    Socket::Listener(listener) => listener.accept(),
                    _ => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let (handler, proto, tls_required) = {
                        let listener = &self.conns[&listener_id];
                        (listener.handler.clone(), listener.proto, listener.tls_required)
                    };
                    if let Err(e) =
                        self.install_accepted(stream, peer, handler, proto, tls_required, fallback)
                    {
                        log::error!("failed to register accepted connection: {}", e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Some(conn) = self.conns.get_mut(&listener_id) {
                        conn.readable = false;
                    }
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if let Some(conn) = self.conns.get_mut(&listener_id) {
                        conn.error(&format!("accept failed: {}", e));
                    }
                    return;
                }
            }
        }
    }

    fn install_accepted(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Option<Rc<dyn EventHandler>>,
        proto: Proto,
        tls_required: bool,
        fallback: &Option<Rc<dyn EventHandler>>,
    ) -> Result<()> {
        let id = self.alloc_id();
        self.poller.register(
            &mut stream,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let local = stream.local_addr().ok();
        let mut conn = Connection::new(id, Socket::Stream(stream));
        conn.accepted = true;
        // Bytes may already be queued at registration time; probe on
        // the next pass rather than waiting for another edge.
        conn.readable = true;
        conn.writable = true;
        conn.peer_addr = Some(peer);
        conn.local_addr = local;
        conn.handler = handler;
        conn.proto = proto;
        conn.tls_required = tls_required;
        self.insert(conn, fallback);
        if let Some(conn) = self.conns.get_mut(&id) {
            deliver(conn, fallback.as_ref(), Event::Accept);
        }
        log::debug!("accepted connection {} from {}", id, peer);
        Ok(())
    }

    fn finalize_connect(
        &mut self,
        id: u64,
        fallback: &Option<Rc<dyn EventHandler>>,
        limits: Limits,
    ) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.connecting {
            return;
        }
        let status = match &conn.sock {
            Socket::Stream(stream) => match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => Ok(peer),
                    Err(e) if e.kind() == std::io::ErrorKind::NotConnected => return,
                    Err(e) => Err(e),
                },
            },
            _ => return,
        };
        match status {
            Ok(peer) => {
                conn.connecting = false;
                conn.peer_addr = Some(peer);
                if let Socket::Stream(stream) = &conn.sock {
                    conn.local_addr = stream.local_addr().ok();
                }
                log::debug!("connection {} established to {}", id, peer);
                deliver(conn, fallback.as_ref(), Event::Connect);
                kickoff(conn, fallback.as_ref(), limits);
            }
            Err(e) => conn.error(&format!("connect failed: {}", e)),
        }
    }

    fn read_pass(&mut self, id: u64, fallback: &Option<Rc<dyn EventHandler>>, limits: Limits) {
        let mut scratch = self.read_pool.acquire();
        if scratch.len() < READ_CHUNK {
            scratch.resize(READ_CHUNK, 0);
        }
        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            if conn.closing
                || conn.draining
                || conn.connecting
                || conn.full
                || !conn.readable
                || (conn.listening && !conn.udp)
            {
                return;
            }

            let outcome = match &mut conn.sock {
                Socket::Stream(stream) => match stream.read(&mut scratch[..]) {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => ReadOutcome::Data(n, None),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        ReadOutcome::WouldBlock
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadOutcome::Retry,
                    Err(e) => ReadOutcome::Failed(e),
                },
                Socket::Udp(sock) => match sock.recv_from(&mut scratch[..]) {
                    Ok((n, from)) => ReadOutcome::Data(n, Some(from)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        ReadOutcome::WouldBlock
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadOutcome::Retry,
                    Err(e) => ReadOutcome::Failed(e),
                },
                _ => return,
            };

            match outcome {
                ReadOutcome::Retry => {}
                ReadOutcome::WouldBlock => {
                    conn.readable = false;
                    return;
                }
                ReadOutcome::Eof => {
                    if conn.proto == Proto::Http && conn.client {
                        http::drive_eof(conn, fallback.as_ref());
                    }
                    conn.closing = true;
                    return;
                }
                ReadOutcome::Failed(e) => {
                    conn.error(&format!("read failed: {}", e));
                    return;
                }
                ReadOutcome::Data(n, from) => {
                    if let Some(addr) = from {
                        conn.peer_addr = Some(addr);
                    }
                    if conn.tls_required && !conn.tls {
                        conn.error("tls required but no hooks installed");
                        return;
                    }
                    if conn.tls {
                        if let Err(e) = conn.tls_recv.append(&scratch[..n]) {
                            conn.error(&e.to_string());
                            return;
                        }
                        if conn.tls_hs {
                            tls_handshake_step(conn, fallback.as_ref(), limits);
                        } else {
                            tls_read_step(conn, fallback.as_ref(), limits);
                        }
                    } else {
                        if let Err(e) = conn.recv.append(&scratch[..n]) {
                            conn.error(&e.to_string());
                            return;
                        }
                        deliver(conn, fallback.as_ref(), Event::Read(n));
                        drive_protocols(conn, fallback.as_ref(), limits);
                    }
                    if conn.recv.len() >= limits.recv_soft_limit {
                        conn.full = true;
                    } else if conn.full && conn.recv.len() < limits.recv_soft_limit / 2 {
                        conn.full = false;
                    }
                }
            }
        }
    }

    fn write_pass(&mut self, id: u64, fallback: &Option<Rc<dyn EventHandler>>) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if (conn.listening && !conn.udp) || conn.connecting || conn.closing {
            return;
        }
        if conn.send.is_empty() {
            if conn.draining {
                conn.closing = true;
            }
            return;
        }
        if !conn.writable {
            return;
        }

        let mut flushed = 0usize;
        loop {
            if conn.send.is_empty() {
                break;
            }
            let result = match &mut conn.sock {
                Socket::Stream(stream) => stream.write(conn.send.as_slice()),
                Socket::Udp(sock) => {
                    if conn.listening {
                        match conn.peer_addr {
                            Some(peer) => sock.send_to(conn.send.as_slice(), peer),
                            None => {
                                conn.send.clear();
                                break;
                            }
                        }
                    } else {
                        sock.send(conn.send.as_slice())
                    }
                }
                Socket::Virtual => Ok(conn.send.len()),
                Socket::Listener(_) => return,
            };
            match result {
                Ok(0) => {
                    conn.error("peer closed during write");
                    break;
                }
                Ok(n) => {
                    conn.send.consume(n);
                    flushed += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    conn.writable = false;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    conn.error(&format!("write failed: {}", e));
                    break;
                }
            }
        }
        if flushed > 0 {
            deliver(conn, fallback.as_ref(), Event::Write(flushed));
        }
        if conn.send.is_empty() && conn.draining {
            conn.closing = true;
        }
    }

    fn wakeup_pass(&mut self, fallback: &Option<Rc<dyn EventHandler>>) {
        let records = match &mut self.wakeup {
            Some(channel) => channel.drain(),
            None => return,
        };
        for (id, payload) in records {
            match self.conns.get_mut(&id) {
                Some(conn) if !conn.closing => {
                    deliver(conn, fallback.as_ref(), Event::Wakeup(&payload[..]));
                }
                _ => log::debug!("wakeup for unknown connection {} dropped", id),
            }
        }
    }

    fn remove_conn(&mut self, id: u64, fallback: &Option<Rc<dyn EventHandler>>) {
        if let Some(conn) = self.conns.get_mut(&id) {
            deliver(conn, fallback.as_ref(), Event::Close);
        }
        if let Some(mut conn) = self.conns.remove(&id) {
            let result = match &mut conn.sock {
                Socket::Stream(stream) => self.poller.deregister(stream),
                Socket::Listener(listener) => self.poller.deregister(listener),
                Socket::Udp(sock) => self.poller.deregister(sock),
                Socket::Virtual => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("deregister of connection {} failed: {}", id, e);
            }
            log::debug!("connection {} closed", id);
        }
        self.ids.retain(|&existing| existing != id);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
    }
}

fn proto_for(scheme: &str) -> Proto {
    match scheme {
        "http" | "https" | "ws" | "wss" => Proto::Http,
        "mqtt" | "mqtts" => Proto::Mqtt,
        _ => Proto::Raw,
    }
}

fn resolve_authority(parsed: &url::Url) -> Result<SocketAddr> {
    (parsed.host.as_str(), parsed.port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::Url(format!("{} resolved to no addresses", parsed.host)))
}

fn drive_protocols(conn: &mut Connection, fallback: Option<&Rc<dyn EventHandler>>, limits: Limits) {
    match conn.proto {
        Proto::Http => http::drive(conn, fallback, limits.max_ws_frame),
        Proto::Mqtt => mqtt::drive(conn, fallback, limits.max_mqtt_packet),
        Proto::Sntp => sntp::drive(conn, fallback),
        Proto::Raw => {}
    }
}

/// Transport became usable: enforce the TLS requirement, run the
/// handshake if one is pending, then fire protocol openers (MQTT
/// CONNECT, WebSocket client upgrade).
fn kickoff(conn: &mut Connection, fallback: Option<&Rc<dyn EventHandler>>, limits: Limits) {
    if conn.tls_required && !conn.tls {
        conn.error("tls required but no hooks installed");
        return;
    }
    if conn.tls && conn.tls_hs {
        tls_handshake_step(conn, fallback, limits);
        return;
    }
    if conn.proto == Proto::Mqtt && conn.client && conn.mqtt_opts.is_some() {
        if let Err(e) = mqtt::send_connect(conn) {
            conn.error(&format!("mqtt connect: {}", e));
            return;
        }
    }
    if let Some((host, uri)) = conn.ws_connect_req.take() {
        if let Err(e) = ws::send_client_upgrade(conn, &host, &uri) {
            conn.error(&format!("websocket upgrade: {}", e));
        }
    }
}

fn tls_handshake_step(
    conn: &mut Connection,
    fallback: Option<&Rc<dyn EventHandler>>,
    limits: Limits,
) {
    let mut hooks = match conn.tls_hooks.take() {
        Some(hooks) => hooks,
        None => {
            conn.error("tls flagged but no hooks installed");
            return;
        }
    };
    let status = hooks.handshake(&mut conn.tls_recv, &mut conn.send);
    conn.tls_hooks = Some(hooks);
    match status {
        HandshakeStatus::NeedsMore => {}
        HandshakeStatus::Done => {
            conn.tls_hs = false;
            deliver(conn, fallback, Event::TlsHs);
            kickoff(conn, fallback, limits);
            tls_read_step(conn, fallback, limits);
        }
        HandshakeStatus::Error(msg) => {
            conn.error(&format!("tls handshake: {}", msg));
        }
    }
}

fn tls_read_step(conn: &mut Connection, fallback: Option<&Rc<dyn EventHandler>>, limits: Limits) {
    if conn.tls_recv.is_empty() {
        return;
    }
    let mut hooks = match conn.tls_hooks.take() {
        Some(hooks) => hooks,
        None => {
            conn.error("tls flagged but no hooks installed");
            return;
        }
    };
    let produced = hooks.read(&mut conn.tls_recv, &mut conn.recv);
    conn.tls_hooks = Some(hooks);
    match produced {
        Ok(0) => {}
        Ok(n) => {
            deliver(conn, fallback, Event::Read(n));
            drive_protocols(conn, fallback, limits);
        }
        Err(e) => conn.error(&format!("tls read: {}", e)),
    }
}
