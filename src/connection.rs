use std::any::Any;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream, UdpSocket};

use crate::buffer::IoBuffer;
use crate::error::{Error, Result};
use crate::event::EventHandler;
use crate::mqtt::MqttOpts;
use crate::tls::{TlsHooks, TlsOpts};

/// Application protocol attached to a connection, derived from the
/// endpoint URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    Raw,
    Http,
    Mqtt,
    Sntp,
}

pub(crate) enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
    /// No OS socket behind it (tests, pseudo-connections).
    Virtual,
}

/// One endpoint owned by a [`Manager`](crate::Manager).
///
/// Connections are created by `listen`, `connect` or accept, addressed
/// by a 64-bit id unique within their manager, and destroyed after the
/// handler has observed CLOSE. Handlers receive `&mut Connection` for
/// the duration of one event; code that needs a connection later keeps
/// the id, never a reference.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) sock: Socket,
    pub(crate) recv: IoBuffer,
    pub(crate) send: IoBuffer,
    /// Ciphertext staging area while TLS hooks are engaged.
    pub(crate) tls_recv: IoBuffer,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) handler: Option<Rc<dyn EventHandler>>,
    pub(crate) userdata: Option<Box<dyn Any>>,
    pub(crate) proto: Proto,

    // State flags. Composition rules: a listener is never client or
    // accepted; tls_hs implies tls; draining stops reads and closes
    // once send empties; closing drops the entry on the next pass.
    pub(crate) listening: bool,
    pub(crate) client: bool,
    pub(crate) accepted: bool,
    pub(crate) resolving: bool,
    pub(crate) connecting: bool,
    pub(crate) tls: bool,
    pub(crate) tls_hs: bool,
    pub(crate) udp: bool,
    pub(crate) websocket: bool,
    pub(crate) draining: bool,
    pub(crate) closing: bool,
    pub(crate) full: bool,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) resp: bool,

    /// Scheme demanded TLS; refused at transport-ready time when no
    /// hooks were installed.
    pub(crate) tls_required: bool,
    /// Application- or parser-raised error, delivered as ERROR before
    /// the connection closes.
    pub(crate) pending_error: Option<String>,

    // HTTP parser state.
    pub(crate) http_hdrs_fired: bool,
    // WebSocket state.
    pub(crate) ws_client_key: Option<String>,
    /// host + uri of a client upgrade to send once the transport is up.
    pub(crate) ws_connect_req: Option<(String, String)>,
    pub(crate) ws_frag: Vec<u8>,
    pub(crate) ws_frag_op: u8,
    // MQTT state.
    pub(crate) mqtt_next_id: u16,
    pub(crate) mqtt_opts: Option<MqttOpts>,

    pub(crate) tls_hooks: Option<Box<dyn TlsHooks>>,
}

impl Connection {
    pub(crate) fn new(id: u64, sock: Socket) -> Self {
        Self {
            id,
            sock,
            recv: IoBuffer::new(),
            send: IoBuffer::new(),
            tls_recv: IoBuffer::new(),
            local_addr: None,
            peer_addr: None,
            handler: None,
            userdata: None,
            proto: Proto::Raw,
            listening: false,
            client: false,
            accepted: false,
            resolving: false,
            connecting: false,
            tls: false,
            tls_hs: false,
            udp: false,
            websocket: false,
            draining: false,
            closing: false,
            full: false,
            readable: false,
            writable: false,
            resp: false,
            tls_required: false,
            pending_error: None,
            http_hdrs_fired: false,
            ws_client_key: None,
            ws_connect_req: None,
            ws_frag: Vec::new(),
            ws_frag_op: 0,
            mqtt_next_id: 1,
            mqtt_opts: None,
            tls_hooks: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn virtual_conn(id: u64) -> Self {
        Self::new(id, Socket::Virtual)
    }

    /// Monotonically assigned id, unique within the owning manager.
    /// Safe to hand to other threads together with a wakeup handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn is_resolving(&self) -> bool {
        self.resolving
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn is_tls_handshaking(&self) -> bool {
        self.tls_hs
    }

    pub fn is_udp(&self) -> bool {
        self.udp
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_resp(&self) -> bool {
        self.resp
    }

    /// Received bytes not yet consumed by a protocol parser. Raw
    /// tcp/udp applications read and [`recv_consume`](Self::recv_consume)
    /// from here in their READ handler.
    pub fn recv_data(&self) -> &[u8] {
        self.recv.as_slice()
    }

    pub fn recv_consume(&mut self, n: usize) {
        self.recv.consume(n);
    }

    /// Bytes queued for the socket but not yet flushed.
    pub fn send_queued(&self) -> usize {
        self.send.len()
    }

    /// Queues bytes for transmission. The send buffer is the single
    /// serialization point for outbound data; the actual socket write
    /// happens inside `poll`. With TLS engaged the bytes are encrypted
    /// on their way in.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.listening {
            return Err(Error::Usage("cannot send on a listener"));
        }
        if self.tls_hs {
            return Err(Error::Usage("TLS handshake in progress"));
        }
        if self.tls {
            let hooks = self
                .tls_hooks
                .as_mut()
                .ok_or(Error::Usage("TLS flagged but no hooks installed"))?;
            hooks.write(data, &mut self.send)?;
        } else {
            self.send.append(data)?;
        }
        Ok(())
    }

    /// Graceful close: stop reading, flush the send buffer, then close.
    pub fn drain(&mut self) {
        self.draining = true;
    }

    /// Hard close: the entry is dropped on the next dispatcher pass,
    /// after the handler observes CLOSE.
    pub fn close(&mut self) {
        self.closing = true;
    }

    /// Protocol failure: ERROR is delivered on the next dispatcher
    /// pass and the connection drains shut.
    pub(crate) fn protocol_error(&mut self, what: &str, err: Error) {
        log::debug!("connection {}: {} parse failure: {}", self.id, what, err);
        if self.pending_error.is_none() {
            self.pending_error = Some(format!("{}: {}", what, err));
        }
        self.draining = true;
    }

    /// Raises an ERROR event on this connection and closes it.
    pub fn error(&mut self, msg: &str) {
        log::debug!("connection {}: {}", self.id, msg);
        if self.pending_error.is_none() {
            self.pending_error = Some(msg.to_string());
        }
        self.closing = true;
    }

    /// Installs TLS hooks. Call while handling ACCEPT (servers) or
    /// CONNECT (clients); the driver then runs the handshake and emits
    /// TLS_HS when it completes.
    pub fn tls_init(&mut self, opts: &TlsOpts, mut hooks: Box<dyn TlsHooks>) -> Result<()> {
        if self.listening {
            return Err(Error::Usage("tls_init on a listener"));
        }
        if self.udp {
            return Err(Error::Usage("tls_init on a udp connection"));
        }
        if self.tls {
            return Err(Error::Usage("tls_init called twice"));
        }
        hooks.init(opts)?;
        self.tls_hooks = Some(hooks);
        self.tls = true;
        self.tls_hs = true;
        Ok(())
    }

    pub fn set_userdata(&mut self, data: Box<dyn Any>) {
        self.userdata = Some(data);
    }

    pub fn userdata(&self) -> Option<&dyn Any> {
        self.userdata.as_deref()
    }

    pub fn userdata_mut(&mut self) -> Option<&mut dyn Any> {
        // Box<dyn Any> derefs to the trait object itself.
        self.userdata.as_deref_mut()
    }

    pub fn take_userdata(&mut self) -> Option<Box<dyn Any>> {
        self.userdata.take()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("listening", &self.listening)
            .field("client", &self.client)
            .field("udp", &self.udp)
            .field("websocket", &self.websocket)
            .field("recv", &self.recv)
            .field("send", &self.send)
            .finish()
    }
}
