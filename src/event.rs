use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::connection::Connection;
use crate::http::HttpMessage;
use crate::mqtt::MqttMessage;
use crate::ws::WsFrame;

/// Typed event payloads delivered to connection handlers.
///
/// Message-view variants borrow bytes staged by the dispatcher for the
/// duration of the callback; the borrow ends when the handler returns,
/// so a view can never outlive its dispatch.
pub enum Event<'a> {
    /// Something went wrong on this connection; CLOSE follows.
    Error(&'a str),
    /// First event after the connection enters the table.
    Open,
    /// Fired every poll cycle for periodic work.
    Poll,
    /// Hostname resolution finished for an outbound connection.
    Resolve,
    /// Outbound TCP handshake completed.
    Connect,
    /// Inbound connection accepted from a listener.
    Accept,
    /// TLS handshake completed.
    TlsHs,
    /// Bytes appended to the recv buffer.
    Read(usize),
    /// Bytes flushed from the send buffer to the socket.
    Write(usize),
    /// Last event a connection ever receives.
    Close,
    /// Request/response head is complete; body may still be arriving.
    HttpHdrs(&'a HttpMessage<'a>),
    /// Full HTTP message, body included.
    HttpMsg(&'a HttpMessage<'a>),
    /// WebSocket handshake done; payload is the upgrade request.
    WsOpen(&'a HttpMessage<'a>),
    /// WebSocket data frame (fragments already joined).
    WsMsg(&'a WsFrame<'a>),
    /// WebSocket control frame (close/ping/pong).
    WsCtl(&'a WsFrame<'a>),
    /// Any parsed MQTT packet, pre-correlation.
    MqttCmd(&'a MqttMessage<'a>),
    /// Incoming MQTT PUBLISH.
    MqttMsg(&'a MqttMessage<'a>),
    /// CONNACK return code.
    MqttOpen(u8),
    /// SNTP server time, epoch milliseconds.
    SntpTime(u64),
    /// Payload injected from another thread via the wakeup channel.
    Wakeup(&'a [u8]),
    /// Application-defined.
    User(&'a dyn std::any::Any),
}

impl Event<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Error(_) => "ERROR",
            Event::Open => "OPEN",
            Event::Poll => "POLL",
            Event::Resolve => "RESOLVE",
            Event::Connect => "CONNECT",
            Event::Accept => "ACCEPT",
            Event::TlsHs => "TLS_HS",
            Event::Read(_) => "READ",
            Event::Write(_) => "WRITE",
            Event::Close => "CLOSE",
            Event::HttpHdrs(_) => "HTTP_HDRS",
            Event::HttpMsg(_) => "HTTP_MSG",
            Event::WsOpen(_) => "WS_OPEN",
            Event::WsMsg(_) => "WS_MSG",
            Event::WsCtl(_) => "WS_CTL",
            Event::MqttCmd(_) => "MQTT_CMD",
            Event::MqttMsg(_) => "MQTT_MSG",
            Event::MqttOpen(_) => "MQTT_OPEN",
            Event::SntpTime(_) => "SNTP_TIME",
            Event::Wakeup(_) => "WAKEUP",
            Event::User(_) => "USER",
        }
    }
}

impl std::fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-connection (or manager-default) event callback.
///
/// Handlers take `&self`; stateful handlers keep their state behind
/// interior mutability (`RefCell`, `Cell`, atomics) the way reactor
/// handlers usually do.
pub trait EventHandler {
    fn event(&self, conn: &mut Connection, ev: Event<'_>);
}

impl<F> EventHandler for F
where
    F: Fn(&mut Connection, Event<'_>),
{
    fn event(&self, conn: &mut Connection, ev: Event<'_>) {
        self(conn, ev)
    }
}

/// Routes one event to the connection's handler, falling back to the
/// manager default. A missing handler drops the event. Handler panics
/// are trapped and logged; the loop carries on.
pub(crate) fn deliver(
    conn: &mut Connection,
    fallback: Option<&Rc<dyn EventHandler>>,
    ev: Event<'_>,
) {
    let handler = match conn.handler.clone().or_else(|| fallback.cloned()) {
        Some(h) => h,
        None => return,
    };
    let id = conn.id();
    let name = ev.name();
    if catch_unwind(AssertUnwindSafe(|| handler.event(conn, ev))).is_err() {
        log::error!("handler panicked during {} on connection {}", name, id);
    }
}
