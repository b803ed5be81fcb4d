//! millrace: an embedded, event-driven networking runtime.
//!
//! One application event handler serves HTTP/1.1, WebSocket and MQTT
//! 3.1.1 concurrently over a single cooperative poll loop. A
//! [`Manager`] owns listeners and connections, a non-blocking driver
//! multiplexes their sockets, and protocol state machines parse the
//! per-connection byte buffers into typed [`Event`]s.
//!
//! ```no_run
//! use millrace::{Connection, Event, Manager};
//!
//! fn main() -> millrace::Result<()> {
//!     let mut mgr = Manager::new()?;
//!     mgr.listen("http://0.0.0.0:8000", |conn: &mut Connection, ev: Event<'_>| {
//!         if let Event::HttpMsg(msg) = ev {
//!             let body = format!("hello, {}\n", msg.uri);
//!             conn.reply(200, body, &[]).unwrap();
//!         }
//!     })?;
//!     loop {
//!         mgr.poll(100)?;
//!     }
//! }
//! ```
//!
//! The loop is single-threaded by design: every handler, parser and
//! timer runs on the thread that calls [`Manager::poll`]. The one
//! cross-thread operation is [`Wakeup::wakeup`], which injects a
//! payload back into the loop by connection id.

pub mod buffer;
pub mod connection;
pub mod error;
pub mod event;
pub mod fs;
pub mod http;
pub mod manager;
pub mod mqtt;
pub mod object_pool;
mod poll;
pub mod sntp;
pub mod thread_pool;
pub mod timer;
pub mod tls;
pub mod url;
pub mod wakeup;
pub mod ws;

pub use buffer::IoBuffer;
pub use connection::Connection;
pub use error::{Error, Result};
pub use event::{Event, EventHandler};
pub use fs::{FileProvider, FileStat, StdFs};
pub use http::{HttpMessage, MultipartPart, ServeOpts};
pub use manager::{Manager, ManagerConfig};
pub use mqtt::{MqttMessage, MqttOpts};
pub use object_pool::{ObjectPool, PooledObject};
pub use thread_pool::ThreadPool;
pub use timer::{TimerId, TimerOpts};
pub use tls::{HandshakeStatus, TlsHooks, TlsOpts};
pub use wakeup::Wakeup;
pub use ws::WsFrame;
