//! WebSocket echo server.
//!
//! Usage: cargo run --example ws_echo [port]
//! Try it with: websocat ws://127.0.0.1:8001/

use millrace::{ws, Connection, Event, Manager};

fn main() -> millrace::Result<()> {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8001);
    let url = format!("ws://127.0.0.1:{}", port);

    let mut mgr = Manager::new()?;
    mgr.listen(&url, |conn: &mut Connection, ev: Event<'_>| match ev {
        Event::HttpMsg(msg) => {
            if let Err(e) = conn.ws_upgrade(msg, &[]) {
                log::warn!("upgrade refused: {}", e);
                let _ = conn.reply(426, "websocket only\n", &[]);
                conn.drain();
            }
        }
        Event::WsOpen(_) => println!("client {} joined", conn.id()),
        Event::WsMsg(frame) => {
            let payload = frame.payload.to_vec();
            if let Err(e) = conn.ws_send(&payload, frame.opcode()) {
                log::error!("echo failed: {}", e);
                conn.close();
            }
        }
        Event::Close => println!("client {} left", conn.id()),
        _ => {}
    })?;

    println!("websocket echo on {}", url);
    loop {
        mgr.poll(100)?;
    }
}
