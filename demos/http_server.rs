//! Static file server with a small JSON route.
//!
//! Usage: cargo run --example http_server [web_root] [port]

use std::path::PathBuf;

use millrace::{Connection, Event, Manager, ServeOpts, StdFs};

fn main() -> millrace::Result<()> {
    env_logger::init();

    let root = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| ".".into()));
    let port: u16 = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let url = format!("http://127.0.0.1:{}", port);

    let mut mgr = Manager::new()?;
    let web_root = root.clone();
    mgr.listen(&url, move |conn: &mut Connection, ev: Event<'_>| {
        if let Event::HttpMsg(msg) = ev {
            println!("{} {}", msg.method, msg.uri);
            let result = if msg.uri == "/api/info" {
                conn.reply(
                    200,
                    r#"{"server":"millrace","protocol":"HTTP/1.1"}"#,
                    &[("Content-Type", "application/json")],
                )
            } else {
                conn.serve_dir(msg, &StdFs, &ServeOpts::new(&web_root))
            };
            if let Err(e) = result {
                log::error!("request failed: {}", e);
                conn.close();
            }
        }
    })?;

    println!("serving {} on {}", root.display(), url);
    println!("  GET {}/api/info", url);
    loop {
        mgr.poll(100)?;
    }
}
