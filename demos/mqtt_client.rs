//! MQTT client: subscribes to a topic and keeps the session alive.
//!
//! Usage: cargo run --example mqtt_client [mqtt://host:1883] [topic]

use std::cell::Cell;
use std::rc::Rc;

use millrace::{mqtt, Connection, Event, Manager, MqttOpts, TimerOpts};

fn main() -> millrace::Result<()> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqtt://127.0.0.1:1883".into());
    let topic = std::env::args().nth(2).unwrap_or_else(|| "millrace/demo".into());

    let mut mgr = Manager::new()?;
    let sub_topic = topic.clone();
    let conn_id = mgr.mqtt_connect(
        &url,
        MqttOpts {
            client_id: "millrace-demo".into(),
            keepalive: 30,
            ..Default::default()
        },
        move |conn: &mut Connection, ev: Event<'_>| match ev {
            Event::MqttOpen(code) => {
                if code != 0 {
                    eprintln!("broker refused connect: code {}", code);
                    conn.close();
                    return;
                }
                let id = conn.mqtt_sub(&sub_topic, 1).unwrap();
                println!("subscribed to {} (packet id {})", sub_topic, id);
            }
            Event::MqttCmd(msg) if msg.cmd == mqtt::MQTT_CMD_SUBACK => {
                println!("suback for packet id {}", msg.id);
            }
            Event::MqttMsg(msg) => {
                println!("{} <- {}", msg.topic, msg.text().unwrap_or("<binary>"));
            }
            Event::Error(why) => eprintln!("connection error: {}", why),
            _ => {}
        },
    )?;
    println!("connecting to {}", url);

    // The keepalive cadence is the application's timer. The callback
    // only flags; the ping itself runs between polls, where the
    // connection can be borrowed again.
    let ping_due = Rc::new(Cell::new(false));
    let flag = ping_due.clone();
    mgr.timer_add(
        25_000,
        TimerOpts {
            repeat: true,
            ..Default::default()
        },
        move || flag.set(true),
    );

    loop {
        mgr.poll(100)?;
        let Some(conn) = mgr.conn(conn_id) else {
            eprintln!("connection closed, exiting");
            return Ok(());
        };
        if ping_due.replace(false) {
            conn.mqtt_ping()?;
        }
    }
}
