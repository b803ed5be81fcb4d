//! MQTT 3.1.1 control packet codec plus the client/broker helpers the
//! dispatcher drives. Protocol name "MQTT", level 4; a version-5 flag
//! is carried for wire compatibility but no v5 properties are emitted.

use std::rc::Rc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{deliver, Event, EventHandler};

pub const MQTT_CMD_CONNECT: u8 = 1;
pub const MQTT_CMD_CONNACK: u8 = 2;
pub const MQTT_CMD_PUBLISH: u8 = 3;
pub const MQTT_CMD_PUBACK: u8 = 4;
pub const MQTT_CMD_PUBREC: u8 = 5;
pub const MQTT_CMD_PUBREL: u8 = 6;
pub const MQTT_CMD_PUBCOMP: u8 = 7;
pub const MQTT_CMD_SUBSCRIBE: u8 = 8;
pub const MQTT_CMD_SUBACK: u8 = 9;
pub const MQTT_CMD_UNSUBSCRIBE: u8 = 10;
pub const MQTT_CMD_UNSUBACK: u8 = 11;
pub const MQTT_CMD_PINGREQ: u8 = 12;
pub const MQTT_CMD_PINGRESP: u8 = 13;
pub const MQTT_CMD_DISCONNECT: u8 = 14;

/// Options for [`Manager::mqtt_connect`](crate::Manager::mqtt_connect).
#[derive(Debug, Clone)]
pub struct MqttOpts {
    /// Generated when empty.
    pub client_id: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Keepalive interval in seconds, advertised in CONNECT. Driving
    /// PINGREQ at that cadence is the application's timer.
    pub keepalive: u16,
    pub clean_session: bool,
    pub will_topic: Option<String>,
    pub will_message: Vec<u8>,
    pub will_qos: u8,
    pub will_retain: bool,
    /// Protocol level; 4 is MQTT 3.1.1.
    pub version: u8,
}

impl Default for MqttOpts {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            user: None,
            pass: None,
            keepalive: 60,
            clean_session: true,
            will_topic: None,
            will_message: Vec::new(),
            will_qos: 0,
            will_retain: false,
            version: 4,
        }
    }
}

/// Parsed view of one control packet, valid during its dispatch.
///
/// Field population depends on `cmd`: PUBLISH fills topic/payload/qos/
/// retain (and id for QoS > 0); CONNACK puts the return code in `ack`;
/// SUBSCRIBE carries the first topic filter; CONNECT exposes the
/// client id through `topic`.
pub struct MqttMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub id: u16,
    pub cmd: u8,
    pub qos: u8,
    pub retain: bool,
    pub ack: u8,
    /// The whole datagram, fixed header included.
    pub raw: &'a [u8],
}

impl<'a> MqttMessage<'a> {
    pub fn text(&self) -> Option<&'a str> {
        std::str::from_utf8(self.payload).ok()
    }
}

/// Encodes the remaining-length varint: 7 bits per byte, continuation
/// in bit 7, at most 4 bytes.
pub(crate) fn encode_varint(mut n: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            return;
        }
    }
}

/// Decodes a remaining-length varint. `Ok(None)` means more bytes are
/// needed; five continuation bytes are malformed.
pub(crate) fn decode_varint(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(Error::Parse("mqtt remaining length overlong".into()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    if buf.len() >= 4 {
        return Err(Error::Parse("mqtt remaining length overlong".into()));
    }
    Ok(None)
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_string<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str> {
    if buf.len() < *pos + 2 {
        return Err(Error::Parse("mqtt string truncated".into()));
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    *pos += 2;
    if buf.len() < *pos + len {
        return Err(Error::Parse("mqtt string truncated".into()));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| Error::Parse("mqtt string not utf-8".into()))?;
    *pos += len;
    Ok(s)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    if buf.len() < *pos + 2 {
        return Err(Error::Parse("mqtt packet truncated".into()));
    }
    let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

struct FixedHeader {
    cmd: u8,
    flags: u8,
    /// Offset of the variable header within the datagram.
    body_start: usize,
    total_len: usize,
}

fn parse_fixed(buf: &[u8], max_packet: usize) -> Result<Option<FixedHeader>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let cmd = buf[0] >> 4;
    let flags = buf[0] & 0x0f;
    let (remaining, varint_len) = match decode_varint(&buf[1..])? {
        Some(pair) => pair,
        None => return Ok(None),
    };
    let total_len = 1 + varint_len + remaining;
    if total_len > max_packet {
        return Err(Error::Parse(format!(
            "mqtt packet of {} bytes exceeds cap {}",
            total_len, max_packet
        )));
    }
    Ok(Some(FixedHeader {
        cmd,
        flags,
        body_start: 1 + varint_len,
        total_len,
    }))
}

/// Decodes the variable header and payload of a complete datagram into
/// a message view borrowing from `raw`.
fn parse_message<'a>(raw: &'a [u8], header: &FixedHeader) -> Result<MqttMessage<'a>> {
    let body = &raw[header.body_start..];
    let mut msg = MqttMessage {
        topic: "",
        payload: &[],
        id: 0,
        cmd: header.cmd,
        qos: 0,
        retain: false,
        ack: 0,
        raw,
    };

    match header.cmd {
        MQTT_CMD_CONNECT => {
            let mut pos = 0;
            let proto = read_string(body, &mut pos)?;
            if proto != "MQTT" && proto != "MQIsdp" {
                return Err(Error::Parse(format!("unknown mqtt protocol {:?}", proto)));
            }
            if body.len() < pos + 4 {
                return Err(Error::Parse("mqtt connect truncated".into()));
            }
            // version, connect flags, keepalive.
            pos += 4;
            msg.topic = read_string(body, &mut pos)?; // client id
        }
        MQTT_CMD_CONNACK => {
            if body.len() < 2 {
                return Err(Error::Parse("mqtt connack truncated".into()));
            }
            msg.ack = body[1];
        }
        MQTT_CMD_PUBLISH => {
            msg.qos = (header.flags >> 1) & 0x03;
            if msg.qos == 3 {
                return Err(Error::Parse("mqtt publish with qos 3".into()));
            }
            msg.retain = header.flags & 0x01 != 0;
            let mut pos = 0;
            msg.topic = read_string(body, &mut pos)?;
            if msg.topic.is_empty() {
                return Err(Error::Parse("mqtt publish with empty topic".into()));
            }
            if msg.qos > 0 {
                msg.id = read_u16(body, &mut pos)?;
                if msg.id == 0 {
                    return Err(Error::Parse("mqtt publish with zero packet id".into()));
                }
            }
            msg.payload = &body[pos..];
        }
        MQTT_CMD_SUBSCRIBE | MQTT_CMD_UNSUBSCRIBE => {
            let mut pos = 0;
            msg.id = read_u16(body, &mut pos)?;
            // First topic filter; the application walks `raw` for the
            // rest of a multi-topic request.
            msg.topic = read_string(body, &mut pos)?;
            if header.cmd == MQTT_CMD_SUBSCRIBE {
                if body.len() <= pos {
                    return Err(Error::Parse("mqtt subscribe without qos".into()));
                }
                msg.qos = body[pos] & 0x03;
            }
        }
        MQTT_CMD_PUBACK | MQTT_CMD_PUBREC | MQTT_CMD_PUBREL | MQTT_CMD_PUBCOMP
        | MQTT_CMD_UNSUBACK => {
            let mut pos = 0;
            msg.id = read_u16(body, &mut pos)?;
        }
        MQTT_CMD_SUBACK => {
            let mut pos = 0;
            msg.id = read_u16(body, &mut pos)?;
            if body.len() > pos {
                msg.ack = body[pos];
            }
        }
        MQTT_CMD_PINGREQ | MQTT_CMD_PINGRESP | MQTT_CMD_DISCONNECT => {}
        other => {
            return Err(Error::Parse(format!("unknown mqtt packet type {}", other)));
        }
    }
    Ok(msg)
}

/// Consumes complete packets from the recv buffer. Every packet is
/// surfaced as MQTT_CMD; CONNACK additionally emits MQTT_OPEN with the
/// return code, PUBLISH emits MQTT_MSG (after auto-acking QoS 1/2),
/// and PINGREQ is answered in kind.
pub(crate) fn drive(
    conn: &mut Connection,
    fallback: Option<&Rc<dyn EventHandler>>,
    max_packet: usize,
) {
    loop {
        if conn.closing || conn.draining {
            return;
        }
        let header = match parse_fixed(conn.recv.as_slice(), max_packet) {
            Ok(Some(h)) => h,
            Ok(None) => return,
            Err(e) => {
                conn.protocol_error("mqtt", e);
                return;
            }
        };
        if conn.recv.len() < header.total_len {
            return;
        }

        let raw = conn.recv.take(header.total_len);
        let msg = match parse_message(&raw, &header) {
            Ok(msg) => msg,
            Err(e) => {
                conn.protocol_error("mqtt", e);
                return;
            }
        };

        deliver(conn, fallback, Event::MqttCmd(&msg));
        match header.cmd {
            MQTT_CMD_CONNACK => {
                let code = msg.ack;
                deliver(conn, fallback, Event::MqttOpen(code));
            }
            MQTT_CMD_PUBLISH => {
                match msg.qos {
                    1 => {
                        let _ = conn.mqtt_send_ack(MQTT_CMD_PUBACK, msg.id);
                    }
                    2 => {
                        let _ = conn.mqtt_send_ack(MQTT_CMD_PUBREC, msg.id);
                    }
                    _ => {}
                }
                deliver(conn, fallback, Event::MqttMsg(&msg));
            }
            MQTT_CMD_PUBREL => {
                let _ = conn.mqtt_send_ack(MQTT_CMD_PUBCOMP, msg.id);
            }
            MQTT_CMD_PINGREQ => {
                let _ = conn.mqtt_pong();
            }
            _ => {}
        }
    }
}

/// Emits the CONNECT packet once the transport is ready.
pub(crate) fn send_connect(conn: &mut Connection) -> Result<()> {
    let opts = conn
        .mqtt_opts
        .clone()
        .ok_or(Error::Usage("mqtt connect options missing"))?;

    let client_id = if opts.client_id.is_empty() {
        format!("millrace-{:08x}", rand::random::<u32>())
    } else {
        opts.client_id.clone()
    };

    let mut connect_flags = 0u8;
    if opts.clean_session {
        connect_flags |= 0x02;
    }
    if opts.will_topic.is_some() {
        connect_flags |= 0x04 | ((opts.will_qos & 0x03) << 3);
        if opts.will_retain {
            connect_flags |= 0x20;
        }
    }
    if opts.pass.is_some() {
        connect_flags |= 0x40;
    }
    if opts.user.is_some() {
        connect_flags |= 0x80;
    }

    let mut body = Vec::new();
    write_string(&mut body, "MQTT");
    body.push(if opts.version == 5 { 5 } else { 4 });
    body.push(connect_flags);
    body.extend_from_slice(&opts.keepalive.to_be_bytes());
    write_string(&mut body, &client_id);
    if let Some(topic) = &opts.will_topic {
        write_string(&mut body, topic);
        body.extend_from_slice(&(opts.will_message.len() as u16).to_be_bytes());
        body.extend_from_slice(&opts.will_message);
    }
    if let Some(user) = &opts.user {
        write_string(&mut body, user);
    }
    if let Some(pass) = &opts.pass {
        write_string(&mut body, pass);
    }

    conn.mqtt_send_header(MQTT_CMD_CONNECT, 0, body.len())?;
    conn.send(&body)
}

impl Connection {
    /// Writes a fixed header: packet type, flags nibble, remaining
    /// length. The caller follows with exactly `len` body bytes.
    pub fn mqtt_send_header(&mut self, cmd: u8, flags: u8, len: usize) -> Result<()> {
        let mut header = Vec::with_capacity(5);
        header.push((cmd << 4) | (flags & 0x0f));
        encode_varint(len, &mut header);
        self.send(&header)
    }

    fn mqtt_send_ack(&mut self, cmd: u8, id: u16) -> Result<()> {
        // PUBREL carries the reserved 0b0010 flags nibble.
        let flags = if cmd == MQTT_CMD_PUBREL { 0x02 } else { 0 };
        self.mqtt_send_header(cmd, flags, 2)?;
        self.send(&id.to_be_bytes())
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.mqtt_next_id;
        self.mqtt_next_id = if self.mqtt_next_id == u16::MAX {
            1
        } else {
            self.mqtt_next_id + 1
        };
        id
    }

    /// Publishes to `topic`. For QoS > 0 a fresh packet id is assigned
    /// and returned (0 for QoS 0).
    pub fn mqtt_pub(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<u16> {
        let qos = qos.min(2);
        let mut body = Vec::with_capacity(2 + topic.len() + payload.len() + 2);
        write_string(&mut body, topic);
        let id = if qos > 0 {
            let id = self.next_packet_id();
            body.extend_from_slice(&id.to_be_bytes());
            id
        } else {
            0
        };
        body.extend_from_slice(payload);

        let flags = (qos << 1) | u8::from(retain);
        self.mqtt_send_header(MQTT_CMD_PUBLISH, flags, body.len())?;
        self.send(&body)?;
        Ok(id)
    }

    /// Subscribes to one topic filter; returns the packet id to match
    /// against the SUBACK.
    pub fn mqtt_sub(&mut self, topic: &str, qos: u8) -> Result<u16> {
        let id = self.next_packet_id();
        let mut body = Vec::with_capacity(4 + topic.len() + 1);
        body.extend_from_slice(&id.to_be_bytes());
        write_string(&mut body, topic);
        body.push(qos.min(2));

        self.mqtt_send_header(MQTT_CMD_SUBSCRIBE, 0x02, body.len())?;
        self.send(&body)?;
        Ok(id)
    }

    pub fn mqtt_ping(&mut self) -> Result<()> {
        self.mqtt_send_header(MQTT_CMD_PINGREQ, 0, 0)
    }

    pub fn mqtt_pong(&mut self) -> Result<()> {
        self.mqtt_send_header(MQTT_CMD_PINGRESP, 0, 0)
    }

    pub fn mqtt_disconnect(&mut self) -> Result<()> {
        self.mqtt_send_header(MQTT_CMD_DISCONNECT, 0, 0)
    }

    /// Broker side: acknowledges a CONNECT with the given return code
    /// (0 accepts).
    pub fn mqtt_connack(&mut self, code: u8) -> Result<()> {
        self.mqtt_send_header(MQTT_CMD_CONNACK, 0, 2)?;
        self.send(&[0, code])
    }

    /// Broker side: grants one subscription at `granted_qos`.
    pub fn mqtt_suback(&mut self, id: u16, granted_qos: u8) -> Result<()> {
        self.mqtt_send_header(MQTT_CMD_SUBACK, 0, 3)?;
        self.send(&id.to_be_bytes())?;
        self.send(&[granted_qos.min(2)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_varint_reference_vectors() {
        for (value, bytes) in [
            (0usize, vec![0x00u8]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xff, 0x7f]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (2_097_151, vec![0xff, 0xff, 0x7f]),
            (268_435_455, vec![0xff, 0xff, 0xff, 0x7f]),
        ] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out, bytes, "encoding {}", value);
            assert_eq!(decode_varint(&bytes).unwrap(), Some((value, bytes.len())));
        }
    }

    #[test]
    fn test_varint_incomplete_and_overlong() {
        assert_eq!(decode_varint(&[0x80]).unwrap(), None);
        assert_eq!(decode_varint(&[0x80, 0x80]).unwrap(), None);
        assert!(decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        assert!(decode_varint(&[0x80, 0x80, 0x80, 0x80]).is_err());
    }

    struct Captured {
        cmds: Vec<u8>,
        msgs: Vec<(String, Vec<u8>, u16, u8, bool)>,
        opens: Vec<u8>,
    }

    fn capture_conn(sink: Rc<RefCell<Captured>>) -> Connection {
        let mut conn = Connection::virtual_conn(1);
        conn.proto = crate::connection::Proto::Mqtt;
        conn.handler = Some(Rc::new(move |_: &mut Connection, ev: Event<'_>| {
            let mut sink = sink.borrow_mut();
            match ev {
                Event::MqttCmd(m) => sink.cmds.push(m.cmd),
                Event::MqttMsg(m) => sink.msgs.push((
                    m.topic.to_string(),
                    m.payload.to_vec(),
                    m.id,
                    m.qos,
                    m.retain,
                )),
                Event::MqttOpen(code) => sink.opens.push(code),
                _ => {}
            }
        }));
        conn
    }

    fn new_sink() -> Rc<RefCell<Captured>> {
        Rc::new(RefCell::new(Captured {
            cmds: Vec::new(),
            msgs: Vec::new(),
            opens: Vec::new(),
        }))
    }

    const CAP: usize = 1 << 20;

    #[test]
    fn test_publish_round_trip_preserves_everything() {
        let mut sender = Connection::virtual_conn(9);
        let id = sender
            .mqtt_pub("sensors/a/temp", b"23.5", 1, true)
            .unwrap();
        assert!(id > 0);

        let sink = new_sink();
        let mut receiver = capture_conn(sink.clone());
        receiver.recv.append(sender.send.as_slice()).unwrap();
        drive(&mut receiver, None, CAP);

        let got = sink.borrow();
        assert_eq!(got.cmds, vec![MQTT_CMD_PUBLISH]);
        assert_eq!(
            got.msgs,
            vec![("sensors/a/temp".to_string(), b"23.5".to_vec(), id, 1, true)]
        );
        // QoS 1 publish was auto-acked with the same id.
        let ack = receiver.send.as_slice();
        assert_eq!(ack[0] >> 4, MQTT_CMD_PUBACK);
        assert_eq!(u16::from_be_bytes([ack[2], ack[3]]), id);
    }

    #[test]
    fn test_qos0_publish_has_no_id_and_no_ack() {
        let mut sender = Connection::virtual_conn(9);
        let id = sender.mqtt_pub("t", b"x", 0, false).unwrap();
        assert_eq!(id, 0);

        let sink = new_sink();
        let mut receiver = capture_conn(sink.clone());
        receiver.recv.append(sender.send.as_slice()).unwrap();
        drive(&mut receiver, None, CAP);

        assert_eq!(sink.borrow().msgs[0].3, 0);
        assert!(receiver.send.is_empty());
    }

    #[test]
    fn test_fresh_packet_ids_increment_and_skip_zero() {
        let mut conn = Connection::virtual_conn(1);
        let a = conn.mqtt_pub("t", b"1", 1, false).unwrap();
        let b = conn.mqtt_pub("t", b"2", 1, false).unwrap();
        assert_eq!(b, a + 1);

        conn.mqtt_next_id = u16::MAX;
        let c = conn.mqtt_pub("t", b"3", 1, false).unwrap();
        assert_eq!(c, u16::MAX);
        let d = conn.mqtt_pub("t", b"4", 1, false).unwrap();
        assert_eq!(d, 1);
    }

    #[test]
    fn test_subscribe_round_trip() {
        let mut client = Connection::virtual_conn(2);
        let id = client.mqtt_sub("sensors/+/temp", 1).unwrap();

        let sink = new_sink();
        let mut broker = capture_conn(sink.clone());
        broker.recv.append(client.send.as_slice()).unwrap();
        drive(&mut broker, None, CAP);

        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_SUBSCRIBE]);
        // SUBSCRIBE fixed-header flags must be the reserved 0b0010.
        assert_eq!(client.send.as_slice()[0] & 0x0f, 0x02);

        // Broker grants it; the client sees the SUBACK with the id.
        broker.mqtt_suback(id, 1).unwrap();
        let sink2 = new_sink();
        let mut client_rx = capture_conn(sink2.clone());
        client_rx.recv.append(broker.send.as_slice()).unwrap();
        drive(&mut client_rx, None, CAP);
        assert_eq!(sink2.borrow().cmds, vec![MQTT_CMD_SUBACK]);
    }

    #[test]
    fn test_connect_packet_shape_and_broker_parse() {
        let mut client = Connection::virtual_conn(3);
        client.mqtt_opts = Some(MqttOpts {
            client_id: "probe-1".into(),
            user: Some("u".into()),
            pass: Some("p".into()),
            keepalive: 30,
            ..Default::default()
        });
        send_connect(&mut client).unwrap();

        let wire = client.send.as_slice().to_vec();
        assert_eq!(wire[0] >> 4, MQTT_CMD_CONNECT);
        // Variable header: len 4, "MQTT", level 4.
        assert_eq!(&wire[2..9], &[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04]);
        // clean session + user + pass flags.
        assert_eq!(wire[9], 0x02 | 0x40 | 0x80);

        let sink = new_sink();
        let mut broker = capture_conn(sink.clone());
        broker.recv.append(&wire).unwrap();
        drive(&mut broker, None, CAP);
        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_CONNECT]);
    }

    #[test]
    fn test_connack_emits_mqtt_open() {
        let mut broker = Connection::virtual_conn(4);
        broker.mqtt_connack(0).unwrap();

        let sink = new_sink();
        let mut client = capture_conn(sink.clone());
        client.recv.append(broker.send.as_slice()).unwrap();
        drive(&mut client, None, CAP);

        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_CONNACK]);
        assert_eq!(sink.borrow().opens, vec![0]);
    }

    #[test]
    fn test_pingreq_answered_with_pingresp() {
        let mut peer = Connection::virtual_conn(5);
        peer.mqtt_ping().unwrap();

        let sink = new_sink();
        let mut conn = capture_conn(sink.clone());
        conn.recv.append(peer.send.as_slice()).unwrap();
        drive(&mut conn, None, CAP);

        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_PINGREQ]);
        assert_eq!(conn.send.as_slice(), &[MQTT_CMD_PINGRESP << 4, 0]);
    }

    #[test]
    fn test_partial_packet_waits_for_more() {
        let mut sender = Connection::virtual_conn(6);
        sender.mqtt_pub("topic", b"payload", 0, false).unwrap();
        let wire = sender.send.as_slice().to_vec();

        let sink = new_sink();
        let mut conn = capture_conn(sink.clone());
        conn.recv.append(&wire[..wire.len() - 3]).unwrap();
        drive(&mut conn, None, CAP);
        assert!(sink.borrow().cmds.is_empty());

        conn.recv.append(&wire[wire.len() - 3..]).unwrap();
        drive(&mut conn, None, CAP);
        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_PUBLISH]);
    }

    #[test]
    fn test_oversized_packet_is_parse_error() {
        let sink = new_sink();
        let mut conn = capture_conn(sink.clone());
        // PUBLISH announcing 70000 bytes against a 1 KiB cap.
        let mut wire = vec![MQTT_CMD_PUBLISH << 4];
        encode_varint(70_000, &mut wire);
        conn.recv.append(&wire).unwrap();
        drive(&mut conn, None, 1024);
        assert!(conn.is_draining());
        assert!(conn.pending_error.is_some());
    }

    #[test]
    fn test_zero_packet_id_publish_is_rejected() {
        // Hand-built QoS 1 PUBLISH with id 0.
        let mut body = Vec::new();
        write_string(&mut body, "t");
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(b"x");
        let mut wire = vec![(MQTT_CMD_PUBLISH << 4) | 0x02];
        encode_varint(body.len(), &mut wire);
        wire.extend_from_slice(&body);

        let sink = new_sink();
        let mut conn = capture_conn(sink.clone());
        conn.recv.append(&wire).unwrap();
        drive(&mut conn, None, CAP);
        assert!(conn.is_draining());
    }

    #[test]
    fn test_disconnect_is_surfaced_as_cmd() {
        let mut peer = Connection::virtual_conn(7);
        peer.mqtt_disconnect().unwrap();

        let sink = new_sink();
        let mut conn = capture_conn(sink.clone());
        conn.recv.append(peer.send.as_slice()).unwrap();
        drive(&mut conn, None, CAP);
        assert_eq!(sink.borrow().cmds, vec![MQTT_CMD_DISCONNECT]);
    }
}
