//! SNTP v4 client codec (RFC 4330). Request/response only; the
//! application owns the polling cadence via a timer.

use std::rc::Rc;

use crate::connection::{Connection, Proto};
use crate::error::{Error, Result};
use crate::event::{deliver, Event, EventHandler};

const PACKET_LEN: usize = 48;
/// Seconds between the NTP era (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Client request: LI=0, VN=4, Mode=3 (client), everything else zero.
pub(crate) fn request_packet() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = 0x23;
    packet
}

/// Extracts the transmit timestamp of a server reply as epoch
/// milliseconds.
pub(crate) fn parse_reply(buf: &[u8]) -> Result<u64> {
    if buf.len() < PACKET_LEN {
        return Err(Error::Parse("sntp reply shorter than 48 bytes".into()));
    }
    let mode = buf[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(Error::Parse(format!("sntp reply with mode {}", mode)));
    }
    if buf[1] == 0 {
        // Stratum 0 is a kiss-of-death packet.
        return Err(Error::Parse("sntp kiss-of-death reply".into()));
    }
    let secs = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]) as u64;
    let frac = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]) as u64;
    if secs < NTP_UNIX_OFFSET {
        return Err(Error::Parse("sntp timestamp before the unix epoch".into()));
    }
    Ok((secs - NTP_UNIX_OFFSET) * 1000 + ((frac * 1000) >> 32))
}

pub(crate) fn drive(conn: &mut Connection, fallback: Option<&Rc<dyn EventHandler>>) {
    while conn.recv.len() >= PACKET_LEN {
        let datagram = conn.recv.take(conn.recv.len());
        match parse_reply(&datagram) {
            Ok(epoch_ms) => deliver(conn, fallback, Event::SntpTime(epoch_ms)),
            Err(e) => {
                conn.protocol_error("sntp", e);
                return;
            }
        }
    }
    // Short datagrams are noise on a UDP socket; drop them.
    if !conn.recv.is_empty() {
        conn.recv.clear();
    }
}

impl Connection {
    /// Sends one time request; the answer arrives as `Event::SntpTime`.
    pub fn sntp_request(&mut self) -> Result<()> {
        if self.proto != Proto::Sntp {
            return Err(Error::Usage("sntp_request on a non-sntp connection"));
        }
        self.send(&request_packet())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn server_reply(secs: u64, frac: u32) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0] = 0x24; // VN=4, Mode=4 (server)
        packet[1] = 2; // stratum
        packet[40..44].copy_from_slice(&((secs + NTP_UNIX_OFFSET) as u32).to_be_bytes());
        packet[44..48].copy_from_slice(&frac.to_be_bytes());
        packet
    }

    #[test]
    fn test_request_is_version_4_client() {
        let packet = request_packet();
        assert_eq!(packet.len(), 48);
        assert_eq!(packet[0] >> 3 & 0x07, 4);
        assert_eq!(packet[0] & 0x07, 3);
    }

    #[test]
    fn test_reply_converts_to_epoch_millis() {
        // 2024-01-01T00:00:00Z plus half a second.
        let secs = 1_704_067_200u64;
        let reply = server_reply(secs, u32::MAX / 2 + 1);
        let ms = parse_reply(&reply).unwrap();
        assert_eq!(ms, secs * 1000 + 500);
    }

    #[test]
    fn test_reply_validation() {
        assert!(parse_reply(&[0u8; 20]).is_err());

        let mut bad_mode = server_reply(1_704_067_200, 0);
        bad_mode[0] = 0x23; // client mode
        assert!(parse_reply(&bad_mode).is_err());

        let mut kod = server_reply(1_704_067_200, 0);
        kod[1] = 0;
        assert!(parse_reply(&kod).is_err());
    }

    #[test]
    fn test_drive_emits_sntp_time() {
        let times = Rc::new(RefCell::new(Vec::new()));
        let mut conn = Connection::virtual_conn(1);
        conn.proto = Proto::Sntp;
        conn.udp = true;
        let sink = times.clone();
        conn.handler = Some(Rc::new(move |_: &mut Connection, ev: Event<'_>| {
            if let Event::SntpTime(ms) = ev {
                sink.borrow_mut().push(ms);
            }
        }));

        conn.recv
            .append(&server_reply(1_704_067_200, 0))
            .unwrap();
        drive(&mut conn, None);
        assert_eq!(*times.borrow(), vec![1_704_067_200_000]);
        assert!(conn.recv.is_empty());
    }
}
