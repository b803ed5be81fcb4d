use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use mio::unix::pipe::{self, Receiver, Sender};

use crate::buffer::IoBuffer;
use crate::error::{Error, Result};

/// Reserved poll token for the wakeup pipe's read end (connection ids
/// start at 1, so it never collides).
pub(crate) const WAKEUP_TOKEN: mio::Token = mio::Token(0);

const FRAME_HEADER: usize = 12; // id: u64 LE, payload len: u32 LE

/// Thread-safe producer half of the wakeup channel.
///
/// This is the one object in the crate that may be used off the loop
/// thread: clone it, move it into workers, and call
/// [`wakeup`](Self::wakeup) with a connection id captured earlier. The
/// payload surfaces on the loop thread as `Event::Wakeup` on that
/// connection; ids that are no longer live are dropped with a log line.
#[derive(Clone)]
pub struct Wakeup {
    tx: Arc<Mutex<Sender>>,
}

impl Wakeup {
    /// Enqueues one framed record for the loop thread. Blocks briefly
    /// (spinning on the pipe) only if the pipe is full.
    pub fn wakeup(&self, id: u64, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Usage("wakeup payload too large"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);

        let mut tx = self
            .tx
            .lock()
            .map_err(|_| Error::Usage("wakeup sender lock poisoned"))?;
        let mut written = 0;
        while written < frame.len() {
            match tx.write(&frame[written..]) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "wakeup pipe closed",
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Loop-thread half: the pipe's read end, registered with the poller as
/// a pseudo-connection under [`WAKEUP_TOKEN`].
pub(crate) struct WakeupChannel {
    rx: Receiver,
    staging: IoBuffer,
    tx: Arc<Mutex<Sender>>,
}

impl WakeupChannel {
    pub fn new() -> Result<Self> {
        let (tx, rx) = pipe::new()?;
        Ok(Self {
            rx,
            staging: IoBuffer::new(),
            tx: Arc::new(Mutex::new(tx)),
        })
    }

    pub fn handle(&self) -> Wakeup {
        Wakeup {
            tx: self.tx.clone(),
        }
    }

    pub fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.rx
    }

    /// Reads everything currently in the pipe and returns the complete
    /// framed records; a partial frame stays staged for the next pass.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut scratch = [0u8; 4096];
        loop {
            match self.rx.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = self.staging.append(&scratch[..n]) {
                        log::error!("wakeup staging append failed: {}", e);
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("wakeup pipe read failed: {}", e);
                    break;
                }
            }
        }

        let mut records = Vec::new();
        loop {
            let data = self.staging.as_slice();
            if data.len() < FRAME_HEADER {
                break;
            }
            let id = u64::from_le_bytes(data[..8].try_into().expect("8-byte slice"));
            let len = u32::from_le_bytes(data[8..12].try_into().expect("4-byte slice")) as usize;
            if data.len() < FRAME_HEADER + len {
                break;
            }
            let payload = data[FRAME_HEADER..FRAME_HEADER + len].to_vec();
            self.staging.consume(FRAME_HEADER + len);
            records.push((id, payload));
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn drain_until(channel: &mut WakeupChannel, want: usize) -> Vec<(u64, Vec<u8>)> {
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < want && Instant::now() < deadline {
            got.extend(channel.drain());
            std::thread::sleep(Duration::from_millis(1));
        }
        got
    }

    #[test]
    fn test_same_thread_round_trip() {
        let mut channel = WakeupChannel::new().unwrap();
        let handle = channel.handle();
        handle.wakeup(3, b"payload").unwrap();
        handle.wakeup(9, b"").unwrap();

        let records = drain_until(&mut channel, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (3, b"payload".to_vec()));
        assert_eq!(records[1], (9, Vec::new()));
    }

    #[test]
    fn test_cross_thread_delivery_preserves_payloads() {
        let mut channel = WakeupChannel::new().unwrap();
        let handle = channel.handle();

        let worker = std::thread::spawn(move || {
            for _ in 0..10 {
                handle.wakeup(77, b"done").unwrap();
            }
        });

        let records = drain_until(&mut channel, 10);
        worker.join().unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|(id, p)| *id == 77 && p == b"done"));
    }

    #[test]
    fn test_partial_frames_are_restitched() {
        let mut channel = WakeupChannel::new().unwrap();
        // Write a record in two raw halves straight into the sender so
        // a drain can land mid-frame.
        let mut frame = Vec::new();
        frame.extend_from_slice(&5u64.to_le_bytes());
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(b"half");

        {
            let mut tx = channel.tx.lock().unwrap();
            tx.write_all(&frame[..6]).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(channel.drain().is_empty());
        {
            let mut tx = channel.tx.lock().unwrap();
            tx.write_all(&frame[6..]).unwrap();
        }
        let records = drain_until(&mut channel, 1);
        assert_eq!(records, vec![(5, b"half".to_vec())]);
    }
}
