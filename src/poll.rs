use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Readiness observed for one token in a single poll pass.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Thin wrapper over `mio::Poll`. The manager owns exactly one and is
/// the only caller; registration and readiness collection both happen
/// on the loop thread, so no locking is involved.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.register(self.poll.registry(), token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.deregister(self.poll.registry())?;
        Ok(())
    }

    /// Blocks for at most `timeout` and returns the readiness observed.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // Signal delivery during the wait is not an error.
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| Readiness {
                token: ev.token(),
                readable: ev.is_readable(),
                writable: ev.is_writable(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_activity() {
        let mut poller = Poller::new().unwrap();
        let start = Instant::now();
        let ready = poller.wait(Some(Duration::from_millis(30))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_register_listener_reports_readable_on_connect() {
        let mut poller = Poller::new().unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(addr).unwrap();
        let local = listener.local_addr().unwrap();
        poller
            .register(&mut listener, Token(5), Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(local).unwrap();

        let mut seen = false;
        for _ in 0..50 {
            let ready = poller.wait(Some(Duration::from_millis(20))).unwrap();
            if ready.iter().any(|r| r.token == Token(5) && r.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen, "listener readability never reported");

        poller.deregister(&mut listener).unwrap();
    }
}
