use crate::buffer::IoBuffer;
use crate::error::Result;

/// TLS material handed through to the hook implementation. The core
/// never interprets these fields.
#[derive(Debug, Clone, Default)]
pub struct TlsOpts {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    /// Server name for SNI.
    pub name: Option<String>,
    pub skip_verification: bool,
}

pub enum HandshakeStatus {
    /// Handshake wants more peer bytes; poll again.
    NeedsMore,
    Done,
    Error(String),
}

/// Capability set an opaque TLS state machine plugs into.
///
/// The driver routes bytes through these hooks whenever a connection's
/// `tls` flag is set: peer ciphertext accumulates in `recv`, and
/// anything the hooks write into `send` is drained to the socket like
/// any other outbound data. Session teardown is `Drop`.
pub trait TlsHooks {
    fn init(&mut self, opts: &TlsOpts) -> Result<()>;

    /// Advances the handshake. Consumes ciphertext from `recv`, may
    /// produce ciphertext into `send`.
    fn handshake(&mut self, recv: &mut IoBuffer, send: &mut IoBuffer) -> HandshakeStatus;

    /// Decrypts buffered ciphertext from `recv` into `plaintext`.
    /// Returns the number of plaintext bytes produced.
    fn read(&mut self, recv: &mut IoBuffer, plaintext: &mut IoBuffer) -> Result<usize>;

    /// Encrypts `plaintext`, appending ciphertext to `send`. Returns
    /// the number of plaintext bytes consumed.
    fn write(&mut self, plaintext: &[u8], send: &mut IoBuffer) -> Result<usize>;
}

/// Identity "TLS" used by loop tests: completes the handshake without
/// exchanging bytes and passes data through unchanged.
#[cfg(test)]
pub(crate) struct PassthroughTls;

#[cfg(test)]
impl TlsHooks for PassthroughTls {
    fn init(&mut self, _opts: &TlsOpts) -> Result<()> {
        Ok(())
    }

    fn handshake(&mut self, _recv: &mut IoBuffer, _send: &mut IoBuffer) -> HandshakeStatus {
        HandshakeStatus::Done
    }

    fn read(&mut self, recv: &mut IoBuffer, plaintext: &mut IoBuffer) -> Result<usize> {
        let n = recv.len();
        let bytes = recv.take(n);
        plaintext.append(&bytes)?;
        Ok(n)
    }

    fn write(&mut self, plaintext: &[u8], send: &mut IoBuffer) -> Result<usize> {
        send.append(plaintext)?;
        Ok(plaintext.len())
    }
}
