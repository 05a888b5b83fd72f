//! Pre-exec rendezvous between supervisor and child
//!
//! Exactly two messages cross the channel: the parent's `DONE` ("setup
//! complete, proceed to exec") and the child's `ERROR` ("aborting before
//! exec"). EOF or a short read means the peer died.

use nsbox_core::{Result, SandboxError};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Done,
    Error,
}

impl Token {
    fn to_byte(self) -> u8 {
        match self {
            Token::Done => b'D',
            Token::Error => b'E',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'D' => Some(Token::Done),
            b'E' => Some(Token::Error),
            _ => None,
        }
    }
}

/// One endpoint of the handshake socket pair. Both endpoints are
/// close-on-exec, so a successful exec hangs up the channel.
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Create a connected (parent, child) endpoint pair.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (parent, child) = UnixStream::pair()
            .map_err(|err| SandboxError::KernelRefused(format!("socketpair: {}", err)))?;
        Ok((Channel { stream: parent }, Channel { stream: child }))
    }

    pub fn send(&mut self, token: Token) -> Result<()> {
        self.stream
            .write_all(&[token.to_byte()])
            .map_err(|err| SandboxError::PeerLost(format!("handshake write failed: {}", err)))
    }

    /// Read one token; EOF and unknown bytes both count as a lost peer.
    pub fn recv(&mut self) -> Result<Token> {
        let mut buf = [0u8; 1];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|err| SandboxError::PeerLost(format!("handshake read failed: {}", err)))?;
        if n == 0 {
            return Err(SandboxError::PeerLost(
                "handshake channel closed by peer".to_string(),
            ));
        }
        Token::from_byte(buf[0]).ok_or_else(|| {
            SandboxError::PeerLost(format!("unexpected handshake byte {:#x}", buf[0]))
        })
    }

    pub(crate) fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }
}
