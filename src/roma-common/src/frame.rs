//! Length-prefixed framing over one end of a socketpair.
//!
//! Each frame is a 4-byte little-endian length followed by a JSON-serialized
//! message. When a shared region is attached and a serialized message is
//! large (or the channel is in buffer-only mode), the message body is placed
//! in the sender's half of the region instead and the frame on the wire is
//! the length prefix with its high bit set, followed by
//! `{offset: u32 LE, len: u32 LE}` into the region.
//!
//! Framing is half-duplex per direction: each side serializes its own
//! writes, and each direction alternates request/response, so one slot per
//! half of the shared region is sufficient.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::shm::SharedRegion;

/// Largest message that is still sent inline when a shared region is
/// attached (and the channel is not in buffer-only mode).
pub const INLINE_FRAME_MAX: usize = 64 * 1024;

/// Marks a length prefix as referring to the shared region.
const SHARED_FLAG: u32 = 1 << 31;

/// Upper bound on an inline frame accepted from the peer. The peer on the
/// other end of a worker channel is untrusted; a fabricated length prefix
/// must not translate into an arbitrary allocation.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Errors surfaced by [`Channel`] operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed its end; the channel is permanently broken.
    #[error("channel disconnected")]
    Disconnected,
    /// A read deadline configured with `set_read_timeout` elapsed.
    #[error("channel read timed out")]
    TimedOut,
    /// A message did not fit its half of the shared region.
    #[error("payload exceeds the shared buffer")]
    PayloadTooLarge,
    /// A frame referenced the shared region but none is attached.
    #[error("frame references a shared region that is not attached")]
    NoSharedRegion,
    /// (De)serialization failure; indicates a protocol bug, not user error.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// Any other I/O failure on the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Which half of an attached shared region this end of the channel writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The spawning process; writes the lower half.
    Parent,
    /// The worker process; writes the upper half.
    Child,
}

/// One end of a framed, bidirectional message channel.
pub struct Channel {
    stream: UnixStream,
    shared: Option<SharedRegion>,
    buffer_only: bool,
    side: Side,
}

impl Channel {
    /// Wrap one end of a socketpair with no shared region attached.
    pub fn new(stream: UnixStream, side: Side) -> Self {
        Self {
            stream,
            shared: None,
            buffer_only: false,
            side,
        }
    }

    /// Attach a shared region. With `buffer_only`, every message goes
    /// through the region regardless of size.
    pub fn with_shared_region(mut self, region: SharedRegion, buffer_only: bool) -> Self {
        self.shared = Some(region);
        self.buffer_only = buffer_only;
        self
    }

    /// Set (or clear) a deadline for `recv`. A `None` timeout blocks
    /// indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// The fd of the underlying stream, for building a worker command line.
    pub fn raw_fd(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }

    /// Serialize and send one message.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        let body = serde_json::to_vec(message)?;

        let use_shared = match &self.shared {
            Some(_) => self.buffer_only || body.len() > INLINE_FRAME_MAX,
            None => false,
        };

        if use_shared {
            // `use_shared` is only true when a region is attached.
            let region = self.shared.as_ref().ok_or(ChannelError::NoSharedRegion)?;
            let half = region.len() / 2;
            if body.len() > half {
                return Err(ChannelError::PayloadTooLarge);
            }
            let offset = match self.side {
                Side::Parent => 0,
                Side::Child => half,
            };
            region.write_at(offset, &body)?;

            let mut frame = [0u8; 12];
            frame[..4].copy_from_slice(&SHARED_FLAG.to_le_bytes());
            frame[4..8].copy_from_slice(&(offset as u32).to_le_bytes());
            frame[8..12].copy_from_slice(&(body.len() as u32).to_le_bytes());
            self.stream.write_all(&frame)?;
        } else {
            if body.len() as u64 >= u64::from(SHARED_FLAG) {
                return Err(ChannelError::PayloadTooLarge);
            }
            // One write per frame: a sender killed between a header and its
            // body would leave the receiver's framing desynchronized.
            let mut frame = Vec::with_capacity(4 + body.len());
            frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
            frame.extend_from_slice(&body);
            self.stream.write_all(&frame)?;
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Receive and deserialize one message, blocking until a frame arrives,
    /// the peer disconnects, or the read timeout elapses.
    ///
    /// A length prefix over the frame limit is treated as a disconnect: the
    /// peer is either hostile or corrupt, and the stream cannot be resynced.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let mut prefix = [0u8; 4];
        read_exact(&mut self.stream, &mut prefix)?;
        let prefix = u32::from_le_bytes(prefix);

        let body = if prefix & SHARED_FLAG != 0 {
            let mut slot = [0u8; 8];
            read_exact(&mut self.stream, &mut slot)?;
            let offset = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
            let len = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]) as usize;
            let region = self.shared.as_ref().ok_or(ChannelError::NoSharedRegion)?;
            region.read_at(offset, len)?
        } else {
            let len = prefix as usize;
            if len > MAX_FRAME_LEN {
                tracing::warn!(len, "peer sent an oversized frame, dropping the channel");
                return Err(ChannelError::Disconnected);
            }
            let mut body = vec![0u8; len];
            read_exact(&mut self.stream, &mut body)?;
            body
        };

        Ok(serde_json::from_slice(&body)?)
    }
}

fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), ChannelError> {
    stream.read_exact(buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset => ChannelError::Disconnected,
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ChannelError::TimedOut,
        _ => ChannelError::Io(err),
    })
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("side", &self.side)
            .field("shared", &self.shared.is_some())
            .field("buffer_only", &self.buffer_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Payload, RpcWrapper};

    fn pair() -> (Channel, Channel) {
        let (a, b) = UnixStream::pair().unwrap();
        (Channel::new(a, Side::Parent), Channel::new(b, Side::Child))
    }

    #[test]
    fn inline_round_trip() {
        let (mut parent, mut child) = pair();
        let wrapper = RpcWrapper {
            function_name: "callback".into(),
            ..Default::default()
        };
        parent.send(&wrapper).unwrap();
        let received: RpcWrapper = child.recv().unwrap();
        assert_eq!(received, wrapper);
    }

    #[test]
    fn recv_reports_disconnect_on_peer_drop() {
        let (mut parent, child) = pair();
        drop(child);
        let err = parent.recv::<RpcWrapper>().unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected), "got {err:?}");
    }

    #[test]
    fn recv_times_out_when_no_frame_arrives() {
        let (mut parent, _child) = pair();
        parent
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let err = parent.recv::<RpcWrapper>().unwrap_err();
        assert!(matches!(err, ChannelError::TimedOut), "got {err:?}");
    }

    #[test]
    fn large_message_travels_through_shared_region() {
        let (a, b) = UnixStream::pair().unwrap();
        let region = SharedRegion::create(4 * 1024 * 1024).unwrap();
        let peer_view =
            SharedRegion::from_fd(region.fd().try_clone_to_owned().unwrap(), 4 * 1024 * 1024)
                .unwrap();
        let mut parent = Channel::new(a, Side::Parent).with_shared_region(region, false);
        let mut child = Channel::new(b, Side::Child).with_shared_region(peer_view, false);

        let big = Payload::Str("x".repeat(INLINE_FRAME_MAX * 2));
        parent.send(&big).unwrap();
        let received: Payload = child.recv().unwrap();
        assert_eq!(received, big);
    }

    #[test]
    fn buffer_only_mode_rejects_oversized_payloads() {
        let (a, _b) = UnixStream::pair().unwrap();
        let region = SharedRegion::create(1024).unwrap();
        let mut parent = Channel::new(a, Side::Parent).with_shared_region(region, true);

        // The payload exceeds the parent's 512-byte half: no inline fallback.
        let err = parent.send(&Payload::Str("y".repeat(2048))).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadTooLarge), "got {err:?}");
    }

    #[test]
    fn buffer_only_mode_routes_small_payloads_through_region() {
        let (a, b) = UnixStream::pair().unwrap();
        let region = SharedRegion::create(1024 * 1024).unwrap();
        let peer_view =
            SharedRegion::from_fd(region.fd().try_clone_to_owned().unwrap(), 1024 * 1024).unwrap();
        let mut parent = Channel::new(a, Side::Parent).with_shared_region(region, true);
        let mut child = Channel::new(b, Side::Child).with_shared_region(peer_view, true);

        parent.send(&Payload::Str("tiny".into())).unwrap();
        let received: Payload = child.recv().unwrap();
        assert_eq!(received, Payload::Str("tiny".into()));
    }
}
