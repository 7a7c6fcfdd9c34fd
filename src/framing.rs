use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Smallest wire size this tool accepts for a DNS message over TCP.
pub const MIN_MSG_LEN: usize = 17;
/// Largest wire size this tool accepts for a DNS message over TCP.
pub const MAX_MSG_LEN: usize = 512;

/// A length prefix outside [MIN_MSG_LEN, MAX_MSG_LEN]. The connection that
/// produced it must be closed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("tcp message length {0} outside [{MIN_MSG_LEN}, {MAX_MSG_LEN}]")]
pub struct FramingError(pub u16);

/// Reassembles length-prefixed DNS messages from a TCP byte stream.
///
/// DNS over TCP prefixes each message with a 16-bit big-endian length. Bytes
/// arrive in arbitrary fragments and may carry several pipelined messages at
/// once; the framer buffers until a complete message is available.
#[derive(Default)]
pub struct MessageFramer {
	buf: BytesMut,
}

impl MessageFramer {
	pub fn new() -> Self {
		MessageFramer { buf: BytesMut::new() }
	}

	/// Append received bytes to the reassembly buffer.
	pub fn push(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Detach the next complete message, if one is buffered.
	///
	/// Ok(None) means more bytes are needed. An out-of-bounds length prefix
	/// is a framing violation; the buffer is left as-is and the caller is
	/// expected to drop the connection.
	pub fn next_message(&mut self) -> Result<Option<Bytes>, FramingError> {
		if self.buf.len() < 2 {
			return Ok(None);
		}
		let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]);
		let len = declared as usize;
		if !(MIN_MSG_LEN..=MAX_MSG_LEN).contains(&len) {
			return Err(FramingError(declared));
		}
		if self.buf.len() < 2 + len {
			return Ok(None);
		}
		self.buf.advance(2);
		Ok(Some(self.buf.split_to(len).freeze()))
	}
}
