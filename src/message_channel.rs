//! Framed messages, scalar blobs and descriptor passing over a
//! stream connection.

use crate::error::ChannelError;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::collections::HashMap;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// The byte that terminates every field of a message.
pub const DELIMITER: u8 = 0;

/// The largest message payload a 2-byte length prefix can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// The payload byte that carries a passed file descriptor.
const FD_MARKER: u8 = b'F';

type Result<T, E = ChannelError> = std::result::Result<T, E>;

/// Encodes a message into its wire representation, including the length prefix.
pub fn encode_message<T: AsRef<str>>(parts: &[T]) -> Result<Vec<u8>> {
    if parts.is_empty() {
        return Err(ChannelError::Protocol(
            "a message needs at least a name".to_string(),
        ));
    }
    let mut payload = Vec::new();
    for part in parts {
        let part = part.as_ref().as_bytes();
        if part.contains(&DELIMITER) {
            return Err(ChannelError::Protocol(
                "message name and arguments may not contain a null byte".to_string(),
            ));
        }
        payload.extend_from_slice(part);
        payload.push(DELIMITER);
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ChannelError::Protocol(format!(
            "message size {} exceeds the maximum of {}",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Splits a message payload (without length prefix) into its fields.
/// Every field must be terminated by a delimiter.
pub fn decode_message(payload: &[u8]) -> Result<Vec<String>> {
    let mut fields = vec![];
    let mut rest = payload;
    while let Some(pos) = rest.iter().position(|b| *b == DELIMITER) {
        let field = String::from_utf8(rest[..pos].to_vec())
            .map_err(|e| ChannelError::Protocol(format!("message field is not UTF-8: {}", e)))?;
        fields.push(field);
        rest = &rest[pos + 1..];
    }
    if !rest.is_empty() {
        return Err(ChannelError::Protocol(format!(
            "{} trailing bytes after the last field",
            rest.len()
        )));
    }
    Ok(fields)
}

/// Splits a `key\0value\0key\0value\0` blob into a map.
///
/// A trailing key without a value is a protocol error.
pub fn split_null_delimited_pairs(data: &[u8]) -> Result<HashMap<String, String>> {
    let fields = decode_message(data)?;
    pairs_into_map(fields)
}

pub(crate) fn pairs_into_map(fields: Vec<String>) -> Result<HashMap<String, String>> {
    if fields.len() % 2 != 0 {
        return Err(ChannelError::Protocol(format!(
            "expected an even number of fields for a hash, got {}",
            fields.len()
        )));
    }
    let mut map = HashMap::with_capacity(fields.len() / 2);
    let mut fields = fields.into_iter();
    while let (Some(k), Some(v)) = (fields.next(), fields.next()) {
        map.insert(k, v);
    }
    Ok(map)
}

/// A framed, blocking connection to one peer.
#[derive(Debug)]
pub struct MessageChannel<S = UnixStream> {
    io: S,
}

impl<S: Read + Write> MessageChannel<S> {
    pub fn new(io: S) -> Self {
        MessageChannel { io }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    /// Sends a message consisting of the given fields, the first of
    /// which is the message name.
    pub fn write_message<T: AsRef<str>>(&mut self, parts: &[T]) -> Result<()> {
        let frame = encode_message(parts)?;
        self.io.write_all(&frame)?;
        self.io.flush()?;
        Ok(())
    }

    /// Reads the next message. Returns `None` if the peer closed the
    /// connection before a new message started.
    pub fn read_message(&mut self) -> Result<Option<Vec<String>>> {
        let mut header = [0u8; 2];
        if !self.read_frame_start(&mut header)? {
            return Ok(None);
        }
        let size = u16::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; size];
        self.read_exactly(&mut payload)?;
        let message = decode_message(&payload)?;
        if message.is_empty() {
            return Err(ChannelError::Protocol("received an empty message".to_string()));
        }
        Ok(Some(message))
    }

    /// Reads the next message as a key/value map.
    pub fn read_hash(&mut self) -> Result<Option<HashMap<String, String>>> {
        match self.read_message()? {
            None => Ok(None),
            Some(fields) => pairs_into_map(fields).map(Some),
        }
    }

    pub fn write_scalar(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > u32::MAX as usize {
            return Err(ChannelError::Protocol(format!(
                "scalar of {} bytes is too large",
                data.len()
            )));
        }
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        self.io.write_all(&frame)?;
        self.io.flush()?;
        Ok(())
    }

    /// Reads the next scalar. A zero-length scalar is returned as an
    /// empty vector; `None` means the peer closed the connection.
    pub fn read_scalar(&mut self) -> Result<Option<Vec<u8>>> {
        self.read_scalar_limited(None)
    }

    /// Like [`read_scalar`](Self::read_scalar), but refuses scalars
    /// larger than `max_size` bytes before reading their payload.
    pub fn read_scalar_limited(&mut self, max_size: Option<usize>) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        if !self.read_frame_start(&mut header)? {
            return Ok(None);
        }
        let size = u32::from_be_bytes(header) as usize;
        if let Some(max) = max_size {
            if size > max {
                return Err(ChannelError::Protocol(format!(
                    "scalar message size ({}) exceeds maximum allowed size ({})",
                    size, max
                )));
            }
        }
        let mut data = vec![0u8; size];
        self.read_exactly(&mut data)?;
        Ok(Some(data))
    }

    /// Closes the channel. Consuming `self` means it can't be closed twice.
    pub fn close(self) {
        drop(self.io);
    }

    /// Fills `buf` entirely; returns false if the stream was at EOF
    /// before the first byte.
    fn read_frame_start(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.io.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(ChannelError::Eof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset && filled == 0 => {
                    return Ok(false)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn read_exactly(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() || self.read_frame_start(buf)? {
            Ok(())
        } else {
            Err(ChannelError::Eof)
        }
    }
}

impl MessageChannel<UnixStream> {
    /// Creates a connected pair of channels.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((MessageChannel::new(a), MessageChannel::new(b)))
    }

    /// Passes an open file descriptor to the peer. The caller keeps its
    /// own copy and is responsible for closing it once this returns.
    pub fn send_fd<F: AsRawFd>(&mut self, fd: &F) -> Result<()> {
        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let payload = [FD_MARKER];
        let iov = [IoSlice::new(&payload)];
        loop {
            match sendmsg::<()>(self.io.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
                Ok(1) => return Ok(()),
                Ok(n) => {
                    return Err(ChannelError::Protocol(format!(
                        "sent {} bytes while passing a file descriptor",
                        n
                    )))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives a file descriptor that the peer passed with
    /// [`send_fd`](Self::send_fd).
    pub fn recv_fd(&mut self) -> Result<OwnedFd> {
        let mut marker = [0u8; 1];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
        let (bytes, fds) = loop {
            let mut iov = [IoSliceMut::new(&mut marker)];
            match recvmsg::<()>(
                self.io.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let mut fds: Vec<RawFd> = vec![];
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            fds.extend(received);
                        }
                    }
                    break (msg.bytes, fds);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(ChannelError::Eof),
                Err(e) => return Err(e.into()),
            }
        };
        // Take ownership right away, so nothing leaks on the error paths below.
        let mut owned: Vec<OwnedFd> = fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();
        if bytes == 0 {
            return Err(ChannelError::Eof);
        }
        if marker[0] != FD_MARKER {
            return Err(ChannelError::Protocol(
                "expected a file descriptor, but received regular data".to_string(),
            ));
        }
        match owned.len() {
            1 => Ok(owned.remove(0)),
            0 => Err(ChannelError::Protocol(
                "expected a file descriptor, but none was attached".to_string(),
            )),
            n => Err(ChannelError::Protocol(format!(
                "expected one file descriptor, received {}",
                n
            ))),
        }
    }
}

impl AsRawFd for MessageChannel<UnixStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use std::fs::File;
    use std::io::Cursor;

    fn channel_with(bytes: Vec<u8>) -> MessageChannel<Cursor<Vec<u8>>> {
        MessageChannel::new(Cursor::new(bytes))
    }

    #[test]
    fn messages_round_trip() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        a.write_message(&["spawn_application", "/srv/app", "", "nobody"])
            .unwrap();
        a.write_message(&["reload"]).unwrap();
        assert_eq!(
            b.read_message().unwrap(),
            Some(vec![
                "spawn_application".to_string(),
                "/srv/app".to_string(),
                "".to_string(),
                "nobody".to_string()
            ])
        );
        assert_eq!(b.read_message().unwrap(), Some(vec!["reload".to_string()]));
    }

    #[test]
    fn wire_format() {
        let frame = encode_message(&["hi", "there"]).unwrap();
        assert_eq!(frame, b"\x00\x09hi\x00there\x00".to_vec());
    }

    #[test]
    fn rejects_the_delimiter() {
        assert_matches!(
            encode_message(&["name", "bad\0arg"]),
            Err(ChannelError::Protocol(_))
        );
        let mut chan = channel_with(vec![]);
        assert_matches!(
            chan.write_message(&["bad\0name"]),
            Err(ChannelError::Protocol(_))
        );
        assert!(chan.get_ref().get_ref().is_empty(), "nothing was written");
    }

    #[test]
    fn unterminated_fields_are_malformed() {
        let mut chan = channel_with(b"\x00\x04a\x00bc".to_vec());
        assert_matches!(chan.read_message(), Err(ChannelError::Protocol(_)));
        assert_matches!(
            split_null_delimited_pairs(b"PATH_INFO\0/\0REQUEST_METHOD"),
            Err(ChannelError::Protocol(_))
        );
    }

    #[test]
    fn rejects_oversized_messages() {
        let big = "x".repeat(MAX_MESSAGE_SIZE);
        assert_matches!(encode_message(&[&big]), Err(ChannelError::Protocol(_)));
    }

    #[test]
    fn eof_before_a_message_is_none() {
        let mut chan = channel_with(vec![]);
        assert_eq!(chan.read_message().unwrap(), None);
        assert_eq!(chan.read_scalar().unwrap(), None);
    }

    #[test]
    fn eof_inside_a_message_is_an_error() {
        let mut chan = channel_with(vec![0, 10, b'a']);
        assert_matches!(chan.read_message(), Err(ChannelError::Eof));
    }

    #[test]
    fn empty_scalars_are_not_eof() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        a.write_scalar(b"").unwrap();
        a.write_scalar(b"\0binary\xff\0").unwrap();
        drop(a);
        assert_eq!(b.read_scalar().unwrap(), Some(vec![]));
        assert_eq!(b.read_scalar().unwrap(), Some(b"\0binary\xff\0".to_vec()));
        assert_eq!(b.read_scalar().unwrap(), None);
    }

    #[test]
    fn scalar_limits() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        a.write_scalar(&[1u8; 32]).unwrap();
        assert_matches!(
            b.read_scalar_limited(Some(16)),
            Err(ChannelError::Protocol(_))
        );
    }

    #[test]
    fn hashes() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        a.write_message(&["app_root", "/srv/app", "environment", "staging"])
            .unwrap();
        a.write_message(&["odd"]).unwrap();
        let hash = b.read_hash().unwrap().unwrap();
        assert_eq!(hash["app_root"], "/srv/app");
        assert_eq!(hash["environment"], "staging");
        assert_matches!(b.read_hash(), Err(ChannelError::Protocol(_)));
    }

    #[test]
    fn null_delimited_pairs() {
        let map =
            split_null_delimited_pairs(b"REQUEST_METHOD\0GET\0PATH_INFO\0/\0EMPTY\0\0").unwrap();
        assert_eq!(map["REQUEST_METHOD"], "GET");
        assert_eq!(map["PATH_INFO"], "/");
        assert_eq!(map["EMPTY"], "");
    }

    #[test]
    fn passes_file_descriptors() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        a.write_message(&["here comes a pipe"]).unwrap();
        a.send_fd(&write_end).unwrap();
        nix::unistd::close(write_end).unwrap();

        assert_eq!(
            b.read_message().unwrap(),
            Some(vec!["here comes a pipe".to_string()])
        );
        let received = b.recv_fd().unwrap();
        let mut writer = File::from(received);
        writer.write_all(b"through the passed fd").unwrap();
        drop(writer);

        let mut reader = unsafe { File::from_raw_fd(read_end) };
        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "through the passed fd");
    }

    #[test]
    fn receiving_a_descriptor_that_isnt_there() {
        let (mut a, mut b) = MessageChannel::pair().unwrap();
        a.write_message(&["not a descriptor"]).unwrap();
        assert_matches!(b.recv_fd(), Err(ChannelError::Protocol(_)));

        let (a, mut b) = MessageChannel::pair().unwrap();
        drop(a);
        assert_matches!(b.recv_fd(), Err(ChannelError::Eof));
    }
}
