//! The fixed-size control message and its codec.
//!
//! Every datagram is a 208-byte header followed by `extra_bytes` of
//! payload. All integers are little-endian. The header is validated on
//! decode; a header with a wrong magic or size never reaches the
//! coordinator state machine.
//!
//! ## Header layout (208 bytes)
//!
//! | Field               | Offset | Size | Description                          |
//! |---------------------|--------|------|--------------------------------------|
//! | magic               | 0      | 16   | `"DMTCP_CKPT_V0\n"` NUL-padded       |
//! | text                | 16     | 64   | barrier name / kvdb namespace id     |
//! | kvdb_op             | 80     | 4    | [`KvdbOp`] on requests               |
//! | kvdb_status         | 84     | 4    | [`KvdbStatus`] on responses          |
//! | msg_size            | 88     | 4    | always 208                           |
//! | extra_bytes         | 92     | 4    | payload length following the header  |
//! | kind                | 96     | 4    | [`MessageKind`]                      |
//! | state               | 100    | 4    | [`WorkerState`] of the sender        |
//! | from                | 104    | 24   | sender [`UniquePid`]                 |
//! | comp_group          | 128    | 24   | computation group [`UniquePid`]      |
//! | virtual_pid         | 152    | 4    | coordinator-assigned pid             |
//! | real_pid            | 156    | 4    | kernel pid on the worker host        |
//! | key_len             | 160    | 4    | kvdb key bytes within the payload    |
//! | val_len             | 164    | 4    | kvdb value bytes within the payload  |
//! | num_peers           | 168    | 4    | peer count (restart hello, accepts)  |
//! | is_running          | 172    | 4    | status reply flag                    |
//! | coord_cmd           | 176    | 4    | command byte for `UserCmd`           |
//! | coord_cmd_status    | 180    | 4    | [`CoordCmdStatus`] in replies        |
//! | coord_timestamp     | 184    | 8    | coordinator monotonic nanoseconds    |
//! | checkpoint_interval | 192    | 4    | seconds; [`SAME_CKPT_INTERVAL`] = keep |
//! | ip_addr             | 196    | 4    | IPv4 octets                          |
//! | unique_id_offset    | 200    | 4    | reserved for unique-filename plugin  |
//! | exit_after_ckpt     | 204    | 4    | workers exit once the ckpt completes |

use std::io;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{CoordCmdStatus, MessageKind, WorkerState, SAME_CKPT_INTERVAL};
use crate::unique_pid::UniquePid;

/// Magic prefix of every header, NUL-padded to 16 bytes.
pub const MAGIC: &[u8; 16] = b"DMTCP_CKPT_V0\n\0\0";

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 208;

/// Inline text capacity (barrier name / kvdb id), including the
/// terminating NUL.
pub const TEXT_SIZE: usize = 64;

/// Sanity cap on payload length. Control payloads are filenames, barrier
/// names, and kvdb values; anything near this large is a corrupt header.
pub const MAX_EXTRA_BYTES: u32 = 16 * 1024 * 1024;

/// Decode failure. Any of these on a worker socket is a protocol error
/// for that socket: the peer is dropped, the coordinator keeps running.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Header magic did not match [`MAGIC`].
    #[error("bad magic in message header")]
    BadMagic,

    /// `msg_size` field disagrees with [`HEADER_SIZE`].
    #[error("bad header size {0} (expected {HEADER_SIZE})")]
    BadSize(u32),

    /// Unknown [`MessageKind`] discriminant.
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    /// Unknown [`WorkerState`] discriminant.
    #[error("unknown worker state {0}")]
    UnknownState(u32),

    /// `extra_bytes` exceeds [`MAX_EXTRA_BYTES`].
    #[error("payload length {0} exceeds cap")]
    OversizedPayload(u32),

    /// Inline text is not valid UTF-8.
    #[error("inline text is not valid UTF-8")]
    BadText,

    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded control message.
///
/// Field meanings depend on [`kind`](Self::kind); unused fields are zero.
/// The `text` field carries the barrier name for `Barrier`/
/// `BarrierReleased` and the kvdb namespace id for kvdb messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind tag.
    pub kind: MessageKind,
    /// Sender's worker state.
    pub state: WorkerState,
    /// Barrier name or kvdb namespace id (at most [`TEXT_SIZE`] - 1 bytes).
    pub text: String,
    /// Raw kvdb operation discriminant (requests).
    pub kvdb_op: u32,
    /// Raw kvdb status (responses).
    pub kvdb_status: i32,
    /// Payload length following the header.
    pub extra_bytes: u32,
    /// Sender identity.
    pub from: UniquePid,
    /// Computation group identity.
    pub comp_group: UniquePid,
    /// Coordinator-assigned pid (-1 when unassigned).
    pub virtual_pid: i32,
    /// Kernel pid on the worker host.
    pub real_pid: i32,
    /// Kvdb key length within the payload.
    pub key_len: u32,
    /// Kvdb value length within the payload.
    pub val_len: u32,
    /// Peer count (restart hello carries the expected total).
    pub num_peers: u32,
    /// Whether the computation is unanimously running (status replies).
    pub is_running: u32,
    /// Command byte for `UserCmd`.
    pub coord_cmd: u32,
    /// Command status for `UserCmdResult`.
    pub coord_cmd_status: i32,
    /// Coordinator monotonic timestamp (nanoseconds).
    pub coord_timestamp: u64,
    /// Checkpoint interval in seconds.
    pub checkpoint_interval: i32,
    /// Coordinator or peer IPv4 address.
    pub ip_addr: Ipv4Addr,
    /// Reserved for the unique-filename plugin.
    pub unique_id_offset: u32,
    /// Workers exit after the checkpoint completes.
    pub exit_after_ckpt: u32,
}

impl Message {
    /// A zeroed message of the given kind.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            state: WorkerState::Unknown,
            text: String::new(),
            kvdb_op: 0,
            kvdb_status: 0,
            extra_bytes: 0,
            from: UniquePid::null(),
            comp_group: UniquePid::null(),
            virtual_pid: -1,
            real_pid: -1,
            key_len: 0,
            val_len: 0,
            num_peers: 0,
            is_running: 0,
            coord_cmd: 0,
            coord_cmd_status: CoordCmdStatus::NoError as i32,
            coord_timestamp: 0,
            checkpoint_interval: SAME_CKPT_INTERVAL,
            ip_addr: Ipv4Addr::UNSPECIFIED,
            unique_id_offset: 0,
            exit_after_ckpt: 0,
        }
    }

    /// Encode the 208-byte header. `extra_bytes` is taken from the field;
    /// use [`write_to`](Self::write_to) to keep it in sync with a payload.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);

        let mut text = [0u8; TEXT_SIZE];
        let n = self.text.len().min(TEXT_SIZE - 1);
        text[..n].copy_from_slice(&self.text.as_bytes()[..n]);
        buf.put_slice(&text);

        buf.put_u32_le(self.kvdb_op);
        buf.put_i32_le(self.kvdb_status);
        buf.put_u32_le(HEADER_SIZE as u32);
        buf.put_u32_le(self.extra_bytes);
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(self.state as u32);
        self.from.encode(&mut buf);
        self.comp_group.encode(&mut buf);
        buf.put_i32_le(self.virtual_pid);
        buf.put_i32_le(self.real_pid);
        buf.put_u32_le(self.key_len);
        buf.put_u32_le(self.val_len);
        buf.put_u32_le(self.num_peers);
        buf.put_u32_le(self.is_running);
        buf.put_u32_le(self.coord_cmd);
        buf.put_i32_le(self.coord_cmd_status);
        buf.put_u64_le(self.coord_timestamp);
        buf.put_i32_le(self.checkpoint_interval);
        buf.put_slice(&self.ip_addr.octets());
        buf.put_u32_le(self.unique_id_offset);
        buf.put_u32_le(self.exit_after_ckpt);

        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf
    }

    /// Decode and validate a 208-byte header.
    pub fn decode(header: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let mut buf = &header[..];

        let mut magic = [0u8; 16];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let mut text_raw = [0u8; TEXT_SIZE];
        buf.copy_to_slice(&mut text_raw);
        let text_end = text_raw.iter().position(|&b| b == 0).unwrap_or(TEXT_SIZE);
        let text = std::str::from_utf8(&text_raw[..text_end])
            .map_err(|_| ProtocolError::BadText)?
            .to_owned();

        let kvdb_op = buf.get_u32_le();
        let kvdb_status = buf.get_i32_le();

        let msg_size = buf.get_u32_le();
        if msg_size != HEADER_SIZE as u32 {
            return Err(ProtocolError::BadSize(msg_size));
        }

        let extra_bytes = buf.get_u32_le();
        if extra_bytes > MAX_EXTRA_BYTES {
            return Err(ProtocolError::OversizedPayload(extra_bytes));
        }

        let kind_raw = buf.get_u32_le();
        let kind = MessageKind::from_u32(kind_raw).ok_or(ProtocolError::UnknownKind(kind_raw))?;
        let state_raw = buf.get_u32_le();
        let state =
            WorkerState::from_u32(state_raw).ok_or(ProtocolError::UnknownState(state_raw))?;

        let from = UniquePid::decode(&mut buf);
        let comp_group = UniquePid::decode(&mut buf);

        let virtual_pid = buf.get_i32_le();
        let real_pid = buf.get_i32_le();
        let key_len = buf.get_u32_le();
        let val_len = buf.get_u32_le();
        let num_peers = buf.get_u32_le();
        let is_running = buf.get_u32_le();
        let coord_cmd = buf.get_u32_le();
        let coord_cmd_status = buf.get_i32_le();
        let coord_timestamp = buf.get_u64_le();
        let checkpoint_interval = buf.get_i32_le();

        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let ip_addr = Ipv4Addr::from(octets);

        let unique_id_offset = buf.get_u32_le();
        let exit_after_ckpt = buf.get_u32_le();

        Ok(Self {
            kind,
            state,
            text,
            kvdb_op,
            kvdb_status,
            extra_bytes,
            from,
            comp_group,
            virtual_pid,
            real_pid,
            key_len,
            val_len,
            num_peers,
            is_running,
            coord_cmd,
            coord_cmd_status,
            coord_timestamp,
            checkpoint_interval,
            ip_addr,
            unique_id_offset,
            exit_after_ckpt,
        })
    }

    /// Write the header plus `payload`, overriding `extra_bytes` with the
    /// payload length.
    pub async fn write_to<W>(&self, writer: &mut W, payload: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut msg = self.clone();
        msg.extra_bytes = payload.len() as u32;
        writer.write_all(&msg.encode()).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        Ok(())
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(MessageKind::Null)
    }
}

/// Read one full message (header plus payload).
///
/// Returns `Ok(None)` on clean EOF before the first header byte. EOF in
/// the middle of a frame is an [`io::ErrorKind::UnexpectedEof`] wrapped
/// in [`ProtocolError::Io`].
pub async fn read_message<R>(reader: &mut R) -> Result<Option<(Message, Bytes)>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];

    // Clean EOF only counts before the first byte of a header.
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside message header",
            )));
        }
        filled += n;
    }

    let msg = Message::decode(&header)?;

    let payload = if msg.extra_bytes > 0 {
        let mut data = vec![0u8; msg.extra_bytes as usize];
        reader.read_exact(&mut data).await.map_err(ProtocolError::Io)?;
        Bytes::from(data)
    } else {
        Bytes::new()
    };

    Ok(Some((msg, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::new(MessageKind::Barrier);
        msg.state = WorkerState::Suspended;
        msg.text = "DMT:SUSPEND".to_owned();
        msg.from = UniquePid::new(0xdead_beef, 40_000, 1_700_000_000);
        msg.comp_group = UniquePid::new(0xdead_beef, 40_000, 1_700_000_000);
        msg.virtual_pid = 40_000;
        msg.real_pid = 1234;
        msg.num_peers = 3;
        msg.coord_timestamp = 42;
        msg.checkpoint_interval = 60;
        msg.ip_addr = Ipv4Addr::new(10, 0, 0, 7);
        msg
    }

    #[test]
    fn header_is_fixed_size() {
        assert_eq!(sample().encode().len(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = sample();
        let encoded = msg.encode();
        let header: [u8; HEADER_SIZE] = encoded.as_ref().try_into().unwrap();
        let decoded = Message::decode(&header).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn poisoned_header_is_rejected() {
        let header = [0u8; HEADER_SIZE];
        assert!(matches!(
            Message::decode(&header),
            Err(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn wrong_size_is_rejected() {
        let mut encoded = sample().encode();
        // Corrupt the msg_size field (offset 88).
        encoded[88..92].copy_from_slice(&100u32.to_le_bytes());
        let header: [u8; HEADER_SIZE] = encoded.as_ref().try_into().unwrap();
        assert!(matches!(
            Message::decode(&header),
            Err(ProtocolError::BadSize(100))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut msg = sample();
        msg.extra_bytes = MAX_EXTRA_BYTES + 1;
        let encoded = msg.encode();
        let header: [u8; HEADER_SIZE] = encoded.as_ref().try_into().unwrap();
        assert!(matches!(
            Message::decode(&header),
            Err(ProtocolError::OversizedPayload(_))
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut encoded = sample().encode();
        // Corrupt the kind field (offset 96).
        encoded[96..100].copy_from_slice(&999u32.to_le_bytes());
        let header: [u8; HEADER_SIZE] = encoded.as_ref().try_into().unwrap();
        assert!(matches!(
            Message::decode(&header),
            Err(ProtocolError::UnknownKind(999))
        ));
    }

    #[test]
    fn text_is_truncated_to_capacity() {
        let mut msg = sample();
        msg.text = "x".repeat(100);
        let encoded = msg.encode();
        let header: [u8; HEADER_SIZE] = encoded.as_ref().try_into().unwrap();
        let decoded = Message::decode(&header).unwrap();
        assert_eq!(decoded.text.len(), TEXT_SIZE - 1);
    }

    #[tokio::test]
    async fn read_message_with_payload() {
        let msg = sample();
        let payload = b"/tmp/ckpt_a.dmtcp\0\0hostA\0";
        let mut wire = Vec::new();
        msg.write_to(&mut wire, payload).await.unwrap();

        let (decoded, data) = read_message(&mut wire.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Barrier);
        assert_eq!(decoded.extra_bytes as usize, payload.len());
        assert_eq!(data.as_ref(), payload);
    }

    #[tokio::test]
    async fn read_message_clean_eof() {
        let wire: &[u8] = &[];
        assert!(read_message(&mut &wire[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_message_truncated_header() {
        let wire = vec![0u8; 10];
        assert!(matches!(
            read_message(&mut wire.as_slice()).await,
            Err(ProtocolError::Io(_))
        ));
    }
}
