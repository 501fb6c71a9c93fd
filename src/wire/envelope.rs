use byteorder::{ByteOrder, LittleEndian};

use crate::bucket::djb2;
use crate::error::{ProtocolError, Result};
use crate::key::Key;
use crate::node::NodeId;
use crate::object_info::ObjectInfo;

/// Fixed message header, identical for every envelope shape (spec §6).
pub const FIXED_HEADER_SIZE: usize = 44;

/// `IS_COMMAND` occupies bit 7; the command selector occupies the
/// whole top nibble `[7:4]` (values `0x8`..`0xF`), so `IS_COMMAND` is
/// implied by any recognized command code (spec §4.2).
pub const IS_COMMAND: u16 = 0x80;

/// Reply-side bits, valid when `IS_COMMAND` is clear.
pub const STATUS_ACK: u16 = 0x01;
pub const STATUS_NACK: u16 = 0x02;
/// Valid on either a command or a reply.
pub const CAN_STALL: u16 = 0x04;
pub const IS_SUCCESS: u16 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Compute = 0x8,
    Publish = 0x9,
    GetBounded = 0xA,
    GetUnbounded = 0xB,
    GetColInfo = 0xC,
    GetRowInfo = 0xD,
    List = 0xE,
    Drop = 0xF,
}

impl Command {
    fn from_nibble(nibble: u16) -> Option<Command> {
        match nibble {
            0x8 => Some(Command::Compute),
            0x9 => Some(Command::Publish),
            0xA => Some(Command::GetBounded),
            0xB => Some(Command::GetUnbounded),
            0xC => Some(Command::GetColInfo),
            0xD => Some(Command::GetRowInfo),
            0xE => Some(Command::List),
            0xF => Some(Command::Drop),
            _ => None,
        }
    }

    /// A stable hash of the op class name, used as the wire `op_id`
    /// (spec §6: "op_id (stable hash of the op class name)").
    pub fn op_id(self) -> u32 {
        djb2(self.class_name())
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Command::Compute => "Compute",
            Command::Publish => "Publish",
            Command::GetBounded => "GetBounded",
            Command::GetUnbounded => "GetUnbounded",
            Command::GetColInfo => "GetColInfo",
            Command::GetRowInfo => "GetRowInfo",
            Command::List => "List",
            Command::Drop => "Drop",
        }
    }
}

/// The `user_flags` header field: command selector plus status/ack
/// bits, packed into the low byte of a 16-bit field (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserFlags(pub u16);

impl UserFlags {
    pub fn for_command(cmd: Command) -> Self {
        UserFlags((cmd as u16) << 4)
    }

    pub fn status(ack: bool, can_stall: bool, is_success: bool) -> Self {
        let mut bits = if ack { STATUS_ACK } else { STATUS_NACK };
        if can_stall {
            bits |= CAN_STALL;
        }
        if is_success {
            bits |= IS_SUCCESS;
        }
        UserFlags(bits)
    }

    pub fn is_command(&self) -> bool {
        self.0 & IS_COMMAND != 0
    }

    pub fn command(&self) -> Option<Command> {
        if !self.is_command() {
            return None;
        }
        Command::from_nibble((self.0 >> 4) & 0xF)
    }

    pub fn is_ack(&self) -> bool {
        !self.is_command() && self.0 & STATUS_ACK != 0
    }

    pub fn is_nack(&self) -> bool {
        !self.is_command() && self.0 & STATUS_NACK != 0
    }

    pub fn can_stall(&self) -> bool {
        self.0 & CAN_STALL != 0
    }

    pub fn is_success(&self) -> bool {
        self.0 & IS_SUCCESS != 0
    }

    pub fn with_can_stall(mut self, v: bool) -> Self {
        if v {
            self.0 |= CAN_STALL;
        } else {
            self.0 &= !CAN_STALL;
        }
        self
    }
}

/// Fixed message header shared by every envelope (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: NodeId,
    pub dst: NodeId,
    pub src_mailbox: u64,
    /// `0` means "new target-side op".
    pub dst_mailbox: u64,
    pub op_id: u32,
    pub user_flags: UserFlags,
    pub body_len: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; FIXED_HEADER_SIZE] {
        let mut buf = [0u8; FIXED_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.src.id());
        LittleEndian::write_u64(&mut buf[8..16], self.dst.id());
        LittleEndian::write_u64(&mut buf[16..24], self.src_mailbox);
        LittleEndian::write_u64(&mut buf[24..32], self.dst_mailbox);
        LittleEndian::write_u32(&mut buf[32..36], self.op_id);
        LittleEndian::write_u16(&mut buf[36..38], self.user_flags.0);
        // bytes[38..40] reserved, left zeroed
        LittleEndian::write_u32(&mut buf[40..44], self.body_len);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::BadRpc("message shorter than the fixed header").into());
        }
        let header = MessageHeader {
            src: NodeId::from_raw(LittleEndian::read_u64(&buf[0..8])),
            dst: NodeId::from_raw(LittleEndian::read_u64(&buf[8..16])),
            src_mailbox: LittleEndian::read_u64(&buf[16..24]),
            dst_mailbox: LittleEndian::read_u64(&buf[24..32]),
            op_id: LittleEndian::read_u32(&buf[32..36]),
            user_flags: UserFlags(LittleEndian::read_u16(&buf[36..38])),
            body_len: LittleEndian::read_u32(&buf[40..44]),
        };
        if buf.len() < FIXED_HEADER_SIZE + header.body_len as usize {
            return Err(ProtocolError::BadRpc("declared body_len overruns the received buffer").into());
        }
        Ok(header)
    }
}

/// `{NetBufferRemote (opaque, ≤56B)}` — an RDMA-registered remote
/// range descriptor, opaque to everything above the transport. We
/// store it as a fixed 56-byte blob; the loopback transport (and any
/// real one) fills it however it likes.
pub const NBR_SIZE: usize = 56;

#[derive(Clone, Copy)]
pub struct NetBufferRemote(pub [u8; NBR_SIZE]);

impl NetBufferRemote {
    pub fn zeroed() -> Self {
        NetBufferRemote([0u8; NBR_SIZE])
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < NBR_SIZE {
            return Err(ProtocolError::BadRpc("NetBufferRemote shorter than 56 bytes").into());
        }
        let mut out = [0u8; NBR_SIZE];
        out.copy_from_slice(&buf[..NBR_SIZE]);
        Ok(NetBufferRemote(out))
    }
}

impl std::fmt::Debug for NetBufferRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetBufferRemote({} bytes)", NBR_SIZE)
    }
}

impl PartialEq for NetBufferRemote {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

fn validate_key_component_len(len: usize) -> Result<()> {
    if len > crate::key::MAX_KEY_BYTES {
        return Err(ProtocolError::KeyTooLong.into());
    }
    Ok(())
}

/// `NetBufferRemote`-less command body: Publish/Get/Info/List/Drop/
/// Compute all flow through this shape when no RDMA buffer needs to
/// travel with the request (spec §4.2: "simple").
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleBody {
    pub meta_plus_data_size: u64,
    pub bucket: u32,
    pub iom_hash: u32,
    pub behavior: u8,
    pub key: Key,
    pub fn_name: Vec<u8>,
    pub fn_args: Vec<u8>,
}

const SIMPLE_FIXED_SIZE: usize = 8 + 2 + 2 + 4 + 4 + 1 + 1 + 2;

impl SimpleBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        validate_key_component_len(self.key.k1_size())?;
        validate_key_component_len(self.key.k2_size())?;
        if self.fn_name.len() > u8::MAX as usize {
            return Err(ProtocolError::BadRpc("function name longer than 255 bytes").into());
        }
        if self.fn_args.len() > u16::MAX as usize {
            return Err(ProtocolError::BadRpc("function args longer than 65535 bytes").into());
        }

        let mut buf = vec![0u8; SIMPLE_FIXED_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.meta_plus_data_size);
        LittleEndian::write_u16(&mut buf[8..10], self.key.k1_size() as u16);
        LittleEndian::write_u16(&mut buf[10..12], self.key.k2_size() as u16);
        LittleEndian::write_u32(&mut buf[12..16], self.bucket);
        LittleEndian::write_u32(&mut buf[16..20], self.iom_hash);
        buf[20] = self.behavior;
        buf[21] = self.fn_name.len() as u8;
        LittleEndian::write_u16(&mut buf[22..24], self.fn_args.len() as u16);

        buf.extend_from_slice(self.key.k1());
        buf.extend_from_slice(self.key.k2());
        buf.extend_from_slice(&self.fn_name);
        buf.extend_from_slice(&self.fn_args);
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIMPLE_FIXED_SIZE {
            return Err(ProtocolError::BadRpc("simple body shorter than its fixed prefix").into());
        }
        let meta_plus_data_size = LittleEndian::read_u64(&buf[0..8]);
        let k1_size = LittleEndian::read_u16(&buf[8..10]) as usize;
        let k2_size = LittleEndian::read_u16(&buf[10..12]) as usize;
        let bucket = LittleEndian::read_u32(&buf[12..16]);
        let iom_hash = LittleEndian::read_u32(&buf[16..20]);
        let behavior = buf[20];
        let fn_name_size = buf[21] as usize;
        let fn_args_size = LittleEndian::read_u16(&buf[22..24]) as usize;

        validate_key_component_len(k1_size)?;
        validate_key_component_len(k2_size)?;

        let tail = &buf[SIMPLE_FIXED_SIZE..];
        let needed = k1_size + k2_size + fn_name_size + fn_args_size;
        if tail.len() < needed {
            return Err(ProtocolError::BadRpc("declared key/function sizes overrun the body").into());
        }

        let mut off = 0;
        let k1 = tail[off..off + k1_size].to_vec();
        off += k1_size;
        let k2 = tail[off..off + k2_size].to_vec();
        off += k2_size;
        let fn_name = tail[off..off + fn_name_size].to_vec();
        off += fn_name_size;
        let fn_args = tail[off..off + fn_args_size].to_vec();

        Ok(SimpleBody {
            meta_plus_data_size,
            bucket,
            iom_hash,
            behavior,
            key: Key::with_column(k1, k2),
            fn_name,
            fn_args,
        })
    }
}

/// Command body carrying a registered remote buffer descriptor
/// alongside the key (spec §4.2: "buffer").
#[derive(Debug, Clone, PartialEq)]
pub struct BufferBody {
    pub nbr: NetBufferRemote,
    pub meta_plus_data_size: u64,
    pub bucket: u32,
    pub iom_hash: u32,
    pub behavior: u8,
    pub key: Key,
}

const BUFFER_FIXED_SIZE: usize = NBR_SIZE + 8 + 2 + 2 + 4 + 4 + 1;

impl BufferBody {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        validate_key_component_len(self.key.k1_size())?;
        validate_key_component_len(self.key.k2_size())?;

        let mut buf = vec![0u8; BUFFER_FIXED_SIZE];
        buf[0..NBR_SIZE].copy_from_slice(&self.nbr.0);
        let mut off = NBR_SIZE;
        LittleEndian::write_u64(&mut buf[off..off + 8], self.meta_plus_data_size);
        off += 8;
        LittleEndian::write_u16(&mut buf[off..off + 2], self.key.k1_size() as u16);
        off += 2;
        LittleEndian::write_u16(&mut buf[off..off + 2], self.key.k2_size() as u16);
        off += 2;
        LittleEndian::write_u32(&mut buf[off..off + 4], self.bucket);
        off += 4;
        LittleEndian::write_u32(&mut buf[off..off + 4], self.iom_hash);
        off += 4;
        buf[off] = self.behavior;

        buf.extend_from_slice(self.key.k1());
        buf.extend_from_slice(self.key.k2());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < BUFFER_FIXED_SIZE {
            return Err(ProtocolError::BadRpc("buffer body shorter than its fixed prefix").into());
        }
        let nbr = NetBufferRemote::from_bytes(&buf[0..NBR_SIZE])?;
        let mut off = NBR_SIZE;
        let meta_plus_data_size = LittleEndian::read_u64(&buf[off..off + 8]);
        off += 8;
        let k1_size = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
        off += 2;
        let k2_size = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
        off += 2;
        let bucket = LittleEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let iom_hash = LittleEndian::read_u32(&buf[off..off + 4]);
        off += 4;
        let behavior = buf[off];

        validate_key_component_len(k1_size)?;
        validate_key_component_len(k2_size)?;

        let tail = &buf[BUFFER_FIXED_SIZE..];
        if tail.len() < k1_size + k2_size {
            return Err(ProtocolError::BadRpc("declared key sizes overrun the body").into());
        }
        let k1 = tail[..k1_size].to_vec();
        let k2 = tail[k1_size..k1_size + k2_size].to_vec();

        Ok(BufferBody {
            nbr,
            meta_plus_data_size,
            bucket,
            iom_hash,
            behavior,
            key: Key::with_column(k1, k2),
        })
    }
}

/// Reply body: `{success flag, remote_rc, object_info}` (spec §4.2,
/// §6). The success flag rides in the header's `IS_SUCCESS` bit, so
/// the body itself is just the rc and the info report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBody {
    pub remote_rc: i32,
    pub object_info: ObjectInfo,
}

const STATUS_BODY_SIZE: usize = 4 + ObjectInfo::WIRE_SIZE;

impl StatusBody {
    pub fn to_bytes(&self) -> [u8; STATUS_BODY_SIZE] {
        let mut buf = [0u8; STATUS_BODY_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.remote_rc);
        buf[4..4 + ObjectInfo::WIRE_SIZE].copy_from_slice(&self.object_info.to_wire());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_BODY_SIZE {
            return Err(ProtocolError::BadRpc("status body shorter than 28 bytes").into());
        }
        Ok(StatusBody {
            remote_rc: LittleEndian::read_i32(&buf[0..4]),
            object_info: ObjectInfo::from_wire(&buf[4..4 + ObjectInfo::WIRE_SIZE])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_info::Availability;

    #[test]
    fn header_roundtrips() {
        let header = MessageHeader {
            src: NodeId::from_raw(10),
            dst: NodeId::from_raw(20),
            src_mailbox: 111,
            dst_mailbox: 0,
            op_id: Command::Publish.op_id(),
            user_flags: UserFlags::for_command(Command::Publish).with_can_stall(true),
            body_len: 17,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend(std::iter::repeat(0u8).take(17));
        let back = MessageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.user_flags.command(), Some(Command::Publish));
        assert!(back.user_flags.can_stall());
    }

    #[test]
    fn header_rejects_truncated_body() {
        let header = MessageHeader {
            src: NodeId::UNSPECIFIED,
            dst: NodeId::UNSPECIFIED,
            src_mailbox: 0,
            dst_mailbox: 0,
            op_id: 0,
            user_flags: UserFlags::default(),
            body_len: 100,
        };
        let bytes = header.to_bytes();
        assert!(MessageHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn command_selector_nibble_implies_is_command() {
        let flags = UserFlags::for_command(Command::Drop);
        assert!(flags.is_command());
        assert_eq!(flags.command(), Some(Command::Drop));
    }

    #[test]
    fn status_flags_carry_ack_and_success() {
        let flags = UserFlags::status(true, false, true);
        assert!(!flags.is_command());
        assert!(flags.is_ack());
        assert!(flags.is_success());
    }

    #[test]
    fn simple_body_roundtrips_with_function_call() {
        let body = SimpleBody {
            meta_plus_data_size: 4096,
            bucket: 0xabcd,
            iom_hash: 0,
            behavior: 0b0000_0011,
            key: Key::with_column("row1", "col1"),
            fn_name: b"reduce_sum".to_vec(),
            fn_args: b"axis=0".to_vec(),
        };
        let bytes = body.to_bytes().unwrap();
        let back = SimpleBody::from_bytes(&bytes).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn simple_body_rejects_oversized_declared_key() {
        let mut bytes = vec![0u8; SIMPLE_FIXED_SIZE];
        LittleEndian::write_u16(&mut bytes[8..10], 300);
        assert!(SimpleBody::from_bytes(&bytes).is_err());
    }

    #[test]
    fn buffer_body_roundtrips() {
        let body = BufferBody {
            nbr: NetBufferRemote::zeroed(),
            meta_plus_data_size: 2048,
            bucket: 7,
            iom_hash: 0,
            behavior: 0,
            key: Key::new("row_only"),
        };
        let bytes = body.to_bytes().unwrap();
        let back = BufferBody::from_bytes(&bytes).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn status_body_roundtrips() {
        let body = StatusBody {
            remote_rc: -2,
            object_info: ObjectInfo {
                row_user_bytes: 10,
                col_user_bytes: 20,
                row_num_columns: 1,
                col_dependencies: 0,
                col_availability: Availability::Unavailable,
            },
        };
        let bytes = body.to_bytes();
        let back = StatusBody::from_bytes(&bytes).unwrap();
        assert_eq!(back, body);
    }
}
