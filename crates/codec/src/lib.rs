//! ## RMA wire protocol
//!
//! Every remote memory operation travels as one fixed-size message, an
//! optional payload, and (for the request/response pairs) one message back
//! on the same socket:
//!
//! ```text
//! 0        4        8     10    12            20              36       44       52
//! +--------+--------+-----+-----+-------------+---------------+--------+--------+
//! | opcode | len    | src | dst | request_id  | ptr (128 bit) | size   | value  |
//! +--------+--------+-----+-----+-------------+---------------+--------+--------+
//! |                      trailing payload of `len` bytes                        |
//! +-----------------------------------------------------------------------------+
//! ```
//!
//! Only PUT requests and GET responses carry a payload, and for those
//! `len == size`. All integers are host byte order: the deployment model is
//! a homogeneous little-endian cluster, and both ends must agree.
//!
//! Responses are matched to requests purely by socket discipline (one
//! in-flight exchange per peer socket), so `request_id` exists for log
//! correlation only.

use bytes::{Buf, BufMut, BytesMut};
use memory::GlobalPtr;

/// Bytes in the fixed part of every message.
pub const MESSAGE_SIZE: usize = 52;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ShortMessage,
    UnknownOpcode(u32),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operation selector for one wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    Put,
    GetResp,
    PutResp,
    AtomicFaa,
    AtomicCas,
    AtomicResp,
    Barrier,
    BarrierResp,
    Alloc,
    AllocResp,
    Free,
}

impl TryFrom<u32> for Opcode {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use pgas_runtime_codec::Opcode;
    ///
    /// assert_eq!(Opcode::try_from(0x01).unwrap(), Opcode::Get);
    /// assert_eq!(Opcode::try_from(0x0c).unwrap(), Opcode::Free);
    /// assert!(Opcode::try_from(0x0d).is_err());
    /// ```
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Get,
            0x02 => Self::Put,
            0x03 => Self::GetResp,
            0x04 => Self::PutResp,
            0x05 => Self::AtomicFaa,
            0x06 => Self::AtomicCas,
            0x07 => Self::AtomicResp,
            0x08 => Self::Barrier,
            0x09 => Self::BarrierResp,
            0x0a => Self::Alloc,
            0x0b => Self::AllocResp,
            0x0c => Self::Free,
            _ => return Err(Error::UnknownOpcode(value)),
        })
    }
}

impl From<Opcode> for u32 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Get => 0x01,
            Opcode::Put => 0x02,
            Opcode::GetResp => 0x03,
            Opcode::PutResp => 0x04,
            Opcode::AtomicFaa => 0x05,
            Opcode::AtomicCas => 0x06,
            Opcode::AtomicResp => 0x07,
            Opcode::Barrier => 0x08,
            Opcode::BarrierResp => 0x09,
            Opcode::Alloc => 0x0a,
            Opcode::AllocResp => 0x0b,
            Opcode::Free => 0x0c,
        }
    }
}

/// Routing header of a wire message.
///
/// `len` is the number of payload bytes that follow the fixed part and is
/// authoritative for framing; `src`/`dst` are node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub len: u32,
    pub src: u16,
    pub dst: u16,
    pub request_id: u64,
}

/// One wire message, fixed part only.
///
/// The operand slots are shared across operations: GET/PUT use `ptr` and
/// `size`; FAA carries its addend in `value`; CAS carries `expected` in
/// `value` and reuses the `size` slot for `desired`; ALLOC carries the
/// requested size in `size` and answers with the pointer in `ptr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Message {
    pub header: Header,
    pub ptr: GlobalPtr,
    pub size: u64,
    pub value: u64,
}

impl Message {
    /// Serialize the fixed part into `buf`, replacing its contents. Any
    /// payload is appended by the transport after this.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use memory::GlobalPtr;
    /// use pgas_runtime_codec::{Header, Message, Opcode, MESSAGE_SIZE};
    ///
    /// let message = Message {
    ///     header: Header {
    ///         opcode: Opcode::Get,
    ///         len: 0,
    ///         src: 0,
    ///         dst: 1,
    ///         request_id: 7,
    ///     },
    ///     ptr: GlobalPtr::new(1, 4096),
    ///     size: 64,
    ///     value: 0,
    /// };
    ///
    /// let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
    /// message.encode(&mut buf);
    ///
    /// assert_eq!(buf.len(), MESSAGE_SIZE);
    /// assert_eq!(Message::decode(&buf).unwrap(), message);
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.put_u32_ne(self.header.opcode.into());
        buf.put_u32_ne(self.header.len);
        buf.put_u16_ne(self.header.src);
        buf.put_u16_ne(self.header.dst);
        buf.put_u64_ne(self.header.request_id);
        buf.put_u16_ne(self.ptr.node);
        buf.put_u16_ne(self.ptr.segment);
        buf.put_u32_ne(self.ptr.flags);
        buf.put_u64_ne(self.ptr.offset);
        buf.put_u64_ne(self.size);
        buf.put_u64_ne(self.value);
    }

    /// Deserialize the fixed part from the front of `bytes`.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < MESSAGE_SIZE {
            return Err(Error::ShortMessage);
        }

        let opcode = Opcode::try_from(bytes.get_u32_ne())?;
        Ok(Self {
            header: Header {
                opcode,
                len: bytes.get_u32_ne(),
                src: bytes.get_u16_ne(),
                dst: bytes.get_u16_ne(),
                request_id: bytes.get_u64_ne(),
            },
            ptr: GlobalPtr {
                node: bytes.get_u16_ne(),
                segment: bytes.get_u16_ne(),
                flags: bytes.get_u32_ne(),
                offset: bytes.get_u64_ne(),
            },
            size: bytes.get_u64_ne(),
            value: bytes.get_u64_ne(),
        })
    }
}
