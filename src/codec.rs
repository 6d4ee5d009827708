// This file is part of qnet-arbiter.

//! Framed-message codec (component C3).
//!
//! Wire format: a fixed 6-byte header `{ type: u8, reserved: u8, length: u32 BE }` followed by
//! a TLV option body, in the spirit of the record framing in
//! `examples/cloudflare-cfnts/src/nts_ke/protocol.rs` (type/length header, then opaque
//! contents) but with a 32-bit body length and a full TLV option list rather than one opaque
//! blob, per this protocol's larger message types.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::convert::TryFrom;
use std::io::{self, Read, Write};

pub const HEADER_SIZE: usize = 6;
/// Size of one TLV option header (`option_type: u16`, `option_len: u16`).
const OPTION_HEADER_SIZE: usize = 4;

/// TLV option type codes used in message bodies.
pub mod options {
    pub const SUPPORTED_ALGORITHMS: u16 = 1;
    pub const ALGORITHM: u16 = 2;
    pub const CLUSTER_NAME: u16 = 3;
    pub const NODE_ID: u16 = 4;
    pub const HEARTBEAT_INTERVAL_MS: u16 = 5;
    pub const RING_ID: u16 = 6;
    pub const NODE_LIST_KIND: u16 = 7;
    pub const NODES: u16 = 8;
    pub const VOTE: u16 = 9;
    pub const REASON: u16 = 10;
    pub const COOKIE: u16 = 11;
    pub const HEURISTICS_RESULT: u16 = 12;
    pub const TLS_REQUIRED: u16 = 13;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Preinit,
    PreinitReply,
    StartTls,
    Init,
    InitReply,
    SetOption,
    SetOptionReply,
    EchoRequest,
    EchoReply,
    NodeList,
    NodeListReply,
    AskForVote,
    AskForVoteReply,
    VoteInfo,
    VoteInfoReply,
    ServerError,
    HeuristicsChange,
    HeuristicsChangeReply,
}

impl MessageType {
    fn to_wire(self) -> u8 {
        match self {
            MessageType::Preinit => 0,
            MessageType::PreinitReply => 1,
            MessageType::StartTls => 2,
            MessageType::Init => 3,
            MessageType::InitReply => 4,
            MessageType::SetOption => 5,
            MessageType::SetOptionReply => 6,
            MessageType::EchoRequest => 7,
            MessageType::EchoReply => 8,
            MessageType::NodeList => 9,
            MessageType::NodeListReply => 10,
            MessageType::AskForVote => 11,
            MessageType::AskForVoteReply => 12,
            MessageType::VoteInfo => 13,
            MessageType::VoteInfoReply => 14,
            MessageType::ServerError => 15,
            MessageType::HeuristicsChange => 16,
            MessageType::HeuristicsChangeReply => 17,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<MessageType, ()> {
        Ok(match value {
            0 => MessageType::Preinit,
            1 => MessageType::PreinitReply,
            2 => MessageType::StartTls,
            3 => MessageType::Init,
            4 => MessageType::InitReply,
            5 => MessageType::SetOption,
            6 => MessageType::SetOptionReply,
            7 => MessageType::EchoRequest,
            8 => MessageType::EchoReply,
            9 => MessageType::NodeList,
            10 => MessageType::NodeListReply,
            11 => MessageType::AskForVote,
            12 => MessageType::AskForVoteReply,
            13 => MessageType::VoteInfo,
            14 => MessageType::VoteInfoReply,
            15 => MessageType::ServerError,
            16 => MessageType::HeuristicsChange,
            17 => MessageType::HeuristicsChangeReply,
            _ => return Err(()),
        })
    }
}

/// One TLV-encoded option in a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvOption {
    pub option_type: u16,
    pub value: Vec<u8>,
}

impl TlvOption {
    pub fn new(option_type: u16, value: Vec<u8>) -> TlvOption {
        TlvOption { option_type, value }
    }

    fn encoded_len(&self) -> usize {
        OPTION_HEADER_SIZE + self.value.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.write_u16::<BigEndian>(self.option_type).unwrap();
        out.write_u16::<BigEndian>(self.value.len() as u16).unwrap();
        out.extend_from_slice(&self.value);
    }
}

/// A fully assembled protocol message.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub options: Vec<TlvOption>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option_type: u16, value: Vec<u8>) -> Message {
        self.options.push(TlvOption::new(option_type, value));
        self
    }

    pub fn option(&self, option_type: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|opt| opt.option_type == option_type)
            .map(|opt| opt.value.as_slice())
    }

    /// Serialize into a single wire-format byte buffer: header followed by each TLV option.
    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self.options.iter().map(TlvOption::encoded_len).sum();
        let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
        out.push(self.msg_type.to_wire());
        out.push(0); // reserved
        out.write_u32::<BigEndian>(body_len as u32).unwrap();
        for option in &self.options {
            option.encode(&mut out);
        }
        out
    }

    /// Parse the TLV options out of a fully-received body buffer. Malformed TLV framing
    /// (truncated option header/value) is treated the same as a protocol violation by the
    /// caller — it cannot happen for a body whose length matches the declared frame length
    /// unless the peer is misbehaving.
    fn parse_options(body: &[u8]) -> Result<Vec<TlvOption>, ()> {
        let mut options = Vec::new();
        let mut cursor = 0;
        while cursor < body.len() {
            if body.len() - cursor < OPTION_HEADER_SIZE {
                return Err(());
            }
            let option_type = BigEndian::read_u16(&body[cursor..]);
            let len = BigEndian::read_u16(&body[cursor + 2..]) as usize;
            cursor += OPTION_HEADER_SIZE;
            if body.len() - cursor < len {
                return Err(());
            }
            options.push(TlvOption::new(option_type, body[cursor..cursor + len].to_vec()));
            cursor += len;
        }
        Ok(options)
    }
}

/// Outcome of one `ReceiveAssembler::read_from` call.
pub enum ReadOutcome {
    /// More bytes are needed; call again once the socket is readable.
    Partial,
    /// The peer closed the connection.
    Eof,
    /// A full frame is available. `skipped` is set if this frame was oversize or of an
    /// unsupported type — bytes were consumed but not retained, and `message` is empty aside
    /// from `msg_type`/`skip_reason`, signalling the caller to emit a `SERVER_ERROR` reply.
    Complete { message: Message, skipped: bool },
    BufAllocFail,
    BodyAllocFail,
    UnsupportedType,
    Oversize,
    Io(io::Error),
}

/// Why a frame was skipped, surfaced to the caller so it can build the right `SERVER_ERROR`
/// reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MessageTooLong,
    UnsupportedMessage,
    DecodingError,
}

enum Phase {
    Header { filled: usize },
    Body { declared_len: u32, filled: usize },
    /// Skipping a body we are not storing; `remaining` bytes are still to be consumed.
    SkippingBody { remaining: u32, reason: SkipReason },
}

/// Per-connection incremental frame assembler. Survives across non-blocking partial reads by
/// keeping a cursor in `phase`.
pub struct ReceiveAssembler {
    max_len: usize,
    phase: Phase,
    header_buf: [u8; HEADER_SIZE],
    body_buf: Vec<u8>,
    raw_type: u8,
}

impl ReceiveAssembler {
    pub fn new(max_len: usize) -> ReceiveAssembler {
        ReceiveAssembler {
            max_len,
            phase: Phase::Header { filled: 0 },
            header_buf: [0; HEADER_SIZE],
            body_buf: Vec::new(),
            raw_type: 0,
        }
    }

    /// The configured cap a frame's declared length is checked against.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Clear all assembly state, returning to a clean header cursor. Called after a
    /// `Complete` frame (skipped or not) has been handled.
    pub fn reset(&mut self) {
        self.phase = Phase::Header { filled: 0 };
        self.body_buf.clear();
    }

    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> ReadOutcome {
        loop {
            match &mut self.phase {
                Phase::Header { filled } => {
                    match read_some(reader, &mut self.header_buf[*filled..]) {
                        Ok(0) if *filled == 0 => return ReadOutcome::Eof,
                        Ok(0) => return ReadOutcome::Partial,
                        Ok(n) => *filled += n,
                        Err(ReadErr::WouldBlock) => return ReadOutcome::Partial,
                        Err(ReadErr::Io(err)) => return ReadOutcome::Io(err),
                    }
                    if *filled < HEADER_SIZE {
                        continue;
                    }
                    self.raw_type = self.header_buf[0];
                    let declared_len = BigEndian::read_u32(&self.header_buf[2..6]);

                    if declared_len as usize > self.max_len {
                        self.phase = Phase::SkippingBody {
                            remaining: declared_len,
                            reason: SkipReason::MessageTooLong,
                        };
                        continue;
                    }
                    if MessageType::try_from(self.raw_type).is_err() {
                        self.phase = Phase::SkippingBody {
                            remaining: declared_len,
                            reason: SkipReason::UnsupportedMessage,
                        };
                        continue;
                    }
                    if self.body_buf.try_reserve(declared_len as usize).is_err() {
                        return ReadOutcome::BodyAllocFail;
                    }
                    self.body_buf.resize(declared_len as usize, 0);
                    self.phase = Phase::Body {
                        declared_len,
                        filled: 0,
                    };
                }
                Phase::Body { declared_len, filled } => {
                    if *filled < *declared_len as usize {
                        match read_some(reader, &mut self.body_buf[*filled..]) {
                            Ok(0) => return ReadOutcome::Partial,
                            Ok(n) => *filled += n,
                            Err(ReadErr::WouldBlock) => return ReadOutcome::Partial,
                            Err(ReadErr::Io(err)) => return ReadOutcome::Io(err),
                        }
                        continue;
                    }
                    let msg_type = MessageType::try_from(self.raw_type)
                        .expect("unsupported types are routed to SkippingBody before Body");
                    let options = match Message::parse_options(&self.body_buf) {
                        Ok(options) => options,
                        Err(()) => {
                            self.reset();
                            return ReadOutcome::Io(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "malformed TLV option framing",
                            ));
                        }
                    };
                    let message = Message { msg_type, options };
                    return ReadOutcome::Complete {
                        message,
                        skipped: false,
                    };
                }
                Phase::SkippingBody { remaining, reason } => {
                    let reason = *reason;
                    if *remaining > 0 {
                        let mut sink = [0u8; 4096];
                        let to_read = std::cmp::min(*remaining as usize, sink.len());
                        match read_some(reader, &mut sink[..to_read]) {
                            Ok(0) => return ReadOutcome::Partial,
                            Ok(n) => *remaining -= n as u32,
                            Err(ReadErr::WouldBlock) => return ReadOutcome::Partial,
                            Err(ReadErr::Io(err)) => return ReadOutcome::Io(err),
                        }
                        continue;
                    }
                    return match reason {
                        SkipReason::MessageTooLong => ReadOutcome::Oversize,
                        SkipReason::UnsupportedMessage => ReadOutcome::UnsupportedType,
                        SkipReason::DecodingError => ReadOutcome::BodyAllocFail,
                    };
                }
            }
        }
    }
}

enum ReadErr {
    WouldBlock,
    Io(io::Error),
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ReadErr> {
    if buf.is_empty() {
        return Ok(0);
    }
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(ReadErr::WouldBlock),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(ReadErr::Io(err)),
    }
}

/// Drain as much of `buf[*cursor..]` as possible into `writer` without blocking.
///
/// Returns `Ok(true)` once the whole buffer has been written.
pub fn write_partial<W: Write>(writer: &mut W, buf: &[u8], cursor: &mut usize) -> io::Result<bool> {
    while *cursor < buf.len() {
        match writer.write(&buf[*cursor..]) {
            Ok(0) => return Ok(false),
            Ok(n) => *cursor += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_preserves_type_and_payload() {
        let msg = Message::new(MessageType::EchoRequest).with_option(1, vec![1, 2, 3, 4]);
        let encoded = msg.encode();

        let mut assembler = ReceiveAssembler::new(4096);
        let mut cursor = Cursor::new(encoded);
        let outcome = assembler.read_from(&mut cursor);
        match outcome {
            ReadOutcome::Complete { message, skipped } => {
                assert!(!skipped);
                assert_eq!(message.msg_type.to_wire(), MessageType::EchoRequest.to_wire());
                assert_eq!(message.option(1), Some(&[1, 2, 3, 4][..]));
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn partial_reads_assemble_across_calls() {
        let msg = Message::new(MessageType::Preinit);
        let encoded = msg.encode();
        let mut assembler = ReceiveAssembler::new(4096);

        // Feed one byte at a time.
        let mut result = None;
        for i in 0..encoded.len() {
            let mut cursor = Cursor::new(vec![encoded[i]]);
            match assembler.read_from(&mut cursor) {
                ReadOutcome::Partial => {}
                ReadOutcome::Complete { message, .. } => result = Some(message),
                _ => panic!("unexpected outcome mid-assembly"),
            }
        }
        let message = result.expect("should complete after final byte");
        assert_eq!(message.msg_type.to_wire(), MessageType::Preinit.to_wire());
    }

    #[test]
    fn oversize_frame_is_skipped_and_buffer_resets_clean() {
        let mut assembler = ReceiveAssembler::new(8);
        let msg = Message::new(MessageType::NodeList).with_option(1, vec![0; 64]);
        let encoded = msg.encode();
        let mut cursor = Cursor::new(encoded);
        let outcome = assembler.read_from(&mut cursor);
        assert!(matches!(outcome, ReadOutcome::Oversize));
        assembler.reset();

        // Property 6: next frame assembles cleanly from a fresh cursor.
        let next = Message::new(MessageType::EchoRequest).encode();
        let mut cursor2 = Cursor::new(next);
        let outcome2 = assembler.read_from(&mut cursor2);
        assert!(matches!(outcome2, ReadOutcome::Complete { skipped: false, .. }));
    }

    #[test]
    fn unknown_type_is_skipped() {
        let mut assembler = ReceiveAssembler::new(4096);
        let mut bytes = vec![255u8, 0];
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut cursor = Cursor::new(bytes);
        let outcome = assembler.read_from(&mut cursor);
        assert!(matches!(outcome, ReadOutcome::UnsupportedType));
    }
}
