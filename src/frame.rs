use bytes::{BufMut, BytesMut};
use crc::Crc;

use crate::seq::SeqNum;

/// Frame boundary marker. Every encoded frame starts and ends with this byte,
///  and byte stuffing guarantees it never occurs in between.
pub const FLAG: u8 = 0x7e;

const ESCAPE: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;

const KIND_HANDSHAKE: u8 = 0x00;
const KIND_INFORMATION: u8 = 0x01;
const KIND_SUPERVISORY: u8 = 0x02;

const CHECKSUM_LEN: usize = size_of::<u32>();

/// Reasons a delimited byte span fails to decode into a frame. Decoding is the
///  only validation gate: a span that produces any of these is dropped whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("nothing but delimiter bytes in the span")]
    Empty,

    #[error("escape byte at the end of the frame with nothing to escape")]
    DanglingEscape,

    #[error("frame body too short ({0} bytes)")]
    Truncated(usize),

    #[error("checksum mismatch (transmitted {transmitted:08x}, computed {computed:08x})")]
    ChecksumMismatch { transmitted: u32, computed: u32 },

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("unknown supervisory sub-type {0:#04x}")]
    UnknownSupervisoryKind(u8),

    #[error("{0} unexpected trailing bytes after the frame fields")]
    TrailingBytes(usize),
}

/// Flow-control meaning of a Supervisory frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryKind {
    /// peer is ready to receive; acknowledges everything below the carried sequence
    Ready,
    /// peer asks the sender to pause until a Ready follows
    NotReady,
    /// peer requests retransmission from the carried sequence onwards
    Reject,
}

impl SupervisoryKind {
    fn to_wire(self) -> u8 {
        match self {
            SupervisoryKind::Ready => 0x00,
            SupervisoryKind::NotReady => 0x01,
            SupervisoryKind::Reject => 0x02,
        }
    }

    fn from_wire(raw: u8) -> Result<SupervisoryKind, FrameError> {
        match raw {
            0x00 => Ok(SupervisoryKind::Ready),
            0x01 => Ok(SupervisoryKind::NotReady),
            0x02 => Ok(SupervisoryKind::Reject),
            other => Err(FrameError::UnknownSupervisoryKind(other)),
        }
    }
}

/// One delimited, checksummed unit of the link protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// link establishment / keepalive probe carrying the prober's send sequence,
    ///  echoed verbatim by the peer
    Handshake { seq: SeqNum },
    /// application data under the originator's send sequence
    Information { seq: SeqNum, payload: Vec<u8> },
    /// flow control and loss recovery, carrying the originator's receive sequence
    Supervisory { kind: SupervisoryKind, seq: SeqNum },
}

impl Frame {
    /// Produce the delimiter-bounded wire representation:
    ///  `FLAG stuffed(body ++ crc32(body)) FLAG`, crc transmitted big-endian.
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.body_len());
        match self {
            Frame::Handshake { seq } => {
                body.put_u8(KIND_HANDSHAKE);
                body.put_u8(seq.to_raw());
            }
            Frame::Information { seq, payload } => {
                body.put_u8(KIND_INFORMATION);
                body.put_u8(seq.to_raw());
                body.put_slice(payload);
            }
            Frame::Supervisory { kind, seq } => {
                body.put_u8(KIND_SUPERVISORY);
                body.put_u8(kind.to_wire());
                body.put_u8(seq.to_raw());
            }
        }
        let checksum = body_checksum(&body);

        let mut buf = BytesMut::with_capacity(2 * (body.len() + CHECKSUM_LEN) + 2);
        buf.put_u8(FLAG);
        for &byte in body.iter().chain(checksum.to_be_bytes().iter()) {
            if byte == FLAG || byte == ESCAPE {
                buf.put_u8(ESCAPE);
                buf.put_u8(byte ^ ESCAPE_XOR);
            } else {
                buf.put_u8(byte);
            }
        }
        buf.put_u8(FLAG);
        buf
    }

    /// Decode a delimiter-bounded span as produced by the receive ring's
    ///  delimiter scan (bounding FLAG bytes included). Fails if the checksum
    ///  does not verify or the byte layout matches no known frame kind.
    pub fn decode(span: &[u8]) -> Result<Frame, FrameError> {
        let first = span.iter().position(|&b| b != FLAG).ok_or(FrameError::Empty)?;
        let last = span.iter().rposition(|&b| b != FLAG).expect("a non-FLAG byte exists");
        let stuffed = &span[first..=last];

        let mut body = Vec::with_capacity(stuffed.len());
        let mut bytes = stuffed.iter();
        while let Some(&byte) = bytes.next() {
            if byte == ESCAPE {
                let &escaped = bytes.next().ok_or(FrameError::DanglingEscape)?;
                body.push(escaped ^ ESCAPE_XOR);
            } else {
                body.push(byte);
            }
        }

        if body.len() < CHECKSUM_LEN + 2 {
            return Err(FrameError::Truncated(body.len()));
        }
        let (body, trailer) = body.split_at(body.len() - CHECKSUM_LEN);
        let transmitted = u32::from_be_bytes(trailer.try_into().expect("trailer is 4 bytes"));
        let computed = body_checksum(body);
        if transmitted != computed {
            return Err(FrameError::ChecksumMismatch { transmitted, computed });
        }

        match body[0] {
            KIND_HANDSHAKE => {
                if body.len() > 2 {
                    return Err(FrameError::TrailingBytes(body.len() - 2));
                }
                Ok(Frame::Handshake { seq: SeqNum::from_raw(body[1]) })
            }
            KIND_INFORMATION => Ok(Frame::Information {
                seq: SeqNum::from_raw(body[1]),
                payload: body[2..].to_vec(),
            }),
            KIND_SUPERVISORY => {
                if body.len() < 3 {
                    return Err(FrameError::Truncated(body.len() + CHECKSUM_LEN));
                }
                if body.len() > 3 {
                    return Err(FrameError::TrailingBytes(body.len() - 3));
                }
                Ok(Frame::Supervisory {
                    kind: SupervisoryKind::from_wire(body[1])?,
                    seq: SeqNum::from_raw(body[2]),
                })
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Handshake { .. } => 2,
            Frame::Information { payload, .. } => 2 + payload.len(),
            Frame::Supervisory { .. } => 3,
        }
    }
}

fn body_checksum(body: &[u8]) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = hasher.digest();
    digest.update(body);
    digest.finalize()
}
