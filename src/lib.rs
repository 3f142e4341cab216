//! Reliable framed serial link for motion-capture sensor streams.
//!
//! A capture microcontroller pushes a continuous byte stream over a serial
//!  line; this crate reassembles it into discrete frames under a lightweight
//!  HDLC-style link protocol and hands validated sensor records to a sink.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *frames* (defined-length,
//!   checksummed units) over an unreliable duplex byte stream
//! * One logical worker per connection: cooperating tasks with explicit
//!   suspension points, no preemption and no true parallelism required
//! * The receiver path is non-suspending - it only mutates buffers and session
//!   state and signals dedicated tasks that own the suspending sends
//! * Loss is *detected* through sequence gaps on successfully decoded frames;
//!   whether a detected gap triggers a retransmission request is a session
//!   policy (see [`config::LinkConfig::reject_on_gap`])
//! * Flow control is peer-driven: a NotReady supervisory frame suspends all
//!   outbound traffic until a Ready follows
//! * Outbound frames leave in exactly the order they were queued
//! * Transport disconnection is fatal to the session; reconnection is the
//!   caller's policy
//!
//! ## Wire format
//!
//! Every frame is bounded by a FLAG byte (`0x7E`); byte stuffing (`0x7D`
//!  escape, XOR `0x20`) keeps the flag out of frame interiors. The stuffed
//!  region is the frame body followed by a CRC-32/ISO-HDLC checksum over the
//!  body (u32, network byte order):
//!
//! ```ascii
//! 0x7E stuffed( body ++ crc32(body) ) 0x7E
//!
//! body:
//! 0: frame kind (u8):
//!    * 0x00 Handshake
//!    * 0x01 Information
//!    * 0x02 Supervisory
//! 1: Handshake:   send sequence (u8, modulo 128)
//!    Information: send sequence (u8, modulo 128), then the payload bytes
//!    Supervisory: sub-type (u8: 0x00 Ready, 0x01 NotReady, 0x02 Reject),
//!                 then the receive sequence (u8, modulo 128)
//! ```
//!
//! Sequence numbers wrap modulo 128 everywhere outside the encoding.
//!
//! ## Control frames
//!
//! *Handshake*
//!
//! Sent on a fixed interval while connecting, carrying the prober's send
//!  sequence. The peer echoes the sequence back; the first matching echo
//!  completes the handshake and cancels the probe.
//!
//! *Supervisory Ready*
//!
//! Carries N(R): acknowledges every Information frame below N(R) and names the
//!  next expected one. Also signals that the peer is ready to receive,
//!  releasing a send-side suspension if one is in effect.
//!
//! *Supervisory NotReady*
//!
//! Suspends the sender until a Ready follows. Acknowledges like a Ready.
//!
//! *Supervisory Reject*
//!
//! Requests retransmission of every buffered frame from the carried sequence
//!  up to (excluding) the sender's current send sequence (go-back-N).
//!
//! ## Structure
//!
//! * [`ring_buffer`] - self-expanding byte ring accumulating raw transport
//!   chunks, with delimiter-bounded extraction
//! * [`frame`] - the codec: encode / validate / decode of the three frame
//!   kinds, checksum verification included
//! * [`link_session`] - the state machine (`Connecting` → `Established` →
//!   `Closed`) consuming bytes through the ring, frames through the codec,
//!   and driving the transport and the sink
//! * [`record_sink`] - where accepted Information payloads go; the bundled
//!   implementation writes CSV rows and makes them durable every 32 records
//! * [`send_pipeline`] - outbound seam over the transport's write half
//!
//! The transport itself is anything `AsyncRead + AsyncWrite` - the host opens
//!  the serial device (or socket, or in-process pipe) and hands it to
//!  [`link_session::LinkSession::start`].

pub mod config;
pub mod frame;
pub mod link_session;
pub mod record_sink;
pub mod ring_buffer;
pub mod send_pipeline;
pub mod seq;
