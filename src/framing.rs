//! # Framing Codecs
//!
//! Codecs translate between [`Unit`] values and the byte stream a transport
//! carries. The responsibility is split in two:
//!
//! - [`Framer`]: the immutable half shared through configuration. It builds
//!   wire-ready units (`create`) and mints fresh parsers (`new_parser`), one
//!   per connection. Holding the framer behind an `Arc` replaces the older
//!   prototype-clone arrangement where cloning a half-fed parser was
//!   silently forbidden.
//! - [`UnitParser`]: the stateful half owned by a single connection. Bytes
//!   are pushed in with `feed`, which consumes a prefix of the buffer in
//!   place and leaves the unconsumed suffix for the next round.
//!
//! Three codecs are provided:
//!
//! | Codec | Wire form |
//! |-------|-----------|
//! | [`RawFramer`] | no framing; each non-empty feed yields one unit |
//! | [`MsgFramer`] | varint byte length followed by exactly that many bytes |
//! | [`DstreamFramer`] | payload terminated by a configurable delimiter |
//!
//! A [`FrameError`] returned from `feed` is a stream error: once a frame
//! boundary is lost there is no recovery point, and the owning connection
//! tears itself down.

use std::fmt;

use thiserror::Error;

use crate::defaults;
use crate::unit::Unit;

/// Stream-level framing failure. Fatal for the connection that hit it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A deframed length exceeded the codec's configured bound.
    #[error("frame length {len} exceeds configured maximum {max}")]
    OversizedFrame { len: u64, max: usize },

    /// A varint did not fit a 32-bit accumulator.
    #[error("varint overflows 32 bits")]
    VarintOverflow,
}

/// Encodes `value` as a base-128 little-endian varint (1 to 5 bytes).
///
/// Seven payload bits per byte, high bit set on every byte except the last.
pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    let mut v = u64::from(value);
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
    out
}

/// Decodes a varint from the front of `data`.
///
/// Returns `Ok(None)` when the buffer ends mid-number (need more bytes),
/// `Ok(Some((value, consumed)))` on success, and [`FrameError::VarintOverflow`]
/// when the accumulated value does not fit 32 bits.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u32, usize)>, FrameError> {
    let mut acc: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        acc |= u64::from(byte & 0x7f) << shift;
        if acc > u64::from(u32::MAX) {
            return Err(FrameError::VarintOverflow);
        }
        if byte & 0x80 == 0 {
            return Ok(Some((acc as u32, i + 1)));
        }
        shift += 7;
        if shift > 31 {
            // A continuation bit on the fifth byte cannot be satisfied.
            return Err(FrameError::VarintOverflow);
        }
    }
    Ok(None)
}

/// The immutable, shareable half of a codec: serialisation and parser
/// construction. Configurations hold `Arc<dyn Framer>`.
pub trait Framer: Send + Sync + fmt::Debug {
    /// Builds a wire-ready unit for `payload`, including any framing header.
    fn create(&self, payload: &[u8]) -> Unit;

    /// Mints a fresh parser with clean state for one connection.
    fn new_parser(&self) -> Box<dyn UnitParser>;
}

/// The stateful, per-connection half of a codec.
///
/// A parser is *ready* exactly when one complete unit has been assembled.
pub trait UnitParser: Send {
    /// Consumes the longest usable prefix of `buf` into parser state,
    /// leaving the remainder in place.
    fn feed(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError>;

    /// Whether one complete unit has been assembled.
    fn ready(&self) -> bool;

    /// Takes the assembled unit.
    ///
    /// # Panics
    ///
    /// Panics if the parser is not ready.
    fn take(&mut self) -> Unit;

    /// Clears all parser state.
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// raw
// ---------------------------------------------------------------------------

/// No framing: every read-completion batch becomes one unit.
///
/// Used when message boundaries are controlled by external code.
#[derive(Debug, Default, Clone)]
pub struct RawFramer;

impl RawFramer {
    pub fn new() -> Self {
        RawFramer
    }
}

impl Framer for RawFramer {
    fn create(&self, payload: &[u8]) -> Unit {
        Unit::bytes(payload)
    }

    fn new_parser(&self) -> Box<dyn UnitParser> {
        Box::new(RawParser { buffer: Vec::new() })
    }
}

#[derive(Debug, Default)]
struct RawParser {
    buffer: Vec<u8>,
}

impl UnitParser for RawParser {
    fn feed(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.ready() || buf.is_empty() {
            return Ok(());
        }
        self.buffer = std::mem::take(buf);
        Ok(())
    }

    fn ready(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn take(&mut self) -> Unit {
        assert!(self.ready(), "raw parser has no assembled unit");
        Unit::bytes(std::mem::take(&mut self.buffer))
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// varint / fixed-count primitives
// ---------------------------------------------------------------------------

/// Accumulates one varint. Internal building block for [`MsgParser`].
#[derive(Debug, Default)]
struct VarintParser {
    value: Option<u32>,
}

impl VarintParser {
    fn feed(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.value.is_some() {
            return Ok(());
        }
        if let Some((value, consumed)) = decode_varint(buf)? {
            buf.drain(..consumed);
            self.value = Some(value);
        }
        Ok(())
    }

    fn value(&self) -> Option<u32> {
        self.value
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

/// Accumulates exactly `size` bytes. Ready immediately for `size == 0`.
#[derive(Debug, Default)]
struct FixedParser {
    size: usize,
    buffer: Vec<u8>,
    ready: bool,
}

impl FixedParser {
    fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    fn feed(&mut self, buf: &mut Vec<u8>) {
        if self.ready {
            return;
        }
        let need = self.size - self.buffer.len();
        let take = need.min(buf.len());
        self.buffer.extend(buf.drain(..take));
        if self.buffer.len() == self.size {
            self.ready = true;
        }
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn take(&mut self) -> Vec<u8> {
        assert!(self.ready, "fixed-count parser is not filled");
        self.ready = false;
        std::mem::take(&mut self.buffer)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.ready = false;
    }
}

// ---------------------------------------------------------------------------
// msg
// ---------------------------------------------------------------------------

/// Length-prefixed messages: a varint byte count followed by the payload.
///
/// `max_size` bounds the payload; a deframed length above it is a fatal
/// stream error, raised before any payload buffer is allocated.
#[derive(Debug, Clone)]
pub struct MsgFramer {
    max_size: usize,
}

impl MsgFramer {
    /// A msg codec with the default payload bound.
    pub fn new() -> Self {
        Self::with_max_size(defaults::MSG_MAX_SIZE)
    }

    /// A msg codec bounding payloads at `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        MsgFramer { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for MsgFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for MsgFramer {
    /// Builds a composite of {length header, payload} so the serializer can
    /// flatten it deterministically into the wire form.
    ///
    /// # Panics
    ///
    /// Panics if `payload` exceeds the configured bound; framing an
    /// oversized message is a programming error on the sending side.
    fn create(&self, payload: &[u8]) -> Unit {
        assert!(
            payload.len() <= self.max_size,
            "message of {} bytes exceeds codec maximum {}",
            payload.len(),
            self.max_size
        );
        let len = u32::try_from(payload.len()).expect("payload length fits 32 bits");
        Unit::composite(vec![
            Unit::bytes(encode_varint(len)),
            Unit::bytes(payload),
        ])
    }

    fn new_parser(&self) -> Box<dyn UnitParser> {
        Box::new(MsgParser {
            max_size: self.max_size,
            length: VarintParser::default(),
            body: FixedParser::default(),
            done: false,
        })
    }
}

/// Composes the varint and fixed-count parsers: first the length, then
/// exactly that many payload bytes.
#[derive(Debug)]
struct MsgParser {
    max_size: usize,
    length: VarintParser,
    body: FixedParser,
    done: bool,
}

impl UnitParser for MsgParser {
    fn feed(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.done {
            return Ok(());
        }
        if self.length.value().is_none() {
            self.length.feed(buf)?;
            if let Some(len) = self.length.value() {
                if len as usize > self.max_size {
                    return Err(FrameError::OversizedFrame {
                        len: u64::from(len),
                        max: self.max_size,
                    });
                }
                self.body.set_size(len as usize);
            }
        }
        if self.length.value().is_some() {
            self.body.feed(buf);
            if self.body.ready() {
                self.done = true;
            }
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        self.done
    }

    fn take(&mut self) -> Unit {
        assert!(self.done, "msg parser has no assembled unit");
        self.done = false;
        let payload = self.body.take();
        self.length.reset();
        Unit::bytes(payload)
    }

    fn reset(&mut self) {
        self.length.reset();
        self.body.reset();
        self.body.set_size(0);
        self.done = false;
    }
}

// ---------------------------------------------------------------------------
// dstream
// ---------------------------------------------------------------------------

/// Delimiter-terminated streams.
///
/// `create` appends the delimiter; the parser scans for it and emits the
/// preceding bytes, discarding the delimiter itself. The delimiter must not
/// appear inside payloads.
#[derive(Debug, Clone)]
pub struct DstreamFramer {
    delimiter: Vec<u8>,
}

impl DstreamFramer {
    /// A dstream codec with the default `\r\n\r\n` delimiter.
    pub fn new() -> Self {
        Self::with_delimiter(defaults::DSTREAM_DELIMITER)
    }

    /// A dstream codec terminated by `delimiter`.
    ///
    /// # Panics
    ///
    /// Panics on an empty delimiter.
    pub fn with_delimiter(delimiter: impl Into<Vec<u8>>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "dstream delimiter must not be empty");
        DstreamFramer { delimiter }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }
}

impl Default for DstreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for DstreamFramer {
    fn create(&self, payload: &[u8]) -> Unit {
        let mut framed = Vec::with_capacity(payload.len() + self.delimiter.len());
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&self.delimiter);
        Unit::bytes(framed)
    }

    fn new_parser(&self) -> Box<dyn UnitParser> {
        Box::new(DstreamParser {
            delimiter: self.delimiter.clone(),
            payload: None,
        })
    }
}

#[derive(Debug)]
struct DstreamParser {
    delimiter: Vec<u8>,
    payload: Option<Vec<u8>>,
}

impl UnitParser for DstreamParser {
    fn feed(&mut self, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if self.payload.is_some() || buf.len() < self.delimiter.len() {
            return Ok(());
        }
        let hit = buf
            .windows(self.delimiter.len())
            .position(|window| window == self.delimiter.as_slice());
        if let Some(at) = hit {
            self.payload = Some(buf[..at].to_vec());
            buf.drain(..at + self.delimiter.len());
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        self.payload.is_some()
    }

    fn take(&mut self) -> Unit {
        let payload = self.payload.take().expect("dstream parser has no assembled unit");
        Unit::bytes(payload)
    }

    fn reset(&mut self) {
        self.payload = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deframes everything currently assembled from `bytes`, feeding the
    /// parser in `chunk`-sized pieces.
    fn deframe_chunked(framer: &dyn Framer, bytes: &[u8], chunk: usize) -> Vec<Unit> {
        let mut parser = framer.new_parser();
        let mut residual: Vec<u8> = Vec::new();
        let mut units = Vec::new();
        for piece in bytes.chunks(chunk) {
            residual.extend_from_slice(piece);
            loop {
                let before = residual.len();
                parser.feed(&mut residual).expect("stream error");
                if parser.ready() {
                    units.push(parser.take());
                    parser.reset();
                    continue;
                }
                if residual.len() == before || residual.is_empty() {
                    break;
                }
            }
        }
        units
    }

    #[test]
    fn varint_round_trips_across_width_boundaries() {
        let samples: [u32; 11] = [
            0,
            1,
            127,
            128,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            268_435_455,
            268_435_456,
            u32::MAX,
        ];
        for value in samples {
            let encoded = encode_varint(value);
            assert!(!encoded.is_empty() && encoded.len() <= 5);
            let (decoded, consumed) = decode_varint(&encoded).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded.len());
            // Every strict prefix asks for more bytes.
            for cut in 0..encoded.len() {
                assert_eq!(decode_varint(&encoded[..cut]).unwrap(), None);
            }
        }
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encode_varint(4), vec![0x04]);
        assert_eq!(encode_varint(200), vec![0xc8, 0x01]);
        assert_eq!(decode_varint(&[0x80, 0x01]).unwrap(), Some((128, 2)));
    }

    #[test]
    fn varint_overflow_is_a_stream_error() {
        // Six continuation bytes can never terminate inside 32 bits.
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(decode_varint(&data), Err(FrameError::VarintOverflow));
    }

    #[test]
    fn msg_round_trip_whole_and_piecewise() {
        let framer = MsgFramer::new();
        let wire = framer.create(b"PING").to_wire_bytes();
        assert_eq!(wire, b"\x04PING");

        for chunk in [1, 2, 3, wire.len()] {
            let units = deframe_chunked(&framer, &wire, chunk);
            assert_eq!(units.len(), 1, "chunk size {chunk}");
            assert_eq!(units[0].as_bytes(), b"PING");
        }
    }

    #[test]
    fn msg_two_frames_in_one_buffer() {
        let framer = MsgFramer::new();
        let mut wire = framer.create(b"HELLO").to_wire_bytes();
        wire.extend(framer.create(b"WORLD").to_wire_bytes());
        assert_eq!(wire.len(), 12);

        let units = deframe_chunked(&framer, &wire, wire.len());
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_bytes(), b"HELLO");
        assert_eq!(units[1].as_bytes(), b"WORLD");
    }

    #[test]
    fn msg_empty_payload_is_a_valid_frame() {
        let framer = MsgFramer::new();
        let wire = framer.create(b"").to_wire_bytes();
        assert_eq!(wire, vec![0x00]);
        let units = deframe_chunked(&framer, &wire, 1);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_bytes(), b"");
    }

    #[test]
    fn msg_oversized_length_rejected_before_payload() {
        let framer = MsgFramer::with_max_size(10);
        let mut parser = framer.new_parser();
        // Varint 128 followed by bytes that must never be buffered.
        let mut buf = vec![0x80, 0x01, 0xaa, 0xbb];
        let err = parser.feed(&mut buf).unwrap_err();
        assert_eq!(err, FrameError::OversizedFrame { len: 128, max: 10 });
        assert!(!parser.ready());
    }

    #[test]
    #[should_panic(expected = "exceeds codec maximum")]
    fn msg_create_rejects_oversized_payload() {
        MsgFramer::with_max_size(4).create(b"too long");
    }

    #[test]
    fn raw_round_trip_consumes_whole_batches() {
        let framer = RawFramer::new();
        let mut parser = framer.new_parser();
        let mut buf = framer.create(b"anything goes").to_wire_bytes();
        parser.feed(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert!(parser.ready());
        assert_eq!(parser.take().as_bytes(), b"anything goes");
        assert!(!parser.ready());
    }

    #[test]
    fn dstream_round_trip_and_delimiter_discard() {
        let framer = DstreamFramer::new();
        let wire = framer.create(b"alpha").to_wire_bytes();
        assert_eq!(wire, b"alpha\r\n\r\n");

        for chunk in [1, 4, wire.len()] {
            let units = deframe_chunked(&framer, &wire, chunk);
            assert_eq!(units.len(), 1, "chunk size {chunk}");
            assert_eq!(units[0].as_bytes(), b"alpha");
        }
    }

    #[test]
    fn dstream_split_writes_produce_units_in_order() {
        let framer = DstreamFramer::new();
        let bytes = b"alpha\r\n\r\nbeta\r\n\r\n";
        let mut parser = framer.new_parser();
        let mut residual: Vec<u8> = Vec::new();
        let mut units = Vec::new();
        // The split the original stream tests used: 4 bytes, then the rest.
        for piece in [&bytes[..4], &bytes[4..]] {
            residual.extend_from_slice(piece);
            loop {
                parser.feed(&mut residual).unwrap();
                if parser.ready() {
                    units.push(parser.take());
                    parser.reset();
                } else {
                    break;
                }
            }
        }
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_bytes(), b"alpha");
        assert_eq!(units[1].as_bytes(), b"beta");
    }

    #[test]
    fn dstream_custom_delimiter() {
        let framer = DstreamFramer::with_delimiter("|");
        let mut buf = b"one|two|".to_vec();
        let mut parser = framer.new_parser();
        parser.feed(&mut buf).unwrap();
        assert_eq!(parser.take().as_bytes(), b"one");
        parser.reset();
        parser.feed(&mut buf).unwrap();
        assert_eq!(parser.take().as_bytes(), b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn parser_reset_clears_partial_state() {
        let framer = MsgFramer::new();
        let mut parser = framer.new_parser();
        let mut buf = vec![0x05, b'h', b'e'];
        parser.feed(&mut buf).unwrap();
        assert!(!parser.ready());
        parser.reset();

        // A fresh frame parses cleanly after the reset.
        let mut buf = framer.create(b"ok").to_wire_bytes();
        parser.feed(&mut buf).unwrap();
        assert!(parser.ready());
        assert_eq!(parser.take().as_bytes(), b"ok");
    }
}
