use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Prefix byte for commands sent to the meter.
pub const COMMAND_PREFIX: u8 = 0x80;
/// Every frame coming back from the meter opens with this marker byte.
pub const START_MARKER: u8 = 0x40;

const TERMINATOR: u8 = 0x0d;
const ESCAPE: u8 = 0x1b;

/// Byte values that never appear literally inside a frame body. On the wire
/// each is replaced by `0x1B` followed by the byte's bitwise complement.
const ESCAPED_BYTES: [u8; 5] = [0x06, 0x0d, 0x1b, 0x40, 0x80];

/// Kamstrup uses the "true" CCITT CRC-16: polynomial 0x1021, initial register
/// 0x0000, MSB first, no reflection, no final xor.
///
/// A payload whose last two bytes carry a valid big-endian checksum (computed
/// over the same payload with those two bytes zeroed) sums to exactly zero,
/// which is how received messages are verified.
pub fn crc_1021(message: &[u8]) -> u16 {
    const POLY: u32 = 0x1021;
    let mut reg: u32 = 0;
    for byte in message {
        let mut mask = 0x80u8;
        while mask > 0 {
            reg <<= 1;
            if byte & mask != 0 {
                reg |= 1;
            }
            mask >>= 1;
            if reg & 0x10000 != 0 {
                reg = (reg & 0xffff) ^ POLY;
            }
        }
    }
    reg as u16
}

/// Append a complete escaped, checksummed, delimited frame to `dst`.
///
/// The prefix byte and the 0x0D terminator travel unescaped; everything in
/// between, including the two CRC bytes, goes through the escape table.
pub fn write_frame(prefix: u8, body: &[u8], dst: &mut BytesMut) {
    let mut message = body.to_vec();
    message.extend([0, 0]);
    let checksum = crc_1021(&message);
    let crc_offset = message.len() - 2;
    message[crc_offset..].copy_from_slice(&checksum.to_be_bytes());
    dst.reserve(2 + 2 * message.len());
    dst.extend([prefix]);
    for byte in message {
        if ESCAPED_BYTES.contains(&byte) {
            dst.extend([ESCAPE, byte ^ 0xff]);
        } else {
            dst.extend([byte]);
        }
    }
    dst.extend([TERMINATOR]);
}

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub address: u16,
}

impl Request {
    /// The unescaped command body that reads one register (CRC not included.)
    pub fn body(&self) -> [u8; 5] {
        let [hi, lo] = self.address.to_be_bytes();
        [0x3f, 0x10, 0x01, hi, lo]
    }

    /// Upper bound on how many bytes the response occupies on the wire.
    ///
    /// Used to budget the time the meter needs to clock the frame out at its
    /// leisurely baud rate: marker and terminator plus a worst-case fully
    /// escaped header, 8-byte mantissa and CRC.
    pub fn expected_response_length(&self) -> u16 {
        2 + 2 * (7 + 8 + 2)
    }
}

#[derive(Debug)]
pub struct Reply {
    pub kind: ReplyKind,
}

#[derive(Debug)]
pub enum ReplyKind {
    /// De-escaped, CRC-verified message with the CRC bytes stripped.
    Body(Vec<u8>),
    /// The frame ended in the middle of an escape sequence.
    TruncatedEscape,
    /// Too short to even carry a checksum.
    Runt { length: usize },
    /// The de-escaped payload did not checksum to zero.
    CrcMismatch { residue: u16 },
}

pub struct KamstrupCodec {}

impl Encoder<&Request> for KamstrupCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(COMMAND_PREFIX, &req.body(), dst);
        trace!(message="sending encoded", buffer=?dst);
        Ok(())
    }
}

impl Decoder for KamstrupCodec {
    type Item = Reply;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message="attempt at decoding", buffer=?src);
        let Some(terminator) = src.iter().position(|b| *b == TERMINATOR) else {
            return Ok(None);
        };
        let frame = src.split_to(terminator + 1);
        // A bare 0x40 is always a start-of-frame marker (everywhere else it
        // travels escaped), so anything preceding the last one is debris from
        // an earlier aborted frame.
        let start = frame[..terminator].iter().rposition(|b| *b == START_MARKER).unwrap_or(0);
        let mut filtered = Vec::with_capacity(terminator);
        let mut i = start + 1;
        while i < terminator {
            if frame[i] == ESCAPE {
                if i + 1 >= terminator {
                    return Ok(Some(Reply { kind: ReplyKind::TruncatedEscape }));
                }
                let value = frame[i + 1] ^ 0xff;
                if !ESCAPED_BYTES.contains(&value) {
                    warn!(value, "escaped byte outside the reserved set");
                }
                filtered.push(value);
                i += 2;
            } else {
                filtered.push(frame[i]);
                i += 1;
            }
        }
        if filtered.len() < 2 {
            return Ok(Some(Reply { kind: ReplyKind::Runt { length: filtered.len() } }));
        }
        let residue = crc_1021(&filtered);
        if residue != 0 {
            return Ok(Some(Reply { kind: ReplyKind::CrcMismatch { residue } }));
        }
        filtered.truncate(filtered.len() - 2);
        Ok(Some(Reply { kind: ReplyKind::Body(filtered) }))
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("response is {0} bytes long, shorter than the fixed header")]
    TooShort(usize),
    #[error("response class {class:#04x}/{subtype:#04x} is not a register read reply")]
    NotAReadReply { class: u8, subtype: u8 },
    #[error("response echoes register {echoed:#06x}, requested {requested:#06x}")]
    AddressMismatch { requested: u16, echoed: u16 },
    #[error("mantissa of {expected} bytes truncated to {available}")]
    IncompleteMantissa { expected: usize, available: usize },
}

/// Interpret a verified response body as the value of the `requested` register.
///
/// The meter encodes measurements as an unsigned big-endian mantissa scaled by
/// a signed power of ten, with an overall sign bit. Layout of the body after
/// CRC stripping: class, subtype, echoed address (2 bytes), a format byte,
/// mantissa length N, the exponent byte (bit 7 value sign, bit 6 exponent
/// sign, bits 0-5 exponent magnitude), then N mantissa bytes.
pub fn decode_value(body: &[u8], requested: u16) -> Result<f64, ValueError> {
    let [class, subtype, hi, lo, _format, length, exponent, mantissa @ ..] = body else {
        return Err(ValueError::TooShort(body.len()));
    };
    if (*class, *subtype) != (0x3f, 0x10) {
        return Err(ValueError::NotAReadReply { class: *class, subtype: *subtype });
    }
    let echoed = u16::from_be_bytes([*hi, *lo]);
    if echoed != requested {
        return Err(ValueError::AddressMismatch { requested, echoed });
    }
    let length = usize::from(*length);
    let Some(mantissa) = mantissa.get(..length) else {
        return Err(ValueError::IncompleteMantissa {
            expected: length,
            available: mantissa.len(),
        });
    };
    // Folding into f64 keeps a garbled length byte from overflowing a fixed
    // width accumulator; real registers stay well under 2^53 and decode
    // exactly.
    let magnitude = mantissa.iter().fold(0.0f64, |acc, b| acc * 256.0 + f64::from(*b));
    let exponent = *exponent;
    let power = i32::from(exponent & 0x3f) * if exponent & 0x40 != 0 { -1 } else { 1 };
    let scale = 10f64.powi(power) * if exponent & 0x80 != 0 { -1.0 } else { 1.0 };
    Ok(magnitude * scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_frame(raw: &[u8]) -> Option<Reply> {
        let mut buffer = BytesMut::from(raw);
        KamstrupCodec {}.decode(&mut buffer).expect("codec errors are infallible")
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc_1021(&[0x3f, 0x10, 0x01, 0x00, 0x3c, 0, 0]), 0xb25f);
        assert_eq!(crc_1021(&[1, 2, 3]), 0x1222);
        assert_eq!(crc_1021(&[]), 0);
    }

    #[test]
    fn valid_trailing_crc_sums_to_zero() {
        for body in [&b"\x3f\x10\x00\x3c"[..], b"", b"\x80\x40\x0d\x1b\x06"] {
            let mut message = body.to_vec();
            message.extend([0, 0]);
            let checksum = crc_1021(&message);
            let crc_offset = message.len() - 2;
            message[crc_offset..].copy_from_slice(&checksum.to_be_bytes());
            assert_eq!(crc_1021(&message), 0, "residue for body {body:02x?}");
        }
    }

    #[test]
    fn encode_read_command() {
        let mut buffer = BytesMut::new();
        let request = Request { address: 0x003c };
        KamstrupCodec {}.encode(&request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0x80, 0x3f, 0x10, 0x01, 0x00, 0x3c, 0xb2, 0x5f, 0x0d]);
    }

    #[test]
    fn encode_escapes_reserved_bytes() {
        let mut buffer = BytesMut::new();
        write_frame(0x80, &[0x06, 0x0d, 0x1b, 0x40, 0x80, 0x42], &mut buffer);
        assert_eq!(buffer[0], 0x80);
        assert_eq!(*buffer.last().unwrap(), 0x0d);
        assert_eq!(
            &buffer[1..11],
            &[0x1b, 0xf9, 0x1b, 0xf2, 0x1b, 0xe4, 0x1b, 0xbf, 0x1b, 0x7f],
        );
        // The interior of the frame carries neither markers nor terminators.
        assert!(!buffer[1..buffer.len() - 1].contains(&0x0d));
        assert!(!buffer[1..buffer.len() - 1].contains(&0x40));
    }

    #[test]
    fn encode_decode_round_trip() {
        let body = [0x3f, 0x10, 0x00, 0x3c, 0x00, 0x03, 0x42, 0x01, 0xe2, 0x40];
        let mut buffer = BytesMut::new();
        write_frame(START_MARKER, &body, &mut buffer);
        // The 0x40 mantissa byte must have been escaped.
        assert_eq!(&buffer[..], &[
            0x40, 0x3f, 0x10, 0x00, 0x3c, 0x00, 0x03, 0x42, 0x01, 0xe2, 0x1b, 0xbf, 0xc7,
            0x30, 0x0d,
        ]);
        let reply = decode_frame(&buffer).expect("a full frame is buffered");
        let ReplyKind::Body(decoded) = reply.kind else {
            panic!("expected a verified body, got {:?}", reply.kind);
        };
        assert_eq!(decoded, body);
    }

    #[test]
    fn decode_needs_a_full_frame() {
        let mut buffer = BytesMut::from(&[0x40, 0x3f, 0x10][..]);
        assert!(KamstrupCodec {}.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn start_marker_restarts_the_frame() {
        // Debris from an aborted frame precedes the genuine response.
        let mut buffer = BytesMut::new();
        buffer.extend([0x3f, 0x99, 0x40, 0x17]);
        write_frame(START_MARKER, &[0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x02, 0x01, 0x00], &mut buffer);
        let reply = decode_frame(&buffer).unwrap();
        let ReplyKind::Body(decoded) = reply.kind else {
            panic!("expected a verified body, got {:?}", reply.kind);
        };
        assert_eq!(decoded, [0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn single_bit_corruption_is_rejected() {
        let body = [0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x02, 0x01, 0x00];
        let mut pristine = BytesMut::new();
        write_frame(START_MARKER, &body, &mut pristine);
        // Flip one bit at a time in every byte between marker and terminator,
        // skipping flips that collide with the framing bytes themselves.
        for position in 1..pristine.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = pristine.to_vec();
                corrupted[position] ^= 1 << bit;
                let byte = corrupted[position];
                if byte == 0x0d || byte == 0x40 || byte == 0x1b {
                    continue;
                }
                let reply = decode_frame(&corrupted).unwrap();
                assert!(
                    !matches!(reply.kind, ReplyKind::Body(_)),
                    "flip of bit {bit} at {position} went undetected",
                );
            }
        }
    }

    #[test]
    fn truncated_escape_is_a_framing_failure() {
        let reply = decode_frame(&[0x40, 0x3f, 0x10, 0x1b, 0x0d]).unwrap();
        assert!(matches!(reply.kind, ReplyKind::TruncatedEscape));
    }

    #[test]
    fn runt_frame_is_reported() {
        let reply = decode_frame(&[0x40, 0x3f, 0x0d]).unwrap();
        assert!(matches!(reply.kind, ReplyKind::Runt { length: 1 }));
    }

    #[test]
    fn positive_exponent_value() {
        // mantissa 0x0100 = 256, exponent byte 0x02: 256 * 10^2.
        let body = [0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x02, 0x01, 0x00];
        assert_eq!(decode_value(&body, 0x0050), Ok(25600.0));
    }

    #[test]
    fn negative_exponent_value() {
        // exponent byte 0x42: magnitude 2, bit 6 negates the exponent.
        let body = [0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x42, 0x01, 0x00];
        assert_eq!(decode_value(&body, 0x0050), Ok(2.56));
    }

    #[test]
    fn sign_bit_negates_the_value() {
        let body = [0x3f, 0x10, 0x00, 0x50, 0x00, 0x02, 0x82, 0x01, 0x00];
        assert_eq!(decode_value(&body, 0x0050), Ok(-25600.0));
    }

    #[test]
    fn value_preconditions() {
        assert_eq!(decode_value(&[0x3f, 0x10], 0x0050), Err(ValueError::TooShort(2)));
        let wrong_class = [0x21, 0x10, 0x00, 0x50, 0x00, 0x00, 0x00];
        assert_eq!(
            decode_value(&wrong_class, 0x0050),
            Err(ValueError::NotAReadReply { class: 0x21, subtype: 0x10 }),
        );
        let stale = [0x3f, 0x10, 0x00, 0x44, 0x00, 0x00, 0x00];
        assert_eq!(
            decode_value(&stale, 0x0050),
            Err(ValueError::AddressMismatch { requested: 0x0050, echoed: 0x0044 }),
        );
        let short_mantissa = [0x3f, 0x10, 0x00, 0x50, 0x00, 0x04, 0x00, 0x01];
        assert_eq!(
            decode_value(&short_mantissa, 0x0050),
            Err(ValueError::IncompleteMantissa { expected: 4, available: 1 }),
        );
    }

    #[test]
    fn hour_counter_width() {
        // The hour counter lives at a 12-bit address; make sure the echoed
        // address comparison is not byte-blind.
        let body = [0x3f, 0x10, 0x03, 0xec, 0x00, 0x02, 0x00, 0x30, 0x39];
        assert_eq!(decode_value(&body, 0x03ec), Ok(12345.0));
    }
}
