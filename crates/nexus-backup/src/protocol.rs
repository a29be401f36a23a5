//! Backup wire protocol
//!
//! Every frame starts with a single tag byte; integer fields are
//! fixed-width big-endian `i64` with no padding.
//!
//! ```text
//! Offer log    [OFFER_LOG:1][version:8][length:8]   17 bytes
//! Request log  [REQUEST_LOG:1][version:8]            9 bytes
//! Acknowledge  [OK:1]                                1 byte
//! Negative ack [NOT_OK:1]                            1 byte
//! Log payload  raw bytes, exactly `length` of the preceding offer
//! ```

use crate::{Error, Result};
use bytes::{Buf, BufMut};

/// Size of an offer frame
pub const OFFER_LOG_LEN: usize = 17;

/// Size of a request frame
pub const REQUEST_LOG_LEN: usize = 9;

/// Size of an acknowledgement frame
pub const ACK_LEN: usize = 1;

/// Message tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// A log version is available, followed by its length
    OfferLog = 0x01,
    /// Slave asks for a specific log version
    RequestLog = 0x02,
    /// Offer accepted, send the payload
    Ok = 0x03,
    /// Offer declined
    NotOk = 0x04,
}

impl TryFrom<u8> for MessageTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::OfferLog),
            0x02 => Ok(Self::RequestLog),
            0x03 => Ok(Self::Ok),
            0x04 => Ok(Self::NotOk),
            _ => Err(Error::protocol(format!("Unknown message tag: {:#04x}", value))),
        }
    }
}

/// Announcement of an available log version and its byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferLog {
    /// Log version on offer
    pub version: u64,
    /// Payload length that follows an accepted offer
    pub length: u64,
}

impl OfferLog {
    /// Append the 17-byte frame to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(MessageTag::OfferLog as u8);
        buf.put_i64(to_wire(self.version, "version")?);
        buf.put_i64(to_wire(self.length, "length")?);
        Ok(())
    }

    /// Consume one frame from the front of `buf`
    ///
    /// The caller must have buffered at least [`OFFER_LOG_LEN`] bytes.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure_len(buf, OFFER_LOG_LEN)?;
        expect_tag(buf.get_u8(), MessageTag::OfferLog)?;
        let version = from_wire(buf.get_i64(), "version")?;
        let length = from_wire(buf.get_i64(), "length")?;
        Ok(Self { version, length })
    }
}

/// Slave request for one log version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLog {
    /// Requested version
    pub version: u64,
}

impl RequestLog {
    /// Append the 9-byte frame to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(MessageTag::RequestLog as u8);
        buf.put_i64(to_wire(self.version, "version")?);
        Ok(())
    }

    /// Consume one frame from the front of `buf`
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure_len(buf, REQUEST_LOG_LEN)?;
        expect_tag(buf.get_u8(), MessageTag::RequestLog)?;
        let version = from_wire(buf.get_i64(), "version")?;
        Ok(Self { version })
    }
}

/// Append an OK or NOT_OK frame to `buf`
pub fn encode_ack<B: BufMut>(accepted: bool, buf: &mut B) {
    let tag = if accepted {
        MessageTag::Ok
    } else {
        MessageTag::NotOk
    };
    buf.put_u8(tag as u8);
}

/// Consume one acknowledgement byte, returning whether the offer was accepted
pub fn decode_ack<B: Buf>(buf: &mut B) -> Result<bool> {
    ensure_len(buf, ACK_LEN)?;
    match MessageTag::try_from(buf.get_u8())? {
        MessageTag::Ok => Ok(true),
        MessageTag::NotOk => Ok(false),
        other => Err(Error::protocol(format!(
            "Expected OK or NOT_OK, got {:?}",
            other
        ))),
    }
}

fn ensure_len<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::protocol(format!(
            "Frame too short: need {} bytes, have {}",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn expect_tag(byte: u8, expected: MessageTag) -> Result<()> {
    let tag = MessageTag::try_from(byte)?;
    if tag != expected {
        return Err(Error::protocol(format!(
            "Expected {:?}, got {:?}",
            expected, tag
        )));
    }
    Ok(())
}

fn to_wire(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::protocol(format!("{} {} does not fit the wire format", field, value)))
}

fn from_wire(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::protocol(format!("Negative {} on the wire: {}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_offer_layout() {
        let mut buf = BytesMut::new();
        OfferLog {
            version: 7,
            length: 0x0102,
        }
        .encode(&mut buf)
        .unwrap();

        assert_eq!(buf.len(), OFFER_LOG_LEN);
        assert_eq!(buf[0], 0x01);
        assert_eq!(&buf[1..9], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&buf[9..17], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_request_layout() {
        let mut buf = BytesMut::new();
        RequestLog { version: 300 }.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), REQUEST_LOG_LEN);
        assert_eq!(buf[0], 0x02);

        let decoded = RequestLog::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.version, 300);
    }

    #[test]
    fn test_ack_frames() {
        let mut buf = BytesMut::new();
        encode_ack(true, &mut buf);
        encode_ack(false, &mut buf);
        assert_eq!(&buf[..], &[0x03, 0x04]);

        assert!(decode_ack(&mut buf).unwrap());
        assert!(!decode_ack(&mut buf).unwrap());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = MessageTag::try_from(0x7f).unwrap_err();
        assert!(err.to_string().contains("Unknown message tag"));

        let mut buf = BytesMut::from(&[0x02u8][..]);
        assert!(decode_ack(&mut buf).is_err());
    }

    #[test]
    fn test_wrong_tag_for_frame() {
        let mut buf = BytesMut::new();
        RequestLog { version: 1 }.encode(&mut buf).unwrap();
        buf.put_bytes(0, 8);
        assert!(OfferLog::decode(&mut buf).is_err());
    }

    #[test]
    fn test_negative_version_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageTag::RequestLog as u8);
        buf.put_i64(-1);
        let err = RequestLog::decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_oversized_value_not_encoded() {
        let mut buf = BytesMut::new();
        let offer = OfferLog {
            version: u64::MAX,
            length: 1,
        };
        assert!(offer.encode(&mut buf).is_err());
    }

    #[test]
    fn test_short_frame() {
        let mut buf = BytesMut::from(&[0x01u8, 0, 0][..]);
        assert!(OfferLog::decode(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn prop_offer_round_trip(version in 0..=i64::MAX as u64, length in 0..=i64::MAX as u64) {
            let mut buf = BytesMut::new();
            OfferLog { version, length }.encode(&mut buf).unwrap();
            let decoded = OfferLog::decode(&mut buf).unwrap();
            prop_assert_eq!(decoded, OfferLog { version, length });
            prop_assert_eq!(buf.len(), 0);
        }
    }
}
