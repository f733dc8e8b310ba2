//! Legacy binary APNs frames.
//!
//! A push is command `2`, a big endian `u32` length and then a sequence of
//! `(item id: u8, length: u16, value)` items. The gateway answers a rejected
//! push with a 6 byte error response, and the feedback service streams fixed
//! 38 byte records. All integers are big endian on the wire.
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use apnpush_common::errors::{ApnsErrorKind, Result};
use apnpush_common::notification::{Notification, DEVICE_TOKEN_SIZE};
use apnpush_common::util::hex_token;

pub const PUSH_COMMAND: u8 = 2;
pub const ERROR_RESPONSE_COMMAND: u8 = 8;
/// command + status + identifier
pub const ERROR_RESPONSE_LEN: usize = 1 + 1 + 4;
/// time + token length + token
pub const FEEDBACK_RECORD_LEN: usize = 4 + 2 + DEVICE_TOKEN_SIZE;
/// command + item length
pub const FRAME_HEADER_LEN: usize = 1 + 4;

/// Item ids, in the order they are written
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemId {
    Token = 1,
    Payload = 2,
    Identifier = 3,
    Expiration = 4,
    Priority = 5,
}

/// Encode a notification as a command 2 frame
pub fn encode_notification(notification: &Notification) -> Vec<u8> {
    let mut items = BytesMut::new();
    put_item(&mut items, ItemId::Token, &notification.token_data());
    put_item(&mut items, ItemId::Payload, notification.payload_data());
    if notification.identifier != 0 {
        put_item(
            &mut items,
            ItemId::Identifier,
            &notification.identifier.to_be_bytes(),
        );
    }
    if let Some(stamp) = notification.expiration_stamp() {
        put_item(&mut items, ItemId::Expiration, &stamp.to_be_bytes());
    }
    if notification.priority != 0 {
        put_item(&mut items, ItemId::Priority, &[notification.priority]);
    }

    // The length prefix covers the items only, so they are built first.
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + items.len());
    frame.put_u8(PUSH_COMMAND);
    frame.put_u32(items.len() as u32);
    frame.put_slice(&items);
    frame.to_vec()
}

fn put_item(buf: &mut BytesMut, id: ItemId, value: &[u8]) {
    let len = u16::try_from(value.len()).unwrap_or_else(|_| {
        warn!(
            "Frame item {} is {} bytes, cut to {}",
            id as u8,
            value.len(),
            u16::MAX
        );
        u16::MAX
    });
    buf.put_u8(id as u8);
    buf.put_u16(len);
    buf.put_slice(&value[..usize::from(len)]);
}

/// Length of the whole frame announced by a frame header, `None` if the
/// header is short or not a push command.
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < FRAME_HEADER_LEN || header[0] != PUSH_COMMAND {
        return None;
    }
    let mut buf = &header[1..FRAME_HEADER_LEN];
    Some(FRAME_HEADER_LEN + buf.get_u32() as usize)
}

/// The items of a decoded push frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushFrame {
    pub items: Vec<(u8, Vec<u8>)>,
}

impl PushFrame {
    fn item(&self, id: ItemId) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(item_id, _)| *item_id == id as u8)
            .map(|(_, value)| value.as_slice())
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.item(ItemId::Token)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.item(ItemId::Payload)
    }

    pub fn identifier(&self) -> Option<u32> {
        self.item(ItemId::Identifier)
            .filter(|v| v.len() == 4)
            .map(|mut v| v.get_u32())
    }

    pub fn expiration(&self) -> Option<u32> {
        self.item(ItemId::Expiration)
            .filter(|v| v.len() == 4)
            .map(|mut v| v.get_u32())
    }

    pub fn priority(&self) -> Option<u8> {
        self.item(ItemId::Priority)
            .filter(|v| v.len() == 1)
            .map(|v| v[0])
    }
}

/// Decode a complete command 2 frame back into its items.
///
/// Returns `None` for anything that is not exactly one well formed frame.
pub fn decode_frame(frame: &[u8]) -> Option<PushFrame> {
    if frame_len(frame)? != frame.len() {
        return None;
    }
    let mut buf = &frame[FRAME_HEADER_LEN..];
    let mut items = vec![];
    while buf.has_remaining() {
        if buf.remaining() < 3 {
            return None;
        }
        let id = buf.get_u8();
        let len = usize::from(buf.get_u16());
        if buf.remaining() < len {
            return None;
        }
        items.push((id, buf[..len].to_vec()));
        buf.advance(len);
    }
    Some(PushFrame { items })
}

/// One entry from the feedback service: a device that stopped accepting
/// notifications, and when the service noticed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedbackRecord {
    pub token: [u8; DEVICE_TOKEN_SIZE],
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn token_hex(&self) -> String {
        hex_token(&self.token)
    }
}

/// Decode a 38 byte feedback record
pub fn decode_feedback_record(data: &[u8]) -> Result<FeedbackRecord> {
    if data.len() < FEEDBACK_RECORD_LEN {
        return Err(ApnsErrorKind::FeedbackLength {
            read: data.len(),
            expected: FEEDBACK_RECORD_LEN,
        }
        .into());
    }
    let mut buf = data;
    let time = buf.get_u32();
    let token_len = buf.get_u16();
    if usize::from(token_len) != DEVICE_TOKEN_SIZE {
        return Err(ApnsErrorKind::FeedbackTokenLength(token_len).into());
    }
    let mut token = [0u8; DEVICE_TOKEN_SIZE];
    buf.copy_to_slice(&mut token);
    let timestamp = Utc
        .timestamp_opt(i64::from(time), 0)
        .single()
        .unwrap_or_default();
    Ok(FeedbackRecord { token, timestamp })
}

/// Encode a feedback record the way the feedback service sends it
pub fn encode_feedback_record(record: &FeedbackRecord) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FEEDBACK_RECORD_LEN);
    buf.put_u32(u32::try_from(record.timestamp.timestamp().max(0)).unwrap_or(u32::MAX));
    buf.put_u16(DEVICE_TOKEN_SIZE as u16);
    buf.put_slice(&record.token);
    buf.to_vec()
}

/// The gateway's answer to a rejected notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u8,
    pub identifier: u32,
}

impl ErrorResponse {
    pub fn error_kind(&self) -> ApnsErrorKind {
        ApnsErrorKind::from_apn_status(self.status)
    }
}

/// Decode the 6 byte error response frame
pub fn decode_error_response(data: &[u8]) -> Result<ErrorResponse> {
    if data.len() < ERROR_RESPONSE_LEN {
        return Err(ApnsErrorKind::ReadFail(format!(
            "error response is {} of {} bytes",
            data.len(),
            ERROR_RESPONSE_LEN
        ))
        .into());
    }
    let mut buf = data;
    let command = buf.get_u8();
    if command != ERROR_RESPONSE_COMMAND {
        return Err(ApnsErrorKind::PushResponseCommand(command).into());
    }
    let status = buf.get_u8();
    let identifier = buf.get_u32();
    Ok(ErrorResponse { status, identifier })
}

/// Encode an error response the way the gateway sends it
pub fn encode_error_response(response: &ErrorResponse) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ERROR_RESPONSE_LEN);
    buf.put_u8(ERROR_RESPONSE_COMMAND);
    buf.put_u8(response.status);
    buf.put_u32(response.identifier);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const PAYLOAD: &str = r#"{"aps":{"alert":"hi"}}"#;

    #[test]
    fn minimal_frame_layout() {
        let frame = encode_notification(&Notification::new(PAYLOAD, TOKEN));
        let items_len = (1 + 2 + 32) + (1 + 2 + PAYLOAD.len());
        assert_eq!(frame.len(), FRAME_HEADER_LEN + items_len);
        assert_eq!(frame[0], 2);
        assert_eq!(&frame[1..5], &(items_len as u32).to_be_bytes());
        // token item
        assert_eq!(&frame[5..8], &[1, 0, 32]);
        assert_eq!(&frame[8..40], &[0xaa; 32]);
        // payload item
        assert_eq!(frame[40], 2);
        assert_eq!(&frame[41..43], &(PAYLOAD.len() as u16).to_be_bytes());
        assert_eq!(&frame[43..], PAYLOAD.as_bytes());
    }

    #[test]
    fn all_items_decode() {
        let at = Utc.timestamp_opt(0x5060_7080, 0).unwrap();
        let notif = Notification::new(PAYLOAD, TOKEN)
            .with_identifier(0x0102_0304)
            .with_expiration(at)
            .with_priority(10);
        let frame = encode_notification(&notif);
        let decoded = decode_frame(&frame).unwrap();
        let ids: Vec<u8> = decoded.items.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(decoded.token(), Some(&[0xaa; 32][..]));
        assert_eq!(decoded.payload(), Some(PAYLOAD.as_bytes()));
        assert_eq!(decoded.identifier(), Some(0x0102_0304));
        assert_eq!(decoded.expiration(), Some(0x5060_7080));
        assert_eq!(decoded.priority(), Some(10));

        // identifiers are big endian on the wire
        let (_, raw_id) = &decoded.items[2];
        assert_eq!(raw_id, &vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn optional_items_omitted() {
        let frame = encode_notification(&Notification::new(PAYLOAD, TOKEN));
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.identifier(), None);
        assert_eq!(decoded.expiration(), None);
        assert_eq!(decoded.priority(), None);
    }

    #[test]
    fn length_field_matches_items() {
        let notif = Notification::new("x".repeat(300), TOKEN)
            .with_identifier(9)
            .with_priority(5);
        let frame = encode_notification(&notif);
        let announced = (&frame[1..5]).get_u32() as usize;
        let expected = (3 + 32) + (3 + 300) + (3 + 4) + (3 + 1);
        assert_eq!(announced, expected);
        assert_eq!(frame.len() - FRAME_HEADER_LEN, announced);
        assert_eq!(frame_len(&frame), Some(frame.len()));
    }

    #[test]
    fn oversized_payload_is_cut_to_item_limit() {
        let notif = Notification::new("x".repeat(70_000), TOKEN);
        let frame = encode_notification(&notif);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.payload().map(<[u8]>::len), Some(usize::from(u16::MAX)));
        assert_eq!(frame_len(&frame), Some(frame.len()));
    }

    #[test]
    fn token_normalization() {
        let pretty: String = TOKEN
            .to_uppercase()
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(pretty.len(), 95);
        assert_eq!(
            encode_notification(&Notification::new(PAYLOAD, pretty.as_str())),
            encode_notification(&Notification::new(PAYLOAD, TOKEN))
        );

        let frame = encode_notification(&Notification::new(PAYLOAD, &TOKEN[..60]));
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.token(), Some(&[][..]));
    }

    #[test]
    fn malformed_frames() {
        let frame = encode_notification(&Notification::new(PAYLOAD, TOKEN));
        assert!(decode_frame(&frame[..frame.len() - 1]).is_none());
        let mut wrong = frame.clone();
        wrong[0] = 1;
        assert!(decode_frame(&wrong).is_none());
        assert!(frame_len(&frame[..3]).is_none());
    }

    #[test]
    fn feedback_record() {
        let mut data = vec![0x50, 0x00, 0x00, 0x01, 0x00, 0x20];
        data.extend_from_slice(&[0xab; 32]);
        let record = decode_feedback_record(&data).unwrap();
        assert_eq!(record.token, [0xab; 32]);
        assert_eq!(record.timestamp.timestamp(), 0x5000_0001);
        assert_eq!(record.token_hex(), "ab".repeat(32));
        assert_eq!(encode_feedback_record(&record), data);
    }

    #[test]
    fn feedback_bad_token_length() {
        let mut data = vec![0, 0, 0, 1, 0x00, 0x1f];
        data.extend_from_slice(&[0xab; 32]);
        let err = decode_feedback_record(&data).unwrap_err();
        assert_eq!(err.kind, ApnsErrorKind::FeedbackTokenLength(31));
    }

    #[test]
    fn feedback_short_read() {
        let data = [0u8; FEEDBACK_RECORD_LEN - 1];
        let err = decode_feedback_record(&data).unwrap_err();
        assert_eq!(
            err.kind,
            ApnsErrorKind::FeedbackLength {
                read: 37,
                expected: 38
            }
        );
    }

    #[test]
    fn error_response() {
        let response = decode_error_response(&[8, 4, 0, 0, 0, 0x2a]).unwrap();
        assert_eq!(
            response,
            ErrorResponse {
                status: 4,
                identifier: 42
            }
        );
        assert_eq!(response.error_kind(), ApnsErrorKind::ApnMissingPayload);
        assert_eq!(encode_error_response(&response), vec![8, 4, 0, 0, 0, 0x2a]);
    }

    #[test]
    fn error_response_bad_command() {
        let err = decode_error_response(&[7, 4, 0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.kind, ApnsErrorKind::PushResponseCommand(7));
        assert!(matches!(
            decode_error_response(&[8, 4]).unwrap_err().kind,
            ApnsErrorKind::ReadFail(_)
        ));
    }
}
