//! Binary protocol for the realtime dialogue and SAUC/TTS V3 services.
//!
//! Frame format:
//! - Header (4 bytes):
//!   - (4bits) version + (4bits) header_size
//!   - (4bits) message_type + (4bits) message_type_flags
//!   - (4bits) serialization + (4bits) compression
//!   - (8bits) reserved
//!
//! - Body:
//!   - [optional] sequence (4 bytes, signed)
//!   - [optional] event (4 bytes)
//!   - [optional] connect_id / session_id (4 bytes len + data)
//!   - [optional] error code (4 bytes, error frames only)
//!   - payload_size (4 bytes) + payload_data
//!
//! All integer fields are big-endian. A negative sequence marks the last
//! audio frame of a logical stream; its absolute value is the sequence
//! number.

use std::io::{Cursor, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

// ================== Protocol Constants ==================

/// Protocol version. Only V1 is defined.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte units.
pub const HEADER_SIZE: u8 = 0b0001;

/// Message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    FullClient = 0b0001,
    AudioOnlyClient = 0b0010,
    FullServer = 0b1001,
    /// Server acknowledgement; carries audio bytes on the dialogue wire.
    ServerAck = 0b1011,
    FrontendResult = 0b1100,
    Error = 0b1111,
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => MessageType::FullClient,
            0b0010 => MessageType::AudioOnlyClient,
            0b1001 => MessageType::FullServer,
            0b1011 => MessageType::ServerAck,
            0b1100 => MessageType::FrontendResult,
            0b1111 => MessageType::Error,
            _ => MessageType::FullClient,
        }
    }
}

/// Message type flags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFlags {
    #[default]
    NoSeq = 0b0000,
    PosSequence = 0b0001,
    NegSequence = 0b0010,
    /// Last frame, sequence field present and negated.
    NegWithSeq = 0b0011,
    WithEvent = 0b0100,
}

impl MessageFlags {
    /// Whether a 4-byte signed sequence field follows the header.
    pub fn has_sequence(self) -> bool {
        matches!(
            self,
            MessageFlags::PosSequence | MessageFlags::NegSequence | MessageFlags::NegWithSeq
        )
    }

    /// Whether a 4-byte event id follows the header.
    pub fn has_event(self) -> bool {
        self == MessageFlags::WithEvent
    }
}

impl From<u8> for MessageFlags {
    fn from(v: u8) -> Self {
        match v {
            0b0000 => MessageFlags::NoSeq,
            0b0001 => MessageFlags::PosSequence,
            0b0010 => MessageFlags::NegSequence,
            0b0011 => MessageFlags::NegWithSeq,
            0b0100 => MessageFlags::WithEvent,
            _ => MessageFlags::NoSeq,
        }
    }
}

/// Serialization type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationType {
    #[default]
    Raw = 0b0000,
    Json = 0b0001,
    Thrift = 0b0011,
}

impl From<u8> for SerializationType {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => SerializationType::Json,
            0b0011 => SerializationType::Thrift,
            _ => SerializationType::Raw,
        }
    }
}

/// Compression type. Gzip is the only defined compression.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None = 0b0000,
    Gzip = 0b0001,
}

impl From<u8> for CompressionType {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => CompressionType::Gzip,
            _ => CompressionType::None,
        }
    }
}

/// Dialogue event ids.
///
/// Events below 100 are connection-level and carry no session id; events
/// at 100 and above are session-level and always carry one.
pub mod events {
    // Client events
    pub const START_CONNECTION: i32 = 1;
    pub const FINISH_CONNECTION: i32 = 2;
    pub const START_SESSION: i32 = 100;
    pub const FINISH_SESSION: i32 = 102;
    pub const TASK_REQUEST: i32 = 200;
    pub const SAY_HELLO: i32 = 300;
    pub const CHAT_TTS_TEXT: i32 = 500;
    pub const CHAT_TEXT_QUERY: i32 = 501;

    // Server events
    pub const CONNECTION_STARTED: i32 = 50;
    pub const CONNECTION_FAILED: i32 = 51;
    pub const CONNECTION_FINISHED: i32 = 52;
    pub const SESSION_STARTED: i32 = 150;
    pub const SESSION_FINISHED: i32 = 152;
    pub const SESSION_FAILED: i32 = 153;
    pub const USAGE: i32 = 154;
    pub const TTS_SENTENCE_START: i32 = 350;
    pub const TTS_SENTENCE_END: i32 = 351;
    pub const TTS_RESPONSE: i32 = 352;
    pub const TTS_ENDED: i32 = 359;
    pub const ASR_INFO: i32 = 450;
    pub const ASR_RESPONSE: i32 = 451;
    pub const ASR_ENDED: i32 = 459;
    pub const CHAT_RESPONSE: i32 = 550;
    pub const CHAT_TEXT_QUERY_CONFIRMED: i32 = 553;
    pub const CHAT_ENDED: i32 = 559;
    pub const DIALOG_COMMON_ERROR: i32 = 599;
}

/// Returns true for session-level events (id >= 100).
pub fn is_session_event(event: i32) -> bool {
    event >= 100
}

/// Server connection events carry a connect id segment instead of a
/// session id.
fn has_connect_id(event: i32) -> bool {
    matches!(
        event,
        events::CONNECTION_STARTED | events::CONNECTION_FAILED | events::CONNECTION_FINISHED
    )
}

/// Returns the event name for log lines.
pub fn event_name(event: i32) -> &'static str {
    match event {
        events::START_CONNECTION => "StartConnection",
        events::FINISH_CONNECTION => "FinishConnection",
        events::START_SESSION => "StartSession",
        events::FINISH_SESSION => "FinishSession",
        events::TASK_REQUEST => "TaskRequest",
        events::SAY_HELLO => "SayHello",
        events::CHAT_TTS_TEXT => "ChatTTSText",
        events::CHAT_TEXT_QUERY => "ChatTextQuery",
        events::CONNECTION_STARTED => "ConnectionStarted",
        events::CONNECTION_FAILED => "ConnectionFailed",
        events::CONNECTION_FINISHED => "ConnectionFinished",
        events::SESSION_STARTED => "SessionStarted",
        events::SESSION_FINISHED => "SessionFinished",
        events::SESSION_FAILED => "SessionFailed",
        events::USAGE => "UsageResponse",
        events::TTS_SENTENCE_START => "TTSSentenceStart",
        events::TTS_SENTENCE_END => "TTSSentenceEnd",
        events::TTS_RESPONSE => "TTSResponse",
        events::TTS_ENDED => "TTSEnded",
        events::ASR_INFO => "ASRInfo",
        events::ASR_RESPONSE => "ASRResponse",
        events::ASR_ENDED => "ASREnded",
        events::CHAT_RESPONSE => "ChatResponse",
        events::CHAT_TEXT_QUERY_CONFIRMED => "ChatTextQueryConfirmed",
        events::CHAT_ENDED => "ChatEnded",
        events::DIALOG_COMMON_ERROR => "DialogCommonError",
        _ => "UnknownEvent",
    }
}

// ================== Frame ==================

/// A decoded protocol frame.
///
/// The payload is stored decompressed; use [`Frame::payload_json`] for
/// JSON-serialized frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub serialization: SerializationType,
    /// Event id, when flags include WithEvent.
    pub event: i32,
    /// Session id, for session-level events.
    pub session_id: String,
    /// Connect id, for server connection events.
    pub connect_id: String,
    /// Signed sequence number; negative marks the last audio frame.
    pub sequence: i32,
    /// Error code, for error frames.
    pub error_code: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Returns true if this frame carries audio bytes.
    pub fn is_audio(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::AudioOnlyClient | MessageType::ServerAck
        )
    }

    /// Returns true if this is an error frame.
    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error
    }

    /// Returns true if this frame closes a sequenced audio stream.
    pub fn is_last_audio(&self) -> bool {
        matches!(
            self.flags,
            MessageFlags::NegSequence | MessageFlags::NegWithSeq
        ) || self.sequence < 0
    }

    /// Deserializes the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Returns the payload as lossy UTF-8, for error messages.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ================== Builders ==================

fn put_header(
    buf: &mut BytesMut,
    msg_type: MessageType,
    flags: MessageFlags,
    serialization: SerializationType,
    compression: CompressionType,
) {
    buf.put_u8((PROTOCOL_VERSION << 4) | HEADER_SIZE);
    buf.put_u8(((msg_type as u8) << 4) | (flags as u8));
    buf.put_u8(((serialization as u8) << 4) | (compression as u8));
    buf.put_u8(0x00); // reserved
}

/// Builds a JSON event frame.
///
/// Connection-level events (id < 100) omit the session segment entirely;
/// session-level events carry the session id length and bytes before the
/// payload. The payload is gzip-compressed UTF-8 JSON.
pub fn build_event_frame(
    event: i32,
    session_id: &str,
    payload: &serde_json::Value,
) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(256);
    put_header(
        &mut buf,
        MessageType::FullClient,
        MessageFlags::WithEvent,
        SerializationType::Json,
        CompressionType::Gzip,
    );

    buf.put_i32(event);
    if is_session_event(event) {
        buf.put_u32(session_id.len() as u32);
        buf.put_slice(session_id.as_bytes());
    }

    let body = gzip_compress(serde_json::to_string(payload)?.as_bytes())?;
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.to_vec())
}

/// Builds an audio event frame (`TASK_REQUEST` on the dialogue wire).
///
/// Same layout as [`build_event_frame`] with a raw, gzip-compressed PCM
/// payload.
pub fn build_audio_frame(event: i32, session_id: &str, audio: &[u8]) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(audio.len() / 2 + 64);
    put_header(
        &mut buf,
        MessageType::AudioOnlyClient,
        MessageFlags::WithEvent,
        SerializationType::Raw,
        CompressionType::Gzip,
    );

    buf.put_i32(event);
    if is_session_event(event) {
        buf.put_u32(session_id.len() as u32);
        buf.put_slice(session_id.as_bytes());
    }

    let body = gzip_compress(audio)?;
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.to_vec())
}

/// Builds a flagless full-client request (SAUC-style configuration frame).
pub fn build_full_client_request(payload: &serde_json::Value, compress: bool) -> Result<Vec<u8>> {
    let mut body = serde_json::to_string(payload)?.into_bytes();
    let compression = if compress {
        body = gzip_compress(&body)?;
        CompressionType::Gzip
    } else {
        CompressionType::None
    };

    let mut buf = BytesMut::with_capacity(body.len() + 8);
    put_header(
        &mut buf,
        MessageType::FullClient,
        MessageFlags::NoSeq,
        SerializationType::Json,
        compression,
    );
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.to_vec())
}

/// Builds a sequenced audio-only request (SAUC-style audio frame).
///
/// The last frame carries a negated sequence number.
pub fn build_audio_only_request(
    audio: &[u8],
    seq: i32,
    is_last: bool,
    compress: bool,
) -> Result<Vec<u8>> {
    let mut body = audio.to_vec();
    let compression = if compress && !body.is_empty() {
        body = gzip_compress(&body)?;
        CompressionType::Gzip
    } else {
        CompressionType::None
    };

    let flags = if is_last {
        MessageFlags::NegWithSeq
    } else {
        MessageFlags::PosSequence
    };

    let mut buf = BytesMut::with_capacity(body.len() + 12);
    put_header(
        &mut buf,
        MessageType::AudioOnlyClient,
        flags,
        SerializationType::Raw,
        compression,
    );
    buf.put_i32(if is_last { -seq } else { seq });
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.to_vec())
}

// ================== Parser ==================

fn read_i32(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<i32> {
    if cursor.remaining() < 4 {
        return Err(Error::Truncated(field));
    }
    Ok(cursor.get_i32())
}

fn read_u32(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(Error::Truncated(field));
    }
    Ok(cursor.get_u32())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize, field: &'static str) -> Result<Vec<u8>> {
    if cursor.remaining() < len {
        return Err(Error::Truncated(field));
    }
    let mut out = vec![0u8; len];
    cursor.copy_to_slice(&mut out);
    Ok(out)
}

/// Parses a binary frame.
///
/// Optional fields are read according to the header flags and message
/// type. Gzip payloads are decompressed. Unknown event ids are passed
/// through untouched.
pub fn parse_frame(data: &[u8]) -> Result<Frame> {
    if data.len() < 4 {
        return Err(Error::Truncated("header"));
    }

    let version = data[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(Error::BadVersion(version));
    }
    let header_size = (data[0] & 0x0f) as usize;

    let mut frame = Frame {
        msg_type: MessageType::from(data[1] >> 4),
        flags: MessageFlags::from(data[1] & 0x0f),
        serialization: SerializationType::from(data[2] >> 4),
        ..Default::default()
    };
    let compression = CompressionType::from(data[2] & 0x0f);

    let mut cursor = Cursor::new(data);
    if data.len() < header_size * 4 {
        return Err(Error::Truncated("extended header"));
    }
    cursor.advance(header_size * 4);

    if frame.flags.has_sequence() {
        frame.sequence = read_i32(&mut cursor, "sequence")?;
    }

    if frame.flags.has_event() {
        frame.event = read_i32(&mut cursor, "event")?;

        if has_connect_id(frame.event) {
            let len = read_u32(&mut cursor, "connect id length")? as usize;
            let bytes = read_bytes(&mut cursor, len, "connect id")?;
            frame.connect_id = String::from_utf8_lossy(&bytes).into_owned();
        } else if is_session_event(frame.event) {
            let len = read_u32(&mut cursor, "session id length")? as usize;
            let bytes = read_bytes(&mut cursor, len, "session id")?;
            frame.session_id = String::from_utf8_lossy(&bytes).into_owned();
        }
    }

    if frame.msg_type == MessageType::Error {
        frame.error_code = read_u32(&mut cursor, "error code")?;
    }

    let payload_len = read_u32(&mut cursor, "payload length")? as usize;
    let payload = read_bytes(&mut cursor, payload_len, "payload")?;
    frame.payload = if compression == CompressionType::Gzip && !payload.is_empty() {
        gzip_decompress(&payload)?
    } else {
        payload
    };

    Ok(frame)
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_frame_round_trip() {
        let payload = json!({"content": "你好"});
        let data = build_event_frame(events::CHAT_TEXT_QUERY, "sess-1", &payload).unwrap();
        let frame = parse_frame(&data).unwrap();

        assert_eq!(frame.msg_type, MessageType::FullClient);
        assert_eq!(frame.flags, MessageFlags::WithEvent);
        assert_eq!(frame.event, events::CHAT_TEXT_QUERY);
        assert_eq!(frame.session_id, "sess-1");
        assert_eq!(frame.payload_json().unwrap(), payload);
    }

    #[test]
    fn connection_frame_has_no_session_segment() {
        let data = build_event_frame(events::START_CONNECTION, "ignored", &json!({})).unwrap();
        let frame = parse_frame(&data).unwrap();

        assert_eq!(frame.event, events::START_CONNECTION);
        assert!(frame.session_id.is_empty());
        assert_eq!(frame.payload_json().unwrap(), json!({}));
    }

    #[test]
    fn audio_frame_round_trip() {
        let audio: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let data = build_audio_frame(events::TASK_REQUEST, "ABC-123", &audio).unwrap();
        let frame = parse_frame(&data).unwrap();

        assert_eq!(frame.msg_type, MessageType::AudioOnlyClient);
        assert_eq!(frame.event, events::TASK_REQUEST);
        assert_eq!(frame.session_id, "ABC-123");
        assert_eq!(frame.payload, audio);
    }

    #[test]
    fn full_client_request_round_trip() {
        let payload = json!({"request": {"model_name": "bigmodel"}});
        for compress in [true, false] {
            let data = build_full_client_request(&payload, compress).unwrap();
            let frame = parse_frame(&data).unwrap();
            assert_eq!(frame.msg_type, MessageType::FullClient);
            assert_eq!(frame.flags, MessageFlags::NoSeq);
            assert_eq!(frame.payload_json().unwrap(), payload);
        }
    }

    #[test]
    fn audio_only_request_sequences() {
        let audio = vec![7u8; 1024];

        let data = build_audio_only_request(&audio, 3, false, true).unwrap();
        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.flags, MessageFlags::PosSequence);
        assert_eq!(frame.sequence, 3);
        assert!(!frame.is_last_audio());
        assert_eq!(frame.payload, audio);

        let data = build_audio_only_request(&audio, 5, true, true).unwrap();
        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.flags, MessageFlags::NegWithSeq);
        assert_eq!(frame.sequence, -5);
        assert!(frame.is_last_audio());
        assert_eq!(frame.payload, audio);
    }

    #[test]
    fn server_frame_with_connect_id() {
        // Synthesized ConnectionStarted frame as the upstream emits it.
        let mut buf = BytesMut::new();
        buf.put_u8(0x11);
        buf.put_u8(((MessageType::FullServer as u8) << 4) | (MessageFlags::WithEvent as u8));
        buf.put_u8((SerializationType::Json as u8) << 4);
        buf.put_u8(0x00);
        buf.put_i32(events::CONNECTION_STARTED);
        buf.put_u32(7);
        buf.put_slice(b"conn-42");
        let body = br#"{"ok":true}"#;
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let frame = parse_frame(&buf).unwrap();
        assert_eq!(frame.event, events::CONNECTION_STARTED);
        assert_eq!(frame.connect_id, "conn-42");
        assert!(frame.session_id.is_empty());
    }

    #[test]
    fn error_frame_carries_code() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x11);
        buf.put_u8(((MessageType::Error as u8) << 4) | (MessageFlags::NoSeq as u8));
        buf.put_u8((SerializationType::Json as u8) << 4);
        buf.put_u8(0x00);
        buf.put_u32(45000001);
        let body = br#"{"error":"bad request"}"#;
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let frame = parse_frame(&buf).unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.error_code, 45000001);
        assert_eq!(frame.payload_json().unwrap()["error"], "bad request");
    }

    #[test]
    fn unknown_event_passes_through() {
        let data = build_event_frame(997, "sess", &json!({"x": 1})).unwrap();
        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.event, 997);
        assert_eq!(frame.session_id, "sess");
        assert_eq!(event_name(frame.event), "UnknownEvent");
    }

    #[test]
    fn truncated_frames_fail() {
        assert!(matches!(parse_frame(&[0x11, 0x14]), Err(Error::Truncated(_))));

        let data = build_event_frame(events::START_SESSION, "sess", &json!({})).unwrap();
        for cut in [4, 8, 10, data.len() - 1] {
            assert!(
                matches!(parse_frame(&data[..cut]), Err(Error::Truncated(_))),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn bad_version_fails() {
        let mut data = build_event_frame(events::START_SESSION, "s", &json!({})).unwrap();
        data[0] = (0b0010 << 4) | 0x01;
        assert!(matches!(parse_frame(&data), Err(Error::BadVersion(2))));
    }

    #[test]
    fn chat_tts_text_frame() {
        let payload = json!({"start": true, "end": false, "content": "早上好"});
        let data = build_event_frame(events::CHAT_TTS_TEXT, "sess", &payload).unwrap();
        let frame = parse_frame(&data).unwrap();
        assert_eq!(frame.event, events::CHAT_TTS_TEXT);
        assert_eq!(frame.payload_json().unwrap(), payload);
    }
}
