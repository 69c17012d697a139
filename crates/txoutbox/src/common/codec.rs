//! Stored-blob codec
//!
//! Every outbox row stores one message as a self-describing binary blob:
//!
//! ```text
//! [version: u8][compression marker: u8][uncompressed len: varint][body]
//! ```
//!
//! The body is a field-tagged payload (protobuf wire format: varint and
//! length-delimited fields only), compressed according to the marker.
//! Unknown fields are skipped on read, so new fields can ship without a
//! version bump. The version byte only changes when the framing itself
//! changes; any version from 1 up is readable.

use crate::common::compression::{self, CompressionAlgorithm};
use crate::common::config::CompressionConfig;
use crate::common::error::{OutboxError, Result};
use crate::common::types::{MessageHeader, OutboxMessage};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Version written by this encoder.
pub const CODEC_VERSION: u8 = 3;

/// Oldest version this decoder accepts.
pub const MIN_CODEC_VERSION: u8 = 1;

/// Upper bound for the declared uncompressed length. Anything larger is
/// treated as corruption before any allocation happens.
const MAX_UNCOMPRESSED_LEN: usize = 256 * 1024 * 1024;

// Payload field numbers. Never renumber these.
const FIELD_TOPIC: u64 = 1;
const FIELD_KEY: u64 = 2;
const FIELD_PARTITION: u64 = 3;
const FIELD_TIMESTAMP_MS: u64 = 4;
const FIELD_HEADER: u64 = 5;
const FIELD_VALUE: u64 = 6;
const FIELD_INSERT_TIME_MS: u64 = 7;

// Header sub-message field numbers.
const HEADER_FIELD_NAME: u64 = 1;
const HEADER_FIELD_VALUE: u64 = 2;

// Protobuf wire types.
const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Result of encoding one message for storage.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    /// The complete blob, ready for insertion
    pub blob: Bytes,
    /// Compression recorded in the blob header
    pub algorithm: CompressionAlgorithm,
    /// Payload size before compression
    pub uncompressed_len: usize,
    attempted_compressed_len: Option<usize>,
}

impl EncodedMessage {
    /// Size of the stored blob.
    pub fn stored_len(&self) -> usize {
        self.blob.len()
    }

    /// Achieved compression ratio (compressed over uncompressed), when
    /// compression was attempted. A ratio of 1.0 or above means the
    /// payload did not shrink and was stored uncompressed.
    pub fn compression_ratio(&self) -> Option<f64> {
        self.attempted_compressed_len
            .map(|len| len as f64 / self.uncompressed_len.max(1) as f64)
    }
}

/// A message restored from a stored blob.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    /// The restored message; the shard override is not stored and is
    /// always `None` here
    pub message: OutboxMessage,
    /// When the row was registered, if the blob carries it
    pub insert_time: Option<DateTime<Utc>>,
    /// Blob version the row was written with
    pub version: u8,
}

/// Encode a message into a stored blob.
///
/// Payloads at or above the configured minimum size are compressed; if the
/// compressed form is not smaller, the payload is stored raw under marker 0.
pub fn encode(message: &OutboxMessage, config: &CompressionConfig) -> Result<EncodedMessage> {
    let payload = encode_payload(message)?;
    let uncompressed_len = payload.len();

    let mut attempted_compressed_len = None;
    let (algorithm, body) = if config.algorithm != CompressionAlgorithm::None
        && uncompressed_len >= config.min_size
    {
        let candidate = compression::compress(config.algorithm, &payload)
            .map_err(|e| OutboxError::validation(format!("message could not be encoded: {}", e)))?;
        attempted_compressed_len = Some(candidate.len());
        if candidate.len() < uncompressed_len {
            (config.algorithm, candidate)
        } else {
            (CompressionAlgorithm::None, payload)
        }
    } else {
        (CompressionAlgorithm::None, payload)
    };

    let mut blob = BytesMut::with_capacity(body.len() + 12);
    blob.put_u8(CODEC_VERSION);
    blob.put_u8(algorithm.marker());
    put_uvarint(&mut blob, uncompressed_len as u64);
    blob.put_slice(&body);

    Ok(EncodedMessage {
        blob: blob.freeze(),
        algorithm,
        uncompressed_len,
        attempted_compressed_len,
    })
}

/// Decode a stored blob back into a message.
///
/// `storage_id` identifies the row in decode errors; any failure here is
/// final for the row and halts its lane.
pub fn decode(storage_id: i64, blob: &[u8]) -> Result<DecodedMessage> {
    let fail = |reason: String| OutboxError::decode(storage_id, reason);

    if blob.len() < 3 {
        return Err(fail(format!("blob of {} bytes is too short", blob.len())));
    }
    let version = blob[0];
    if !(MIN_CODEC_VERSION..=CODEC_VERSION).contains(&version) {
        return Err(fail(format!("unsupported blob version {}", version)));
    }
    let algorithm = CompressionAlgorithm::from_marker(blob[1])
        .ok_or_else(|| fail(format!("unknown compression marker {}", blob[1])))?;

    let mut cursor = &blob[2..];
    let uncompressed_len =
        get_uvarint(&mut cursor).map_err(|e| fail(e.to_string()))? as usize;
    if uncompressed_len > MAX_UNCOMPRESSED_LEN {
        return Err(fail(format!(
            "declared uncompressed length {} exceeds limit",
            uncompressed_len
        )));
    }

    let payload = match algorithm {
        CompressionAlgorithm::None => {
            if cursor.len() != uncompressed_len {
                return Err(fail(format!(
                    "payload length {} does not match header length {}",
                    cursor.len(),
                    uncompressed_len
                )));
            }
            cursor.to_vec()
        }
        _ => compression::decompress(algorithm, cursor, uncompressed_len)
            .map_err(&fail)?,
    };

    let (message, insert_time) = parse_payload(storage_id, &payload)?;
    Ok(DecodedMessage {
        message,
        insert_time,
        version,
    })
}

fn encode_payload(message: &OutboxMessage) -> Result<Vec<u8>> {
    let header_bytes: usize = message
        .headers
        .iter()
        .map(|h| h.name.len() + h.value.len() + 8)
        .sum();
    let mut buf = BytesMut::with_capacity(
        message.topic.len() + message.value.len() + header_bytes + 64,
    );

    put_len_field(&mut buf, FIELD_TOPIC, message.topic.as_bytes());
    if let Some(key) = &message.key {
        put_len_field(&mut buf, FIELD_KEY, key);
    }
    if let Some(partition) = message.partition {
        if partition < 0 {
            return Err(OutboxError::validation(format!(
                "partition {} must not be negative",
                partition
            )));
        }
        put_varint_field(&mut buf, FIELD_PARTITION, partition as u64);
    }
    if let Some(timestamp) = message.timestamp {
        put_varint_field(
            &mut buf,
            FIELD_TIMESTAMP_MS,
            timestamp.timestamp_millis() as u64,
        );
    }
    for header in &message.headers {
        let mut nested = BytesMut::with_capacity(header.name.len() + header.value.len() + 8);
        put_len_field(&mut nested, HEADER_FIELD_NAME, header.name.as_bytes());
        put_len_field(&mut nested, HEADER_FIELD_VALUE, &header.value);
        put_len_field(&mut buf, FIELD_HEADER, &nested);
    }
    put_len_field(&mut buf, FIELD_VALUE, &message.value);
    put_varint_field(
        &mut buf,
        FIELD_INSERT_TIME_MS,
        Utc::now().timestamp_millis() as u64,
    );

    Ok(buf.to_vec())
}

fn parse_payload(
    storage_id: i64,
    data: &[u8],
) -> Result<(OutboxMessage, Option<DateTime<Utc>>)> {
    let fail = |reason: String| OutboxError::decode(storage_id, reason);

    let mut topic: Option<String> = None;
    let mut key: Option<Bytes> = None;
    let mut partition: Option<i32> = None;
    let mut timestamp: Option<DateTime<Utc>> = None;
    let mut headers: Vec<MessageHeader> = Vec::new();
    let mut value = Bytes::new();
    let mut insert_time: Option<DateTime<Utc>> = None;

    let mut buf = data;
    while !buf.is_empty() {
        let tag = get_uvarint(&mut buf).map_err(|e| fail(e.to_string()))?;
        let field = tag >> 3;
        let wire = tag & 0x7;
        match (field, wire) {
            (FIELD_TOPIC, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                let parsed = String::from_utf8(raw.to_vec())
                    .map_err(|_| fail("topic is not valid UTF-8".to_string()))?;
                topic = Some(parsed);
            }
            (FIELD_KEY, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                key = Some(Bytes::copy_from_slice(raw));
            }
            (FIELD_PARTITION, WIRE_VARINT) => {
                let raw = get_uvarint(&mut buf).map_err(|e| fail(e.to_string()))?;
                if raw > i32::MAX as u64 {
                    return Err(fail(format!("partition {} is out of range", raw)));
                }
                partition = Some(raw as i32);
            }
            (FIELD_TIMESTAMP_MS, WIRE_VARINT) => {
                let raw = get_uvarint(&mut buf).map_err(|e| fail(e.to_string()))?;
                let parsed = DateTime::from_timestamp_millis(raw as i64)
                    .ok_or_else(|| fail(format!("timestamp {} is out of range", raw as i64)))?;
                timestamp = Some(parsed);
            }
            (FIELD_HEADER, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                headers.push(parse_header(storage_id, raw)?);
            }
            (FIELD_VALUE, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                value = Bytes::copy_from_slice(raw);
            }
            (FIELD_INSERT_TIME_MS, WIRE_VARINT) => {
                let raw = get_uvarint(&mut buf).map_err(|e| fail(e.to_string()))?;
                insert_time = DateTime::from_timestamp_millis(raw as i64);
            }
            // Unknown field from a newer writer: skip by wire type
            _ => skip_field(&mut buf, wire).map_err(|e| fail(e.to_string()))?,
        }
    }

    let topic = topic.ok_or_else(|| fail("topic field is missing".to_string()))?;

    let message = OutboxMessage {
        topic,
        key,
        partition,
        timestamp,
        headers,
        value,
        shard: None,
    };
    Ok((message, insert_time))
}

fn parse_header(storage_id: i64, data: &[u8]) -> Result<MessageHeader> {
    let fail = |reason: String| OutboxError::decode(storage_id, reason);

    let mut name: Option<String> = None;
    let mut value = Bytes::new();
    let mut buf = data;
    while !buf.is_empty() {
        let tag = get_uvarint(&mut buf).map_err(|e| fail(e.to_string()))?;
        let field = tag >> 3;
        let wire = tag & 0x7;
        match (field, wire) {
            (HEADER_FIELD_NAME, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                let parsed = String::from_utf8(raw.to_vec())
                    .map_err(|_| fail("header name is not valid UTF-8".to_string()))?;
                name = Some(parsed);
            }
            (HEADER_FIELD_VALUE, WIRE_LEN) => {
                let raw = get_len_delimited(&mut buf).map_err(|e| fail(e.to_string()))?;
                value = Bytes::copy_from_slice(raw);
            }
            _ => skip_field(&mut buf, wire).map_err(|e| fail(e.to_string()))?,
        }
    }

    let name = name.ok_or_else(|| fail("header name field is missing".to_string()))?;
    Ok(MessageHeader { name, value })
}

fn put_varint_field(buf: &mut BytesMut, field: u64, value: u64) {
    put_uvarint(buf, field << 3 | WIRE_VARINT);
    put_uvarint(buf, value);
}

fn put_len_field(buf: &mut BytesMut, field: u64, data: &[u8]) {
    put_uvarint(buf, field << 3 | WIRE_LEN);
    put_uvarint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn get_uvarint(buf: &mut &[u8]) -> std::result::Result<u64, &'static str> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let (&byte, rest) = buf.split_first().ok_or("varint is truncated")?;
        *buf = rest;
        if shift == 63 && byte > 1 {
            return Err("varint overflows 64 bits");
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err("varint is too long");
        }
    }
}

fn get_len_delimited<'a>(buf: &mut &'a [u8]) -> std::result::Result<&'a [u8], &'static str> {
    let len = get_uvarint(buf)? as usize;
    if buf.len() < len {
        return Err("length-delimited field is truncated");
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Ok(data)
}

fn skip_field(buf: &mut &[u8], wire: u64) -> std::result::Result<(), &'static str> {
    match wire {
        WIRE_VARINT => {
            get_uvarint(buf)?;
        }
        WIRE_FIXED64 => {
            if buf.len() < 8 {
                return Err("fixed64 field is truncated");
            }
            *buf = &buf[8..];
        }
        WIRE_LEN => {
            get_len_delimited(buf)?;
        }
        WIRE_FIXED32 => {
            if buf.len() < 4 {
                return Err("fixed32 field is truncated");
            }
            *buf = &buf[4..];
        }
        _ => return Err("unsupported wire type"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::RngCore;

    fn no_compression() -> CompressionConfig {
        CompressionConfig {
            algorithm: CompressionAlgorithm::None,
            min_size: 0,
        }
    }

    fn compressible_value(len: usize) -> Vec<u8> {
        b"0123456789abcdef".iter().copied().cycle().take(len).collect()
    }

    #[test]
    fn test_round_trip_minimal() {
        let msg = OutboxMessage::new("orders", "payload");
        let encoded = encode(&msg, &no_compression()).unwrap();
        let decoded = decode(1, &encoded.blob).unwrap();

        assert_eq!(decoded.message, msg);
        assert_eq!(decoded.version, CODEC_VERSION);
        assert!(decoded.insert_time.is_some());
    }

    #[test]
    fn test_round_trip_all_fields() {
        let timestamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let msg = OutboxMessage::new("orders", compressible_value(512))
            .with_key("order-42")
            .with_partition(7)
            .with_timestamp(timestamp)
            .add_header("trace-id", "abc-123")
            .add_header("source", "billing");

        let config = CompressionConfig::default();
        let encoded = encode(&msg, &config).unwrap();
        assert_eq!(encoded.algorithm, CompressionAlgorithm::Snappy);
        assert!(encoded.stored_len() < encoded.uncompressed_len);
        assert!(encoded.compression_ratio().unwrap() < 1.0);

        let decoded = decode(1, &encoded.blob).unwrap();
        assert_eq!(decoded.message, msg);
        // Header order survives the round trip
        assert_eq!(decoded.message.headers[0].name, "trace-id");
        assert_eq!(decoded.message.headers[1].name, "source");
    }

    #[test]
    fn test_shard_override_is_not_stored() {
        let msg = OutboxMessage::new("orders", "payload").with_shard(3);
        let encoded = encode(&msg, &no_compression()).unwrap();
        let decoded = decode(1, &encoded.blob).unwrap();
        assert_eq!(decoded.message.shard, None);
    }

    #[test]
    fn test_round_trip_each_algorithm() {
        let msg = OutboxMessage::new("orders", compressible_value(2048));
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
            CompressionAlgorithm::Zstd,
        ] {
            let config = CompressionConfig {
                algorithm,
                min_size: 128,
            };
            let encoded = encode(&msg, &config).unwrap();
            assert_eq!(encoded.algorithm, algorithm, "marker for {}", algorithm);
            let decoded = decode(1, &encoded.blob).unwrap();
            assert_eq!(decoded.message, msg, "round trip for {}", algorithm);
        }
    }

    #[test]
    fn test_small_payload_stays_uncompressed() {
        let msg = OutboxMessage::new("t", "tiny");
        let encoded = encode(&msg, &CompressionConfig::default()).unwrap();
        assert_eq!(encoded.algorithm, CompressionAlgorithm::None);
        assert!(encoded.compression_ratio().is_none());
        assert_eq!(encoded.blob[1], 0);
    }

    #[test]
    fn test_incompressible_payload_falls_back_to_raw() {
        let mut value = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut value);
        let msg = OutboxMessage::new("t", value);

        let encoded = encode(&msg, &CompressionConfig::default()).unwrap();
        assert_eq!(encoded.algorithm, CompressionAlgorithm::None);
        // Compression was attempted but did not win
        assert!(encoded.compression_ratio().unwrap() >= 1.0);

        let decoded = decode(1, &encoded.blob).unwrap();
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_empty_value_round_trips() {
        let msg = OutboxMessage::new("t", Bytes::new());
        let encoded = encode(&msg, &no_compression()).unwrap();
        let decoded = decode(1, &encoded.blob).unwrap();
        assert_eq!(decoded.message.value, Bytes::new());
    }

    #[test]
    fn test_negative_partition_rejected_at_encode() {
        let msg = OutboxMessage::new("t", "v").with_partition(-1);
        let err = encode(&msg, &no_compression()).unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
    }

    #[test]
    fn test_older_version_accepted() {
        let msg = OutboxMessage::new("orders", "payload");
        let encoded = encode(&msg, &no_compression()).unwrap();
        let mut blob = encoded.blob.to_vec();
        blob[0] = 1;

        let decoded = decode(1, &blob).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let msg = OutboxMessage::new("t", "v");
        let encoded = encode(&msg, &no_compression()).unwrap();

        for bad_version in [0u8, CODEC_VERSION + 1, 200] {
            let mut blob = encoded.blob.to_vec();
            blob[0] = bad_version;
            let err = decode(7, &blob).unwrap_err();
            match err {
                OutboxError::Decode { storage_id, reason } => {
                    assert_eq!(storage_id, 7);
                    assert!(reason.contains("version"));
                }
                other => panic!("expected decode error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_marker_rejected() {
        let msg = OutboxMessage::new("t", "v");
        let encoded = encode(&msg, &no_compression()).unwrap();
        let mut blob = encoded.blob.to_vec();
        blob[1] = 9;
        let err = decode(1, &blob).unwrap_err();
        assert!(err.to_string().contains("marker"));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let msg = OutboxMessage::new("orders", compressible_value(256));
        let encoded = encode(&msg, &no_compression()).unwrap();

        assert!(decode(1, &[]).is_err());
        assert!(decode(1, &encoded.blob[..2]).is_err());
        assert!(decode(1, &encoded.blob[..encoded.blob.len() - 5]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let msg = OutboxMessage::new("t", "v");
        let encoded = encode(&msg, &no_compression()).unwrap();
        let mut blob = encoded.blob.to_vec();
        // Bump the declared uncompressed length without adding bytes
        blob[2] = blob[2].wrapping_add(1);
        assert!(decode(1, &blob).is_err());
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let msg = OutboxMessage::new("orders", "payload").with_key("k");
        let encoded = encode(&msg, &no_compression()).unwrap();

        // Re-frame the payload with two extra fields a future writer
        // might add: a varint field 14 and a length-delimited field 15.
        let payload_start = 3;
        let mut payload = encoded.blob[payload_start..].to_vec();
        let mut extra = BytesMut::new();
        put_varint_field(&mut extra, 14, 42);
        put_len_field(&mut extra, 15, b"future data");
        payload.extend_from_slice(&extra);

        let mut blob = BytesMut::new();
        blob.put_u8(CODEC_VERSION);
        blob.put_u8(0);
        put_uvarint(&mut blob, payload.len() as u64);
        blob.put_slice(&payload);

        let decoded = decode(1, &blob).unwrap();
        assert_eq!(decoded.message, msg);
    }

    #[test]
    fn test_missing_topic_rejected() {
        // Payload with only a value field
        let mut payload = BytesMut::new();
        put_len_field(&mut payload, FIELD_VALUE, b"v");

        let mut blob = BytesMut::new();
        blob.put_u8(CODEC_VERSION);
        blob.put_u8(0);
        put_uvarint(&mut blob, payload.len() as u64);
        blob.put_slice(&payload);

        let err = decode(3, &blob).unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_varint_helpers() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, value);
            let mut slice = &buf[..];
            assert_eq!(get_uvarint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }

        // Truncated continuation byte
        let mut slice: &[u8] = &[0x80];
        assert!(get_uvarint(&mut slice).is_err());

        // Eleven continuation bytes can never be a valid u64
        let mut slice: &[u8] = &[0xFF; 11];
        assert!(get_uvarint(&mut slice).is_err());
    }
}
