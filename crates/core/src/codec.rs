//! Wire codec: a framed, versioned binary layout for events.
//!
//! The event type sits right behind the format version so routers can read
//! it without decoding the whole frame ([`peek_event_type`]). Body and
//! metadata travel in the canonical value encoding (see [`crate::value`]).
//!
//! Timestamps are carried as whole seconds; sub-second precision is lost on
//! the wire. Callers who need milliseconds must put them in the body or
//! metadata themselves.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;

use crate::error::CodecError;
use crate::event::{AggregateRef, Event};
use crate::id::{AGGREGATE_ID_LEN, AggregateId, EventId};
use crate::value::{SerializerRegistry, Value};

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Encodes and decodes events against a serializer registry.
#[derive(Clone)]
pub struct EventCodec {
    registry: Arc<SerializerRegistry>,
}

impl EventCodec {
    /// Codec with only the built-in `bytes`/`time` tags registered.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(SerializerRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<SerializerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    pub fn encode(&self, event: &Event) -> Result<Bytes, CodecError> {
        let body = match &event.body {
            None => None,
            Some(value) => {
                let canonical = self.registry.encode(value)?;
                Some(serde_json::to_vec(&canonical).map_err(|e| CodecError::Invalid(e.to_string()))?)
            }
        };

        let meta_canonical = self.registry.encode(&Value::Map(event.meta.clone()))?;
        let meta = serde_json::to_vec(&meta_canonical).map_err(|e| CodecError::Invalid(e.to_string()))?;

        let id = event.id.as_bytes();

        let mut buf = BytesMut::with_capacity(
            1 + 4 + 1 + id.len() + AGGREGATE_ID_LEN + 4 + 4 + 5 + body.as_ref().map_or(0, Vec::len) + 4 + meta.len(),
        );
        buf.put_u8(FRAME_VERSION);
        buf.put_u32(event.event_type);
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_slice(event.aggregate.id.as_bytes());
        buf.put_u32(event.aggregate.version);
        buf.put_u32(event.timestamp.timestamp() as u32);
        match body {
            None => buf.put_u8(0),
            Some(body) => {
                buf.put_u8(1);
                buf.put_u32(body.len() as u32);
                buf.put_slice(&body);
            }
        }
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);

        Ok(buf.freeze())
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Event, CodecError> {
        let mut buf = frame;

        let version = take_u8(&mut buf)?;
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let event_type = take_u32(&mut buf)?;

        let id_len = take_u8(&mut buf)? as usize;
        let id = EventId::from_slice(take_slice(&mut buf, id_len)?)
            .map_err(|e| CodecError::Invalid(e.to_string()))?;

        let aggregate_id = AggregateId::from_slice(take_slice(&mut buf, AGGREGATE_ID_LEN)?)
            .map_err(|e| CodecError::Invalid(e.to_string()))?;
        let aggregate_version = take_u32(&mut buf)?;

        let secs = take_u32(&mut buf)?;
        let timestamp = DateTime::from_timestamp(i64::from(secs), 0)
            .ok_or_else(|| CodecError::Invalid(format!("timestamp out of range: {secs}")))?;

        let body = match take_u8(&mut buf)? {
            0 => None,
            1 => {
                let len = take_u32(&mut buf)? as usize;
                let raw: serde_json::Value = serde_json::from_slice(take_slice(&mut buf, len)?)
                    .map_err(|e| CodecError::Invalid(format!("body: {e}")))?;
                Some(self.registry.decode(&raw)?)
            }
            flag => return Err(CodecError::Invalid(format!("invalid body flag: {flag}"))),
        };

        let meta_len = take_u32(&mut buf)? as usize;
        let raw: serde_json::Value = serde_json::from_slice(take_slice(&mut buf, meta_len)?)
            .map_err(|e| CodecError::Invalid(format!("meta: {e}")))?;
        let meta = match self.registry.decode(&raw)? {
            Value::Map(map) => map,
            other => return Err(CodecError::Invalid(format!("meta must be a map, got {other:?}"))),
        };

        if buf.has_remaining() {
            return Err(CodecError::Invalid(format!("{} trailing bytes after frame", buf.remaining())));
        }

        Ok(Event {
            id,
            event_type,
            aggregate: AggregateRef::new(aggregate_id, aggregate_version),
            body,
            meta,
            timestamp,
        })
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the event type out of a frame header without a full decode.
pub fn peek_event_type(frame: &[u8]) -> Result<u32, CodecError> {
    let mut buf = frame;

    let version = take_u8(&mut buf)?;
    if version != FRAME_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    take_u32(&mut buf)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32())
}

fn take_slice<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn sample_event(event_type: u32, body: Option<Value>) -> Event {
        let mut meta = BTreeMap::new();
        meta.insert("__ctx".to_string(), Value::String("tenant-1".to_string()));
        Event {
            id: EventId::generate(),
            event_type,
            aggregate: AggregateRef::new(AggregateId::from_bytes([7; AGGREGATE_ID_LEN]), 3),
            body,
            meta,
            // Whole seconds: the wire drops sub-second precision.
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn round_trips_body_and_meta() {
        let codec = EventCodec::new();
        let event = sample_event(
            42,
            Some(Value::Map(BTreeMap::from([
                ("balance".to_string(), Value::Int(10)),
                ("blob".to_string(), Value::Bytes(vec![0, 255, 7])),
            ]))),
        );

        let frame = codec.encode(&event).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), event);
    }

    #[test]
    fn round_trips_null_body() {
        let codec = EventCodec::new();
        let event = sample_event(1, None);

        let frame = codec.encode(&event).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), event);
    }

    #[test]
    fn wire_timestamp_drops_sub_second_precision() {
        let codec = EventCodec::new();
        let mut event = sample_event(1, None);
        event.timestamp = DateTime::from_timestamp_millis(1_700_000_000_900).unwrap();

        let decoded = codec.decode(&codec.encode(&event).unwrap()).unwrap();
        assert_eq!(decoded.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(decoded.timestamp.timestamp_subsec_millis(), 0);
    }

    #[test]
    fn peeks_event_type_from_header_only() {
        let codec = EventCodec::new();
        let frame = codec.encode(&sample_event(9000, None)).unwrap();

        assert_eq!(peek_event_type(&frame).unwrap(), 9000);
        // The header alone is enough.
        assert_eq!(peek_event_type(&frame[..5]).unwrap(), 9000);
    }

    #[test]
    fn rejects_truncated_and_unversioned_frames() {
        let codec = EventCodec::new();
        let frame = codec.encode(&sample_event(1, None)).unwrap();

        assert_eq!(codec.decode(&frame[..frame.len() - 1]).unwrap_err(), CodecError::Truncated);
        assert_eq!(peek_event_type(&[]).unwrap_err(), CodecError::Truncated);

        let mut bad = frame.to_vec();
        bad[0] = 99;
        assert_eq!(codec.decode(&bad).unwrap_err(), CodecError::UnsupportedVersion(99));
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_primitive_bodies(
            event_type in any::<u32>(),
            n in any::<i64>(),
            s in ".*",
            blob in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let codec = EventCodec::new();
            let body = Value::Array(vec![
                Value::Int(n),
                Value::String(s),
                Value::Bytes(blob),
                Value::Null,
            ]);
            let event = sample_event(event_type, Some(body));

            let frame = codec.encode(&event).unwrap();
            prop_assert_eq!(codec.decode(&frame).unwrap(), event);
        }
    }
}
