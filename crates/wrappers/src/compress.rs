//! Deflate field transform.
//!
//! Stored form is a binary blob: `0x00 || serialised` when compression
//! was skipped or did not win, raw zlib output otherwise. Decoding
//! dispatches on the first byte; unknown leading bytes are either legacy
//! pre-wrapping data (`allow_raw`) or an error.

use std::io::Write as _;

use async_trait::async_trait;
use colstore_common::{Record, StoreError, Value, value};
use flate2::Compression;

use crate::wrapped::FieldTransform;

/// Payloads at or below this size are stored uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 200;

const PLAIN_MARKER: u8 = 0x00;
/// First byte of zlib output (CMF for the deflate method).
const ZLIB_MAGIC: u8 = 0x78;

pub struct Deflate {
    threshold: usize,
    allow_raw: bool,
}

impl Deflate {
    pub fn new() -> Self {
        Deflate {
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
            allow_raw: false,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Treat values with an unknown leading byte (or non-binary stored
    /// values) as data written before the wrapper existed and pass them
    /// through unchanged.
    pub fn with_allow_raw(mut self, allow_raw: bool) -> Self {
        self.allow_raw = allow_raw;
        self
    }
}

impl Default for Deflate {
    fn default() -> Self {
        Deflate::new()
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .and_then(|_| decoder.finish())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

#[async_trait]
impl FieldTransform for Deflate {
    type Context = ();

    async fn wrap_context(&self, _record: &Record) -> Result<(), StoreError> {
        Ok(())
    }

    async fn unwrap_context(&self, _record: &Record) -> Result<(), StoreError> {
        Ok(())
    }

    fn wrap(&self, _context: &(), plain: &Value) -> Result<Value, StoreError> {
        let serialised = value::to_bytes(plain)?;
        if serialised.len() > self.threshold {
            let compressed = deflate(&serialised)?;
            // Keep the compressed form only when it actually wins.
            if compressed.len() < serialised.len() + 1 {
                return Ok(Value::Binary(compressed.into()));
            }
        }
        let mut marked = Vec::with_capacity(serialised.len() + 1);
        marked.push(PLAIN_MARKER);
        marked.extend_from_slice(&serialised);
        Ok(Value::Binary(marked.into()))
    }

    fn unwrap(&self, _context: &(), stored: &Value) -> Result<Value, StoreError> {
        let Value::Binary(blob) = stored else {
            return if self.allow_raw {
                Ok(stored.clone())
            } else {
                Err(StoreError::Codec(
                    "unknown compression type (not a binary value)".to_string(),
                ))
            };
        };
        match blob.first() {
            Some(&ZLIB_MAGIC) => value::from_bytes(&inflate(blob)?),
            Some(&PLAIN_MARKER) => value::from_bytes(&blob[1..]),
            Some(_) if self.allow_raw => Ok(stored.clone()),
            Some(other) => Err(StoreError::Codec(format!(
                "unknown compression type 0x{other:02x}"
            ))),
            None if self.allow_raw => Ok(stored.clone()),
            None => Err(StoreError::Codec(
                "unknown compression type (empty payload)".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(transform: &Deflate, plain: &Value) -> Value {
        transform.wrap(&(), plain).unwrap()
    }

    fn unwrap(transform: &Deflate, stored: &Value) -> Value {
        transform.unwrap(&(), stored).unwrap()
    }

    #[test]
    fn round_trips_below_threshold() {
        let transform = Deflate::new();
        let plain = Value::String("small".to_string());
        let stored = wrap(&transform, &plain);
        let Value::Binary(blob) = &stored else {
            panic!("expected binary storage");
        };
        assert_eq!(blob[0], PLAIN_MARKER);
        // At most the serialised size plus the marker.
        assert!(blob.len() <= value::to_bytes(&plain).unwrap().len() + 1);
        assert_eq!(unwrap(&transform, &stored), plain);
    }

    #[test]
    fn compresses_repetitive_payloads() {
        let transform = Deflate::new();
        let plain = Value::String("0123456789abc".repeat(20));
        let serialised_len = value::to_bytes(&plain).unwrap().len();
        let stored = wrap(&transform, &plain);
        let Value::Binary(blob) = &stored else {
            panic!("expected binary storage");
        };
        assert_eq!(blob[0], ZLIB_MAGIC);
        assert!(blob.len() < serialised_len);
        assert_eq!(unwrap(&transform, &stored), plain);
    }

    #[test]
    fn incompressible_payloads_stay_marked() {
        let transform = Deflate::new().with_threshold(8);
        // High-entropy bytes do not deflate.
        let noise: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let plain = Value::Binary(noise.into());
        let stored = wrap(&transform, &plain);
        let Value::Binary(blob) = &stored else {
            panic!("expected binary storage");
        };
        assert!(blob.len() <= value::to_bytes(&plain).unwrap().len() + 1);
        assert_eq!(unwrap(&transform, &stored), plain);
    }

    #[test]
    fn threshold_gates_compression() {
        let transform = Deflate::new();
        // Repetitive but short: stays uncompressed.
        let short = Value::String("aaaaaaaaaaaa".to_string());
        let Value::Binary(blob) = wrap(&transform, &short) else {
            panic!()
        };
        assert_eq!(blob[0], PLAIN_MARKER);
    }

    #[test]
    fn unknown_marker_dispatch() {
        let strict = Deflate::new();
        let legacy = Value::Binary(vec![0x42, 1, 2, 3].into());
        assert!(matches!(
            strict.unwrap(&(), &legacy),
            Err(StoreError::Codec(_))
        ));

        let tolerant = Deflate::new().with_allow_raw(true);
        assert_eq!(unwrap(&tolerant, &legacy), legacy);
        // Non-binary legacy values pass through too.
        let plain_legacy = Value::String("old".to_string());
        assert_eq!(unwrap(&tolerant, &plain_legacy), plain_legacy);
        assert!(strict.unwrap(&(), &plain_legacy).is_err());
    }
}
