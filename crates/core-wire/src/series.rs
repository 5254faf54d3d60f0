//! Values export: batches of numeric time series

use crate::error::{Error, Result};
use crate::SERIES_HEADER_LEN;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

/// One time series; NaN marks a missing sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub values: Vec<f64>,
}

impl Series {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of missing (NaN) samples
    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_nan()).count()
    }

    /// Sample-wise equality that treats two NaNs as equal and compares
    /// finite values bit for bit
    pub fn same_samples(&self, other: &Series) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits())
    }
}

/// A set of series sharing one start date (seconds since the Unix epoch)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesBatch {
    pub start_date: i64,
    pub series: Vec<Series>,
}

impl SeriesBatch {
    pub fn new(start_date: i64, series: Vec<Series>) -> Self {
        Self { start_date, series }
    }

    /// Start date as a UTC timestamp, if it is representable
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.start_date, 0)
    }

    /// NaN-aware equality across every series
    pub fn same_samples(&self, other: &SeriesBatch) -> bool {
        self.start_date == other.start_date
            && self.series.len() == other.series.len()
            && self
                .series
                .iter()
                .zip(&other.series)
                .all(|(a, b)| a.same_samples(b))
    }

    /// Encoded size of this batch in bytes
    pub fn encoded_len(&self) -> usize {
        SERIES_HEADER_LEN + self.series.iter().map(|s| 8 + s.len() * 8).sum::<usize>()
    }
}

/// Decode a values export holding exactly `expected_count` series
///
/// The header's batch count is checked against `expected_count` before any
/// series is read, so a mismatch never yields a partial batch.
pub fn decode_series_batch(bytes: &[u8], expected_count: usize) -> Result<SeriesBatch> {
    let total = bytes.len();
    let mut buf = bytes;

    if buf.remaining() < SERIES_HEADER_LEN {
        return Err(Error::truncated(
            "series header",
            0,
            SERIES_HEADER_LEN,
            buf.remaining(),
        ));
    }

    let batch_count = buf.get_u64_le();
    let start_date = buf.get_i64_le();

    if batch_count != expected_count as u64 {
        return Err(Error::CountMismatch {
            expected: expected_count,
            found: batch_count,
        });
    }

    let mut series = Vec::with_capacity(expected_count);
    for _ in 0..expected_count {
        let offset = total - buf.remaining();
        if buf.remaining() < 8 {
            return Err(Error::truncated("element count", offset, 8, buf.remaining()));
        }
        let element_count = buf.get_u64_le();

        let offset = total - buf.remaining();
        let needed = usize::try_from(element_count)
            .ok()
            .and_then(|n| n.checked_mul(8))
            .unwrap_or(usize::MAX);
        if buf.remaining() < needed {
            return Err(Error::truncated("series values", offset, needed, buf.remaining()));
        }

        let mut values = Vec::with_capacity(needed / 8);
        for _ in 0..needed / 8 {
            values.push(buf.get_f64_le());
        }
        series.push(Series { values });
    }

    if buf.has_remaining() {
        return Err(Error::TrailingBytes {
            offset: total - buf.remaining(),
            count: buf.remaining(),
        });
    }

    Ok(SeriesBatch { start_date, series })
}

/// Encode a batch into the values export format
pub fn encode_series_batch(batch: &SeriesBatch) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(batch.encoded_len());
    out.put_u64_le(batch.series.len() as u64);
    out.put_i64_le(batch.start_date);

    for series in &batch.series {
        out.put_u64_le(series.values.len() as u64);
        for value in &series.values {
            out.put_f64_le(*value);
        }
    }

    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> SeriesBatch {
        SeriesBatch::new(
            946_684_800,
            vec![
                Series::new(vec![1.5, f64::NAN, -0.0, 3.25e10]),
                Series::new(vec![]),
                Series::new(vec![f64::NAN, f64::NAN]),
            ],
        )
    }

    #[test]
    fn test_round_trip_preserves_nan_positions() {
        let batch = sample_batch();
        let bytes = encode_series_batch(&batch);
        let decoded = decode_series_batch(&bytes, 3).unwrap();
        assert!(decoded.same_samples(&batch));
        assert_eq!(decoded.series[0].missing_count(), 1);
        assert_eq!(decoded.series[2].missing_count(), 2);
        assert_eq!(decoded.series[0].values[2].to_bits(), (-0.0f64).to_bits());
    }

    /// Deterministic sample stream covering NaN, infinities, signed zero,
    /// subnormals and arbitrary bit patterns
    fn samples(len: usize, seed: u64) -> Vec<f64> {
        const SPECIAL: [f64; 6] = [
            f64::NAN,
            f64::INFINITY,
            f64::NEG_INFINITY,
            -0.0,
            f64::MIN_POSITIVE / 2.0,
            f64::MAX,
        ];
        let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (0..len)
            .map(|i| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                if i % 5 == 0 {
                    SPECIAL[(state >> 61) as usize % SPECIAL.len()]
                } else {
                    f64::from_bits(state)
                }
            })
            .collect()
    }

    #[test]
    fn test_round_trip_across_batch_shapes() {
        let lengths = [0, 1, 2, 7, 64, 1000];
        let start_dates = [i64::MIN, -1, 0, 1_104_537_600, i64::MAX];
        for count in 0..=6usize {
            for (shift, start_date) in start_dates.iter().enumerate() {
                let series = (0..count)
                    .map(|i| {
                        let len = lengths[(i + shift) % lengths.len()];
                        Series::new(samples(len, (count * 31 + i) as u64))
                    })
                    .collect();
                let batch = SeriesBatch::new(*start_date, series);

                let bytes = encode_series_batch(&batch);
                assert_eq!(bytes.len(), batch.encoded_len());

                let decoded = decode_series_batch(&bytes, count).unwrap();
                assert_eq!(decoded.start_date, *start_date);
                assert_eq!(decoded.series.len(), count);
                for (got, want) in decoded.series.iter().zip(&batch.series) {
                    let got: Vec<u64> = got.values.iter().map(|v| v.to_bits()).collect();
                    let want: Vec<u64> = want.values.iter().map(|v| v.to_bits()).collect();
                    assert_eq!(got, want, "count {} start {}", count, start_date);
                }
            }
        }
    }

    #[test]
    fn test_empty_batch() {
        let batch = SeriesBatch::new(-86_400, vec![]);
        let bytes = encode_series_batch(&batch);
        assert_eq!(bytes.len(), SERIES_HEADER_LEN);
        let decoded = decode_series_batch(&bytes, 0).unwrap();
        assert_eq!(decoded.start_date, -86_400);
        assert!(decoded.series.is_empty());
    }

    #[test]
    fn test_count_mismatch_fails_before_decoding() {
        let bytes = encode_series_batch(&sample_batch());
        for expected in [0, 1, 2, 4, 100] {
            let err = decode_series_batch(&bytes, expected).unwrap_err();
            assert_eq!(
                err,
                Error::CountMismatch {
                    expected,
                    found: 3
                }
            );
        }
    }

    #[test]
    fn test_count_mismatch_checked_even_when_body_truncated() {
        let bytes = encode_series_batch(&sample_batch());
        let err = decode_series_batch(&bytes[..SERIES_HEADER_LEN], 2).unwrap_err();
        assert!(matches!(err, Error::CountMismatch { .. }));
    }

    #[test]
    fn test_truncated_values_fail() {
        let bytes = encode_series_batch(&sample_batch());
        let err = decode_series_batch(&bytes[..bytes.len() - 4], 3).unwrap_err();
        assert!(matches!(err, Error::Truncated { what: "series values", .. }));
    }

    #[test]
    fn test_short_header_fails() {
        let err = decode_series_batch(&[0u8; 9], 0).unwrap_err();
        assert!(matches!(err, Error::Truncated { what: "series header", .. }));
    }

    #[test]
    fn test_huge_element_count_does_not_allocate() {
        let mut out = BytesMut::new();
        out.put_u64_le(1);
        out.put_i64_le(0);
        out.put_u64_le(u64::MAX);
        let err = decode_series_batch(&out, 1).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_series_batch(&sample_batch());
        bytes.extend_from_slice(&[0, 0, 0]);
        let err = decode_series_batch(&bytes, 3).unwrap_err();
        assert!(matches!(err, Error::TrailingBytes { count: 3, .. }));
    }

    #[test]
    fn test_start_datetime() {
        let batch = SeriesBatch::new(946_684_800, vec![]);
        let dt = batch.start_datetime().unwrap();
        assert_eq!(dt.to_rfc3339(), "2000-01-01T00:00:00+00:00");
    }
}
