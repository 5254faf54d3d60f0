//! Structure export: parent/child metadata tree records

use crate::error::{Error, Result};
use crate::STRUCTURE_HEADER_LEN;
use bytes::{Buf, BufMut, BytesMut};

/// One node of a parameter, result, or input hierarchy
///
/// Records arrive in the store's scan order. Only the IDs establish the
/// parent/child relation; a parent is not guaranteed to precede its children.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructureEntry {
    pub parent_id: u32,
    pub child_id: u32,
    pub name: String,
    pub unit: String,
}

impl StructureEntry {
    pub fn new(
        parent_id: u32,
        child_id: u32,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            parent_id,
            child_id,
            name: name.into(),
            unit: unit.into(),
        }
    }

    /// Encoded size of this record in bytes
    pub fn encoded_len(&self) -> usize {
        STRUCTURE_HEADER_LEN + self.name.len() + self.unit.len()
    }
}

/// Decode a structure export buffer into its records
///
/// The cursor must land exactly on the end of the buffer after the last
/// record; a buffer cut inside a header or a text run is rejected.
pub fn decode_structure(bytes: &[u8]) -> Result<Vec<StructureEntry>> {
    let total = bytes.len();
    let mut buf = bytes;
    let mut entries = Vec::new();

    while buf.has_remaining() {
        let offset = total - buf.remaining();
        if buf.remaining() < STRUCTURE_HEADER_LEN {
            return Err(Error::truncated(
                "structure header",
                offset,
                STRUCTURE_HEADER_LEN,
                buf.remaining(),
            ));
        }

        let parent_id = buf.get_u32_le();
        let child_id = buf.get_u32_le();
        let name_len = buf.get_u32_le() as usize;
        let unit_len = buf.get_u32_le() as usize;

        let name = read_text(&mut buf, name_len, "name", total)?;
        let unit = read_text(&mut buf, unit_len, "unit", total)?;

        entries.push(StructureEntry {
            parent_id,
            child_id,
            name,
            unit,
        });
    }

    Ok(entries)
}

fn read_text(buf: &mut &[u8], len: usize, field: &'static str, total: usize) -> Result<String> {
    let offset = total - buf.remaining();
    if buf.remaining() < len {
        return Err(Error::truncated(field, offset, len, buf.remaining()));
    }
    let (raw, rest) = buf.split_at(len);
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::InvalidText { field, offset })?
        .to_string();
    *buf = rest;
    Ok(text)
}

/// Encode records into the structure export format
pub fn encode_structure(entries: &[StructureEntry]) -> Vec<u8> {
    let capacity = entries.iter().map(StructureEntry::encoded_len).sum();
    let mut out = BytesMut::with_capacity(capacity);

    for entry in entries {
        out.put_u32_le(entry.parent_id);
        out.put_u32_le(entry.child_id);
        out.put_u32_le(entry.name.len() as u32);
        out.put_u32_le(entry.unit.len() as u32);
        out.put_slice(entry.name.as_bytes());
        out.put_slice(entry.unit.as_bytes());
    }

    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Vec<StructureEntry> {
        vec![
            StructureEntry::new(0, 1, "Catchment", ""),
            StructureEntry::new(1, 2, "Precipitation", "mm/day"),
            StructureEntry::new(1, 3, "Évapotranspiration", "mm/day"),
            StructureEntry::new(3, 4, "", ""),
        ]
    }

    #[test]
    fn test_round_trip() {
        let entries = sample_tree();
        let bytes = encode_structure(&entries);
        assert_eq!(decode_structure(&bytes).unwrap(), entries);
    }

    /// Text of exactly `len` bytes mixing one- and two-byte characters
    fn text_of_len(len: usize, seed: usize) -> String {
        let mut text = String::with_capacity(len);
        let mut i = seed;
        while text.len() < len {
            if len - text.len() >= 2 && i % 3 == 0 {
                text.push('é');
            } else {
                text.push(char::from(b'a' + (i % 26) as u8));
            }
            i += 1;
        }
        text
    }

    #[test]
    fn test_round_trip_across_text_lengths() {
        for name_len in [0, 1, 2, 3, 15, 16, 17, 255, 256, 4096] {
            for unit_len in [0, 1, 5, 64] {
                let entries: Vec<StructureEntry> = (0..3u32)
                    .map(|i| {
                        StructureEntry::new(
                            i,
                            i + 1,
                            text_of_len(name_len, i as usize),
                            text_of_len(unit_len, name_len + i as usize),
                        )
                    })
                    .collect();

                let bytes = encode_structure(&entries);
                let expected: usize = entries.iter().map(StructureEntry::encoded_len).sum();
                assert_eq!(bytes.len(), expected);
                assert_eq!(
                    decode_structure(&bytes).unwrap(),
                    entries,
                    "name {} unit {}",
                    name_len,
                    unit_len
                );
            }
        }
    }

    #[test]
    fn test_empty_buffer_is_empty_tree() {
        assert!(decode_structure(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_layout_is_little_endian_without_padding() {
        let bytes = encode_structure(&[StructureEntry::new(7, 9, "ab", "c")]);
        assert_eq!(
            bytes,
            vec![7, 0, 0, 0, 9, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_truncated_header_fails() {
        let bytes = encode_structure(&sample_tree());
        let err = decode_structure(&bytes[..8]).unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                what: "structure header",
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_mid_record_fails_at_every_cut() {
        let entries = sample_tree();
        let bytes = encode_structure(&entries);

        let mut boundaries = vec![0];
        for entry in &entries {
            boundaries.push(boundaries.last().unwrap() + entry.encoded_len());
        }

        for cut in 1..bytes.len() {
            let result = decode_structure(&bytes[..cut]);
            if boundaries.contains(&cut) {
                assert!(result.is_ok(), "cut {} lands on a record boundary", cut);
            } else {
                assert!(result.is_err(), "cut {} must not decode", cut);
            }
        }
    }

    #[test]
    fn test_declared_length_past_end_fails() {
        let mut bytes = encode_structure(&[StructureEntry::new(0, 1, "abc", "")]);
        bytes[8] = 200;
        let err = decode_structure(&bytes).unwrap_err();
        assert!(matches!(err, Error::Truncated { what: "name", .. }));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = encode_structure(&[StructureEntry::new(0, 1, "ab", "")]);
        bytes[16] = 0xff;
        let err = decode_structure(&bytes).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidText {
                field: "name",
                offset: 16
            }
        );
    }
}
