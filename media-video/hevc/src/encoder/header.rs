//! Accounting for application packed headers
//!
//! Headers are handed to the PAK as raw insert objects. The BRC kernels need to know how many bits
//! they take up after emulation prevention, which is measured here.

use crate::encoder::{
    config::{PackedNalUnit, PackedSliceHeader},
    hw::{EndMarker, InsertObject},
};
use bytes::Bytes;

/// Bytes of the NAL unit header following the start code
const NAL_HEADER_BYTES: u32 = 2;

/// Largest payload a single insert object can carry (12 bit dword length field)
pub const MAX_INSERT_CHUNK_BYTES: usize = ((2 << 11) - 1) * 4;

/// Offset of the first byte after the start code of `buf`
///
/// Counts the leading zero bytes up to the `0x01` byte. A malformed start code ends the scan early,
/// so the result stays reasonable.
pub fn find_start_code_offset(buf: &[u8]) -> u32 {
    let count = buf.iter().take_while(|&&b| b == 0x00).count();

    count as u32 + 1
}

/// Count the emulation prevention bytes the hardware will insert into `payload`
fn count_emulation_bytes(payload: &[u8]) -> u32 {
    let mut zero_count = 0;
    let mut inserted = 0;

    for &byte in payload {
        if zero_count == 3 && byte & 0xFC == 0 {
            zero_count = 0;
            inserted += 1;
        }

        if byte == 0x00 {
            zero_count += 1;
        } else {
            zero_count = 0;
        }
    }

    inserted
}

/// Number of bits the packed headers take up in the bitstream, excluding the first start code and
/// NAL header
pub fn compute_header_bit_length(nal_units: &[PackedNalUnit], emulation_insertion: bool) -> u32 {
    let non_empty = nal_units.iter().filter(|nal| !nal.data.is_empty());

    let Some(first) = non_empty.clone().next() else {
        return 0;
    };

    let header_begin = find_start_code_offset(&first.data) + NAL_HEADER_BYTES;

    let mut accum: u32 = 0;
    let mut emulation_bytes = 0;

    for nal in non_empty {
        if emulation_insertion {
            let offset = (find_start_code_offset(&nal.data) as usize).min(nal.data.len());
            emulation_bytes += count_emulation_bytes(&nal.data[offset..]);
        }

        accum += nal.data.len() as u32;
    }

    accum += emulation_bytes;

    let header_begin = header_begin.min(accum);

    (accum - header_begin) * 8
}

fn insert(payload: Bytes, bit_size: u32) -> InsertObject {
    InsertObject {
        payload,
        bit_size,
        emulation_bytes: false,
        skip_emulation_check_count: 0,
        last_header: false,
        end_of_slice: false,
        end_marker: None,
    }
}

/// Split a NAL unit into insert objects no larger than [`MAX_INSERT_CHUNK_BYTES`]
pub fn nal_unit_inserts(nal: &PackedNalUnit) -> impl Iterator<Item = InsertObject> + '_ {
    (0..nal.data.len())
        .step_by(MAX_INSERT_CHUNK_BYTES)
        .map(move |start| {
            let end = (start + MAX_INSERT_CHUNK_BYTES).min(nal.data.len());
            let chunk = nal.data.slice(start..end);
            let bit_size = chunk.len() as u32 * 8;

            InsertObject {
                emulation_bytes: nal.insert_emulation_bytes,
                skip_emulation_check_count: nal.skip_emulation_check_count,
                ..insert(chunk, bit_size)
            }
        })
}

/// Insert object of an application packed slice header, the last header before the slice data
pub fn slice_header_insert(header: &PackedSliceHeader) -> InsertObject {
    InsertObject {
        emulation_bytes: true,
        skip_emulation_check_count: header.skip_emulation_check_count,
        last_header: true,
        ..insert(header.data.clone(), header.bit_length)
    }
}

/// Insert object of an end of sequence or end of bitstream NAL unit, written after the last slice
pub(crate) fn end_marker_insert(marker: EndMarker, nal: Bytes) -> InsertObject {
    let bit_size = nal.len() as u32 * 8;

    InsertObject {
        last_header: true,
        end_of_slice: true,
        end_marker: Some(marker),
        ..insert(nal, bit_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(data: &'static [u8]) -> PackedNalUnit {
        PackedNalUnit {
            data: Bytes::from_static(data),
            insert_emulation_bytes: true,
            skip_emulation_check_count: 4,
        }
    }

    #[test]
    fn start_code_offset() {
        assert_eq!(find_start_code_offset(&[0, 0, 0, 1, 0x40]), 4);
        assert_eq!(find_start_code_offset(&[0, 0, 1, 0x40]), 3);
        // Malformed start code
        assert_eq!(find_start_code_offset(&[0, 0x40, 1]), 2);
        assert_eq!(find_start_code_offset(&[]), 1);
    }

    #[test]
    fn no_nal_units() {
        assert_eq!(compute_header_bit_length(&[], true), 0);
        assert_eq!(compute_header_bit_length(&[nal(&[])], true), 0);
    }

    #[test]
    fn short_zero_runs_insert_nothing() {
        let vps = nal(&[0, 0, 0, 1, 0x40, 0x01, 0x0C, 0x00, 0x00, 0x03, 0xFF]);
        // 11 bytes minus 4 start code bytes and 2 NAL header bytes
        assert_eq!(compute_header_bit_length(&[vps], true), 5 * 8);
    }

    #[test]
    fn counts_emulation_bytes() {
        let sps = nal(&[0, 0, 1, 0x42, 0x01, 0x00, 0x00, 0x00, 0x01, 0x80]);
        let pps = nal(&[0, 0, 1, 0x44, 0x01, 0xC0]);

        // Both NAL units plus one emulation byte, minus the first start code and NAL header
        assert_eq!(compute_header_bit_length(&[sps.clone(), pps.clone()], true), (16 + 1 - 5) * 8);
        assert_eq!(compute_header_bit_length(&[sps, pps], false), (16 - 5) * 8);
    }

    #[test]
    fn header_begin_is_clamped() {
        let broken = nal(&[0, 0, 0]);
        assert_eq!(compute_header_bit_length(&[broken], false), 0);
    }

    #[test]
    fn large_nal_units_are_chunked() {
        let data: &'static [u8] =
            Box::leak(vec![0xAB; MAX_INSERT_CHUNK_BYTES * 2 + 10].into_boxed_slice());
        let inserts: Vec<_> = nal_unit_inserts(&nal(data)).collect();

        assert_eq!(inserts.len(), 3);
        assert_eq!(inserts[0].bit_size, MAX_INSERT_CHUNK_BYTES as u32 * 8);
        assert_eq!(inserts[2].bit_size, 80);
        assert!(inserts.iter().all(|i| i.emulation_bytes && i.skip_emulation_check_count == 4));
        assert!(inserts.iter().all(|i| !i.last_header));
    }

    #[test]
    fn slice_header_is_last_header() {
        let header = PackedSliceHeader {
            data: Bytes::from_static(&[0x26, 0x01, 0xAF]),
            bit_length: 21,
            skip_emulation_check_count: 2,
        };

        let insert = slice_header_insert(&header);
        assert!(insert.last_header);
        assert!(insert.emulation_bytes);
        assert_eq!(insert.bit_size, 21);
        assert_eq!(insert.skip_emulation_check_count, 2);
    }

    #[test]
    fn end_marker_has_no_emulation() {
        let insert = end_marker_insert(
            EndMarker::EndOfStream,
            Bytes::from_static(&[0, 0, 0, 1, 74, 1]),
        );

        assert_eq!(insert.bit_size, 48);
        assert!(!insert.emulation_bytes);
        assert!(insert.end_of_slice);
        assert_eq!(insert.end_marker, Some(EndMarker::EndOfStream));
    }
}
