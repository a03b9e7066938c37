//! H.264 annex-B inspection.
//!
//! The recorder never decodes video. It only needs to know where a decoder
//! could start: an access unit that carries a sequence parameter set (SPS) is
//! a sync point, because everything after it can be decoded without earlier
//! data. The helpers here scan annex-B byte streams (start code delimited) for
//! NAL unit headers.

/// NAL unit types (5 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Anything else the recorder does not care about
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    pub fn is_sequence_header(&self) -> bool {
        matches!(self, NalUnitType::Sps)
    }
}

/// Location of one NAL unit inside an annex-B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalPosition {
    /// Offset of the start code that precedes the unit
    pub start_code_offset: usize,
    /// Offset of the NAL header byte
    pub header_offset: usize,
    pub nal_type: NalUnitType,
}

/// Iterate over every NAL unit header found in `data`.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = NalPosition> + '_ {
    let mut cursor = 0usize;
    std::iter::from_fn(move || {
        while cursor + 3 <= data.len() {
            let i = cursor;
            cursor += 1;

            if data[i] != 0 || data[i + 1] != 0 {
                continue;
            }

            let (code_len, start) = if data[i + 2] == 1 {
                (3, i)
            } else if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                (4, i)
            } else {
                continue;
            };

            let header_offset = start + code_len;
            if header_offset >= data.len() {
                return None;
            }

            cursor = header_offset + 1;
            return Some(NalPosition {
                start_code_offset: start,
                header_offset,
                nal_type: NalUnitType::from(data[header_offset]),
            });
        }
        None
    })
}

/// Offset of the first start code that introduces a sequence header.
pub fn first_sync_offset(data: &[u8]) -> Option<usize> {
    nal_units(data)
        .find(|nal| nal.nal_type.is_sequence_header())
        .map(|nal| nal.start_code_offset)
}

/// Whether an access unit can start a decodable stream.
pub fn is_sync_point(data: &[u8]) -> bool {
    first_sync_offset(data).is_some()
}

/// Whether an access unit contains an IDR slice.
pub fn contains_keyframe(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal.nal_type.is_keyframe())
}
