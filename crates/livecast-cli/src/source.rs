//! Access unit extraction from an Annex B H.264 file.

use bytes::Bytes;
use livecast_codec::nal::{self, NalUnit, NalUnitType};

/// One picture and the non-VCL units that precede it.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Annex B payload, access unit delimiters removed.
    pub data: Bytes,
    pub is_keyframe: bool,
}

fn is_slice(unit: &NalUnit) -> bool {
    matches!(
        unit.nal_type,
        NalUnitType::NonIdrSlice | NalUnitType::IdrSlice
    )
}

/// `first_mb_in_slice == 0`, coded as a single `1` bit in ue(v).
fn starts_picture(unit: &NalUnit) -> bool {
    unit.data.get(1).is_some_and(|b| b & 0x80 != 0)
}

fn finish(units: &mut Vec<NalUnit>, out: &mut Vec<AccessUnit>) {
    if !units.iter().any(is_slice) {
        return;
    }
    let is_keyframe = units.iter().any(|u| u.nal_type == NalUnitType::IdrSlice);
    out.push(AccessUnit {
        data: nal::nals_to_annex_b(units),
        is_keyframe,
    });
    units.clear();
}

/// Group the NAL units of an elementary stream into access units.
///
/// A new unit starts at an AUD, at a non-VCL unit following a slice, and
/// at a slice whose first macroblock is 0. Leading parameter sets stay
/// with the first picture.
pub fn split_access_units(data: &[u8]) -> Vec<AccessUnit> {
    let mut out = Vec::new();
    let mut current: Vec<NalUnit> = Vec::new();
    let mut seen_slice = false;

    for unit in nal::parse_annex_b(data) {
        if unit.nal_type == NalUnitType::Aud {
            finish(&mut current, &mut out);
            seen_slice = false;
            continue;
        }

        let boundary = if is_slice(&unit) {
            seen_slice && starts_picture(&unit)
        } else {
            seen_slice
        };
        if boundary {
            finish(&mut current, &mut out);
            seen_slice = false;
        }

        seen_slice |= is_slice(&unit);
        current.push(unit);
    }
    finish(&mut current, &mut out);

    out
}
