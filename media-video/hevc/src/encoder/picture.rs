use crate::encoder::{
    config::{
        ChromaFormat, CodingType, EncoderSettings, MAX_COMPACT_REF_IDS, MAX_REF_FRAMES,
        MAX_SLICE_QP, PictureParams, RateControlMethod, SliceParams,
    },
    error::EncodeError,
    hw::{HardwareCapabilities, Surface},
    sequence::SequenceConfig,
    session::{EncoderSessionState, QpBounds, RefListEntry, unique_refs},
};

/// Surface the BRC kernels read the frame's distortion from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionSource {
    Intra,
    MotionEstimation,
}

/// Enabled hierarchical motion estimation levels
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HmeLevels {
    pub x4: bool,
    pub x16: bool,
    pub x32: bool,
}

/// Per picture state derived from the [`PictureParams`]
#[derive(Debug, Clone)]
pub struct PictureConfig {
    /// Coding type as encoded by the hardware
    pub coding_type: CodingType,
    /// Coding type as written into the picture header
    pub nominal_coding_type: CodingType,

    /// Compact reference id of every entry in `PictureParams::ref_frames`
    pub compact_ref_ids: [Option<u8>; MAX_REF_FRAMES],
    /// Entries of `PictureParams::ref_frames` referenced by any slice
    pub curr_used_refs: [bool; MAX_REF_FRAMES],

    pub raw: Surface,
    pub recon: Option<Surface>,

    pub tracked_slot: u8,

    /// Wait on previous PAK work before this frame's kernels run
    pub wait_for_pak: bool,
    /// Signal the tracked slot's sync object once the frame's PAK completed
    pub signal_completion: bool,

    pub lcu_brc_enabled: bool,
    pub min_qp: u8,
    pub max_qp: u8,
    pub distortion: Option<DistortionSource>,

    /// Number of PAK passes after the first one
    pub num_passes: u8,
    /// Pass index of the SAO only pass, 0 if there is none
    pub second_sao_pass: u8,
    /// SAO after verifying the slices agree on it
    pub sao_enabled: bool,

    pub lcu_max_bit_size: u32,
    pub hme: HmeLevels,

    pub frame_store: u8,
    /// Session's min/max QP bounds including this picture's
    pub qp_bounds: QpBounds,
}

impl PictureConfig {
    pub fn total_passes(&self) -> u8 {
        self.num_passes + 1
    }

    /// Compact reference id of an entry in `PictureParams::ref_frames`
    pub(crate) fn compact_id(&self, ref_frame_idx: usize) -> Option<u8> {
        self.compact_ref_ids.get(ref_frame_idx).copied().flatten()
    }
}

/// Map every reference frame used by a slice onto a compact id in `0..8`
///
/// Entries naming the same frame store share their id.
pub fn compact_reference_ids(
    pic: &PictureParams,
    slices: &[SliceParams],
) -> Result<([Option<u8>; MAX_REF_FRAMES], [bool; MAX_REF_FRAMES]), EncodeError> {
    let mut used = [false; MAX_REF_FRAMES];

    for slice in slices {
        for list in &slice.ref_pic_lists {
            if list.len() > MAX_REF_FRAMES {
                return Err(EncodeError::invalid(format!(
                    "invalid number of active references {}",
                    list.len()
                )));
            }

            for idx in list.iter().flatten() {
                let idx = usize::from(*idx);

                if pic.ref_frames.get(idx).is_some_and(Option::is_some) {
                    used[idx] = true;
                }
            }
        }
    }

    let mut mapping = [None; MAX_REF_FRAMES];
    let mut next_id = 0;

    for i in 0..MAX_REF_FRAMES {
        let Some(ref_frame) = pic.ref_frames[i].filter(|_| used[i]) else {
            continue;
        };

        let duplicate = (0..i).find(|&j| {
            used[j]
                && pic.ref_frames[j].is_some_and(|other| other.frame_store == ref_frame.frame_store)
        });

        if let Some(j) = duplicate {
            mapping[i] = mapping[j];
            continue;
        }

        if usize::from(next_id) >= MAX_COMPACT_REF_IDS {
            return Err(EncodeError::invalid(
                "more than 8 distinct reference frames are in use",
            ));
        }

        mapping[i] = Some(next_id);
        next_id += 1;
    }

    Ok((mapping, used))
}

/// Maximum number of bits a single LCU may take up
pub fn lcu_max_coding_size(seq: &SequenceConfig, requested: u32) -> u32 {
    let raw = 1u32 << (2 * seq.log2_lcu_size);

    let raw = match seq.params.chroma_format {
        ChromaFormat::Monochrome => raw,
        ChromaFormat::Yuv420 => raw * 3 / 2,
        ChromaFormat::Yuv422 => raw * 2,
        ChromaFormat::Yuv444 => raw * 3,
    };

    let raw = raw * u32::from(seq.params.bit_depth_luma);
    let raw = 5 * raw / 3;

    if requested == 0 || requested > raw {
        raw
    } else {
        requested
    }
}

/// Validate the picture parameters and derive the picture level state
///
/// The session is left untouched, [`commit_picture`] applies the picture to it once the whole frame
/// is validated.
pub fn configure_picture(
    session: &EncoderSessionState,
    settings: &EncoderSettings,
    caps: &HardwareCapabilities,
    seq: &SequenceConfig,
    pic: &PictureParams,
    slices: &[SliceParams],
) -> Result<PictureConfig, EncodeError> {
    let (compact_ref_ids, curr_used_refs) = compact_reference_ids(pic, slices)?;

    if pic.coding_type != CodingType::I {
        if let Some(idx) = pic.collocated_ref_idx.filter(|&idx| usize::from(idx) < MAX_REF_FRAMES) {
            let idx = usize::from(idx);

            let valid = compact_ref_ids[idx].is_some_and(|id| usize::from(id) < MAX_COMPACT_REF_IDS)
                && curr_used_refs[idx];

            if !valid {
                return Err(EncodeError::invalid(format!(
                    "collocated reference {idx} is not used by any slice"
                )));
            }
        }
    }

    if pic.qp_y > MAX_SLICE_QP {
        return Err(EncodeError::invalid(format!("QpY {} is out of range", pic.qp_y)));
    }

    if pic.recon_surface.is_none() && !pic.use_raw_pic_for_ref {
        return Err(EncodeError::NullResource("reconstructed surface"));
    }

    if pic.field_pic {
        return Err(EncodeError::invalid("interlaced coding is not supported"));
    }

    if usize::from(pic.frame_store) >= session.ref_list.len() {
        return Err(EncodeError::invalid(format!("invalid frame store {}", pic.frame_store)));
    }

    if !pic.roi.is_empty() && !seq.params.roi_value_in_delta_qp {
        return Err(EncodeError::invalid(
            "ROI priority levels are not supported, use delta QP values",
        ));
    }

    let raw = pic.raw_surface.ok_or(EncodeError::NullResource("raw surface"))?;

    if !seq.params.chroma_format.accepts(raw.format) || !caps.raw_formats.contains(&raw.format) {
        return Err(EncodeError::invalid(format!(
            "raw surface format {:?} cannot be encoded as {:?}",
            raw.format, seq.params.chroma_format
        )));
    }

    // P/B pictures without any reference are encoded as I, the header keeps the nominal type
    let nominal_coding_type = pic.coding_type;
    let coding_type = if pic.ref_frames.iter().all(Option::is_none) {
        CodingType::I
    } else {
        nominal_coding_type
    };

    let brc_enabled = seq.brc_enabled;
    let prev_used_as_ref = session
        .prev_frame_store
        .and_then(|frame_store| session.ref_entry(frame_store))
        .is_some_and(|entry| entry.used_as_ref);

    let wait_for_pak = !(session.first_frame
        || (!brc_enabled && pic.use_raw_pic_for_ref)
        || (!brc_enabled && coding_type == CodingType::I)
        || (!brc_enabled && !prev_used_as_ref));

    let signal_completion = brc_enabled || pic.used_as_ref;

    let tracked_slot = session.tracked.current;

    let mut qp_bounds = session.qp_bounds;
    qp_bounds.update(nominal_coding_type, pic.brc_min_qp, pic.brc_max_qp);
    let (min_qp, max_qp) = qp_bounds.for_type(coding_type);

    let distortion = (brc_enabled || seq.cqp || seq.params.video_surveillance).then(|| {
        if coding_type == CodingType::I {
            DistortionSource::Intra
        } else {
            DistortionSource::MotionEstimation
        }
    });

    let num_passes = if brc_enabled && !seq.is_icq() && !qp_bounds.enabled {
        caps.brc_num_pak_passes.saturating_sub(1)
    } else {
        0
    };

    let lcu_brc_enabled = seq.params.rate_control != RateControlMethod::Vcm
        && (seq.lcu_brc_enabled || (brc_enabled && !pic.roi.is_empty()));

    let inter = coding_type != CodingType::I;
    let hme = HmeLevels {
        x4: settings.hme.x4 && inter,
        x16: settings.hme.x16 && inter,
        x32: seq.hme_32x_allowed && inter,
    };

    let config = PictureConfig {
        coding_type,
        nominal_coding_type,
        compact_ref_ids,
        curr_used_refs,
        raw,
        recon: pic.recon_surface,
        tracked_slot,
        wait_for_pak,
        signal_completion,
        lcu_brc_enabled,
        min_qp,
        max_qp,
        distortion,
        num_passes,
        second_sao_pass: 0,
        sao_enabled: seq.params.sao_enabled,
        lcu_max_bit_size: lcu_max_coding_size(seq, pic.lcu_max_bit_size),
        hme,
        frame_store: pic.frame_store,
        qp_bounds,
    };

    log::trace!("Configured picture {config:?}");

    Ok(config)
}

/// Record a validated picture in the session's reference list table and min/max QP bounds
pub fn commit_picture(
    session: &mut EncoderSessionState,
    picture: &PictureConfig,
    pic: &PictureParams,
) {
    let unique = unique_refs(&pic.ref_frames);
    for ref_frame in &unique {
        if let Some(Some(entry)) = session.ref_list.get_mut(usize::from(ref_frame.frame_store)) {
            entry.poc = ref_frame.poc;
        }
    }

    if let Some(slot) = session.ref_list.get_mut(usize::from(picture.frame_store)) {
        *slot = Some(RefListEntry {
            tracked_slot: picture.tracked_slot,
            poc: pic.poc,
            used_as_ref: pic.used_as_ref,
            raw: Some(picture.raw),
            recon: picture.recon,
            ref_list: unique,
        });
    }

    session.prev_frame_store = Some(picture.frame_store);
    session.qp_bounds = picture.qp_bounds;
}
