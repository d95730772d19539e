use crate::encoder::{
    config::{CodingType, MAX_SLICE_QP, PictureParams, RateControlMethod, SliceParams, SliceType},
    error::{EncodeError, SoftConstraintViolation},
    hw::HardwareCapabilities,
    picture::PictureConfig,
    sequence::SequenceConfig,
    session::EncoderSessionState,
};

/// Properties of the picture's slice set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceConfig {
    /// No reference of a B slice lies in the future
    pub low_delay: bool,
    /// L0 and L1 name the same pictures
    pub same_ref_list: bool,
    /// A slice does not cover a whole number of LCU rows
    pub arbitrary_split: bool,
}

fn ref_poc(pic: &PictureParams, idx: u8) -> Option<i32> {
    pic.ref_frames
        .get(usize::from(idx))
        .copied()
        .flatten()
        .map(|r| r.poc)
}

fn ref_frame_store(pic: &PictureParams, idx: u8) -> Option<u8> {
    pic.ref_frames
        .get(usize::from(idx))
        .copied()
        .flatten()
        .map(|r| r.frame_store)
}

/// Validate the slices of a picture
///
/// Clamps the slices' active reference counts to the hardware limits and settles the picture's SAO
/// & PAK pass configuration.
pub fn configure_slices(
    session: &mut EncoderSessionState,
    caps: &HardwareCapabilities,
    seq: &SequenceConfig,
    picture: &mut PictureConfig,
    pic: &PictureParams,
    slices: &mut [SliceParams],
) -> Result<SliceConfig, EncodeError> {
    if slices.len() > caps.max_num_slices as usize {
        return Err(EncodeError::invalid(format!(
            "{} slices exceed the limit of {}",
            slices.len(),
            caps.max_num_slices
        )));
    }

    match slices.first() {
        Some(first) if first.segment_address == 0 => {}
        Some(_) => return Err(EncodeError::invalid("first slice must start at LCU 0")),
        None => return Err(EncodeError::invalid("picture has no slices")),
    }

    let mut config = SliceConfig {
        low_delay: true,
        same_ref_list: true,
        arbitrary_split: false,
    };

    let max_refs = [
        usize::from(caps.max_l0_references),
        usize::from(caps.max_l1_references),
    ];

    let mut start_lcu = 0;

    for (i, slice) in slices.iter_mut().enumerate() {
        for (list, max) in max_refs.into_iter().enumerate() {
            let requested = slice.ref_pic_lists[list].len();

            if requested > max {
                session.record(SoftConstraintViolation::RefCountClamped {
                    slice: i,
                    list,
                    requested,
                    max,
                });

                slice.ref_pic_lists[list].truncate(max);
            }
        }

        if u32::from(pic.qp_y).saturating_add_signed(i32::from(slice.slice_qp_delta))
            > u32::from(MAX_SLICE_QP)
        {
            return Err(EncodeError::invalid(format!(
                "slice {i} QP exceeds {MAX_SLICE_QP}"
            )));
        }

        if slice.slice_type == SliceType::B && config.low_delay {
            let future_ref = slice
                .ref_pic_lists
                .iter()
                .flatten()
                .flatten()
                .any(|&idx| ref_poc(pic, idx).is_some_and(|poc| poc > pic.poc));

            config.low_delay = !future_ref;
        }

        if config.same_ref_list && slice.num_ref_idx_active(0) >= slice.num_ref_idx_active(1) {
            let [l0, l1] = &slice.ref_pic_lists;

            let differs = l0.iter().zip(l1.iter()).any(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => ref_frame_store(pic, *a) != ref_frame_store(pic, *b),
                _ => false,
            });

            config.same_ref_list = !differs;
        }

        if slice.num_lcus % seq.width_in_lcu != 0 {
            config.arbitrary_split = true;
        }

        if !pic.tiles_enabled {
            if slice.segment_address != start_lcu {
                return Err(EncodeError::invalid(format!(
                    "slice {i} starts at LCU {} instead of {start_lcu}",
                    slice.segment_address
                )));
            }

            start_lcu = start_lcu
                .checked_add(slice.num_lcus)
                .ok_or_else(|| EncodeError::invalid(format!("slice {i} LCU count overflows")))?;
        }
    }

    if config.low_delay && !config.same_ref_list {
        log::debug!("Low delay B frame with different L0/L1 lists");
    }

    if seq.params.rate_control == RateControlMethod::Vcm
        && picture.coding_type == CodingType::B
        && !config.low_delay
    {
        return Err(EncodeError::invalid(
            "VCM rate control does not support regular B frames",
        ));
    }

    if picture.sao_enabled {
        let luma = slices.iter().filter(|s| s.sao_luma).count();
        let chroma = slices.iter().filter(|s| s.sao_chroma).count();

        let mixed = |count: usize| count > 0 && count != slices.len();

        if mixed(luma) || mixed(chroma) {
            session.record(SoftConstraintViolation::MixedSliceSao);
            picture.sao_enabled = false;
        }
    }

    picture.second_sao_pass = 0;
    if picture.sao_enabled && caps.second_sao_pass {
        picture.num_passes += 1;
        picture.second_sao_pass = picture.num_passes;
    }

    log::trace!(
        "Configured {} slices {config:?}, {} PAK passes",
        slices.len(),
        picture.total_passes()
    );

    Ok(config)
}
