//! Bitrate controller feedback loop
//!
//! The BRC kernels read the PAK statistics of earlier frames and write the picture states the PAK
//! passes of the current frame execute. All buffers the kernels exchange are recycled through a
//! ring of [`BRC_RING_SIZE`](crate::encoder::BRC_RING_SIZE) sets.

use crate::encoder::{
    config::{CodingType, EncoderSettings, PictureParams, RateControlMethod, SequenceParams},
    error::EncodeError,
    hw::{ComputeKernelExecutor, KernelDispatch, ResourceAllocator},
    picture::{DistortionSource, PictureConfig},
    sequence::{ScaledDimensions, SequenceConfig},
    session::EncoderSessionState,
    slice::SliceConfig,
};

mod resources;
mod roi;

pub use resources::{
    BRC_IMAGE_STATE_SIZE, BRC_IMG_STATE_SIZE_PER_PASS, BRC_MAX_PASSES, BrcBufferSet, BrcBuffers,
    pak_statistics,
};
pub use roi::{RoiSurfaceWriter, roi_ratio};

/// Lifecycle of the bitrate controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrcState {
    /// No buffers are allocated and the init kernel never ran
    Uninitialized,
    /// Init/reset kernel was dispatched, the next frame update is the first one
    Primed,
    Steady,
}

/// Classification of a frame for the BRC kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBrcLevel {
    /// P frame or low delay B frame
    PorLowDelayB = 0,
    B = 1,
    I = 2,
    B1 = 3,
    B2 = 4,
}

/// Classify the current frame for the BRC kernel
pub fn frame_brc_level(
    low_delay: bool,
    coding_type: CodingType,
    hierarchical_level_plus1: u8,
) -> Result<FrameBrcLevel, EncodeError> {
    if !low_delay {
        return Ok(match coding_type {
            CodingType::I => FrameBrcLevel::I,
            CodingType::P => FrameBrcLevel::PorLowDelayB,
            CodingType::B => FrameBrcLevel::B,
            CodingType::B1 => FrameBrcLevel::B1,
            CodingType::B2 => FrameBrcLevel::B2,
        });
    }

    match (coding_type, hierarchical_level_plus1) {
        (CodingType::I, 0) => Ok(FrameBrcLevel::I),
        (CodingType::I, _) => Err(EncodeError::invalid(
            "I frames must be on hierarchy level 0 in low delay mode",
        )),
        (CodingType::P | CodingType::B, 0) => Ok(FrameBrcLevel::PorLowDelayB),
        (CodingType::P | CodingType::B, 1) => Ok(FrameBrcLevel::B),
        (CodingType::P | CodingType::B, 2) => Ok(FrameBrcLevel::B1),
        (CodingType::P | CodingType::B, level) => Err(EncodeError::invalid(format!(
            "hierarchy level {level} is not supported in low delay mode"
        ))),
        (CodingType::B1 | CodingType::B2, _) => Err(EncodeError::invalid(
            "B1/B2 frames are not supported in low delay mode",
        )),
    }
}

/// Quantizer rounding offsets `(intra, inter)` of a frame
pub fn rounding_offsets(seq: &SequenceParams, pic: &PictureParams) -> (u8, u8) {
    let hierarchical = seq.num_b_in_gop[1] != 0 || seq.num_b_in_gop[2] != 0;

    let hierarchical_offset = match pic.coding_type {
        CodingType::I | CodingType::P => 4,
        CodingType::B => 3,
        CodingType::B1 | CodingType::B2 => 2,
    };

    let (intra_default, inter_default) = if hierarchical {
        (hierarchical_offset, hierarchical_offset)
    } else {
        (10, 4)
    };

    (
        pic.rounding.intra.unwrap_or(intra_default),
        pic.rounding.inter.unwrap_or(inter_default),
    )
}

/// POC distance of a reference to the current picture, as the hardware expects it
pub fn temporal_difference(current_poc: i32, ref_poc: Option<i32>) -> i8 {
    match ref_poc {
        Some(ref_poc) => current_poc
            .saturating_sub(ref_poc)
            .clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8,
        None => 0,
    }
}

/// Per frame values derived while priming the BRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrcFrame {
    pub frame_brc_level: FrameBrcLevel,
    pub roi_ratio: u8,
    /// Ring index of the buffer set the PAK passes of this frame use
    pub write_index: usize,
}

/// Drives the BRC kernels and owns their buffers
#[derive(Debug)]
pub struct BrcFeedbackLoop {
    state: BrcState,
    buffers: Option<BrcBuffers>,
}

impl Default for BrcFeedbackLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl BrcFeedbackLoop {
    pub fn new() -> Self {
        Self {
            state: BrcState::Uninitialized,
            buffers: None,
        }
    }

    pub fn state(&self) -> BrcState {
        self.state
    }

    pub fn buffers(&self) -> Option<&BrcBuffers> {
        self.buffers.as_ref()
    }

    /// Force the init/reset kernel to run again with the next frame
    pub fn reset(&mut self, session: &mut EncoderSessionState) {
        if self.state != BrcState::Uninitialized {
            self.state = BrcState::Primed;
        }

        session.brc_reset = true;
    }

    fn ensure_buffers<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        create_size: (u32, u32),
    ) -> Result<&BrcBuffers, EncodeError> {
        if self.buffers.is_none() {
            let (width, height) = create_size;
            let buffers = BrcBuffers::allocate(allocator, ScaledDimensions::new(width, height, 4))?;
            self.buffers = Some(buffers);
        }

        self.buffers
            .as_ref()
            .ok_or(EncodeError::NullResource("BRC buffers"))
    }

    /// Run the BRC kernels of a frame
    ///
    /// Returns `None` when the sequence does not use BRC.
    #[allow(clippy::too_many_arguments)]
    pub fn prime<A, E>(
        &mut self,
        session: &mut EncoderSessionState,
        settings: &EncoderSettings,
        seq: &SequenceConfig,
        picture: &PictureConfig,
        pic: &PictureParams,
        slices: &SliceConfig,
        picture_header_bits: u32,
        allocator: &mut A,
        executor: &mut E,
    ) -> Result<Option<BrcFrame>, EncodeError>
    where
        A: ResourceAllocator,
        E: ComputeKernelExecutor,
    {
        if !seq.brc_enabled {
            return Ok(None);
        }

        let frame_brc_level =
            frame_brc_level(slices.low_delay, picture.coding_type, pic.hierarchical_level_plus1)?;

        let roi_ratio = roi_ratio(&pic.roi, seq.num_mbs());

        let buffers = self.ensure_buffers(allocator, session.create_size)?;
        let history = buffers.history;
        let lcu_qp = buffers.lcu_qp;
        let roi_surface = buffers.roi;
        let distortion = match picture.distortion {
            Some(DistortionSource::MotionEstimation) => buffers.me_distortion.handle,
            Some(DistortionSource::Intra) | None => buffers.intra_distortion.handle,
        };

        if session.brc_init || session.brc_reset {
            let reset = !session.brc_init;

            session.reset_brc_ring(seq.params.parallel_brc);

            log::debug!(
                "BRC {} with sliding window {}",
                if reset { "reset" } else { "init" },
                seq.sliding_window
            );

            executor
                .execute(KernelDispatch::BrcInitReset {
                    reset,
                    history,
                    sliding_window: seq.sliding_window,
                })
                .map_err(EncodeError::hardware)?;

            session.brc_init = false;
            session.brc_reset = false;
            self.state = BrcState::Primed;
        }

        let buffers = self
            .buffers
            .as_ref()
            .ok_or(EncodeError::NullResource("BRC buffers"))?;

        let read = buffers
            .set(session.brc_read_index)
            .ok_or(EncodeError::NullResource("BRC read buffer set"))?;
        let write = buffers
            .set(session.brc_write_index)
            .ok_or(EncodeError::NullResource("BRC write buffer set"))?;

        let quality_factor = matches!(
            seq.params.rate_control,
            RateControlMethod::Icq | RateControlMethod::Qvbr
        )
        .then_some(seq.params.icq_quality_factor);

        let update = KernelDispatch::BrcFrameUpdate {
            history,
            pak_statistics: read.pak_statistics,
            image_state_read: read.image_state_read,
            image_state_write: write.image_state_write,
            constant_data: write.constant_data,
            distortion,
            picture_header_bits,
            frame_brc_level: frame_brc_level as u8,
            max_num_paks: picture.total_passes(),
            quality_factor,
            roi_ratio,
            min_qp: picture.min_qp,
            max_qp: picture.max_qp,
        };

        log::trace!(
            "BRC frame update read={} write={}",
            session.brc_read_index,
            session.brc_write_index
        );

        executor.execute(update).map_err(EncodeError::hardware)?;

        if picture.lcu_brc_enabled {
            let roi_surface = if pic.roi.is_empty() {
                None
            } else {
                RoiSurfaceWriter::new(
                    &pic.roi,
                    seq.width_in_mb,
                    seq.height_in_mb,
                    settings.roi_smoothing,
                )
                .write_surface(allocator, &roi_surface)?;

                Some(roi_surface.handle)
            };

            executor
                .execute(KernelDispatch::BrcLcuUpdate {
                    history,
                    qp_surface: lcu_qp.handle,
                    roi_surface,
                })
                .map_err(EncodeError::hardware)?;
        }

        self.state = BrcState::Steady;

        Ok(Some(BrcFrame {
            frame_brc_level,
            roi_ratio,
            write_index: session.brc_write_index,
        }))
    }

    pub(crate) fn free<A: ResourceAllocator>(&mut self, allocator: &mut A) {
        if let Some(buffers) = self.buffers.take() {
            buffers.free(allocator);
        }

        self.state = BrcState::Uninitialized;
    }
}
