//! Per frame encode orchestration of a hardware HEVC encoder
//!
//! A frame passes through the following stages:
//!
//! 1. [`configure_picture`] and [`configure_slices`] validate the frame's parameters against the
//!    configured sequence and derive the picture state. [`commit_picture`] records the frame in
//!    the session once it is valid.
//! 2. [`wait_for_pending_pak`] makes the engine wait on the PAK work of earlier frames this frame
//!    depends on.
//! 3. Motion estimation and the BRC kernels run through the [`ComputeKernelExecutor`].
//! 4. The [`PakOrchestrator`] submits all PAK passes into the [`HardwareCommandSink`].
//!
//! Status reports of completed frames are collected with [`EncodeOrchestrator::collect_status`].

use std::collections::VecDeque;

pub mod brc;
mod config;
mod error;
mod header;
pub mod hw;
mod me;
mod pak;
mod picture;
mod policy;
mod sequence;
mod session;
mod slice;
mod status;
mod sync;

pub use config::{
    ChromaFormat, CodingType, EncoderSettings, FrameRate, HmeSupport, LcuBrcMode,
    MAX_COMPACT_REF_IDS, MAX_ICQ_QUALITY_FACTOR, MAX_REF_FRAMES, MAX_SLICE_QP,
    MIN_ICQ_QUALITY_FACTOR, NUM_FRAME_STORES, PackedNalUnit, PackedSliceHeader, PictureParams,
    PredWeightTable, RateControlMethod, RefFrame, RefPicList, RoiRegion, RoundingOffsets,
    SequenceParams, SliceParams, SliceType, WeightEntry,
};
pub use error::{EncodeError, SoftConstraintViolation};
pub use header::{
    MAX_INSERT_CHUNK_BYTES, compute_header_bit_length, find_start_code_offset, nal_unit_inserts,
    slice_header_insert,
};
pub use me::MotionEstimation;
pub use pak::{PakFrame, PakOrchestrator, PakOutcome, PassState};
pub use picture::{
    DistortionSource, HmeLevels, PictureConfig, commit_picture, compact_reference_ids,
    configure_picture, lcu_max_coding_size,
};
pub use policy::{CodecPolicy, DefaultCodecPolicy, HardwareGeneration, MmcPolicy};
pub use sequence::{ScaledDimensions, SequenceConfig, configure_sequence};
pub use session::{
    BRC_RING_SIZE, EncoderSessionState, PAK_SLICE_RING_SIZE, QpBounds, RefListEntry,
    ReferenceSyncSlot, TrackedBuffers, brc_ring_delay,
};
pub use slice::{SliceConfig, configure_slices};
pub use status::{
    EncodeStatus, ImageStatusControl, ReportContext, STATUS_REPORT_SIZE, StatusRecord, StatusReport,
    StatusSink, offsets as status_offsets, psnr_x100,
};
pub use sync::{wait_for_pending_pak, wait_for_reference_ready, wait_for_vdbox};

use brc::BrcFeedbackLoop;
use hw::{
    ComputeKernelExecutor, HardwareCapabilities, HardwareCommandSink, Resource, ResourceAllocator,
    with_locked,
};

/// Size of the semaphore memory of a tracked slot
const SEMAPHORE_SIZE: usize = 4;

#[derive(Debug)]
struct PendingStatus {
    offset: u32,
    context: ReportContext,
}

/// Drives all stages of the encoder for a session
pub struct EncodeOrchestrator<P = DefaultCodecPolicy, G = HardwareCapabilities> {
    policy: P,
    generation: G,
    caps: HardwareCapabilities,
    settings: EncoderSettings,

    session: EncoderSessionState,
    sequence: Option<SequenceConfig>,

    me: MotionEstimation,
    brc: BrcFeedbackLoop,
    pak: PakOrchestrator,

    mmc: Option<Box<dyn MmcPolicy>>,
    status_sink: Option<Box<dyn StatusSink>>,
    pending_status: VecDeque<PendingStatus>,
}

impl<P: CodecPolicy, G: HardwareGeneration> EncodeOrchestrator<P, G> {
    /// Create a new session, allocating all buffers which do not depend on the sequence
    pub fn new<A: ResourceAllocator>(
        policy: P,
        generation: G,
        settings: EncoderSettings,
        allocator: &mut A,
    ) -> Result<Self, EncodeError> {
        let caps = generation.capabilities();
        let mut session = EncoderSessionState::new(&settings);

        for slot in &mut session.sync_slots {
            let sync = allocator
                .allocate_sync_object("reference sync")
                .map_err(EncodeError::allocation("reference sync"))?;

            slot.sync = Some(sync);

            if settings.vdbox_semaphores {
                let buffer = allocator
                    .allocate_buffer(SEMAPHORE_SIZE, "VDBOX semaphore")
                    .map_err(EncodeError::allocation("VDBOX semaphore"))?;

                with_locked(allocator, Resource::Buffer(buffer), "VDBOX semaphore", |data| {
                    if let Some(value) = data.get_mut(..SEMAPHORE_SIZE) {
                        value.copy_from_slice(&1u32.to_le_bytes());
                    }
                })?;

                slot.semaphore_memory = Some(buffer);
            }
        }

        let pak = PakOrchestrator::allocate(allocator, &settings, &caps)?;

        log::debug!(
            "Created encode session for {}x{} with {} tracked buffers",
            settings.max_resolution.0,
            settings.max_resolution.1,
            session.sync_slots.len()
        );

        Ok(Self {
            policy,
            generation,
            caps,
            settings,
            session,
            sequence: None,
            me: MotionEstimation::new(),
            brc: BrcFeedbackLoop::new(),
            pak,
            mmc: None,
            status_sink: None,
            pending_status: VecDeque::new(),
        })
    }

    pub fn with_mmc(mut self, mmc: Box<dyn MmcPolicy>) -> Self {
        self.mmc = Some(mmc);
        self
    }

    pub fn with_status_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn generation(&self) -> &G {
        &self.generation
    }

    pub fn capabilities(&self) -> &HardwareCapabilities {
        &self.caps
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn session(&self) -> &EncoderSessionState {
        &self.session
    }

    pub fn sequence(&self) -> Option<&SequenceConfig> {
        self.sequence.as_ref()
    }

    pub fn brc(&self) -> &BrcFeedbackLoop {
        &self.brc
    }

    pub fn pak(&self) -> &PakOrchestrator {
        &self.pak
    }

    /// Start a new sequence, all following frames are encoded with it
    pub fn configure_sequence<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        params: &SequenceParams,
    ) -> Result<&SequenceConfig, EncodeError> {
        let config = configure_sequence(
            &mut self.session,
            &self.settings,
            &self.caps,
            allocator,
            params,
        )?;

        self.session.new_seq_header = true;
        self.session.new_pps_header = true;

        Ok(self.sequence.insert(config))
    }

    /// Run the BRC init kernel again before the next frame
    pub fn reset_brc(&mut self) {
        self.brc.reset(&mut self.session);
    }

    /// Encode a single frame
    ///
    /// Slices may be modified, reference lists exceeding the hardware limits are clamped. A failed
    /// frame is reported to the status sink.
    pub fn encode_frame<A, E, S>(
        &mut self,
        allocator: &mut A,
        executor: &mut E,
        sink: &mut S,
        pic: &PictureParams,
        slices: &mut [SliceParams],
    ) -> Result<PakOutcome, EncodeError>
    where
        A: ResourceAllocator,
        E: ComputeKernelExecutor,
        S: HardwareCommandSink,
    {
        match self.try_encode_frame(allocator, executor, sink, pic, slices) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!("Failed to encode frame {}: {e}", pic.status_feedback_number);

                if let Some(status_sink) = &mut self.status_sink {
                    status_sink.report(StatusReport::failed(pic.status_feedback_number));
                }

                Err(e)
            }
        }
    }

    fn try_encode_frame<A, E, S>(
        &mut self,
        allocator: &mut A,
        executor: &mut E,
        sink: &mut S,
        pic: &PictureParams,
        slices: &mut [SliceParams],
    ) -> Result<PakOutcome, EncodeError>
    where
        A: ResourceAllocator,
        E: ComputeKernelExecutor,
        S: HardwareCommandSink,
    {
        let Self {
            policy,
            caps,
            settings,
            session,
            sequence,
            me,
            brc,
            pak,
            mmc,
            pending_status,
            ..
        } = self;

        let seq = sequence
            .as_ref()
            .ok_or_else(|| EncodeError::invalid("no sequence is configured"))?;

        session.violations.clear();

        if session.new_seq_header && pic.nal_units.is_empty() {
            log::warn!("First frame of a new sequence carries no parameter sets");
        }

        let mut picture = configure_picture(session, settings, caps, seq, pic, slices)?;
        let slice_config = configure_slices(session, caps, seq, &mut picture, pic, slices)?;

        if seq.brc_enabled {
            brc::frame_brc_level(
                slice_config.low_delay,
                picture.coding_type,
                pic.hierarchical_level_plus1,
            )?;
        }

        // The frame is valid, later failures come from the hardware layer
        commit_picture(session, &picture, pic);

        let header_bits = compute_header_bit_length(&pic.nal_units, pic.emulation_byte_insertion);

        if picture.wait_for_pak {
            wait_for_pending_pak(session, sink, seq, &picture, pic, slices)?;
        }

        let me_kernels = me.run(session.create_size, seq, &picture, allocator, executor)?;

        let brc_frame = brc.prime(
            session,
            settings,
            seq,
            &picture,
            pic,
            &slice_config,
            header_bits,
            allocator,
            executor,
        )?;

        if me_kernels > 0 || brc_frame.is_some() {
            session.render_context_sync = executor.completion_sync();
        }

        let brc_set = match brc_frame {
            Some(frame) => Some(
                brc.buffers()
                    .and_then(|buffers| buffers.set(frame.write_index))
                    .copied()
                    .ok_or(EncodeError::NullResource("BRC buffer set"))?,
            ),
            None => None,
        };

        let frame_num = session.frame_num;

        let outcome = pak.encode_frame(
            session,
            settings,
            caps,
            &*policy,
            mmc.as_deref(),
            sink,
            &PakFrame {
                seq,
                picture: &picture,
                pic,
                slices,
                brc: brc_set,
            },
        )?;

        log::debug!(
            "Frame {frame_num} submitted, feedback number {}",
            pic.status_feedback_number
        );

        if pending_status.len() >= settings.status_reports.max(1) as usize {
            if let Some(dropped) = pending_status.pop_front() {
                log::warn!(
                    "Status of frame {} was overwritten before it was collected",
                    dropped.context.feedback_number
                );
            }
        }

        pending_status.push_back(PendingStatus {
            offset: outcome.status_offset,
            context: ReportContext {
                feedback_number: pic.status_feedback_number,
                header_bytes_inserted: outcome.header_bytes_inserted,
                num_lcus: seq.num_lcus(),
                frame_width: seq.frame_width,
                frame_height: seq.frame_height,
                chroma_format: seq.params.chroma_format,
                bit_depth: seq.params.bit_depth_luma,
                frame_stats: pak.frame_stats().is_some(),
            },
        });

        Ok(outcome)
    }

    /// Read the status records of all completed frames, in submission order
    ///
    /// Reports are forwarded to the status sink and returned.
    pub fn collect_status<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
    ) -> Result<Vec<StatusReport>, EncodeError> {
        if self.pending_status.is_empty() {
            return Ok(Vec::new());
        }

        let pending = &mut self.pending_status;

        let reports = with_locked(
            allocator,
            Resource::Buffer(self.pak.status_buffer()),
            "status buffer",
            |data| {
                let mut reports = Vec::new();

                while let Some(front) = pending.front() {
                    let start = front.offset as usize;

                    let Some(record) = data
                        .get(start..start + STATUS_REPORT_SIZE as usize)
                        .and_then(StatusRecord::parse)
                    else {
                        break;
                    };

                    // Not yet completed
                    if record.feedback_number != front.context.feedback_number {
                        break;
                    }

                    reports.push(front.context.report(&record));
                    pending.pop_front();
                }

                reports
            },
        )?;

        if let Some(status_sink) = &mut self.status_sink {
            for report in &reports {
                status_sink.report(*report);
            }
        }

        Ok(reports)
    }

    /// Free all resources of the session
    pub fn destroy<A: ResourceAllocator>(mut self, allocator: &mut A) {
        self.brc.free(allocator);
        self.me.free(allocator);
        self.pak.free(allocator);

        for slot in &self.session.sync_slots {
            if let Some(buffer) = slot.semaphore_memory {
                allocator.free(Resource::Buffer(buffer));
            }
        }

        if let Some(surface) = self.session.scaled_2x_surface.take() {
            allocator.free(Resource::Surface(surface.handle));
        }
    }
}
