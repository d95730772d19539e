//! Multi pass PAK submission of a frame
//!
//! Every pass re-encodes the whole frame. With BRC, passes after the first one are skipped by the
//! device once the image status of the previous pass reports the frame size to be within its
//! limits.

use crate::{
    bitstream::{NAL_EOB, NAL_EOS, empty_nal_unit},
    encoder::{
        brc::{
            BRC_IMAGE_STATE_SIZE, BRC_MAX_PASSES, BrcBufferSet, pak_statistics, rounding_offsets,
            temporal_difference,
        },
        config::{EncoderSettings, PictureParams, SliceParams, SliceType},
        error::EncodeError,
        header::{end_marker_insert, nal_unit_inserts, slice_header_insert},
        hw::{
            BufferHandle, CompressionMode, EndMarker, HardwareCapabilities, HardwareCommandSink,
            HwCommand, IndObjBaseAddr, PictureState, PipeBufAddr, PipeModeSelect, RefIdxEntry,
            RefIdxState, Resource, ResourceAllocator, SliceState, Surface, SurfaceHandle,
            SurfaceRole, SurfaceState, WeightOffsetState,
        },
        picture::PictureConfig,
        policy::{CodecPolicy, MmcPolicy},
        sequence::SequenceConfig,
        session::{EncoderSessionState, PAK_SLICE_RING_SIZE},
        status::{STATUS_REPORT_SIZE, offsets},
        sync::{signal_completion, wait_for_vdbox},
    },
};
use bytes::Bytes;
use smallvec::SmallVec;

/// Size of the frame statistics the PAK streams out
const FRAME_STATS_SIZE: usize = 512;

/// Dword offset of the sum of squared errors in the frame statistics
const FRAME_STATS_SSE_DWORD: u32 = 32;
const NUM_SSE_DWORDS: u32 = 6;

/// LCU size used to size the PAK object data, the smallest one results in the most LCUs
const MIN_LCU_SIZE: u32 = 32;

/// Transient state of a single PAK pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassState {
    pub pass: u8,
    pub first_task: bool,
    pub last_task: bool,
    /// Pass exists only to apply the SAO filter
    pub sao_only: bool,
    /// Bytes inserted after the slice data which the hardware byte count doesn't include
    pub header_bytes_inserted: u32,
}

/// Inputs of the PAK passes of a single frame
#[derive(Debug, Clone, Copy)]
pub struct PakFrame<'a> {
    pub seq: &'a SequenceConfig,
    pub picture: &'a PictureConfig,
    pub pic: &'a PictureParams,
    pub slices: &'a [SliceParams],
    /// Buffer set at the BRC write index, required when BRC is enabled
    pub brc: Option<BrcBufferSet>,
}

/// Result of a completely submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PakOutcome {
    /// Offset of the frame's record in the status buffer
    pub status_offset: u32,
    pub header_bytes_inserted: u32,
    pub passes: u8,
}

/// Owns the PAK buffers and submits the passes of every frame
#[derive(Debug)]
pub struct PakOrchestrator {
    pak_object_data: Vec<BufferHandle>,
    status: BufferHandle,
    status_slots: u32,
    frame_stats: Option<BufferHandle>,
}

impl PakOrchestrator {
    pub(crate) fn allocate<A: ResourceAllocator>(
        allocator: &mut A,
        settings: &EncoderSettings,
        caps: &HardwareCapabilities,
    ) -> Result<Self, EncodeError> {
        let (width, height) = settings.max_resolution;
        let max_lcus = width.div_ceil(MIN_LCU_SIZE) * height.div_ceil(MIN_LCU_SIZE);
        let pak_object_size = (max_lcus * caps.pak_object_dwords * 4) as usize;

        let pak_object_data = (0..PAK_SLICE_RING_SIZE)
            .map(|_| {
                allocator
                    .allocate_buffer(pak_object_size, "PAK object data")
                    .map_err(EncodeError::allocation("PAK object data"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let status_slots = settings.status_reports.max(1);
        let status = allocator
            .allocate_buffer((status_slots * STATUS_REPORT_SIZE) as usize, "status buffer")
            .map_err(EncodeError::allocation("status buffer"))?;

        let frame_stats = if settings.frame_stats {
            let buffer = allocator
                .allocate_buffer(FRAME_STATS_SIZE, "frame statistics")
                .map_err(EncodeError::allocation("frame statistics"))?;

            Some(buffer)
        } else {
            None
        };

        log::debug!(
            "Allocated PAK buffers, {pak_object_size} bytes PAK object data, \
             {status_slots} status records"
        );

        Ok(Self {
            pak_object_data,
            status,
            status_slots,
            frame_stats,
        })
    }

    pub fn status_buffer(&self) -> BufferHandle {
        self.status
    }

    pub fn frame_stats(&self) -> Option<BufferHandle> {
        self.frame_stats
    }

    /// Offset of the status record of the frame with the given number
    pub fn status_offset(&self, frame_num: u32) -> u32 {
        (frame_num % self.status_slots) * STATUS_REPORT_SIZE
    }

    /// Submit all PAK passes of a frame and advance the session to the next frame
    #[allow(clippy::too_many_arguments)]
    pub fn encode_frame<S, P>(
        &self,
        session: &mut EncoderSessionState,
        settings: &EncoderSettings,
        caps: &HardwareCapabilities,
        policy: &P,
        mmc: Option<&dyn MmcPolicy>,
        sink: &mut S,
        frame: &PakFrame<'_>,
    ) -> Result<PakOutcome, EncodeError>
    where
        S: HardwareCommandSink,
        P: CodecPolicy + ?Sized,
    {
        let PakFrame {
            seq,
            picture,
            pic,
            slices,
            brc,
        } = *frame;

        let bitstream = pic
            .bitstream_buffer
            .ok_or(EncodeError::NullResource("bitstream buffer"))?;

        let brc = if seq.brc_enabled {
            Some(brc.ok_or(EncodeError::NullResource("BRC buffer set"))?)
        } else {
            None
        };

        let pak_object_data = self
            .pak_object_data
            .get(usize::from(session.pak_slice_index))
            .copied()
            .ok_or(EncodeError::NullResource("PAK object data"))?;

        let mut end_markers = SmallVec::<[_; 2]>::new();
        if pic.last_pic_in_seq {
            end_markers.push((EndMarker::EndOfSequence, empty_nal_unit(NAL_EOS)?));
        }
        if pic.last_pic_in_stream {
            end_markers.push((EndMarker::EndOfStream, empty_nal_unit(NAL_EOB)?));
        }

        let commands = FrameCommands {
            settings,
            caps,
            policy,
            mmc,
            seq,
            picture,
            pic,
            slices,
            brc,
            bitstream,
            pak_object_data,
            slice_offsets: slices
                .iter()
                .map(|slice| slice.segment_address * caps.pak_object_dwords * 4)
                .collect(),
            status: self.status,
            status_offset: self.status_offset(session.frame_num),
            frame_stats: self.frame_stats,
            end_markers,
        };

        log::debug!(
            "Submit frame {} ({:?}) with {} PAK passes",
            session.frame_num,
            picture.coding_type,
            picture.total_passes()
        );

        let mut header_bytes_inserted = 0;

        for pass in 0..=picture.num_passes {
            let (first_task, last_task) = if settings.single_task_phase_in_pak {
                (pass == 0, pass == picture.num_passes)
            } else {
                (true, true)
            };

            session.current_pass = pass;
            session.first_task_in_phase = first_task;
            session.last_task_in_phase = last_task;

            let mut state = PassState {
                pass,
                first_task,
                last_task,
                sao_only: picture.second_sao_pass != 0 && pass == picture.second_sao_pass,
                header_bytes_inserted: 0,
            };

            commands.execute_pass(session, sink, &mut state)?;

            header_bytes_inserted = state.header_bytes_inserted;
        }

        let outcome = PakOutcome {
            status_offset: commands.status_offset,
            header_bytes_inserted,
            passes: picture.total_passes(),
        };

        session.finish_frame(seq.params.parallel_brc);

        Ok(outcome)
    }

    pub(crate) fn free<A: ResourceAllocator>(self, allocator: &mut A) {
        for buffer in self.pak_object_data {
            allocator.free(Resource::Buffer(buffer));
        }

        allocator.free(Resource::Buffer(self.status));

        if let Some(frame_stats) = self.frame_stats {
            allocator.free(Resource::Buffer(frame_stats));
        }
    }
}

fn emit<S: HardwareCommandSink>(sink: &mut S, command: HwCommand) -> Result<(), EncodeError> {
    sink.add_command(command).map_err(EncodeError::hardware)
}

/// Everything the passes of a frame share
struct FrameCommands<'a, P: ?Sized> {
    settings: &'a EncoderSettings,
    caps: &'a HardwareCapabilities,
    policy: &'a P,
    mmc: Option<&'a dyn MmcPolicy>,

    seq: &'a SequenceConfig,
    picture: &'a PictureConfig,
    pic: &'a PictureParams,
    slices: &'a [SliceParams],
    brc: Option<BrcBufferSet>,

    bitstream: BufferHandle,
    pak_object_data: BufferHandle,
    /// Offset of each slice's PAK objects in `pak_object_data`
    slice_offsets: SmallVec<[u32; 8]>,

    status: BufferHandle,
    status_offset: u32,
    frame_stats: Option<BufferHandle>,

    end_markers: SmallVec<[(EndMarker, Bytes); 2]>,
}

impl<P: CodecPolicy + ?Sized> FrameCommands<'_, P> {
    fn execute_pass<S: HardwareCommandSink>(
        &self,
        session: &mut EncoderSessionState,
        sink: &mut S,
        state: &mut PassState,
    ) -> Result<(), EncodeError> {
        log::trace!("PAK pass {state:?}");

        sink.command_buffer().map_err(EncodeError::hardware)?;

        self.preamble(sink, state)?;
        self.conditional_end(sink, state)?;
        self.picture_level(session, sink, state)?;
        self.slice_level(sink)?;
        self.end_of_frame(sink, state)?;
        self.status_readback(sink, state)?;
        self.submit(session, sink, state)
    }

    fn single_task_phase(&self) -> bool {
        self.settings.single_task_phase
    }

    fn preamble<S: HardwareCommandSink>(
        &self,
        sink: &mut S,
        state: &PassState,
    ) -> Result<(), EncodeError> {
        if !self.single_task_phase() || state.first_task {
            let frame_tracking = if self.seq.brc_enabled && self.picture.sao_enabled {
                false
            } else if self.single_task_phase() {
                state.first_task
            } else {
                state.last_task
            };

            emit(sink, HwCommand::Prolog { frame_tracking })?;
        }

        if self
            .policy
            .force_filter_pass_header(self.seq, self.picture, state.pass)
        {
            emit(sink, HwCommand::Prolog { frame_tracking: true })?;
        }

        Ok(())
    }

    /// Skip the rest of the pass on the device if the previous pass needs no further pass
    fn conditional_end<S: HardwareCommandSink>(
        &self,
        sink: &mut S,
        state: &PassState,
    ) -> Result<(), EncodeError> {
        let Some(brc) = self.brc else {
            return Ok(());
        };

        if state.pass == 0 || state.sao_only {
            return Ok(());
        }

        let register = self.caps.registers.image_status_ctrl;

        emit(
            sink,
            HwCommand::ConditionalBatchBufferEnd {
                buffer: self.status,
                offset: self.status_offset + offsets::IMAGE_STATUS_MASK,
            },
        )?;
        emit(
            sink,
            HwCommand::LoadRegisterMem {
                buffer: self.status,
                offset: self.status_offset + offsets::IMAGE_STATUS_CTRL,
                register,
            },
        )?;
        emit(
            sink,
            HwCommand::StoreRegisterMem {
                buffer: brc.pak_statistics,
                offset: pak_statistics::IMAGE_STATUS_CONTROL_FOR_LAST_PASS,
                register,
            },
        )?;
        emit(
            sink,
            HwCommand::StoreRegisterMem {
                buffer: self.status,
                offset: self.status_offset + offsets::IMAGE_STATUS_CTRL_OF_LAST_BRC_PASS,
                register,
            },
        )
    }

    fn compression(&self, role: SurfaceRole, surface: &Surface) -> CompressionMode {
        self.mmc
            .map_or(CompressionMode::None, |mmc| mmc.compression(role, surface))
    }

    fn surface_state(&self, role: SurfaceRole, surface: Surface) -> HwCommand {
        HwCommand::SurfaceState(SurfaceState {
            role,
            surface,
            bit_depth_minus8: self.seq.params.bit_depth_luma.saturating_sub(8),
            compression: self.compression(role, &surface),
        })
    }

    fn reference_surfaces(&self, session: &EncoderSessionState) -> [Option<SurfaceHandle>; 8] {
        let mut references = [None; 8];

        for (idx, ref_frame) in self.pic.ref_frames.iter().enumerate() {
            let Some(ref_frame) = ref_frame else {
                continue;
            };

            let Some(compact_id) = self.picture.compact_id(idx) else {
                continue;
            };

            let Some(entry) = session.ref_entry(ref_frame.frame_store) else {
                continue;
            };

            let surface = if self.pic.use_raw_pic_for_ref {
                entry.raw
            } else {
                entry.recon
            };

            if let Some(slot) = references.get_mut(usize::from(compact_id)) {
                *slot = surface.map(|surface| surface.handle);
            }
        }

        references
    }

    fn picture_state(&self, state: &PassState) -> PictureState {
        PictureState {
            coding_type: self.picture.coding_type,
            frame_width: self.seq.frame_width,
            frame_height: self.seq.frame_height,
            log2_max_cb_size: self.seq.params.log2_max_cb_size,
            qp_y: self.pic.qp_y,
            // With a separate SAO pass only that pass applies the filter
            sao_enabled: self.picture.sao_enabled
                && (self.picture.second_sao_pass == 0 || state.sao_only),
            lcu_max_bit_size: self.picture.lcu_max_bit_size,
            sao_only_pass: state.sao_only,
            min_qp: self.picture.min_qp,
            max_qp: self.picture.max_qp,
        }
    }

    fn picture_level<S: HardwareCommandSink>(
        &self,
        session: &EncoderSessionState,
        sink: &mut S,
        state: &PassState,
    ) -> Result<(), EncodeError> {
        if state.pass == 0 {
            if self.settings.tag_resource_sync {
                if let Some(tag) = sink.gpu_status_tag() {
                    emit(
                        sink,
                        HwCommand::StoreDataImm {
                            buffer: tag.buffer,
                            offset: tag.offset,
                            value: tag.value,
                        },
                    )?;
                }
            }

            wait_for_vdbox(session, sink)?;
        }

        emit(
            sink,
            HwCommand::StatusReportStart {
                buffer: self.status,
                offset: self.status_offset,
            },
        )?;

        emit(
            sink,
            HwCommand::PipeModeSelect(PipeModeSelect {
                brc_enabled: self.seq.brc_enabled,
                rdoq_enabled: self.settings.rdoq,
                stream_out: self.frame_stats.is_some(),
            }),
        )?;

        let recon = self.picture.recon.unwrap_or(self.picture.raw);

        emit(sink, self.surface_state(SurfaceRole::Source, self.picture.raw))?;
        emit(sink, self.surface_state(SurfaceRole::Reconstructed, recon))?;

        emit(
            sink,
            HwCommand::PipeBufAddr(PipeBufAddr {
                recon: Some(recon.handle),
                pak_object_data: self.pak_object_data,
                references: self.reference_surfaces(session),
                frame_stats: self.frame_stats,
            }),
        )?;

        emit(
            sink,
            HwCommand::IndObjBaseAddr(IndObjBaseAddr {
                bitstream: self.bitstream,
                pak_object_data: self.pak_object_data,
            }),
        )?;

        let quant_matrix = self.policy.quant_matrix(self.seq);
        emit(sink, HwCommand::FqmState(quant_matrix))?;
        emit(sink, HwCommand::QmState(quant_matrix))?;

        let picture_state = self.picture_state(state);

        match self.brc {
            // The BRC kernel wrote a picture state for every pass
            Some(brc) if !state.sao_only => emit(
                sink,
                HwCommand::BatchBufferStart {
                    buffer: brc.image_state_write,
                    offset: u32::from(state.pass) * (BRC_IMAGE_STATE_SIZE / BRC_MAX_PASSES),
                    second_level: true,
                },
            )?,
            _ => emit(sink, HwCommand::PictureState(picture_state))?,
        }

        if self.settings.rdoq {
            emit(sink, HwCommand::RdoqState(picture_state))?;
        }

        Ok(())
    }

    fn ref_idx_state(&self, slice: &SliceParams, list: usize) -> RefIdxState {
        let entries = slice.ref_pic_lists[list]
            .iter()
            .take(slice.num_ref_idx_active(list))
            .map(|&entry| {
                let idx = usize::from(entry?);
                let ref_frame = self.pic.ref_frames.get(idx).copied().flatten()?;

                Some(RefIdxEntry {
                    compact_id: self.picture.compact_id(idx)?,
                    temporal_difference: temporal_difference(self.pic.poc, Some(ref_frame.poc)),
                })
            })
            .collect();

        RefIdxState {
            list: list as u8,
            entries,
        }
    }

    fn slice_level<S: HardwareCommandSink>(&self, sink: &mut S) -> Result<(), EncodeError> {
        let (rounding_intra, rounding_inter) = rounding_offsets(&self.seq.params, self.pic);
        let last_slice = self.slices.len().saturating_sub(1);

        for (slice_index, slice) in self.slices.iter().enumerate() {
            let lists: &[usize] = match slice.slice_type {
                SliceType::I => &[],
                SliceType::P => &[0],
                SliceType::B => &[0, 1],
            };

            for &list in lists {
                emit(sink, HwCommand::RefIdxState(self.ref_idx_state(slice, list)))?;
            }

            let weighted = match slice.slice_type {
                SliceType::I => false,
                SliceType::P => self.pic.weighted_pred,
                SliceType::B => self.pic.weighted_bipred,
            };

            if weighted {
                for &list in lists {
                    emit(
                        sink,
                        HwCommand::WeightOffsetState(WeightOffsetState {
                            list: list as u8,
                            entries: slice.pred_weight_table.entries[list].clone(),
                        }),
                    )?;
                }
            }

            let slice_qp =
                (i16::from(self.pic.qp_y) + i16::from(slice.slice_qp_delta)).clamp(0, 51) as u8;

            let collocated_ref = match slice.slice_type {
                SliceType::I => None,
                SliceType::P | SliceType::B => self
                    .pic
                    .collocated_ref_idx
                    .and_then(|idx| self.picture.compact_id(usize::from(idx))),
            };

            emit(
                sink,
                HwCommand::SliceState(SliceState {
                    slice_index,
                    slice_type: slice.slice_type,
                    segment_address: slice.segment_address,
                    num_lcus: slice.num_lcus,
                    slice_qp,
                    last_slice: slice_index == last_slice,
                    sao_luma: self.picture.sao_enabled && slice.sao_luma,
                    sao_chroma: self.picture.sao_enabled && slice.sao_chroma,
                    deblocking_filter_disabled: slice.deblocking_filter_disabled,
                    rounding_intra,
                    rounding_inter,
                    collocated_ref,
                }),
            )?;

            // Parameter sets & SEI precede the first slice
            if slice_index == 0 {
                for nal in &self.pic.nal_units {
                    for insert in nal_unit_inserts(nal) {
                        emit(sink, HwCommand::InsertObject(insert))?;
                    }
                }
            }

            emit(sink, HwCommand::InsertObject(slice_header_insert(&slice.header)))?;

            let offset = self
                .slice_offsets
                .get(slice_index)
                .copied()
                .ok_or(EncodeError::NullResource("slice PAK objects"))?;

            emit(
                sink,
                HwCommand::BatchBufferStart {
                    buffer: self.pak_object_data,
                    offset,
                    second_level: true,
                },
            )?;
        }

        Ok(())
    }

    fn end_of_frame<S: HardwareCommandSink>(
        &self,
        sink: &mut S,
        state: &mut PassState,
    ) -> Result<(), EncodeError> {
        for (marker, nal) in &self.end_markers {
            state.header_bytes_inserted += nal.len() as u32;

            emit(sink, HwCommand::InsertObject(end_marker_insert(*marker, nal.clone())))?;
        }

        Ok(())
    }

    fn store_register<S: HardwareCommandSink>(
        &self,
        sink: &mut S,
        buffer: BufferHandle,
        offset: u32,
        register: u32,
    ) -> Result<(), EncodeError> {
        emit(
            sink,
            HwCommand::StoreRegisterMem {
                buffer,
                offset,
                register,
            },
        )
    }

    fn status_readback<S: HardwareCommandSink>(
        &self,
        sink: &mut S,
        state: &PassState,
    ) -> Result<(), EncodeError> {
        let registers = &self.caps.registers;
        let status = self.status;
        let base = self.status_offset;

        emit(sink, HwCommand::FlushDw)?;

        let status_registers = [
            (offsets::BYTECOUNT, registers.bitstream_bytecount_frame),
            (offsets::SE_BITCOUNT, registers.bitstream_se_bitcount_frame),
            (offsets::QP_STATUS_COUNT, registers.qp_status_count),
            (offsets::IMAGE_STATUS_MASK, registers.image_status_mask),
            (offsets::IMAGE_STATUS_CTRL, registers.image_status_ctrl),
        ];

        for (offset, register) in status_registers {
            self.store_register(sink, status, base + offset, register)?;
        }

        emit(sink, HwCommand::FlushDw)?;

        if let Some(brc) = self.brc {
            let stats = brc.pak_statistics;

            let stats_registers = [
                (pak_statistics::BYTECOUNT_FRAME, registers.bitstream_bytecount_frame),
                (
                    pak_statistics::BYTECOUNT_FRAME_NO_HEADER,
                    registers.bitstream_bytecount_frame_no_header,
                ),
                (pak_statistics::IMAGE_STATUS_CONTROL, registers.image_status_ctrl),
            ];

            for (offset, register) in stats_registers {
                self.store_register(sink, stats, offset, register)?;
            }

            emit(
                sink,
                HwCommand::StoreDataImm {
                    buffer: status,
                    offset: base + offsets::NUM_PASSES,
                    value: u32::from(state.pass),
                },
            )?;
        }

        if let Some(frame_stats) = self.frame_stats {
            for i in 0..NUM_SSE_DWORDS {
                emit(
                    sink,
                    HwCommand::CopyMemMem {
                        src: frame_stats,
                        src_offset: (FRAME_STATS_SSE_DWORD + i) * 4,
                        dst: status,
                        dst_offset: base + offsets::SUM_SQUARE_ERROR + i * 4,
                    },
                )?;
            }
        }

        emit(
            sink,
            HwCommand::StatusReportEnd {
                buffer: status,
                offset: base,
                feedback_number: self.pic.status_feedback_number,
            },
        )?;

        if !self.single_task_phase() || state.last_task {
            emit(sink, HwCommand::BatchBufferEnd)?;
        }

        Ok(())
    }

    fn submit<S: HardwareCommandSink>(
        &self,
        session: &mut EncoderSessionState,
        sink: &mut S,
        state: &PassState,
    ) -> Result<(), EncodeError> {
        if state.pass == 0 {
            if let Some(sync) = session.render_context_sync.take() {
                sink.engine_wait(sync, 1).map_err(EncodeError::hardware)?;
            }
        }

        if !self.single_task_phase() || state.last_task {
            sink.submit().map_err(EncodeError::hardware)?;
        } else {
            sink.return_command_buffer().map_err(EncodeError::hardware)?;
        }

        if state.pass == self.picture.num_passes && self.picture.signal_completion {
            signal_completion(session, sink, self.picture.tracked_slot)?;
        }

        Ok(())
    }
}
