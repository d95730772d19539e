//! Interfaces to the hardware, kernel dispatch and memory management collaborators
//!
//! The orchestration engine never touches hardware directly. It emits typed [`HwCommand`]
//! descriptors into a [`HardwareCommandSink`], dispatches kernels through a
//! [`ComputeKernelExecutor`] and obtains all of its memory from a [`ResourceAllocator`].

use crate::encoder::{
    config::{CodingType, RateControlMethod, SliceType, WeightEntry},
    error::EncodeError,
};
use bytes::Bytes;
use ezk_image::PixelFormat;
use smallvec::SmallVec;
use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncObject(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(BufferHandle),
    Surface(SurfaceHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub handle: SurfaceHandle,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes
    pub pitch: u32,
    pub format: PixelFormat,
}

/// Memory and sync object provider
///
/// All allocations must be zero initialized.
pub trait ResourceAllocator {
    type Error: Error + Send + Sync + 'static;

    fn allocate_buffer(&mut self, size: usize, name: &'static str)
    -> Result<BufferHandle, Self::Error>;

    fn allocate_surface_2d(
        &mut self,
        width: u32,
        height: u32,
        name: &'static str,
    ) -> Result<Surface, Self::Error>;

    fn allocate_sync_object(&mut self, name: &'static str) -> Result<SyncObject, Self::Error>;

    /// Map the resource into host memory. Must be followed by [`unlock`](Self::unlock).
    fn lock(&mut self, resource: Resource) -> Result<&mut [u8], Self::Error>;
    fn unlock(&mut self, resource: Resource) -> Result<(), Self::Error>;

    fn free(&mut self, resource: Resource);
}

/// Lock `resource`, hand its memory to `f` and unlock it again
pub(crate) fn with_locked<A, T>(
    allocator: &mut A,
    resource: Resource,
    name: &'static str,
    f: impl FnOnce(&mut [u8]) -> T,
) -> Result<T, EncodeError>
where
    A: ResourceAllocator,
{
    let data = allocator
        .lock(resource)
        .map_err(EncodeError::allocation(name))?;

    let result = f(data);

    allocator
        .unlock(resource)
        .map_err(EncodeError::allocation(name))?;

    Ok(result)
}

/// Previous GPU status tag, written at the beginning of a frame when tag resource sync is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuStatusTag {
    pub buffer: BufferHandle,
    pub offset: u32,
    pub value: u32,
}

/// Receiver of hardware commands
///
/// Commands are recorded into the currently open command buffer until it is submitted.
pub trait HardwareCommandSink {
    type Error: Error + Send + Sync + 'static;

    /// Open (or continue) the primary command buffer
    fn command_buffer(&mut self) -> Result<(), Self::Error>;

    fn add_command(&mut self, command: HwCommand) -> Result<(), Self::Error>;

    /// Return the command buffer without submitting it, it is continued by the next call to
    /// `command_buffer`
    fn return_command_buffer(&mut self) -> Result<(), Self::Error>;

    fn submit(&mut self) -> Result<(), Self::Error>;

    /// Make the engine wait until `sync` has been signaled `count` times
    fn engine_wait(&mut self, sync: SyncObject, count: u32) -> Result<(), Self::Error>;

    /// Signal `sync` once the previously submitted work completes
    fn engine_signal(&mut self, sync: SyncObject) -> Result<(), Self::Error>;

    fn gpu_status_tag(&mut self) -> Option<GpuStatusTag> {
        None
    }
}

/// Motion estimation decimation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeScale {
    X4,
    X16,
    X32,
}

/// Compute kernels run ahead of the PAK passes
#[derive(Debug, Clone, PartialEq)]
pub enum KernelDispatch {
    MotionEstimation {
        scale: MeScale,
        width_in_mb: u32,
        height_in_mb: u32,
        /// Output motion vectors & distortion surface
        output: SurfaceHandle,
        /// Use the output of the next coarser level as predictor
        use_coarser_level: bool,
    },
    BrcInitReset {
        reset: bool,
        history: BufferHandle,
        sliding_window: u8,
    },
    BrcFrameUpdate {
        history: BufferHandle,
        pak_statistics: BufferHandle,
        image_state_read: BufferHandle,
        image_state_write: BufferHandle,
        constant_data: BufferHandle,
        distortion: SurfaceHandle,
        picture_header_bits: u32,
        frame_brc_level: u8,
        max_num_paks: u8,
        /// Quality factor of ICQ & QVBR rate control
        quality_factor: Option<u8>,
        roi_ratio: u8,
        min_qp: u8,
        max_qp: u8,
    },
    BrcLcuUpdate {
        history: BufferHandle,
        qp_surface: SurfaceHandle,
        roi_surface: Option<SurfaceHandle>,
    },
}

pub trait ComputeKernelExecutor {
    type Error: Error + Send + Sync + 'static;

    fn execute(&mut self, dispatch: KernelDispatch) -> Result<(), Self::Error>;

    /// Sync object signaled once the dispatched kernels completed
    ///
    /// The first PAK pass of a frame waits on it before consuming the kernel output.
    fn completion_sync(&mut self) -> Option<SyncObject> {
        None
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RateControlModes: u32 {
        const CQP = 1 << 0;
        const CBR = 1 << 1;
        const VBR = 1 << 2;
        const AVBR = 1 << 3;
        const ICQ = 1 << 4;
        const QVBR = 1 << 5;
        const VCM = 1 << 6;
    }
}

impl From<RateControlMethod> for RateControlModes {
    fn from(value: RateControlMethod) -> Self {
        match value {
            RateControlMethod::Cqp => Self::CQP,
            RateControlMethod::Cbr => Self::CBR,
            RateControlMethod::Vbr => Self::VBR,
            RateControlMethod::Avbr => Self::AVBR,
            RateControlMethod::Icq => Self::ICQ,
            RateControlMethod::Qvbr => Self::QVBR,
            RateControlMethod::Vcm => Self::VCM,
        }
    }
}

/// MMIO offsets of the codec engine status registers
#[derive(Debug, Clone, Copy)]
pub struct MmioRegisters {
    pub bitstream_bytecount_frame: u32,
    pub bitstream_bytecount_frame_no_header: u32,
    pub bitstream_se_bitcount_frame: u32,
    pub qp_status_count: u32,
    pub image_status_mask: u32,
    pub image_status_ctrl: u32,
}

/// Limits and features of a hardware generation
#[derive(Debug, Clone)]
pub struct HardwareCapabilities {
    pub max_num_slices: u32,

    pub max_l0_references: u8,
    pub max_l1_references: u8,

    /// Number of PAK passes the BRC may run for a single frame
    pub brc_num_pak_passes: u8,

    /// SAO requires a second, separate PAK pass
    pub second_sao_pass: bool,

    /// 64x64 LCUs are supported (requires the 2x scaling kernel)
    pub lcu64: bool,

    pub rate_control: RateControlModes,

    /// Size of a single PAK object command in dwords
    pub pak_object_dwords: u32,

    pub raw_formats: Vec<PixelFormat>,

    pub registers: MmioRegisters,
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        Self {
            max_num_slices: 600,
            max_l0_references: 4,
            max_l1_references: 4,
            brc_num_pak_passes: 4,
            second_sao_pass: false,
            lcu64: false,
            rate_control: RateControlModes::all(),
            pak_object_dwords: 5,
            raw_formats: vec![PixelFormat::NV12],
            registers: MmioRegisters {
                bitstream_bytecount_frame: 0x1e9a0,
                bitstream_bytecount_frame_no_header: 0x1e9a4,
                bitstream_se_bitcount_frame: 0x1e9a8,
                qp_status_count: 0x1e9ac,
                image_status_mask: 0x1e9b0,
                image_status_ctrl: 0x1e9b4,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeModeSelect {
    pub brc_enabled: bool,
    pub rdoq_enabled: bool,
    pub stream_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceRole {
    Source,
    Reconstructed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceState {
    pub role: SurfaceRole,
    pub surface: Surface,
    pub bit_depth_minus8: u8,
    pub compression: CompressionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeBufAddr {
    pub recon: Option<SurfaceHandle>,
    pub pak_object_data: BufferHandle,
    /// Reference pictures by compact reference id
    pub references: [Option<SurfaceHandle>; 8],
    pub frame_stats: Option<BufferHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndObjBaseAddr {
    pub bitstream: BufferHandle,
    pub pak_object_data: BufferHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMatrix {
    Flat,
    Default,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureState {
    pub coding_type: CodingType,
    pub frame_width: u32,
    pub frame_height: u32,
    pub log2_max_cb_size: u8,
    pub qp_y: u8,
    pub sao_enabled: bool,
    pub lcu_max_bit_size: u32,
    /// Second SAO pass only applies the in-loop filter
    pub sao_only_pass: bool,
    pub min_qp: u8,
    pub max_qp: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceState {
    pub slice_index: usize,
    pub slice_type: SliceType,
    pub segment_address: u32,
    pub num_lcus: u32,
    pub slice_qp: u8,
    pub last_slice: bool,
    pub sao_luma: bool,
    pub sao_chroma: bool,
    pub deblocking_filter_disabled: bool,
    pub rounding_intra: u8,
    pub rounding_inter: u8,
    /// Collocated reference as compact reference id
    pub collocated_ref: Option<u8>,
}

/// One entry of a hardware reference index list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefIdxEntry {
    /// Compact reference id (0..8)
    pub compact_id: u8,
    /// Temporal distance to the current picture, clamped to i8
    pub temporal_difference: i8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefIdxState {
    pub list: u8,
    pub entries: SmallVec<[Option<RefIdxEntry>; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightOffsetState {
    pub list: u8,
    pub entries: SmallVec<[WeightEntry; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMarker {
    EndOfSequence,
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertObject {
    pub payload: Bytes,
    pub bit_size: u32,
    pub emulation_bytes: bool,
    pub skip_emulation_check_count: u8,
    pub last_header: bool,
    pub end_of_slice: bool,
    pub end_marker: Option<EndMarker>,
}

/// Typed hardware command descriptors
#[derive(Debug, Clone, PartialEq)]
pub enum HwCommand {
    /// OS dependent command buffer header
    Prolog {
        frame_tracking: bool,
    },
    StatusReportStart {
        buffer: BufferHandle,
        offset: u32,
    },
    StatusReportEnd {
        buffer: BufferHandle,
        offset: u32,
        feedback_number: u32,
    },

    PipeModeSelect(PipeModeSelect),
    SurfaceState(SurfaceState),
    PipeBufAddr(PipeBufAddr),
    IndObjBaseAddr(IndObjBaseAddr),
    FqmState(QuantMatrix),
    QmState(QuantMatrix),
    PictureState(PictureState),
    RdoqState(PictureState),
    SliceState(SliceState),
    RefIdxState(RefIdxState),
    WeightOffsetState(WeightOffsetState),
    InsertObject(InsertObject),

    /// End the batch buffer if the masked value at `buffer + offset` is zero.
    ///
    /// Evaluated by the device, the host never observes the outcome.
    ConditionalBatchBufferEnd {
        buffer: BufferHandle,
        offset: u32,
    },
    BatchBufferStart {
        buffer: BufferHandle,
        offset: u32,
        second_level: bool,
    },
    BatchBufferEnd,
    StoreRegisterMem {
        buffer: BufferHandle,
        offset: u32,
        register: u32,
    },
    LoadRegisterMem {
        buffer: BufferHandle,
        offset: u32,
        register: u32,
    },
    StoreDataImm {
        buffer: BufferHandle,
        offset: u32,
        value: u32,
    },
    CopyMemMem {
        src: BufferHandle,
        src_offset: u32,
        dst: BufferHandle,
        dst_offset: u32,
    },
    FlushDw,
    /// Wait on a semaphore in memory until it reaches `value`
    HwWait {
        buffer: BufferHandle,
        value: u32,
    },
}
