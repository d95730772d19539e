use crate::encoder::hw::{BufferHandle, Surface};
use bytes::Bytes;
use ezk_image::PixelFormat;
use smallvec::SmallVec;

/// Number of entries in a picture's reference frame list
pub const MAX_REF_FRAMES: usize = 15;

/// Number of distinct reference pictures the hardware can address at once
pub const MAX_COMPACT_REF_IDS: usize = 8;

/// Number of frame store entries an application may use to identify pictures
pub const NUM_FRAME_STORES: usize = 127;

pub const MAX_SLICE_QP: u8 = 51;

pub const MIN_ICQ_QUALITY_FACTOR: u8 = 1;
pub const MAX_ICQ_QUALITY_FACTOR: u8 = 51;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlMethod {
    /// Constant QP, BRC is disabled
    Cqp,
    Cbr,
    Vbr,
    Avbr,
    /// Intelligent constant quality
    Icq,
    /// Quality defined VBR
    Qvbr,
    /// Video conferencing mode, frame level BRC only
    Vcm,
}

impl RateControlMethod {
    pub fn is_brc(self) -> bool {
        !matches!(self, RateControlMethod::Cqp)
    }
}

/// Request for LCU (coding tree unit) level BRC
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcuBrcMode {
    /// Decided by the target usage
    #[default]
    Internal,
    Disabled,
    Enabled,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    /// Returns if a raw picture of the given format can be encoded with this chroma format
    pub fn accepts(self, format: PixelFormat) -> bool {
        match self {
            ChromaFormat::Monochrome | ChromaFormat::Yuv420 => {
                matches!(format, PixelFormat::NV12 | PixelFormat::I420)
            }
            ChromaFormat::Yuv422 => matches!(format, PixelFormat::I422),
            ChromaFormat::Yuv444 => matches!(format, PixelFormat::I444),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameRate {
    pub num: u32,
    pub denom: u32,
}

impl FrameRate {
    pub const fn from_fps(fps: u32) -> Self {
        Self { num: fps, denom: 1 }
    }
}

/// Per sequence coding parameters
///
/// Re-applied on every new sequence (e.g. after an IDR with new parameter sets or a resolution
/// change).
#[derive(Debug, Clone)]
pub struct SequenceParams {
    /// Picture width in units of the minimum coding block size
    pub width_in_min_cb: u32,
    /// Picture height in units of the minimum coding block size
    pub height_in_min_cb: u32,

    /// log2 of the minimum coding block size, must be at least 3
    pub log2_min_cb_size: u8,
    /// log2 of the LCU size, 5 (32x32) or 6 (64x64)
    pub log2_max_cb_size: u8,

    pub chroma_format: ChromaFormat,
    pub bit_depth_luma: u8,

    pub rate_control: RateControlMethod,
    pub lcu_brc: LcuBrcMode,

    /// Quality/speed trade-off, 1 is best quality, 7 is fastest
    pub target_usage: u8,

    pub frame_rate: FrameRate,

    /// Quality factor used by ICQ and QVBR rate control, must be in `1..=51`
    pub icq_quality_factor: u8,

    pub gop_size: u16,
    /// Number of B frames per hierarchy level in the GOP
    pub num_b_in_gop: [u16; 3],

    pub sao_enabled: bool,
    pub scaling_list_enabled: bool,

    /// Request a reset of the bitrate controller with this sequence
    pub reset_brc: bool,

    /// ROI values are delta QPs (priority levels are not supported)
    pub roi_value_in_delta_qp: bool,

    /// Run the BRC kernel pipelined two frames ahead of PAK
    pub parallel_brc: bool,

    /// CQP with distortion statistics for surveillance use cases
    pub video_surveillance: bool,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            width_in_min_cb: 240,
            height_in_min_cb: 135,
            log2_min_cb_size: 3,
            log2_max_cb_size: 5,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth_luma: 8,
            rate_control: RateControlMethod::Cqp,
            lcu_brc: LcuBrcMode::Internal,
            target_usage: 4,
            frame_rate: FrameRate::from_fps(30),
            icq_quality_factor: 26,
            gop_size: 30,
            num_b_in_gop: [0; 3],
            sao_enabled: false,
            scaling_list_enabled: false,
            reset_brc: false,
            roi_value_in_delta_qp: true,
            parallel_brc: false,
            video_surveillance: false,
        }
    }
}

impl SequenceParams {
    pub fn frame_width(&self) -> u32 {
        self.width_in_min_cb << self.log2_min_cb_size
    }

    pub fn frame_height(&self) -> u32 {
        self.height_in_min_cb << self.log2_min_cb_size
    }

    pub fn lcu_size(&self) -> u32 {
        1 << self.log2_max_cb_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingType {
    I,
    P,
    B,
    /// B frame on the first hierarchy level
    B1,
    /// B frame on the second hierarchy level
    B2,
}

impl CodingType {
    pub fn is_intra(self) -> bool {
        self == CodingType::I
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    B,
    P,
    I,
}

/// Entry of a picture's reference frame list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefFrame {
    /// Frame store index of the referenced picture
    pub frame_store: u8,
    pub poc: i32,
}

/// Region of interest in units of 16x16 blocks, `right` and `bottom` are exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiRegion {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    /// Delta QP applied inside the region
    pub delta_qp: i8,
}

/// Application provided NAL unit (VPS/SPS/PPS/SEI..) inserted in front of the first slice header
#[derive(Debug, Clone, Default)]
pub struct PackedNalUnit {
    /// Complete NAL unit including its start code
    pub data: Bytes,
    pub insert_emulation_bytes: bool,
    /// Number of leading bytes the hardware must not check for emulation
    pub skip_emulation_check_count: u8,
}

/// Application packed slice header
#[derive(Debug, Clone, Default)]
pub struct PackedSliceHeader {
    pub data: Bytes,
    /// Number of valid bits in `data`
    pub bit_length: u32,
    pub skip_emulation_check_count: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightEntry {
    pub delta_luma_weight: i8,
    pub luma_offset: i16,
    pub delta_chroma_weight: [i8; 2],
    pub chroma_offset: [i16; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub chroma_log2_weight_denom: u8,
    pub entries: [SmallVec<[WeightEntry; 4]>; 2],
}

/// Reference picture list of a slice, entries index into [`PictureParams::ref_frames`]
///
/// `None` entries are invalid/unused.
pub type RefPicList = SmallVec<[Option<u8>; 4]>;

#[derive(Debug, Clone)]
pub struct SliceParams {
    /// Address of the first LCU of the slice segment
    pub segment_address: u32,
    pub num_lcus: u32,
    pub slice_type: SliceType,

    /// Active reference lists L0 & L1, the list length is the active reference count
    pub ref_pic_lists: [RefPicList; 2],

    pub slice_qp_delta: i8,
    pub sao_luma: bool,
    pub sao_chroma: bool,
    pub deblocking_filter_disabled: bool,

    pub pred_weight_table: PredWeightTable,

    pub header: PackedSliceHeader,
}

impl SliceParams {
    pub fn num_ref_idx_active(&self, list: usize) -> usize {
        self.ref_pic_lists[list].len()
    }
}

/// Overrides of the quantizer rounding offsets
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundingOffsets {
    pub intra: Option<u8>,
    pub inter: Option<u8>,
}

/// Per frame coding parameters
#[derive(Debug, Clone)]
pub struct PictureParams {
    /// Nominal coding type as written into the picture header
    pub coding_type: CodingType,

    /// Frame store index of the current picture
    pub frame_store: u8,
    pub poc: i32,

    pub raw_surface: Option<Surface>,
    pub recon_surface: Option<Surface>,
    pub bitstream_buffer: Option<BufferHandle>,

    pub ref_frames: [Option<RefFrame>; MAX_REF_FRAMES],

    /// Index into `ref_frames` of the collocated picture for temporal MV prediction
    pub collocated_ref_idx: Option<u8>,

    pub qp_y: u8,

    pub used_as_ref: bool,
    pub use_raw_pic_for_ref: bool,
    pub field_pic: bool,

    pub last_pic_in_seq: bool,
    pub last_pic_in_stream: bool,

    /// Minimum QP for frames of this coding type, 0 if unset
    pub brc_min_qp: u8,
    /// Maximum QP for frames of this coding type, 0 if unset
    pub brc_max_qp: u8,

    /// Hierarchy level of the picture plus one, 0 if the GOP is flat
    pub hierarchical_level_plus1: u8,

    pub roi: SmallVec<[RoiRegion; 4]>,

    /// Maximum number of bits a single LCU may produce, 0 to derive it
    pub lcu_max_bit_size: u32,

    pub weighted_pred: bool,
    pub weighted_bipred: bool,

    pub tiles_enabled: bool,
    pub emulation_byte_insertion: bool,

    pub rounding: RoundingOffsets,

    /// Packed headers inserted before the first slice of the picture
    pub nal_units: Vec<PackedNalUnit>,

    /// Returned in the status report to associate it with this frame
    pub status_feedback_number: u32,
}

impl Default for PictureParams {
    fn default() -> Self {
        Self {
            coding_type: CodingType::I,
            frame_store: 0,
            poc: 0,
            raw_surface: None,
            recon_surface: None,
            bitstream_buffer: None,
            ref_frames: [None; MAX_REF_FRAMES],
            collocated_ref_idx: None,
            qp_y: 26,
            used_as_ref: true,
            use_raw_pic_for_ref: false,
            field_pic: false,
            last_pic_in_seq: false,
            last_pic_in_stream: false,
            brc_min_qp: 0,
            brc_max_qp: 0,
            hierarchical_level_plus1: 0,
            roi: SmallVec::new(),
            lcu_max_bit_size: 0,
            weighted_pred: false,
            weighted_bipred: false,
            tiles_enabled: false,
            emulation_byte_insertion: true,
            rounding: RoundingOffsets::default(),
            nal_units: Vec::new(),
            status_feedback_number: 0,
        }
    }
}

/// Which hierarchical motion estimation levels the session may use
#[derive(Debug, Clone, Copy)]
pub struct HmeSupport {
    pub x4: bool,
    pub x16: bool,
    pub x32: bool,
}

impl Default for HmeSupport {
    fn default() -> Self {
        Self {
            x4: true,
            x16: true,
            x32: true,
        }
    }
}

/// Options of an encode session, fixed at construction
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Maximum width & height of the pictures to be encoded.
    ///
    /// Buffers are sized for this resolution, later sequences may only shrink the picture.
    pub max_resolution: (u32, u32),

    /// Accumulate all passes of a frame into a single submission
    pub single_task_phase: bool,

    /// Command buffer and patch list are large enough to batch multiple PAK passes
    pub single_task_phase_in_pak: bool,

    /// Write the previous frame's GPU tag at the start of the first pass
    pub tag_resource_sync: bool,

    pub rdoq: bool,
    pub hme: HmeSupport,

    /// Allocate a frame statistics stream out buffer used for PSNR reporting
    pub frame_stats: bool,

    /// Write smoothing bands around ROI regions into the ROI surface
    pub roi_smoothing: bool,

    /// Number of tracked buffer slots (PAK object data + reference sync)
    pub tracked_buffers: u8,

    /// Number of status report records in the status buffer
    pub status_reports: u32,

    /// Allocate semaphore memory per tracked slot, the VDBOX waits on it before starting a new
    /// frame
    pub vdbox_semaphores: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            max_resolution: (1920, 1080),
            single_task_phase: false,
            single_task_phase_in_pak: true,
            tag_resource_sync: false,
            rdoq: false,
            hme: HmeSupport::default(),
            frame_stats: false,
            roi_smoothing: false,
            tracked_buffers: 8,
            status_reports: 64,
            vdbox_semaphores: false,
        }
    }
}
