use crate::encoder::{
    config::{CodingType, EncoderSettings, MAX_REF_FRAMES, NUM_FRAME_STORES, RefFrame},
    error::SoftConstraintViolation,
    hw::{BufferHandle, Surface, SyncObject},
};

/// Number of recycled BRC buffer sets
pub const BRC_RING_SIZE: usize = 6;

/// Number of frames the BRC statistics read index trails the write index
///
/// With parallel BRC the kernels of a frame run while the PAK of the previous frame is still in
/// flight, so they read the statistics of the frame before it. Otherwise the frame's kernels run
/// after the previous PAK completed and read the slot it wrote.
pub fn brc_ring_delay(parallel_brc: bool) -> usize {
    if parallel_brc { 2 } else { 0 }
}

/// Number of PAK slice level batch buffers cycled through
pub const PAK_SLICE_RING_SIZE: u8 = 3;

/// Reference synchronization state of a tracked buffer slot
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceSyncSlot {
    pub sync: Option<SyncObject>,
    /// Semaphore memory the VDBOX may wait on
    pub semaphore_memory: Option<BufferHandle>,
    pub in_use: bool,
    /// Number of signals outstanding on `sync`
    pub signal_count: u32,
}

/// Entry of the session wide reference list, indexed by frame store
#[derive(Debug, Clone)]
pub struct RefListEntry {
    pub tracked_slot: u8,
    pub poc: i32,
    pub used_as_ref: bool,
    pub raw: Option<Surface>,
    pub recon: Option<Surface>,
    /// Unique references used by the picture when it was encoded
    pub ref_list: Vec<RefFrame>,
}

/// Cursor over the tracked buffer slots (PAK object data & reference sync)
#[derive(Debug, Clone, Copy)]
pub struct TrackedBuffers {
    pub count: u8,
    pub current: u8,
    pub last: u8,
    pub minus2: u8,
}

impl TrackedBuffers {
    fn new(count: u8) -> Self {
        Self {
            count: count.max(1),
            current: 0,
            last: 0,
            minus2: 0,
        }
    }

    /// Move to the next slot once a frame was completely submitted
    ///
    /// `last` and `minus2` then name the slots of the previous two frames.
    pub(crate) fn advance(&mut self) {
        self.minus2 = self.last;
        self.last = self.current;
        self.current = (self.current + 1) % self.count;
    }
}

/// Frame class used for the min/max QP bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QpClass {
    I = 0,
    P = 1,
    B = 2,
}

impl From<CodingType> for QpClass {
    fn from(value: CodingType) -> Self {
        match value {
            CodingType::I => QpClass::I,
            CodingType::P => QpClass::P,
            CodingType::B | CodingType::B1 | CodingType::B2 => QpClass::B,
        }
    }
}

/// Min/max QP per frame class, persistent across frames
#[derive(Debug, Clone, Copy)]
pub struct QpBounds {
    pub enabled: bool,
    min: [u8; 3],
    max: [u8; 3],
    explicit: [bool; 3],
}

impl Default for QpBounds {
    fn default() -> Self {
        Self {
            enabled: false,
            min: [1; 3],
            max: [51; 3],
            explicit: [false; 3],
        }
    }
}

impl QpBounds {
    /// Apply the bounds of a picture, either value being non-zero enables min/max QP control
    pub(crate) fn update(&mut self, coding_type: CodingType, min: u8, max: u8) {
        if min == 0 && max == 0 {
            return;
        }

        self.enabled = true;

        let max = max.clamp(1, 51);
        let min = min.clamp(1, max);

        let class = QpClass::from(coding_type);
        self.set(class, min, max);

        if class != QpClass::I {
            self.explicit[class as usize] = true;
        }

        let inherit: &[QpClass] = match class {
            QpClass::I => &[QpClass::P, QpClass::B],
            QpClass::P => &[QpClass::B],
            QpClass::B => &[],
        };

        for &class in inherit {
            if !self.explicit[class as usize] {
                self.set(class, min, max);
            }
        }
    }

    fn set(&mut self, class: QpClass, min: u8, max: u8) {
        self.min[class as usize] = min;
        self.max[class as usize] = max;
    }

    pub fn for_type(&self, coding_type: CodingType) -> (u8, u8) {
        let class = QpClass::from(coding_type) as usize;
        (self.min[class], self.max[class])
    }
}

/// All mutable state which carries over from one frame to the next
#[derive(Debug)]
pub struct EncoderSessionState {
    pub frame_num: u32,
    pub first_frame: bool,
    /// Set for the first two frames, the parallel BRC pipeline is not yet filled
    pub first_two_frames: bool,

    /// Size the session's buffers were allocated for
    pub create_size: (u32, u32),
    /// Size of the previous sequence
    pub last_size: Option<(u32, u32)>,

    pub brc_init: bool,
    pub brc_reset: bool,
    pub brc_read_index: usize,
    pub brc_write_index: usize,

    pub pak_slice_index: u8,
    pub tracked: TrackedBuffers,

    pub qp_bounds: QpBounds,

    pub ref_list: Vec<Option<RefListEntry>>,
    /// Frame store of the previously encoded picture
    pub prev_frame_store: Option<u8>,

    pub sync_slots: Vec<ReferenceSyncSlot>,
    /// Sync object of the render context, waited on by the first pass of a frame
    pub render_context_sync: Option<SyncObject>,

    pub current_pass: u8,
    pub first_task_in_phase: bool,
    pub last_task_in_phase: bool,
    pub new_seq_header: bool,
    pub new_pps_header: bool,

    /// 2x downscaled source used by the LCU64 kernels, allocated with the first LCU64 sequence
    pub scaled_2x_surface: Option<Surface>,

    /// Soft constraint violations of the current frame
    pub violations: Vec<SoftConstraintViolation>,
}

impl EncoderSessionState {
    pub fn new(settings: &EncoderSettings) -> Self {
        Self {
            frame_num: 0,
            first_frame: true,
            first_two_frames: true,
            create_size: settings.max_resolution,
            last_size: None,
            brc_init: true,
            brc_reset: false,
            brc_read_index: 0,
            brc_write_index: 0,
            pak_slice_index: 0,
            tracked: TrackedBuffers::new(settings.tracked_buffers),
            qp_bounds: QpBounds::default(),
            ref_list: vec![None; NUM_FRAME_STORES],
            prev_frame_store: None,
            sync_slots: vec![
                ReferenceSyncSlot::default();
                usize::from(settings.tracked_buffers.max(1))
            ],
            render_context_sync: None,
            current_pass: 0,
            first_task_in_phase: true,
            last_task_in_phase: true,
            new_seq_header: false,
            new_pps_header: false,
            scaled_2x_surface: None,
            violations: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, violation: SoftConstraintViolation) {
        self.violations.push(violation.log());
    }

    pub(crate) fn ref_entry(&self, frame_store: u8) -> Option<&RefListEntry> {
        self.ref_list
            .get(usize::from(frame_store))
            .and_then(Option::as_ref)
    }

    /// Restart the BRC ring at slot 0
    pub(crate) fn reset_brc_ring(&mut self, parallel_brc: bool) {
        self.brc_read_index = 0;
        self.brc_write_index = brc_ring_delay(parallel_brc) % BRC_RING_SIZE;
    }

    /// Whether the read index trails the write index by [`brc_ring_delay`]
    pub fn brc_ring_consistent(&self, parallel_brc: bool) -> bool {
        let delay = brc_ring_delay(parallel_brc);
        self.brc_read_index == (self.brc_write_index + BRC_RING_SIZE - delay) % BRC_RING_SIZE
    }

    pub(crate) fn sync_slot_mut(&mut self, slot: u8) -> Option<&mut ReferenceSyncSlot> {
        self.sync_slots.get_mut(usize::from(slot))
    }

    /// Update the session after the final pass of a frame was submitted
    pub(crate) fn finish_frame(&mut self, parallel_brc: bool) {
        self.pak_slice_index = (self.pak_slice_index + 1) % PAK_SLICE_RING_SIZE;

        if parallel_brc {
            self.brc_read_index = (self.brc_read_index + 1) % BRC_RING_SIZE;
            self.brc_write_index = (self.brc_write_index + 1) % BRC_RING_SIZE;
        }

        self.new_seq_header = false;
        self.new_pps_header = false;
        self.frame_num += 1;

        self.first_two_frames = self.first_frame;
        self.first_frame = false;

        self.tracked.advance();
    }
}

/// Unique valid entries of a picture's reference frame list, in list order
pub(crate) fn unique_refs(ref_frames: &[Option<RefFrame>; MAX_REF_FRAMES]) -> Vec<RefFrame> {
    let mut unique: Vec<RefFrame> = Vec::with_capacity(MAX_REF_FRAMES);

    for ref_frame in ref_frames.iter().flatten() {
        if !unique.iter().any(|r| r.frame_store == ref_frame.frame_store) {
            unique.push(*ref_frame);
        }
    }

    unique
}
