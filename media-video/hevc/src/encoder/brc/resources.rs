use crate::encoder::{
    error::EncodeError,
    hw::{BufferHandle, Resource, ResourceAllocator, Surface, with_locked},
    sequence::ScaledDimensions,
    session::BRC_RING_SIZE,
};

/// Size of the picture state the BRC kernel writes for a single PAK pass
pub const BRC_IMG_STATE_SIZE_PER_PASS: u32 = 128;

/// Maximum number of PAK passes the BRC kernel writes picture states for
pub const BRC_MAX_PASSES: u32 = 7;

pub const BRC_IMAGE_STATE_SIZE: u32 = BRC_IMG_STATE_SIZE_PER_PASS * BRC_MAX_PASSES;

const BRC_HISTORY_SIZE: usize = 576;
const BRC_PAK_STATISTICS_SIZE: usize = 32;
const BRC_CONSTANT_DATA_SIZE: usize = 64 * 53;

/// Offsets into a PAK statistics buffer
pub mod pak_statistics {
    pub const BYTECOUNT_FRAME: u32 = 0;
    pub const BYTECOUNT_FRAME_NO_HEADER: u32 = 4;
    pub const IMAGE_STATUS_CONTROL: u32 = 8;
    pub const IMAGE_STATUS_CONTROL_FOR_LAST_PASS: u32 = 16;
}

/// Buffers recycled between frames, one set per ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrcBufferSet {
    pub pak_statistics: BufferHandle,
    pub image_state_read: BufferHandle,
    pub image_state_write: BufferHandle,
    pub constant_data: BufferHandle,
}

/// All buffers owned by the bitrate controller
#[derive(Debug)]
pub struct BrcBuffers {
    pub sets: Vec<BrcBufferSet>,
    pub history: BufferHandle,
    pub intra_distortion: Surface,
    pub me_distortion: Surface,
    pub lcu_qp: Surface,
    pub roi: Surface,
}

fn align(v: u32, to: u32) -> u32 {
    v.div_ceil(to) * to
}

impl BrcBuffers {
    /// Allocate the BRC buffers for pictures of up to `scaled_4x` (4x downscaled) blocks
    pub(crate) fn allocate<A: ResourceAllocator>(
        allocator: &mut A,
        scaled_4x: ScaledDimensions,
    ) -> Result<Self, EncodeError> {
        let mut sets = Vec::with_capacity(BRC_RING_SIZE);

        for _ in 0..BRC_RING_SIZE {
            let mut buffer = |size: usize, name: &'static str| {
                allocator
                    .allocate_buffer(size, name)
                    .map_err(EncodeError::allocation(name))
            };

            sets.push(BrcBufferSet {
                pak_statistics: buffer(BRC_PAK_STATISTICS_SIZE, "BRC PAK statistics")?,
                image_state_read: buffer(BRC_IMAGE_STATE_SIZE as usize, "BRC image state read")?,
                image_state_write: buffer(BRC_IMAGE_STATE_SIZE as usize, "BRC image state write")?,
                constant_data: buffer(BRC_CONSTANT_DATA_SIZE, "BRC constant data")?,
            });
        }

        let history = allocator
            .allocate_buffer(BRC_HISTORY_SIZE, "BRC history")
            .map_err(EncodeError::allocation("BRC history"))?;

        // The kernel interprets a zeroed history as "no previous frames"
        with_locked(allocator, Resource::Buffer(history), "BRC history", |data| {
            data.fill(0)
        })?;

        let ScaledDimensions {
            width_in_mb: w,
            height_in_mb: h,
        } = scaled_4x;

        let mut surface = |width: u32, height: u32, name: &'static str| {
            allocator
                .allocate_surface_2d(width, height, name)
                .map_err(EncodeError::allocation(name))
        };

        let distortion_width = align(w * 8, 64);
        let distortion_height = align(h * 4, 8) * 2;

        let buffers = Self {
            sets,
            history,
            intra_distortion: surface(distortion_width, distortion_height, "BRC intra distortion")?,
            me_distortion: surface(distortion_width, distortion_height, "BRC ME distortion")?,
            lcu_qp: surface(align(w * 4, 64), align(h * 4, 8), "BRC LCU QP")?,
            roi: surface(align(w * 16, 64), align(h * 4, 8), "BRC ROI")?,
        };

        log::debug!(
            "Allocated BRC buffers, ring of {} sets, ROI surface {}x{}",
            buffers.sets.len(),
            buffers.roi.width,
            buffers.roi.height
        );

        Ok(buffers)
    }

    pub(crate) fn set(&self, index: usize) -> Option<&BrcBufferSet> {
        self.sets.get(index)
    }

    pub(crate) fn free<A: ResourceAllocator>(self, allocator: &mut A) {
        for set in self.sets {
            allocator.free(Resource::Buffer(set.pak_statistics));
            allocator.free(Resource::Buffer(set.image_state_read));
            allocator.free(Resource::Buffer(set.image_state_write));
            allocator.free(Resource::Buffer(set.constant_data));
        }

        allocator.free(Resource::Buffer(self.history));

        for surface in [
            self.intra_distortion,
            self.me_distortion,
            self.lcu_qp,
            self.roi,
        ] {
            allocator.free(Resource::Surface(surface.handle));
        }
    }
}
