//! Hierarchical motion estimation ahead of the BRC kernels

use crate::encoder::{
    error::EncodeError,
    hw::{ComputeKernelExecutor, KernelDispatch, MeScale, Resource, ResourceAllocator, Surface},
    picture::PictureConfig,
    sequence::{ScaledDimensions, SequenceConfig},
};

/// Motion vector records per macroblock row of a ME output surface
const ME_DATA_SIZE_MULTIPLIER: u32 = 10;

#[derive(Debug)]
struct MeSurfaces {
    x4: Surface,
    x16: Surface,
    x32: Surface,
}

fn allocate_output<A: ResourceAllocator>(
    allocator: &mut A,
    dimensions: ScaledDimensions,
    name: &'static str,
) -> Result<Surface, EncodeError> {
    let width = (dimensions.width_in_mb * 32).next_multiple_of(64);
    let height = dimensions.height_in_mb * 4 * ME_DATA_SIZE_MULTIPLIER;

    allocator
        .allocate_surface_2d(width, height, name)
        .map_err(EncodeError::allocation(name))
}

/// Owns the output surfaces of the HME levels and dispatches the ME kernels
#[derive(Debug, Default)]
pub struct MotionEstimation {
    surfaces: Option<MeSurfaces>,
}

impl MotionEstimation {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_surfaces<A: ResourceAllocator>(
        &mut self,
        allocator: &mut A,
        create_size: (u32, u32),
    ) -> Result<&MeSurfaces, EncodeError> {
        if self.surfaces.is_none() {
            let (width, height) = create_size;

            let mut output = |factor: u32, name: &'static str| {
                allocate_output(allocator, ScaledDimensions::new(width, height, factor), name)
            };

            let surfaces = MeSurfaces {
                x4: output(4, "4x ME output")?,
                x16: output(16, "16x ME output")?,
                x32: output(32, "32x ME output")?,
            };

            log::debug!("Allocated HME surfaces for {width}x{height}");

            self.surfaces = Some(surfaces);
        }

        self.surfaces
            .as_ref()
            .ok_or(EncodeError::NullResource("HME surfaces"))
    }

    /// Run the enabled HME levels from the coarsest to the finest
    ///
    /// Each level uses the output of the previous one as predictor. Returns the number of
    /// dispatched kernels.
    pub fn run<A, E>(
        &mut self,
        create_size: (u32, u32),
        seq: &SequenceConfig,
        picture: &PictureConfig,
        allocator: &mut A,
        executor: &mut E,
    ) -> Result<usize, EncodeError>
    where
        A: ResourceAllocator,
        E: ComputeKernelExecutor,
    {
        let hme = picture.hme;

        if !(hme.x4 || hme.x16 || hme.x32) {
            return Ok(0);
        }

        let surfaces = self.ensure_surfaces(allocator, create_size)?;

        let levels = [
            (MeScale::X32, hme.x32 && hme.x16, seq.scaled_32x, surfaces.x32),
            (MeScale::X16, hme.x16, seq.scaled_16x, surfaces.x16),
            (MeScale::X4, hme.x4, seq.scaled_4x, surfaces.x4),
        ];

        let mut coarser_ran = false;
        let mut dispatched = 0;

        for (scale, enabled, dimensions, output) in levels {
            if !enabled {
                coarser_ran = false;
                continue;
            }

            log::trace!("Dispatch {scale:?} motion estimation");

            executor
                .execute(KernelDispatch::MotionEstimation {
                    scale,
                    width_in_mb: dimensions.width_in_mb,
                    height_in_mb: dimensions.height_in_mb,
                    output: output.handle,
                    use_coarser_level: coarser_ran,
                })
                .map_err(EncodeError::hardware)?;

            coarser_ran = true;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    pub(crate) fn free<A: ResourceAllocator>(&mut self, allocator: &mut A) {
        if let Some(surfaces) = self.surfaces.take() {
            for surface in [surfaces.x4, surfaces.x16, surfaces.x32] {
                allocator.free(Resource::Surface(surface.handle));
            }
        }
    }
}
