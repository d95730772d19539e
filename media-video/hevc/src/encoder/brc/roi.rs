use crate::encoder::{
    config::RoiRegion,
    error::EncodeError,
    hw::{Resource, ResourceAllocator, Surface, with_locked},
};

const MAX_ROI_RATIO: u32 = 51;

/// Value of a block inside a region, smoothing bands count down from here
const ROI_INSIDE: u32 = 15;

/// Ratio of the whole picture to the area covered by ROI regions, used to weight the ROI QP
/// adjustment
pub fn roi_ratio(regions: &[RoiRegion], num_mbs: u32) -> u8 {
    let roi_size: u64 = regions
        .iter()
        .map(|r| {
            let height = u64::from(r.top.abs_diff(r.bottom)) + 1;
            let width = u64::from(r.right.abs_diff(r.left)) + 1;

            16 * height * 16 * width
        })
        .sum();

    if roi_size == 0 {
        return 0;
    }

    // Regions covering more than the picture get the maximum ratio
    let ratio = (u64::from(num_mbs) * 256 / roi_size)
        .checked_sub(1)
        .map_or(u64::from(MAX_ROI_RATIO), |quotient| quotient * 2);

    ratio.min(u64::from(MAX_ROI_RATIO)) as u8
}

/// Writes the per block ROI control words the LCU BRC kernel reads
#[derive(Debug, Clone, Copy)]
pub struct RoiSurfaceWriter<'a> {
    regions: &'a [RoiRegion],
    width_in_mb: u32,
    height_in_mb: u32,
    smoothing: bool,
}

impl<'a> RoiSurfaceWriter<'a> {
    pub fn new(
        regions: &'a [RoiRegion],
        width_in_mb: u32,
        height_in_mb: u32,
        smoothing: bool,
    ) -> Self {
        Self {
            regions,
            width_in_mb,
            height_in_mb,
            smoothing,
        }
    }

    /// Control word of the block at `(x, y)`
    ///
    /// Regions are visited from last to first, so the first matching region of the list decides the
    /// value.
    pub fn block_value(&self, x: u32, y: u32) -> u32 {
        let (x, y) = (i64::from(x), i64::from(y));

        let mut value = 0;

        for region in self.regions.iter().rev() {
            if region.delta_qp == 0 {
                continue;
            }

            let qp_bits = (u32::from(region.delta_qp as u8)) << 16;

            let within = |margin: i64| {
                x >= i64::from(region.left) - margin
                    && x < i64::from(region.right) + margin
                    && y >= i64::from(region.top) - margin
                    && y < i64::from(region.bottom) + margin
            };

            if within(0) {
                value = ROI_INSIDE | qp_bits;
            } else if self.smoothing {
                if let Some(band) = (1..=3).find(|&margin| within(margin)) {
                    value = (ROI_INSIDE - band as u32) | qp_bits;
                }
            }
        }

        value
    }

    /// Fill a surface of 32 bit words with a row stride of `pitch / 4`
    pub fn write(&self, data: &mut [u8], pitch: u32) -> Result<(), EncodeError> {
        let stride = (pitch / 4) as usize;

        if stride < self.width_in_mb as usize {
            return Err(EncodeError::invalid(format!(
                "ROI surface pitch {pitch} is too small for {} blocks",
                self.width_in_mb
            )));
        }

        for y in 0..self.height_in_mb {
            for x in 0..self.width_in_mb {
                let offset = (y as usize * stride + x as usize) * 4;

                let word = data
                    .get_mut(offset..offset + 4)
                    .ok_or_else(|| EncodeError::invalid("ROI surface is too small"))?;

                word.copy_from_slice(&self.block_value(x, y).to_le_bytes());
            }
        }

        Ok(())
    }

    pub(crate) fn write_surface<A: ResourceAllocator>(
        &self,
        allocator: &mut A,
        surface: &Surface,
    ) -> Result<(), EncodeError> {
        with_locked(
            allocator,
            Resource::Surface(surface.handle),
            "BRC ROI surface",
            |data| self.write(data, surface.pitch),
        )?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(left: u32, top: u32, right: u32, bottom: u32, delta_qp: i8) -> RoiRegion {
        RoiRegion {
            left,
            top,
            right,
            bottom,
            delta_qp,
        }
    }

    #[test]
    fn inside_and_outside() {
        let regions = [region(2, 2, 4, 4, -5)];
        let writer = RoiSurfaceWriter::new(&regions, 8, 8, false);

        let qp = u32::from((-5i8) as u8) << 16;
        assert_eq!(writer.block_value(2, 2), 15 | qp);
        assert_eq!(writer.block_value(3, 3), 15 | qp);
        assert_eq!(writer.block_value(4, 3), 0);
        assert_eq!(writer.block_value(1, 2), 0);
    }

    #[test]
    fn smoothing_bands() {
        let regions = [region(4, 4, 6, 6, 3)];
        let writer = RoiSurfaceWriter::new(&regions, 16, 16, true);

        let qp = 3 << 16;
        assert_eq!(writer.block_value(4, 4), 15 | qp);
        assert_eq!(writer.block_value(3, 4), 14 | qp);
        assert_eq!(writer.block_value(7, 7), 13 | qp);
        assert_eq!(writer.block_value(1, 5), 12 | qp);
        assert_eq!(writer.block_value(0, 5), 0);
    }

    #[test]
    fn first_region_wins() {
        let regions = [region(0, 0, 4, 4, 2), region(2, 2, 6, 6, 7)];
        let writer = RoiSurfaceWriter::new(&regions, 8, 8, false);

        assert_eq!(writer.block_value(3, 3), 15 | (2 << 16));
        assert_eq!(writer.block_value(5, 5), 15 | (7 << 16));
    }

    #[test]
    fn zero_delta_is_skipped() {
        let regions = [region(0, 0, 4, 4, 0), region(0, 0, 2, 2, 1)];
        let writer = RoiSurfaceWriter::new(&regions, 8, 8, false);

        assert_eq!(writer.block_value(1, 1), 15 | (1 << 16));
        assert_eq!(writer.block_value(3, 3), 0);
    }

    #[test]
    fn write_uses_pitch() {
        let regions = [region(1, 1, 2, 2, 4)];
        let writer = RoiSurfaceWriter::new(&regions, 2, 2, false);

        let mut data = vec![0xAAu8; 16 * 2];
        writer.write(&mut data, 16).unwrap();

        let word = |x: usize, y: usize| {
            let offset = (y * 4 + x) * 4;
            u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
        };

        assert_eq!(word(0, 0), 0);
        assert_eq!(word(1, 1), 15 | (4 << 16));
        // Padding beyond the picture width is left untouched
        assert_eq!(word(2, 0), 0xAAAA_AAAA);

        assert!(writer.write(&mut data, 4).is_err());
    }

    #[test]
    fn ratio() {
        // 1920x1080 has 8160 blocks, a 10x10 region covers 121 blocks
        let regions = [region(0, 0, 10, 10, 3)];
        assert_eq!(roi_ratio(&regions, 8160), 51);

        let regions = [region(0, 0, 59, 59, 3)];
        assert_eq!(roi_ratio(&regions, 8160), 2 * (8160 * 256 / (3600 * 256) - 1) as u8);

        assert_eq!(roi_ratio(&[], 8160), 0);
    }

    #[test]
    fn ratio_of_regions_larger_than_the_picture() {
        // 120x68 blocks exactly cover the picture
        let regions = [region(0, 0, 119, 67, 3)];
        assert_eq!(roi_ratio(&regions, 8160), 0);

        let regions = [region(0, 0, 119, 67, 3), region(0, 0, 3, 3, -2)];
        assert_eq!(roi_ratio(&regions, 8160), 51);
    }
}
