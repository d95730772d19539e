//! Per frame status records written by the hardware and the reports derived from them

use crate::encoder::config::ChromaFormat;

/// Size of a single status record in the status buffer
pub const STATUS_REPORT_SIZE: u32 = 64;

/// Offsets into a status record
pub mod offsets {
    /// Written by the status report end command once the frame completed
    pub const FEEDBACK_NUMBER: u32 = 0;
    pub const BYTECOUNT: u32 = 8;
    pub const SE_BITCOUNT: u32 = 12;
    pub const IMAGE_STATUS_MASK: u32 = 16;
    pub const IMAGE_STATUS_CTRL: u32 = 20;
    pub const NUM_PASSES: u32 = 24;
    pub const QP_STATUS_COUNT: u32 = 32;
    pub const IMAGE_STATUS_CTRL_OF_LAST_BRC_PASS: u32 = 36;
    /// Three 64 bit sums of squared errors (Y, U, V)
    pub const SUM_SQUARE_ERROR: u32 = 40;
}

/// Image status control register of the PAK
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImageStatusControl(pub u32);

impl ImageStatusControl {
    /// The frame exceeded its size limit and was coded in panic mode
    pub fn panic(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// Index of the last executed PAK pass
    pub fn total_pass(self) -> u8 {
        ((self.0 >> 8) & 0xF) as u8
    }

    pub fn cumulative_frame_delta_qp(self) -> i8 {
        (self.0 >> 24) as u8 as i8
    }
}

/// Raw content of a status record
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub feedback_number: u32,
    pub bytecount: u32,
    pub se_bitcount: u32,
    pub image_status_mask: u32,
    pub image_status_ctrl: ImageStatusControl,
    pub num_passes: u32,
    pub qp_status_count: u32,
    pub image_status_ctrl_of_last_brc_pass: ImageStatusControl,
    pub sum_square_error: [u64; 3],
}

impl StatusRecord {
    /// Parse a record from the little endian status buffer memory
    pub fn parse(data: &[u8]) -> Option<Self> {
        let u32_at = |offset: u32| -> Option<u32> {
            let offset = offset as usize;
            let bytes = data.get(offset..offset + 4)?;
            Some(u32::from_le_bytes(bytes.try_into().ok()?))
        };

        let u64_at = |offset: u32| -> Option<u64> {
            let offset = offset as usize;
            let bytes = data.get(offset..offset + 8)?;
            Some(u64::from_le_bytes(bytes.try_into().ok()?))
        };

        Some(Self {
            feedback_number: u32_at(offsets::FEEDBACK_NUMBER)?,
            bytecount: u32_at(offsets::BYTECOUNT)?,
            se_bitcount: u32_at(offsets::SE_BITCOUNT)?,
            image_status_mask: u32_at(offsets::IMAGE_STATUS_MASK)?,
            image_status_ctrl: ImageStatusControl(u32_at(offsets::IMAGE_STATUS_CTRL)?),
            num_passes: u32_at(offsets::NUM_PASSES)?,
            qp_status_count: u32_at(offsets::QP_STATUS_COUNT)?,
            image_status_ctrl_of_last_brc_pass: ImageStatusControl(u32_at(
                offsets::IMAGE_STATUS_CTRL_OF_LAST_BRC_PASS,
            )?),
            sum_square_error: [
                u64_at(offsets::SUM_SQUARE_ERROR)?,
                u64_at(offsets::SUM_SQUARE_ERROR + 8)?,
                u64_at(offsets::SUM_SQUARE_ERROR + 16)?,
            ],
        })
    }

    /// Sum of the QPs of all LCUs in the frame
    pub fn cumulative_qp(&self) -> u32 {
        self.qp_status_count & 0x00FF_FFFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub feedback_number: u32,
    pub status: EncodeStatus,
    /// Size of the coded frame in bytes
    pub bitstream_size: u32,
    pub average_qp: u8,
    /// QP delta the BRC suggests for the next frame
    pub suggested_qp_delta: i8,
    pub num_passes: u8,
    pub panic: bool,
    /// PSNR x 100 for Y, U and V, available when frame statistics are enabled
    pub psnr: Option<[u16; 3]>,
}

impl StatusReport {
    pub fn failed(feedback_number: u32) -> Self {
        Self {
            feedback_number,
            status: EncodeStatus::Failed,
            bitstream_size: 0,
            average_qp: 0,
            suggested_qp_delta: 0,
            num_passes: 0,
            panic: false,
            psnr: None,
        }
    }
}

/// Receiver of per frame status reports
pub trait StatusSink {
    fn report(&mut self, report: StatusReport);
}

/// Frame properties needed to turn a [`StatusRecord`] into a [`StatusReport`]
#[derive(Debug, Clone, Copy)]
pub struct ReportContext {
    pub feedback_number: u32,
    /// Bytes inserted into the bitstream which the hardware byte count doesn't include
    pub header_bytes_inserted: u32,
    pub num_lcus: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub chroma_format: ChromaFormat,
    pub bit_depth: u8,
    pub frame_stats: bool,
}

const MAX_PSNR_X100: f64 = 10000.0;

/// PSNR x 100 of a plane from its sum of squared errors
pub fn psnr_x100(sse: u64, num_pixels: u32, bit_depth: u8) -> u16 {
    // 8 bit content is processed as 10 bit by the hardware
    let sse = if bit_depth == 8 { sse >> 4 } else { sse };

    if sse == 0 {
        return MAX_PSNR_X100 as u16;
    }

    let peak = 2f64.powi(i32::from(bit_depth)) - 1.0;
    let psnr = 1000.0 * (peak * peak * f64::from(num_pixels) / sse as f64).log10();

    psnr.clamp(0.0, MAX_PSNR_X100) as u16
}

impl ReportContext {
    fn chroma_pixels(&self) -> u32 {
        let luma = self.frame_width * self.frame_height;

        match self.chroma_format {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::Yuv420 => luma / 4,
            ChromaFormat::Yuv422 => luma / 2,
            ChromaFormat::Yuv444 => luma,
        }
    }

    pub fn report(&self, record: &StatusRecord) -> StatusReport {
        let ctrl = record.image_status_ctrl;

        let mut suggested_qp_delta = ctrl.cumulative_frame_delta_qp();

        // The last BRC pass may report a zero delta
        if ctrl.total_pass() > 0 && suggested_qp_delta == 0 {
            suggested_qp_delta = record
                .image_status_ctrl_of_last_brc_pass
                .cumulative_frame_delta_qp();
        }

        let average_qp = if self.num_lcus == 0 {
            0
        } else {
            (record.cumulative_qp() / self.num_lcus) as u8
        };

        let psnr = self.frame_stats.then(|| {
            let luma = self.frame_width * self.frame_height;
            let chroma = self.chroma_pixels();

            [
                psnr_x100(record.sum_square_error[0], luma, self.bit_depth),
                psnr_x100(record.sum_square_error[1], chroma, self.bit_depth),
                psnr_x100(record.sum_square_error[2], chroma, self.bit_depth),
            ]
        });

        StatusReport {
            feedback_number: self.feedback_number,
            status: EncodeStatus::Success,
            bitstream_size: record.bytecount + self.header_bytes_inserted,
            average_qp,
            suggested_qp_delta,
            num_passes: ctrl.total_pass() + 1,
            panic: ctrl.panic(),
            psnr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ReportContext {
        ReportContext {
            feedback_number: 7,
            header_bytes_inserted: 6,
            num_lcus: 60 * 34,
            frame_width: 1920,
            frame_height: 1080,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: 8,
            frame_stats: false,
        }
    }

    fn record_bytes(fields: &[(u32, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; STATUS_REPORT_SIZE as usize];

        for &(offset, value) in fields {
            let offset = offset as usize;
            data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        data
    }

    #[test]
    fn image_status_control_fields() {
        let ctrl = ImageStatusControl(0xFE00_0304);

        assert!(ctrl.panic());
        assert_eq!(ctrl.total_pass(), 3);
        assert_eq!(ctrl.cumulative_frame_delta_qp(), -2);
    }

    #[test]
    fn parse_and_report() {
        let data = record_bytes(&[
            (offsets::FEEDBACK_NUMBER, 7),
            (offsets::BYTECOUNT, 1000),
            (offsets::IMAGE_STATUS_CTRL, 0x0300_0100),
            (offsets::QP_STATUS_COUNT, 0xAB00_0000 | (30 * 2040)),
        ]);

        let record = StatusRecord::parse(&data).unwrap();
        assert_eq!(record.cumulative_qp(), 30 * 2040);

        let report = context().report(&record);
        assert_eq!(report.status, EncodeStatus::Success);
        assert_eq!(report.bitstream_size, 1006);
        assert_eq!(report.average_qp, 30);
        assert_eq!(report.suggested_qp_delta, 3);
        assert_eq!(report.num_passes, 2);
        assert!(!report.panic);
        assert_eq!(report.psnr, None);

        assert!(StatusRecord::parse(&data[..40]).is_none());
    }

    #[test]
    fn delta_qp_from_last_brc_pass() {
        let data = record_bytes(&[
            (offsets::IMAGE_STATUS_CTRL, 0x0000_0200),
            (offsets::IMAGE_STATUS_CTRL_OF_LAST_BRC_PASS, 0xFB00_0000),
        ]);

        let report = context().report(&StatusRecord::parse(&data).unwrap());
        assert_eq!(report.suggested_qp_delta, -5);
        assert_eq!(report.num_passes, 3);
    }

    #[test]
    fn psnr() {
        assert_eq!(psnr_x100(0, 100, 8), 10000);

        // peak^2 * pixels / sse == 10^4 -> 40 dB
        let pixels = 1920 * 1080;
        let sse = 255u64 * 255 * pixels as u64 / 10_000;
        assert!((3999..=4000).contains(&psnr_x100(sse << 4, pixels, 8)));

        // Same error at a higher bit depth means a higher PSNR
        assert!(psnr_x100(sse, pixels, 10) > psnr_x100(sse, pixels, 8));

        // Errors larger than the peak clamp to 0
        assert_eq!(psnr_x100(u64::MAX, 4, 10), 0);

        // Peak values beyond 32 bit
        assert_eq!(psnr_x100(1, 4, 40), 10000);
    }

    #[test]
    fn psnr_per_plane() {
        let mut data = record_bytes(&[]);
        let offset = offsets::SUM_SQUARE_ERROR as usize;
        data[offset..offset + 8].copy_from_slice(&(1u64 << 20).to_le_bytes());

        let context = ReportContext {
            frame_stats: true,
            chroma_format: ChromaFormat::Monochrome,
            ..context()
        };

        let psnr = context.report(&StatusRecord::parse(&data).unwrap()).psnr.unwrap();
        assert!(psnr[0] > 0 && psnr[0] < 10000);
        // No chroma error at all
        assert_eq!(psnr[1], 10000);
        assert_eq!(psnr[2], 10000);
    }
}
