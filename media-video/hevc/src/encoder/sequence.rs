use std::ops::RangeInclusive;

use crate::encoder::{
    config::{
        EncoderSettings, LcuBrcMode, MAX_ICQ_QUALITY_FACTOR, MIN_ICQ_QUALITY_FACTOR,
        RateControlMethod, SequenceParams,
    },
    error::{EncodeError, SoftConstraintViolation},
    hw::{HardwareCapabilities, ResourceAllocator},
    session::EncoderSessionState,
};

const MB_SIZE: u32 = 16;

/// Downscaled surfaces may not be smaller than this in either dimension
const MIN_SCALED_DIMENSION: u32 = 48;

const MAX_SLIDING_WINDOW: u32 = 60;

const BIT_DEPTHS: RangeInclusive<u8> = 8..=16;

const PIC_4K: (u32, u32) = (3840, 2160);
const PIC_16K: (u32, u32) = (16384, 4096);

/// Dimensions of a downscaled picture in units of 16x16 blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledDimensions {
    pub width_in_mb: u32,
    pub height_in_mb: u32,
}

impl ScaledDimensions {
    pub(crate) fn new(width: u32, height: u32, factor: u32) -> Self {
        let dim = |v: u32| (v / factor).div_ceil(MB_SIZE).max(MIN_SCALED_DIMENSION / MB_SIZE);

        Self {
            width_in_mb: dim(width),
            height_in_mb: dim(height),
        }
    }
}

/// Values derived from the [`SequenceParams`], valid until the next sequence
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub params: SequenceParams,

    pub frame_width: u32,
    pub frame_height: u32,

    pub log2_lcu_size: u8,
    pub width_in_lcu: u32,
    pub height_in_lcu: u32,

    pub width_in_mb: u32,
    pub height_in_mb: u32,

    pub scaled_4x: ScaledDimensions,
    pub scaled_16x: ScaledDimensions,
    pub scaled_32x: ScaledDimensions,

    pub brc_enabled: bool,
    /// LCU BRC as requested by the sequence, pictures with ROI regions may still enable it
    pub lcu_brc_enabled: bool,
    pub cqp: bool,

    pub resolution_changed: bool,
    pub sliding_window: u8,

    pub gop_is_idr_only: bool,
    pub is_4k: bool,
    pub is_16k: bool,

    /// Ultra HME is not supported in the fastest target usage
    pub hme_32x_allowed: bool,
}

impl SequenceConfig {
    pub fn lcu_size(&self) -> u32 {
        1 << self.log2_lcu_size
    }

    pub fn num_lcus(&self) -> u32 {
        self.width_in_lcu * self.height_in_lcu
    }

    pub fn num_mbs(&self) -> u32 {
        self.width_in_mb * self.height_in_mb
    }

    pub fn is_icq(&self) -> bool {
        self.params.rate_control == RateControlMethod::Icq
    }
}

/// Validate the sequence parameters and derive the sequence level state
pub fn configure_sequence<A: ResourceAllocator>(
    session: &mut EncoderSessionState,
    settings: &EncoderSettings,
    caps: &HardwareCapabilities,
    allocator: &mut A,
    params: &SequenceParams,
) -> Result<SequenceConfig, EncodeError> {
    let frame_width = params.frame_width();
    let frame_height = params.frame_height();

    let resolution_changed = match session.last_size {
        Some(last_size) => last_size != (frame_width, frame_height),
        None => false,
    };

    let (create_width, create_height) = session.create_size;
    if frame_width > create_width || frame_height > create_height {
        return Err(EncodeError::invalid(format!(
            "resolution {frame_width}x{frame_height} exceeds the session's resolution \
             {create_width}x{create_height}"
        )));
    }

    if !caps.rate_control.contains(params.rate_control.into()) {
        return Err(EncodeError::invalid(format!(
            "rate control method {:?} is not supported",
            params.rate_control
        )));
    }

    let brc_enabled = params.rate_control.is_brc();

    let mut lcu_brc_enabled = brc_enabled
        && match params.lcu_brc {
            LcuBrcMode::Internal => params.target_usage == 1,
            LcuBrcMode::Disabled => false,
            LcuBrcMode::Enabled => true,
        };

    if matches!(
        params.rate_control,
        RateControlMethod::Icq | RateControlMethod::Qvbr
    ) {
        // ICQ and QVBR are implemented by the LCU BRC kernel
        lcu_brc_enabled = true;

        if !(MIN_ICQ_QUALITY_FACTOR..=MAX_ICQ_QUALITY_FACTOR).contains(&params.icq_quality_factor) {
            return Err(EncodeError::invalid(format!(
                "invalid ICQ quality factor {}",
                params.icq_quality_factor
            )));
        }
    }

    if params.rate_control == RateControlMethod::Vcm {
        lcu_brc_enabled = false;
    }

    let lcu64 = match params.log2_max_cb_size {
        5 => false,
        6 if caps.lcu64 => true,
        size => {
            return Err(EncodeError::invalid(format!(
                "LCU size {} is not supported",
                1u32.checked_shl(u32::from(size)).unwrap_or(0)
            )));
        }
    };

    if params.frame_rate.denom == 0 {
        return Err(EncodeError::invalid("frame rate denominator must not be 0"));
    }

    if !BIT_DEPTHS.contains(&params.bit_depth_luma) {
        return Err(EncodeError::invalid(format!(
            "luma bit depth {} is not supported",
            params.bit_depth_luma
        )));
    }

    let sliding_window = (params.frame_rate.num / params.frame_rate.denom).min(MAX_SLIDING_WINDOW);

    let log2_lcu_size = params.log2_max_cb_size;
    let lcu_size = params.lcu_size();
    let width_in_lcu = frame_width.div_ceil(lcu_size);
    let height_in_lcu = frame_height.div_ceil(lcu_size);

    if width_in_lcu < 1 || lcu_size / MB_SIZE < 1 {
        return Err(EncodeError::invalid("picture is smaller than a single LCU"));
    }

    let reset_ignored =
        params.reset_brc && (!brc_enabled || params.rate_control == RateControlMethod::Icq);

    if lcu64 && session.scaled_2x_surface.is_none() {
        let surface = allocator
            .allocate_surface_2d(create_width / 2, create_height / 2, "2x downscaled surface")
            .map_err(EncodeError::allocation("2x downscaled surface"))?;

        session.scaled_2x_surface = Some(surface);
    }

    if resolution_changed {
        log::debug!("Resolution changed to {frame_width}x{frame_height}, reinitializing BRC");
        session.brc_init = true;
    }

    session.last_size = Some((frame_width, frame_height));

    session.brc_reset = params.reset_brc && !reset_ignored;
    if reset_ignored {
        session.record(SoftConstraintViolation::BrcResetIgnored);
    }

    if !params.parallel_brc {
        session.reset_brc_ring(false);
    }

    let pixels = frame_width * frame_height;

    let config = SequenceConfig {
        params: params.clone(),
        frame_width,
        frame_height,
        log2_lcu_size,
        width_in_lcu,
        height_in_lcu,
        width_in_mb: frame_width.div_ceil(MB_SIZE),
        height_in_mb: frame_height.div_ceil(MB_SIZE),
        scaled_4x: ScaledDimensions::new(frame_width, frame_height, 4),
        scaled_16x: ScaledDimensions::new(frame_width, frame_height, 16),
        scaled_32x: ScaledDimensions::new(frame_width, frame_height, 32),
        brc_enabled,
        lcu_brc_enabled,
        cqp: !brc_enabled,
        resolution_changed,
        sliding_window: sliding_window as u8,
        gop_is_idr_only: params.gop_size == 1,
        is_4k: pixels >= PIC_4K.0 * PIC_4K.1,
        is_16k: pixels >= PIC_16K.0 * PIC_16K.1,
        hme_32x_allowed: settings.hme.x32 && params.target_usage != 7,
    };

    log::trace!("Configured sequence {config:?}");

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{
        config::FrameRate,
        hw::{BufferHandle, Resource, Surface, SurfaceHandle, SyncObject},
    };
    use ezk_image::PixelFormat;

    #[derive(Debug, thiserror::Error)]
    #[error("out of memory")]
    struct OutOfMemory;

    #[derive(Default)]
    struct CountingAllocator {
        surfaces: u32,
    }

    impl ResourceAllocator for CountingAllocator {
        type Error = OutOfMemory;

        fn allocate_buffer(
            &mut self,
            _: usize,
            _: &'static str,
        ) -> Result<BufferHandle, OutOfMemory> {
            Err(OutOfMemory)
        }

        fn allocate_surface_2d(
            &mut self,
            width: u32,
            height: u32,
            _: &'static str,
        ) -> Result<Surface, OutOfMemory> {
            self.surfaces += 1;

            Ok(Surface {
                handle: SurfaceHandle(self.surfaces),
                width,
                height,
                pitch: width,
                format: PixelFormat::NV12,
            })
        }

        fn allocate_sync_object(&mut self, _: &'static str) -> Result<SyncObject, OutOfMemory> {
            Err(OutOfMemory)
        }

        fn lock(&mut self, _: Resource) -> Result<&mut [u8], OutOfMemory> {
            Err(OutOfMemory)
        }

        fn unlock(&mut self, _: Resource) -> Result<(), OutOfMemory> {
            Ok(())
        }

        fn free(&mut self, _: Resource) {}
    }

    fn configure(
        session: &mut EncoderSessionState,
        caps: &HardwareCapabilities,
        params: &SequenceParams,
    ) -> Result<SequenceConfig, EncodeError> {
        configure_sequence(
            session,
            &EncoderSettings::default(),
            caps,
            &mut CountingAllocator::default(),
            params,
        )
    }

    #[test]
    fn derives_frame_size() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let config = configure(
            &mut session,
            &HardwareCapabilities::default(),
            &SequenceParams::default(),
        )
        .unwrap();

        assert_eq!((config.frame_width, config.frame_height), (1920, 1080));
        assert_eq!((config.width_in_lcu, config.height_in_lcu), (60, 34));
        assert_eq!(config.num_mbs(), 120 * 68);
        assert_eq!(config.scaled_4x.width_in_mb, 30);
        assert_eq!(config.scaled_32x.width_in_mb, 4);
        assert_eq!(config.scaled_32x.height_in_mb, 3);
        assert!(config.cqp);
        assert!(!config.is_4k);
        assert_eq!(config.sliding_window, 30);
    }

    #[test]
    fn resolution_may_only_shrink() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let caps = HardwareCapabilities::default();

        let mut params = SequenceParams::default();
        configure(&mut session, &caps, &params).unwrap();
        session.brc_init = false;

        params.width_in_min_cb = 160;
        params.height_in_min_cb = 90;
        let config = configure(&mut session, &caps, &params).unwrap();
        assert!(config.resolution_changed);
        assert!(session.brc_init);

        params.width_in_min_cb = 480;
        assert!(matches!(
            configure(&mut session, &caps, &params),
            Err(EncodeError::InvalidParameter(..))
        ));
    }

    #[test]
    fn lcu_brc_selection() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let caps = HardwareCapabilities::default();

        let mut params = SequenceParams {
            rate_control: RateControlMethod::Cbr,
            target_usage: 1,
            ..Default::default()
        };
        assert!(configure(&mut session, &caps, &params).unwrap().lcu_brc_enabled);

        params.target_usage = 4;
        assert!(!configure(&mut session, &caps, &params).unwrap().lcu_brc_enabled);

        params.rate_control = RateControlMethod::Icq;
        assert!(configure(&mut session, &caps, &params).unwrap().lcu_brc_enabled);

        params.rate_control = RateControlMethod::Vcm;
        params.lcu_brc = LcuBrcMode::Enabled;
        assert!(!configure(&mut session, &caps, &params).unwrap().lcu_brc_enabled);

        params.rate_control = RateControlMethod::Cqp;
        assert!(!configure(&mut session, &caps, &params).unwrap().lcu_brc_enabled);
    }

    #[test]
    fn icq_quality_factor_is_validated() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let params = SequenceParams {
            rate_control: RateControlMethod::Qvbr,
            icq_quality_factor: 0,
            ..Default::default()
        };

        assert!(matches!(
            configure(&mut session, &HardwareCapabilities::default(), &params),
            Err(EncodeError::InvalidParameter(..))
        ));
    }

    #[test]
    fn lcu64_needs_hardware_support() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let mut caps = HardwareCapabilities::default();
        let params = SequenceParams {
            log2_max_cb_size: 6,
            ..Default::default()
        };

        assert!(configure(&mut session, &caps, &params).is_err());

        caps.lcu64 = true;
        let mut allocator = CountingAllocator::default();
        for _ in 0..2 {
            configure_sequence(
                &mut session,
                &EncoderSettings::default(),
                &caps,
                &mut allocator,
                &params,
            )
            .unwrap();
        }

        assert_eq!(allocator.surfaces, 1);
        assert_eq!(session.scaled_2x_surface.map(|s| s.width), Some(960));
    }

    #[test]
    fn zero_frame_rate_denominator() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let params = SequenceParams {
            frame_rate: FrameRate { num: 30, denom: 0 },
            ..Default::default()
        };

        assert!(configure(&mut session, &HardwareCapabilities::default(), &params).is_err());
    }

    #[test]
    fn bit_depth_is_validated() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let caps = HardwareCapabilities::default();

        for bit_depth_luma in [0, 7, 17, 40] {
            let params = SequenceParams {
                bit_depth_luma,
                ..Default::default()
            };

            assert!(matches!(
                configure(&mut session, &caps, &params),
                Err(EncodeError::InvalidParameter(..))
            ));
        }

        let params = SequenceParams {
            bit_depth_luma: 10,
            ..Default::default()
        };
        assert!(configure(&mut session, &caps, &params).is_ok());
    }

    #[test]
    fn rejected_sequence_leaves_session_unchanged() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let caps = HardwareCapabilities {
            lcu64: true,
            ..Default::default()
        };

        configure(&mut session, &caps, &SequenceParams::default()).unwrap();
        session.brc_init = false;

        let params = SequenceParams {
            width_in_min_cb: 160,
            height_in_min_cb: 90,
            log2_max_cb_size: 6,
            reset_brc: true,
            frame_rate: FrameRate { num: 30, denom: 0 },
            ..Default::default()
        };

        let mut allocator = CountingAllocator::default();
        let result = configure_sequence(
            &mut session,
            &EncoderSettings::default(),
            &caps,
            &mut allocator,
            &params,
        );

        assert!(result.is_err());
        assert_eq!(session.last_size, Some((1920, 1080)));
        assert!(!session.brc_init);
        assert!(!session.brc_reset);
        assert!(session.violations.is_empty());
        assert!(session.scaled_2x_surface.is_none());
        assert_eq!(allocator.surfaces, 0);
    }

    #[test]
    fn sliding_window_is_capped() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let params = SequenceParams {
            frame_rate: FrameRate::from_fps(120),
            ..Default::default()
        };

        let config = configure(&mut session, &HardwareCapabilities::default(), &params).unwrap();
        assert_eq!(config.sliding_window, 60);
    }

    #[test]
    fn brc_reset_in_cqp_is_ignored() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let params = SequenceParams {
            reset_brc: true,
            ..Default::default()
        };

        configure(&mut session, &HardwareCapabilities::default(), &params).unwrap();
        assert!(!session.brc_reset);
        assert_eq!(
            session.violations,
            [SoftConstraintViolation::BrcResetIgnored]
        );
    }

    #[test]
    fn tu7_disables_ultra_hme() {
        let mut session = EncoderSessionState::new(&EncoderSettings::default());
        let params = SequenceParams {
            target_usage: 7,
            ..Default::default()
        };

        let config = configure(&mut session, &HardwareCapabilities::default(), &params).unwrap();
        assert!(!config.hme_32x_allowed);
    }
}
