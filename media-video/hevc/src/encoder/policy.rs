//! Extension points of the orchestrator for codec and hardware generation specifics

use crate::encoder::{
    hw::{CompressionMode, HardwareCapabilities, QuantMatrix, Surface, SurfaceRole},
    picture::PictureConfig,
    sequence::SequenceConfig,
};

/// Codec level decisions which differ between hardware generations
pub trait CodecPolicy {
    /// Emit a frame tracking prolog again before the given PAK pass
    ///
    /// By default this is done for the SAO only pass of a BRC frame, which otherwise inherits the
    /// untracked prolog of the BRC passes.
    fn force_filter_pass_header(
        &self,
        seq: &SequenceConfig,
        picture: &PictureConfig,
        pass: u8,
    ) -> bool {
        seq.brc_enabled
            && picture.sao_enabled
            && picture.second_sao_pass != 0
            && pass == picture.second_sao_pass
    }

    fn quant_matrix(&self, seq: &SequenceConfig) -> QuantMatrix {
        if seq.params.scaling_list_enabled {
            QuantMatrix::Default
        } else {
            QuantMatrix::Flat
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodecPolicy;

impl CodecPolicy for DefaultCodecPolicy {}

/// Source of the [`HardwareCapabilities`] of the device the session runs on
pub trait HardwareGeneration {
    fn capabilities(&self) -> HardwareCapabilities;
}

impl HardwareGeneration for HardwareCapabilities {
    fn capabilities(&self) -> HardwareCapabilities {
        self.clone()
    }
}

/// Memory compression of the surfaces the PAK reads and writes
pub trait MmcPolicy {
    fn compression(&self, role: SurfaceRole, surface: &Surface) -> CompressionMode;
}
