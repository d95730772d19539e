use bitstream_io::{BigEndian, BitWrite, BitWriter};
use bytes::Bytes;
use std::io;

pub(crate) const NAL_EOS: u8 = 36;
pub(crate) const NAL_EOB: u8 = 37;

pub(crate) struct HevcBitStreamWriter {
    buf: BitWriter<Vec<u8>, BigEndian>,
}

impl HevcBitStreamWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: BitWriter::new(Vec::new()),
        }
    }

    fn write_bits<const BITS: u32>(&mut self, value: impl Into<u32>) -> io::Result<()> {
        self.buf.write::<BITS, u32>(value.into())
    }

    pub(crate) fn write_nal_start_code_prefix(&mut self) -> io::Result<()> {
        for byte in [0u8, 0, 0, 1] {
            self.write_bits::<8>(byte)?;
        }

        Ok(())
    }

    pub(crate) fn write_nal_header(
        &mut self,
        nal_unit_type: u8,
        temporal_id: u8,
    ) -> io::Result<()> {
        // forbidden zero bit
        self.write_bits::<1>(0u32)?;
        self.write_bits::<6>(nal_unit_type)?;
        // nuh_layer_id
        self.write_bits::<6>(0u32)?;
        self.write_bits::<3>(temporal_id + 1)
    }

    /// Returns the written bytes, padding a partial last byte with zeros
    pub(crate) fn finish(mut self) -> io::Result<Bytes> {
        self.buf.byte_align()?;

        Ok(Bytes::from(self.buf.into_writer()))
    }
}

/// Complete NAL unit without payload, like end of sequence or end of bitstream
pub(crate) fn empty_nal_unit(nal_unit_type: u8) -> io::Result<Bytes> {
    let mut writer = HevcBitStreamWriter::new();

    writer.write_nal_start_code_prefix()?;
    writer.write_nal_header(nal_unit_type, 0)?;

    writer.finish()
}
