#![allow(dead_code)]

use ezk_hevc::encoder::{
    PackedSliceHeader, PictureParams, PredWeightTable, SequenceParams, SliceParams, SliceType,
    StatusReport, StatusSink,
    hw::{
        BufferHandle, ComputeKernelExecutor, HardwareCommandSink, HwCommand, KernelDispatch,
        Resource, ResourceAllocator, Surface, SurfaceHandle, SyncObject,
    },
};
use ezk_image::PixelFormat;
use std::{cell::RefCell, collections::HashMap, convert::Infallible, io, rc::Rc};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Allocator backed by host memory
#[derive(Default)]
pub(crate) struct MemoryAllocator {
    next_id: u32,
    pub(crate) memory: HashMap<Resource, Vec<u8>>,
    pub(crate) names: HashMap<Resource, &'static str>,
    pub(crate) sync_objects: Vec<SyncObject>,
    pub(crate) locked: Vec<Resource>,
    pub(crate) freed: Vec<Resource>,
}

impl MemoryAllocator {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn buffers_named(&self, name: &str) -> Vec<BufferHandle> {
        let mut buffers: Vec<_> = self
            .names
            .iter()
            .filter(|(_, n)| **n == name)
            .filter_map(|(resource, _)| match resource {
                Resource::Buffer(buffer) => Some(*buffer),
                Resource::Surface(_) => None,
            })
            .collect();

        buffers.sort_by_key(|b| b.0);
        buffers
    }

    pub(crate) fn memory_mut(&mut self, buffer: BufferHandle) -> &mut Vec<u8> {
        self.memory.get_mut(&Resource::Buffer(buffer)).unwrap()
    }
}

impl ResourceAllocator for MemoryAllocator {
    type Error = io::Error;

    fn allocate_buffer(
        &mut self,
        size: usize,
        name: &'static str,
    ) -> Result<BufferHandle, io::Error> {
        let buffer = BufferHandle(self.next_id());

        self.memory.insert(Resource::Buffer(buffer), vec![0; size]);
        self.names.insert(Resource::Buffer(buffer), name);

        Ok(buffer)
    }

    fn allocate_surface_2d(
        &mut self,
        width: u32,
        height: u32,
        name: &'static str,
    ) -> Result<Surface, io::Error> {
        let handle = SurfaceHandle(self.next_id());

        self.memory
            .insert(Resource::Surface(handle), vec![0; (width * height) as usize]);
        self.names.insert(Resource::Surface(handle), name);

        Ok(Surface {
            handle,
            width,
            height,
            pitch: width,
            format: PixelFormat::NV12,
        })
    }

    fn allocate_sync_object(&mut self, _name: &'static str) -> Result<SyncObject, io::Error> {
        let sync = SyncObject(self.next_id());
        self.sync_objects.push(sync);
        Ok(sync)
    }

    fn lock(&mut self, resource: Resource) -> Result<&mut [u8], io::Error> {
        self.locked.push(resource);

        self.memory
            .get_mut(&resource)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown resource"))
    }

    fn unlock(&mut self, resource: Resource) -> Result<(), io::Error> {
        let pos = self
            .locked
            .iter()
            .position(|r| *r == resource)
            .ok_or_else(|| io::Error::other("resource is not locked"))?;

        self.locked.remove(pos);

        Ok(())
    }

    fn free(&mut self, resource: Resource) {
        self.memory.remove(&resource);
        self.freed.push(resource);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    CommandBuffer,
    Command(HwCommand),
    Return,
    Submit,
    Wait(SyncObject, u32),
    Signal(SyncObject),
}

/// Records everything the orchestrator emits
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub(crate) fn commands(&self) -> impl Iterator<Item = &HwCommand> {
        self.events.iter().filter_map(|event| match event {
            SinkEvent::Command(command) => Some(command),
            _ => None,
        })
    }

    pub(crate) fn count(&self, f: impl Fn(&HwCommand) -> bool) -> usize {
        self.commands().filter(|c| f(c)).count()
    }

    pub(crate) fn submits(&self) -> usize {
        self.events.iter().filter(|e| **e == SinkEvent::Submit).count()
    }

    pub(crate) fn waits(&self) -> Vec<(SyncObject, u32)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Wait(sync, count) => Some((*sync, *count)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn signals(&self) -> Vec<SyncObject> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Signal(sync) => Some(*sync),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}

impl HardwareCommandSink for RecordingSink {
    type Error = Infallible;

    fn command_buffer(&mut self) -> Result<(), Infallible> {
        self.events.push(SinkEvent::CommandBuffer);
        Ok(())
    }

    fn add_command(&mut self, command: HwCommand) -> Result<(), Infallible> {
        self.events.push(SinkEvent::Command(command));
        Ok(())
    }

    fn return_command_buffer(&mut self) -> Result<(), Infallible> {
        self.events.push(SinkEvent::Return);
        Ok(())
    }

    fn submit(&mut self) -> Result<(), Infallible> {
        self.events.push(SinkEvent::Submit);
        Ok(())
    }

    fn engine_wait(&mut self, sync: SyncObject, count: u32) -> Result<(), Infallible> {
        self.events.push(SinkEvent::Wait(sync, count));
        Ok(())
    }

    fn engine_signal(&mut self, sync: SyncObject) -> Result<(), Infallible> {
        self.events.push(SinkEvent::Signal(sync));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingExecutor {
    pub(crate) dispatches: Vec<KernelDispatch>,
    pub(crate) completion: Option<SyncObject>,
}

impl ComputeKernelExecutor for RecordingExecutor {
    type Error = Infallible;

    fn execute(&mut self, dispatch: KernelDispatch) -> Result<(), Infallible> {
        self.dispatches.push(dispatch);
        Ok(())
    }

    fn completion_sync(&mut self) -> Option<SyncObject> {
        self.completion
    }
}

/// Status sink sharing its reports with the test
#[derive(Default, Clone)]
pub(crate) struct SharedStatusSink(pub(crate) Rc<RefCell<Vec<StatusReport>>>);

impl StatusSink for SharedStatusSink {
    fn report(&mut self, report: StatusReport) {
        self.0.borrow_mut().push(report);
    }
}

/// 1080p sequence with 32x32 LCUs, 60x34 LCUs
pub(crate) fn sequence() -> SequenceParams {
    SequenceParams::default()
}

pub(crate) const NUM_LCUS: u32 = 60 * 34;

pub(crate) fn picture(allocator: &mut MemoryAllocator, frame_store: u8, poc: i32) -> PictureParams {
    let raw = allocator.allocate_surface_2d(1920, 1080, "raw").unwrap();
    let recon = allocator.allocate_surface_2d(1920, 1080, "recon").unwrap();
    let bitstream = allocator.allocate_buffer(1 << 16, "bitstream").unwrap();

    PictureParams {
        frame_store,
        poc,
        raw_surface: Some(raw),
        recon_surface: Some(recon),
        bitstream_buffer: Some(bitstream),
        status_feedback_number: poc as u32 + 100,
        ..Default::default()
    }
}

pub(crate) fn slice(slice_type: SliceType) -> SliceParams {
    let l0 = match slice_type {
        SliceType::I => smallvec::smallvec![],
        SliceType::P | SliceType::B => smallvec::smallvec![Some(0)],
    };

    let l1 = match slice_type {
        SliceType::B => smallvec::smallvec![Some(0)],
        SliceType::I | SliceType::P => smallvec::smallvec![],
    };

    SliceParams {
        segment_address: 0,
        num_lcus: NUM_LCUS,
        slice_type,
        ref_pic_lists: [l0, l1],
        slice_qp_delta: 0,
        sao_luma: false,
        sao_chroma: false,
        deblocking_filter_disabled: false,
        pred_weight_table: PredWeightTable::default(),
        header: PackedSliceHeader {
            data: bytes::Bytes::from_static(&[0x26, 0x01, 0xAF, 0x80]),
            bit_length: 25,
            skip_emulation_check_count: 0,
        },
    }
}
