//! Cross frame synchronization on the tracked buffer slots
//!
//! A frame which is used as reference signals the sync object of its tracked slot after its last
//! PAK pass. Later frames wait on the slots of their references before their kernels consume them.

use crate::encoder::{
    config::{CodingType, PictureParams, SliceParams},
    error::EncodeError,
    hw::{HardwareCommandSink, HwCommand},
    picture::PictureConfig,
    sequence::SequenceConfig,
    session::EncoderSessionState,
};

/// Make the engine wait until the frame owning `slot` completed
///
/// Does nothing if no signal is outstanding on the slot, so waiting twice is harmless. Returns if a
/// wait was issued.
pub fn wait_for_reference_ready<S: HardwareCommandSink>(
    session: &mut EncoderSessionState,
    sink: &mut S,
    slot: u8,
) -> Result<bool, EncodeError> {
    let Some(sync_slot) = session.sync_slot_mut(slot) else {
        return Ok(false);
    };

    if !sync_slot.in_use {
        return Ok(false);
    }

    if let Some(sync) = sync_slot.sync {
        log::trace!("Wait for tracked slot {slot}, {} signals", sync_slot.signal_count);

        sink.engine_wait(sync, sync_slot.signal_count)
            .map_err(EncodeError::hardware)?;
    }

    sync_slot.signal_count = 0;
    sync_slot.in_use = false;

    Ok(true)
}

/// Wait on all previous PAK work the current frame depends on
pub fn wait_for_pending_pak<S: HardwareCommandSink>(
    session: &mut EncoderSessionState,
    sink: &mut S,
    seq: &SequenceConfig,
    picture: &PictureConfig,
    pic: &PictureParams,
    slices: &[SliceParams],
) -> Result<(), EncodeError> {
    let brc = seq.brc_enabled;
    let parallel_brc = seq.params.parallel_brc;

    if picture.coding_type == CodingType::I && !brc {
        return Ok(());
    }

    if !session.first_frame && brc && !parallel_brc {
        // Without parallel BRC the previous frame's statistics are consumed by this frame's BRC
        // update
        let last = session.tracked.last;
        wait_for_reference_ready(session, sink, last)?;
        return Ok(());
    }

    let ref_slots: Vec<u8> = slices
        .iter()
        .flat_map(|slice| slice.ref_pic_lists.iter().flatten().flatten())
        .filter_map(|&idx| pic.ref_frames.get(usize::from(idx)).copied().flatten())
        .filter_map(|ref_frame| session.ref_entry(ref_frame.frame_store))
        .map(|entry| entry.tracked_slot)
        .collect();

    for slot in ref_slots {
        wait_for_reference_ready(session, sink, slot)?;
    }

    if !session.first_two_frames && brc && parallel_brc {
        let minus2 = session.tracked.minus2;
        wait_for_reference_ready(session, sink, minus2)?;
    }

    Ok(())
}

/// Make the codec engine wait until the previous frame released the VDBOX
pub fn wait_for_vdbox<S: HardwareCommandSink>(
    session: &EncoderSessionState,
    sink: &mut S,
) -> Result<(), EncodeError> {
    if session.first_frame {
        return Ok(());
    }

    let semaphore = session
        .sync_slots
        .get(usize::from(session.tracked.last))
        .and_then(|slot| slot.semaphore_memory);

    if let Some(buffer) = semaphore {
        sink.add_command(HwCommand::HwWait { buffer, value: 1 })
            .map_err(EncodeError::hardware)?;
    }

    Ok(())
}

/// Signal the sync object of `slot` once the submitted work completes and mark the slot in use
pub(crate) fn signal_completion<S: HardwareCommandSink>(
    session: &mut EncoderSessionState,
    sink: &mut S,
    slot: u8,
) -> Result<(), EncodeError> {
    let Some(sync_slot) = session.sync_slot_mut(slot) else {
        return Ok(());
    };

    let Some(sync) = sync_slot.sync else {
        return Ok(());
    };

    sink.engine_signal(sync).map_err(EncodeError::hardware)?;

    sync_slot.signal_count += 1;
    sync_slot.in_use = true;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{
        config::EncoderSettings,
        hw::{BufferHandle, SyncObject},
    };
    use std::convert::Infallible;

    #[derive(Default)]
    struct Sink {
        waits: Vec<(SyncObject, u32)>,
        signals: Vec<SyncObject>,
        commands: Vec<HwCommand>,
    }

    impl HardwareCommandSink for Sink {
        type Error = Infallible;

        fn command_buffer(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn add_command(&mut self, command: HwCommand) -> Result<(), Infallible> {
            self.commands.push(command);
            Ok(())
        }

        fn return_command_buffer(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn submit(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn engine_wait(&mut self, sync: SyncObject, count: u32) -> Result<(), Infallible> {
            self.waits.push((sync, count));
            Ok(())
        }

        fn engine_signal(&mut self, sync: SyncObject) -> Result<(), Infallible> {
            self.signals.push(sync);
            Ok(())
        }
    }

    fn session() -> EncoderSessionState {
        let mut session = EncoderSessionState::new(&EncoderSettings {
            tracked_buffers: 4,
            ..Default::default()
        });

        for (i, slot) in session.sync_slots.iter_mut().enumerate() {
            slot.sync = Some(SyncObject(i as u32));
        }

        session
    }

    #[test]
    fn wait_is_idempotent() {
        let mut session = session();
        let mut sink = Sink::default();

        signal_completion(&mut session, &mut sink, 2).unwrap();
        signal_completion(&mut session, &mut sink, 2).unwrap();
        assert_eq!(session.sync_slots[2].signal_count, 2);
        assert_eq!(sink.signals, [SyncObject(2), SyncObject(2)]);

        assert!(wait_for_reference_ready(&mut session, &mut sink, 2).unwrap());
        assert!(!wait_for_reference_ready(&mut session, &mut sink, 2).unwrap());

        assert_eq!(sink.waits, [(SyncObject(2), 2)]);
        assert!(!session.sync_slots[2].in_use);
        assert_eq!(session.sync_slots[2].signal_count, 0);
    }

    #[test]
    fn unused_or_unknown_slots_are_skipped() {
        let mut session = session();
        let mut sink = Sink::default();

        assert!(!wait_for_reference_ready(&mut session, &mut sink, 1).unwrap());
        assert!(!wait_for_reference_ready(&mut session, &mut sink, 200).unwrap());
        assert!(sink.waits.is_empty());
    }

    #[test]
    fn vdbox_wait_after_first_frame() {
        let mut session = session();
        let mut sink = Sink::default();

        session.sync_slots[0].semaphore_memory = Some(BufferHandle(9));

        wait_for_vdbox(&session, &mut sink).unwrap();
        assert!(sink.commands.is_empty());

        session.finish_frame(false);
        wait_for_vdbox(&session, &mut sink).unwrap();
        assert_eq!(
            sink.commands,
            [HwCommand::HwWait {
                buffer: BufferHandle(9),
                value: 1
            }]
        );
    }
}
