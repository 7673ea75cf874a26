//! Frame orchestration for multiple frames in flight.
//!
//! [`FrameOrchestrator`] rotates N frame slots (N >= 2) so the CPU can record
//! frame N+1 while the GPU executes frame N. Each slot owns a command list and
//! the fence value its last submission signals.
//!
//! # Slot Lifecycle
//!
//! ```text
//!         begin_frame                 end_frame
//! Idle ───────────────► Recording ───────────────► Submitted
//!  ▲                        ▲                          │
//!  │ abort_frame            │ begin_frame              │ GPU reaches fence value
//!  └──── Recording          │ (after waiting)          ▼
//!                           └─────────────────────  Completed
//! ```
//!
//! # Frame Overlap (Pipelining)
//!
//! With 2 frames in flight, the CPU and GPU work in parallel:
//!
//! ```text
//! Frame 0: [CPU record] [submit] ────────────────────────────────────────►
//!                                [GPU execute frame 0] ─────────────────►
//!
//! Frame 1:              [CPU record] [submit] ───────────────────────────►
//!                                             [GPU execute frame 1] ────►
//!
//! Frame 2:                           [wait F0] [CPU record] [submit] ───►
//!
//! Time ─────────────────────────────────────────────────────────────────►
//! ```
//!
//! The CPU only blocks when the slot it is about to reuse still has work the
//! GPU has not confirmed. The wait is a blocking wait on the queue's
//! completion counter, not a spin.
//!
//! # Choosing Frames in Flight
//!
//! | Count | Behavior |
//! |-------|----------|
//! | 2 | Good balance. CPU can work on N+1 while GPU renders N. |
//! | 3 | More overlap, higher latency. Useful for heavy CPU work. |
//!
//! More frames mean more upload and descriptor memory: every slot owns its
//! own region of each.

mod fence;

pub use fence::{Fence, FenceStatus};

use crate::backend::GpuBackend;
use crate::commands::CommandList;
use crate::error::GraphicsError;

/// Lifecycle state of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Not in use.
    Idle,
    /// Commands are being recorded.
    Recording,
    /// Submitted; the GPU may still be executing.
    Submitted,
    /// The GPU confirmed completion.
    Completed,
}

/// Result of acquiring a slot in [`FrameOrchestrator::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    /// The slot index.
    pub slot: usize,
    /// Whether the slot was recycled. `false` when recording already open
    /// between frames (setup work) is adopted into the frame, in which case
    /// per-slot memory must not be reset.
    pub recycled: bool,
    /// Whether acquiring the slot had to block on the GPU.
    pub waited: bool,
}

#[derive(Debug)]
struct FrameSlot {
    state: FrameState,
    fence_value: u64,
    commands: CommandList,
}

/// Manages N frame slots and their fences.
///
/// `FrameOrchestrator` is **not thread-safe**. It is owned by the context and
/// driven from the recording thread.
#[derive(Debug)]
pub struct FrameOrchestrator {
    slots: Vec<FrameSlot>,
    current_slot: usize,
    in_frame: bool,
    frame_count: u64,
    next_fence_value: u64,
    last_submitted: u64,
    wait_count: u64,
}

impl FrameOrchestrator {
    /// Create an orchestrator with `frames_in_flight` slots.
    ///
    /// Slot 0 starts out recording so setup work (uploads, mipmap
    /// generation) can be recorded before the first frame.
    pub fn new(frames_in_flight: usize) -> Result<Self, GraphicsError> {
        if frames_in_flight < 2 {
            return Err(GraphicsError::InvalidParameter(format!(
                "frames_in_flight must be at least 2, got {frames_in_flight}"
            )));
        }

        let mut slots: Vec<FrameSlot> = (0..frames_in_flight)
            .map(|_| FrameSlot {
                state: FrameState::Idle,
                fence_value: 0,
                commands: CommandList::new(),
            })
            .collect();
        slots[0].state = FrameState::Recording;

        Ok(Self {
            slots,
            current_slot: 0,
            in_frame: false,
            frame_count: 0,
            next_fence_value: 1,
            last_submitted: 0,
            wait_count: 0,
        })
    }

    /// Begin a new frame in the current slot.
    ///
    /// If the GPU is still processing the slot's previous frame this blocks
    /// until the slot's fence value is reached. The slot's command list is
    /// reset before recording starts.
    pub fn begin_frame(&mut self, fence: &Fence) -> Result<AcquiredSlot, GraphicsError> {
        if self.in_frame {
            return Err(GraphicsError::FrameState(
                "begin_frame called twice without end_frame".to_string(),
            ));
        }

        let index = self.current_slot;
        let slot = &mut self.slots[index];
        let mut acquired = AcquiredSlot {
            slot: index,
            recycled: true,
            waited: false,
        };

        match slot.state {
            FrameState::Recording => acquired.recycled = false,
            FrameState::Idle | FrameState::Completed => {}
            FrameState::Submitted => {
                if !fence.is_reached(slot.fence_value)? {
                    log::debug!(
                        "Slot {} busy, waiting for fence {}",
                        index,
                        slot.fence_value
                    );
                    self.wait_count += 1;
                    acquired.waited = true;
                    fence.wait(slot.fence_value)?;
                }
                slot.state = FrameState::Completed;
            }
        }

        if acquired.recycled {
            slot.commands.clear();
        }
        slot.state = FrameState::Recording;
        self.in_frame = true;
        self.frame_count += 1;

        log::trace!("Begin frame {} (slot {})", self.frame_count, index);
        Ok(acquired)
    }

    /// Submit the current frame and advance to the next slot.
    ///
    /// Returns the fence value the submission signals.
    pub fn end_frame(&mut self, backend: &dyn GpuBackend) -> Result<u64, GraphicsError> {
        if !self.in_frame {
            return Err(GraphicsError::FrameState(
                "end_frame called without begin_frame".to_string(),
            ));
        }

        let value = self.submit_current(backend)?;
        self.slots[self.current_slot].state = FrameState::Submitted;

        log::trace!(
            "End frame {} (slot {}, fence {})",
            self.frame_count,
            self.current_slot,
            value
        );

        self.in_frame = false;
        self.current_slot = (self.current_slot + 1) % self.slots.len();
        Ok(value)
    }

    /// Submit pending work and block until the GPU has finished everything.
    ///
    /// Afterwards the current slot is recording with an empty list: a frame in
    /// progress continues, and between frames the slot is reopened for setup
    /// work that the next [`begin_frame`](Self::begin_frame) adopts.
    pub fn finish_gpu_commands(
        &mut self,
        backend: &dyn GpuBackend,
        fence: &Fence,
    ) -> Result<(), GraphicsError> {
        let current = &self.slots[self.current_slot];
        if current.state == FrameState::Recording && !current.commands.is_empty() {
            self.submit_current(backend)?;
        }

        self.wait_idle(fence)?;
        let slot = &mut self.slots[self.current_slot];
        slot.commands.clear();
        slot.state = FrameState::Recording;
        Ok(())
    }

    /// Block until every submitted frame has completed.
    pub fn wait_idle(&mut self, fence: &Fence) -> Result<(), GraphicsError> {
        log::trace!("Waiting for GPU idle (fence {})", self.last_submitted);
        fence.wait(self.last_submitted)?;
        for slot in &mut self.slots {
            if slot.state == FrameState::Submitted {
                slot.state = FrameState::Completed;
            }
        }
        Ok(())
    }

    /// Discard the current slot's recorded commands and return it to idle.
    ///
    /// The slot's previous submission was already waited on when the frame
    /// began, so the slot can be reused without another wait.
    pub fn abort_frame(&mut self) {
        let slot = &mut self.slots[self.current_slot];
        log::warn!(
            "Aborting frame {} (slot {}, {} commands discarded)",
            self.frame_count,
            self.current_slot,
            slot.commands.len()
        );
        slot.commands.clear();
        slot.state = FrameState::Idle;
        self.in_frame = false;
    }

    /// Mark submitted slots whose fence value has been reached as completed.
    pub fn update_completed(&mut self, completed: u64) {
        for slot in &mut self.slots {
            if slot.state == FrameState::Submitted && slot.fence_value <= completed {
                slot.state = FrameState::Completed;
            }
        }
    }

    /// Command list of the recording slot.
    pub fn commands_mut(&mut self) -> Result<&mut CommandList, GraphicsError> {
        let slot = &mut self.slots[self.current_slot];
        if slot.state != FrameState::Recording {
            return Err(GraphicsError::FrameState(
                "no frame is recording; call begin_frame first".to_string(),
            ));
        }
        Ok(&mut slot.commands)
    }

    /// Returns true if commands can be recorded.
    pub fn is_recording(&self) -> bool {
        self.slots[self.current_slot].state == FrameState::Recording
    }

    /// Returns true between `begin_frame` and `end_frame`.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot being (or about to be) recorded.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Total frames begun.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// State of a slot.
    pub fn slot_state(&self, slot: usize) -> FrameState {
        self.slots[slot].state
    }

    /// Fence value a slot's last submission signals.
    pub fn slot_fence_value(&self, slot: usize) -> u64 {
        self.slots[slot].fence_value
    }

    /// Number of `begin_frame` calls that had to block on the GPU.
    pub fn wait_count(&self) -> u64 {
        self.wait_count
    }

    /// Value the next submission will signal.
    ///
    /// Resources released now are tagged with this value.
    pub fn next_signal_value(&self) -> u64 {
        self.next_fence_value
    }

    /// Value of the most recent submission.
    pub fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    fn submit_current(&mut self, backend: &dyn GpuBackend) -> Result<u64, GraphicsError> {
        profile_scope!("queue_submit");
        let value = self.next_fence_value;
        let slot = &mut self.slots[self.current_slot];
        backend.submit(&slot.commands, self.current_slot, value)?;
        slot.fence_value = value;
        self.next_fence_value += 1;
        self.last_submitted = value;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use std::sync::Arc;

    fn setup(manual: bool) -> (Arc<DummyBackend>, Fence, FrameOrchestrator) {
        let backend = Arc::new(if manual {
            DummyBackend::manual()
        } else {
            DummyBackend::default()
        });
        let fence = Fence::new(backend.clone());
        (backend, fence, FrameOrchestrator::new(2).unwrap())
    }

    #[test]
    fn test_new() {
        let frames = FrameOrchestrator::new(3).unwrap();
        assert_eq!(frames.frames_in_flight(), 3);
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.frame_count(), 0);
        assert_eq!(frames.slot_state(0), FrameState::Recording);
        assert_eq!(frames.slot_state(1), FrameState::Idle);
        assert_eq!(frames.next_signal_value(), 1);
    }

    #[test]
    fn test_single_slot_rejected() {
        assert!(FrameOrchestrator::new(1).is_err());
    }

    #[test]
    fn test_first_frame_adopts_setup_recording() {
        let (_backend, fence, mut frames) = setup(false);
        let acquired = frames.begin_frame(&fence).unwrap();
        assert_eq!(acquired.slot, 0);
        assert!(!acquired.recycled);
        assert!(!acquired.waited);
    }

    #[test]
    fn test_end_frame_advances_slot() {
        let (backend, fence, mut frames) = setup(false);
        for expected in [1, 0, 1, 0] {
            frames.begin_frame(&fence).unwrap();
            frames.end_frame(backend.as_ref()).unwrap();
            assert_eq!(frames.current_slot(), expected);
        }
        assert_eq!(frames.frame_count(), 4);
        assert_eq!(frames.last_submitted(), 4);
        assert_eq!(frames.wait_count(), 0);
    }

    #[test]
    fn test_out_of_order_calls() {
        let (backend, fence, mut frames) = setup(false);
        assert!(matches!(
            frames.end_frame(backend.as_ref()),
            Err(GraphicsError::FrameState(_))
        ));
        frames.begin_frame(&fence).unwrap();
        assert!(matches!(
            frames.begin_frame(&fence),
            Err(GraphicsError::FrameState(_))
        ));
    }

    #[test]
    fn test_commands_require_recording() {
        let (backend, fence, mut frames) = setup(false);
        frames.begin_frame(&fence).unwrap();
        frames.end_frame(backend.as_ref()).unwrap();
        assert!(frames.commands_mut().is_err());
        frames.begin_frame(&fence).unwrap();
        assert!(frames.commands_mut().is_ok());
    }

    #[test]
    fn test_reuse_waits_for_completion() {
        let (backend, fence, mut frames) = setup(true);

        frames.begin_frame(&fence).unwrap();
        frames.end_frame(backend.as_ref()).unwrap();
        frames.begin_frame(&fence).unwrap();
        frames.end_frame(backend.as_ref()).unwrap();
        assert_eq!(frames.slot_state(0), FrameState::Submitted);

        let gpu = backend.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            gpu.complete_next();
        });

        let acquired = frames.begin_frame(&fence).unwrap();
        assert!(acquired.waited);
        assert!(backend.completed_value().unwrap() >= 1);
        assert_eq!(frames.wait_count(), 1);
        worker.join().unwrap();
    }

    #[test]
    fn test_finish_gpu_commands_drains() {
        let (backend, fence, mut frames) = setup(true);
        frames.begin_frame(&fence).unwrap();
        frames.end_frame(backend.as_ref()).unwrap();
        frames.begin_frame(&fence).unwrap();
        frames.commands_mut().unwrap().push(crate::commands::GpuCommand::Dispatch {
            x: 1,
            y: 1,
            z: 1,
        });

        let gpu = backend.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            gpu.complete_all();
        });

        frames.finish_gpu_commands(backend.as_ref(), &fence).unwrap();
        assert_eq!(backend.completed_value().unwrap(), 2);
        assert_eq!(backend.stats().dispatches, 1);
        assert!(frames.is_recording());
        assert!(frames.commands_mut().unwrap().is_empty());
        worker.join().unwrap();
    }

    #[test]
    fn test_finish_reopens_slot_between_frames() {
        let (backend, fence, mut frames) = setup(false);
        frames.begin_frame(&fence).unwrap();
        frames.end_frame(backend.as_ref()).unwrap();
        assert_eq!(frames.slot_state(1), FrameState::Idle);

        frames.finish_gpu_commands(backend.as_ref(), &fence).unwrap();
        assert_eq!(frames.slot_state(0), FrameState::Completed);
        assert!(frames.is_recording());

        let acquired = frames.begin_frame(&fence).unwrap();
        assert_eq!(acquired.slot, 1);
        assert!(!acquired.recycled);
    }

    #[test]
    fn test_abort_frame() {
        let (_backend, fence, mut frames) = setup(false);
        frames.begin_frame(&fence).unwrap();
        frames
            .commands_mut()
            .unwrap()
            .push(crate::commands::GpuCommand::EndRendering);
        frames.abort_frame();

        assert_eq!(frames.slot_state(0), FrameState::Idle);
        assert!(!frames.in_frame());
        assert_eq!(frames.next_signal_value(), 1);

        let acquired = frames.begin_frame(&fence).unwrap();
        assert!(acquired.recycled);
        assert!(frames.commands_mut().unwrap().is_empty());
    }
}
