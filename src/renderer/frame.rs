// Frame loop - the per-frame state machine
//
// Idle -> WaitForSlotFence -> AcquireImage -> {RecreateAndAbort | RecordAndSubmit}
//      -> Present -> Idle(next slot)
//
// The GPU side is behind FrameTimeline so the sequencing can be driven by a
// mock in tests. The slot only advances after a present; a dropped frame
// reuses its slot, whose fence is still signaled because it was never reset.

use anyhow::Result;

use crate::backend::{AcquireOutcome, PresentOutcome, RecreateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    WaitForSlotFence,
    AcquireImage,
    RecordAndSubmit,
    RecreateAndAbort,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image_index: u32 },
    /// Acquire reported out-of-date; the swapchain was rebuilt, nothing submitted.
    Dropped,
    /// Window is minimized; nothing was touched.
    Skipped,
}

/// GPU-facing steps of one frame, in the order the loop calls them.
pub trait FrameTimeline {
    /// Block until the last submission that used `slot` has finished.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire a presentable image, signaling the slot's image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Reset the slot's fence, write its uniforms, record and submit.
    fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Rebuild the swapchain and everything sized to it. Idles the device first.
    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome>;
}

#[derive(Debug)]
pub struct FrameLoop {
    slot_count: usize,
    current_slot: usize,
    frame_index: u64,
    state: FrameState,
    resize_requested: bool,
    recreate_pending: bool,
    halted: bool,
}

impl FrameLoop {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count: slot_count.max(1),
            current_slot: 0,
            frame_index: 0,
            state: FrameState::Idle,
            resize_requested: false,
            recreate_pending: false,
            halted: false,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Number of frames submitted so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// External resize signal; the swapchain is rebuilt after the next present.
    pub fn notify_resized(&mut self) {
        self.resize_requested = true;
    }

    /// Run one pass of the state machine.
    ///
    /// Any error is fatal: the loop halts and refuses further frames.
    pub fn draw_frame<T: FrameTimeline + ?Sized>(&mut self, timeline: &mut T) -> Result<FrameOutcome> {
        if self.halted {
            anyhow::bail!("Frame loop halted after a fatal error");
        }

        let result = self.step(timeline);
        match result {
            Ok(_) => self.state = FrameState::Idle,
            Err(ref e) => {
                log::error!("Fatal error in {:?}: {:?}", self.state, e);
                self.halted = true;
            }
        }
        result
    }

    fn step<T: FrameTimeline + ?Sized>(&mut self, timeline: &mut T) -> Result<FrameOutcome> {
        // A rebuild deferred while minimized must land before touching the swapchain
        if self.recreate_pending {
            self.state = FrameState::RecreateAndAbort;
            if self.rebuild(timeline)? == RecreateOutcome::Deferred {
                return Ok(FrameOutcome::Skipped);
            }
        }

        let slot = self.current_slot;

        self.state = FrameState::WaitForSlotFence;
        timeline.wait_for_slot(slot)?;

        self.state = FrameState::AcquireImage;
        let (image_index, suboptimal) = match timeline.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, dropping frame {}", self.frame_index);
                self.state = FrameState::RecreateAndAbort;
                self.rebuild(timeline)?;
                return Ok(FrameOutcome::Dropped);
            }
        };

        self.state = FrameState::RecordAndSubmit;
        timeline.record_and_submit(slot, image_index)?;
        self.frame_index += 1;

        self.state = FrameState::Present;
        let presented = timeline.present(slot, image_index)?;

        if presented.needs_rebuild() || suboptimal || self.resize_requested {
            log::debug!(
                "Rebuilding swapchain after present ({:?}, suboptimal acquire: {}, resize: {})",
                presented,
                suboptimal,
                self.resize_requested
            );
            self.resize_requested = false;
            self.rebuild(timeline)?;
        }

        self.current_slot = (slot + 1) % self.slot_count;
        Ok(FrameOutcome::Presented { slot, image_index })
    }

    fn rebuild<T: FrameTimeline + ?Sized>(&mut self, timeline: &mut T) -> Result<RecreateOutcome> {
        let outcome = timeline.recreate_swapchain()?;
        self.recreate_pending = outcome == RecreateOutcome::Deferred;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate,
    }

    /// Fakes the GPU: a submission stays outstanding until its slot is waited on.
    struct MockTimeline {
        device_id: u64,
        swapchain_generation: u32,
        image_count: u32,
        next_image: u32,
        outstanding: Vec<bool>,
        events: Vec<Event>,
        acquire_script: Vec<AcquireOutcome>,
        present_script: Vec<PresentOutcome>,
        minimized: bool,
        fail_submit: bool,
    }

    impl MockTimeline {
        fn new(slots: usize) -> Self {
            Self {
                device_id: 0xdead_beef,
                swapchain_generation: 0,
                image_count: 3,
                next_image: 0,
                outstanding: vec![false; slots],
                events: Vec::new(),
                acquire_script: Vec::new(),
                present_script: Vec::new(),
                minimized: false,
                fail_submit: false,
            }
        }

        fn submissions(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Submit(slot, _) => Some(*slot),
                    _ => None,
                })
                .collect()
        }

        fn recreations(&self) -> usize {
            self.events.iter().filter(|e| **e == Event::Recreate).count()
        }
    }

    impl FrameTimeline for MockTimeline {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Wait(slot));
            self.outstanding[slot] = false;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.events.push(Event::Acquire(slot));
            if !self.acquire_script.is_empty() {
                return Ok(self.acquire_script.remove(0));
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal: false,
            })
        }

        fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            if self.fail_submit {
                anyhow::bail!("device lost");
            }
            assert!(
                !self.outstanding[slot],
                "slot {} re-recorded while its previous submission is in flight",
                slot
            );
            self.outstanding[slot] = true;
            self.events.push(Event::Submit(slot, image_index));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.events.push(Event::Present(slot, image_index));
            if !self.present_script.is_empty() {
                return Ok(self.present_script.remove(0));
            }
            Ok(PresentOutcome::Presented)
        }

        fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
            if self.minimized {
                return Ok(RecreateOutcome::Deferred);
            }
            // Device idle: nothing is left in flight
            self.outstanding.iter_mut().for_each(|o| *o = false);
            self.events.push(Event::Recreate);
            self.swapchain_generation += 1;
            self.next_image = 0;
            Ok(RecreateOutcome::Rebuilt)
        }
    }

    #[test]
    fn slots_cycle_round_robin() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);

        let mut slots = Vec::new();
        for _ in 0..5 {
            match frame_loop.draw_frame(&mut timeline).unwrap() {
                FrameOutcome::Presented { slot, .. } => slots.push(slot),
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(frame_loop.state(), FrameState::Idle);
        }

        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(timeline.submissions(), vec![0, 1, 0, 1, 0]);
        assert_eq!(frame_loop.frame_index(), 5);
    }

    #[test]
    fn two_image_swapchain_renders_five_frames_in_order() {
        use crate::backend::surface::SurfaceSupport;
        use crate::backend::swapchain::plan_swapchain;
        use ash::vk;

        let window = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 1,
                max_image_count: 2,
                current_extent: window,
                min_image_extent: window,
                max_image_extent: window,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let plan = plan_swapchain(&support, window, vk::PresentModeKHR::MAILBOX).unwrap();
        assert_eq!(plan.image_count, 2);
        assert_eq!(plan.extent, window);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);

        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);
        timeline.image_count = plan.image_count;

        let mut presented = Vec::new();
        for _ in 0..5 {
            match frame_loop.draw_frame(&mut timeline).unwrap() {
                FrameOutcome::Presented { slot, image_index } => {
                    presented.push((slot, image_index))
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(
            presented,
            vec![(0, 0), (1, 1), (0, 0), (1, 1), (0, 0)]
        );
        assert_eq!(timeline.recreations(), 0);
        assert_eq!(frame_loop.frame_index(), 5);
    }

    #[test]
    fn slot_is_waited_before_every_submission() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);

        for _ in 0..6 {
            frame_loop.draw_frame(&mut timeline).unwrap();
        }

        // Every submit is preceded by a wait on the same slot, with acquire in between
        for (i, event) in timeline.events.iter().enumerate() {
            if let Event::Submit(slot, _) = event {
                assert_eq!(timeline.events[i - 1], Event::Acquire(*slot));
                assert_eq!(timeline.events[i - 2], Event::Wait(*slot));
            }
        }
    }

    #[test]
    fn frame_slot_is_frame_index_mod_slot_count() {
        for slot_count in 1..=3 {
            let mut frame_loop = FrameLoop::new(slot_count);
            let mut timeline = MockTimeline::new(slot_count);

            for f in 0..10 {
                match frame_loop.draw_frame(&mut timeline).unwrap() {
                    FrameOutcome::Presented { slot, .. } => assert_eq!(slot, f % slot_count),
                    other => panic!("unexpected outcome {:?}", other),
                }
            }
        }
    }

    #[test]
    fn out_of_date_acquire_drops_frame_and_rebuilds() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);
        let device_id = timeline.device_id;

        frame_loop.draw_frame(&mut timeline).unwrap();
        frame_loop.draw_frame(&mut timeline).unwrap();
        let submitted_before = timeline.submissions().len();

        // Frame 3
        timeline.acquire_script.push(AcquireOutcome::OutOfDate);
        let outcome = frame_loop.draw_frame(&mut timeline).unwrap();

        assert_eq!(outcome, FrameOutcome::Dropped);
        assert_eq!(timeline.submissions().len(), submitted_before);
        assert_eq!(timeline.recreations(), 1);
        assert_eq!(timeline.swapchain_generation, 1);
        assert_eq!(timeline.device_id, device_id);
        assert_eq!(timeline.events.last(), Some(&Event::Recreate));

        // The dropped frame's slot is reused
        assert_eq!(frame_loop.current_slot(), 0);
        match frame_loop.draw_frame(&mut timeline).unwrap() {
            FrameOutcome::Presented { slot, image_index } => {
                assert_eq!(slot, 0);
                assert_eq!(image_index, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn suboptimal_present_rebuilds_after_presenting() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);
        timeline.present_script.push(PresentOutcome::Suboptimal);

        let outcome = frame_loop.draw_frame(&mut timeline).unwrap();

        assert!(matches!(outcome, FrameOutcome::Presented { slot: 0, .. }));
        assert_eq!(
            &timeline.events[timeline.events.len() - 2..],
            &[Event::Present(0, 0), Event::Recreate]
        );
        assert_eq!(frame_loop.current_slot(), 1);
    }

    #[test]
    fn out_of_date_present_still_completes_the_frame() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);
        timeline.present_script.push(PresentOutcome::OutOfDate);

        let outcome = frame_loop.draw_frame(&mut timeline).unwrap();

        assert!(matches!(outcome, FrameOutcome::Presented { .. }));
        assert_eq!(timeline.submissions(), vec![0]);
        assert_eq!(timeline.recreations(), 1);
    }

    #[test]
    fn suboptimal_acquire_renders_then_rebuilds() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);
        timeline.acquire_script.push(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: true,
        });

        let outcome = frame_loop.draw_frame(&mut timeline).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented { slot: 0, image_index: 2 });
        assert_eq!(timeline.recreations(), 1);
    }

    #[test]
    fn resize_signal_rebuilds_once_after_present() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);

        frame_loop.notify_resized();
        frame_loop.draw_frame(&mut timeline).unwrap();
        frame_loop.draw_frame(&mut timeline).unwrap();

        assert_eq!(timeline.recreations(), 1);
        assert_eq!(timeline.events[4], Event::Recreate);
    }

    #[test]
    fn minimized_window_defers_and_skips_frames() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);

        timeline.minimized = true;
        frame_loop.notify_resized();

        // The frame that sees the resize still presents; the rebuild is deferred
        assert!(matches!(
            frame_loop.draw_frame(&mut timeline).unwrap(),
            FrameOutcome::Presented { .. }
        ));
        let events_while_minimized = timeline.events.len();

        for _ in 0..3 {
            assert_eq!(frame_loop.draw_frame(&mut timeline).unwrap(), FrameOutcome::Skipped);
        }
        assert_eq!(timeline.events.len(), events_while_minimized);

        // Restored: the pending rebuild lands before the next acquire
        timeline.minimized = false;
        let outcome = frame_loop.draw_frame(&mut timeline).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { slot: 1, .. }));
        assert_eq!(timeline.events[events_while_minimized], Event::Recreate);
        assert_eq!(timeline.recreations(), 1);
    }

    #[test]
    fn fatal_error_halts_the_loop() {
        let mut frame_loop = FrameLoop::new(2);
        let mut timeline = MockTimeline::new(2);

        frame_loop.draw_frame(&mut timeline).unwrap();
        timeline.fail_submit = true;

        assert!(frame_loop.draw_frame(&mut timeline).is_err());
        assert!(frame_loop.is_halted());
        assert_eq!(frame_loop.state(), FrameState::RecordAndSubmit);

        timeline.fail_submit = false;
        let events = timeline.events.len();
        assert!(frame_loop.draw_frame(&mut timeline).is_err());
        assert_eq!(timeline.events.len(), events);
    }

    #[test]
    fn zero_slots_is_clamped_to_one() {
        let frame_loop = FrameLoop::new(0);
        assert_eq!(frame_loop.slot_count(), 1);
    }
}
