// SPDX-License-Identifier: CEPL-1.0
//! Frame pacing: K frame slots of (image available, render finished,
//! in flight) plus the image → fence table that stops two slots from
//! using the same presentable image at once.
//!
//! The protocol runs against [`GpuTimeline`] so it can be driven by the real
//! queues or by a scripted timeline.

use ash::khr::swapchain;
use ash::vk;
use lumen_render::PresentOutcome;
use tracing::debug;

use crate::error::{RenderError, RenderResult, SetupContext};

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// The GPU-side operations the frame protocol issues, in submission terms.
/// Fence waits block with no timeout.
pub trait GpuTimeline {
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;
    /// `(image index, suboptimal)`; signals `signal` once the image is free.
    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool), vk::Result>;
    /// Runs `cmd` after `wait` (at colour attachment output), then signals
    /// `signal` and `fence`.
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(), vk::Result>;
    /// `Ok(true)` means suboptimal.
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool, vk::Result>;
}

/// The live queues and swapchain.
pub(crate) struct VkTimeline<'a> {
    pub device: &'a ash::Device,
    pub swapchain_loader: &'a swapchain::Device,
    pub swapchain: vk::SwapchainKHR,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl GpuTimeline for VkTimeline<'_> {
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        }
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, std::slice::from_ref(&submit), fence)
        }
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool, vk::Result> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

#[derive(Debug)]
pub struct FrameSync {
    slots: Vec<FrameSlot>,
    images_in_flight: Vec<Option<vk::Fence>>,
    current_frame: usize,
}

impl FrameSync {
    /// Wraps existing sync objects. Fences must start signaled.
    pub fn new(slots: Vec<FrameSlot>, image_count: usize) -> Self {
        Self {
            slots,
            images_in_flight: vec![None; image_count],
            current_frame: 0,
        }
    }

    /// Creates `frames` slots with pre-signaled fences. On failure the
    /// objects created so far are destroyed.
    pub(crate) unsafe fn create(
        device: &ash::Device,
        frames: usize,
        image_count: usize,
    ) -> RenderResult<Self> {
        let mut sync = Self::new(Vec::with_capacity(frames), image_count);
        for _ in 0..frames {
            match create_slot(device) {
                Ok(slot) => sync.slots.push(slot),
                Err(e) => {
                    sync.destroy(device);
                    return Err(e);
                }
            }
        }
        Ok(sync)
    }

    pub(crate) unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            device.destroy_semaphore(slot.render_finished, None);
            device.destroy_semaphore(slot.image_available, None);
            device.destroy_fence(slot.in_flight, None);
        }
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Fence of the frame that last submitted work for `image_index`.
    pub fn image_owner(&self, image_index: u32) -> Option<vk::Fence> {
        self.images_in_flight
            .get(image_index as usize)
            .copied()
            .flatten()
    }

    /// Waits for the current slot to retire, then acquires an image that
    /// signals the slot's `image_available` semaphore.
    pub fn acquire(&mut self, gpu: &impl GpuTimeline) -> RenderResult<u32> {
        let slot = self.slots[self.current_frame];
        gpu.wait_for_fence(slot.in_flight)
            .map_err(RenderError::Fence)?;

        let (image_index, suboptimal) = gpu
            .acquire_next_image(slot.image_available)
            .map_err(RenderError::Acquire)?;
        if suboptimal {
            debug!("acquired image {image_index} from a suboptimal swapchain");
        }
        Ok(image_index)
    }

    /// Submits `cmd` for `image_index` and queues it for presentation.
    ///
    /// The cursor advances once the submit is accepted, whatever the present
    /// call reports. Suboptimal and out-of-date presents are returned as
    /// outcomes; any other present failure is an error.
    pub fn submit(
        &mut self,
        gpu: &impl GpuTimeline,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> RenderResult<PresentOutcome> {
        let slot = self.slots[self.current_frame];
        let owner = &mut self.images_in_flight[image_index as usize];

        if let Some(previous) = *owner {
            gpu.wait_for_fence(previous).map_err(RenderError::Fence)?;
        }
        *owner = Some(slot.in_flight);

        gpu.reset_fence(slot.in_flight).map_err(RenderError::Fence)?;
        gpu.submit(cmd, slot.image_available, slot.render_finished, slot.in_flight)
            .map_err(RenderError::Submit)?;

        let presented = gpu.present(image_index, slot.render_finished);
        self.current_frame = (self.current_frame + 1) % self.slots.len();

        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(RenderError::Present(e)),
        }
    }
}

unsafe fn create_slot(device: &ash::Device) -> RenderResult<FrameSlot> {
    let sem_info = vk::SemaphoreCreateInfo {
        s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
        ..Default::default()
    };
    let fence_info = vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    };

    let image_available = device
        .create_semaphore(&sem_info, None)
        .setup("create_semaphore")?;
    let render_finished = match device.create_semaphore(&sem_info, None) {
        Ok(s) => s,
        Err(result) => {
            device.destroy_semaphore(image_available, None);
            return Err(RenderError::Setup {
                what: "create_semaphore",
                result,
            });
        }
    };
    let in_flight = match device.create_fence(&fence_info, None) {
        Ok(f) => f,
        Err(result) => {
            device.destroy_semaphore(render_finished, None);
            device.destroy_semaphore(image_available, None);
            return Err(RenderError::Setup {
                what: "create_fence",
                result,
            });
        }
    };
    Ok(FrameSlot {
        image_available,
        render_finished,
        in_flight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        /// Submitted; signals as soon as someone waits on it.
        Pending,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Wait(u64),
        BlockedOn(u64),
        Reset(u64),
        Acquire { signal: u64, image: u32 },
        Submit { cmd: u64, wait: u64, signal: u64, fence: u64 },
        Present { image: u32, wait: u64 },
    }

    #[derive(Default)]
    struct State {
        fences: HashMap<u64, FenceState>,
        images: VecDeque<u32>,
        image_count: u32,
        next_image: u32,
        presents: VecDeque<Result<bool, vk::Result>>,
        acquire_error: Option<vk::Result>,
        submit_error: Option<vk::Result>,
        log: Vec<Call>,
    }

    /// Images come from `images` first, then round-robin.
    #[derive(Default)]
    struct MockGpu(RefCell<State>);

    impl MockGpu {
        fn new(sync: &FrameSync, image_count: u32) -> Self {
            let gpu = MockGpu::default();
            {
                let mut s = gpu.0.borrow_mut();
                s.image_count = image_count;
                for slot in sync.slots() {
                    s.fences
                        .insert(slot.in_flight.as_raw(), FenceState::Signaled);
                }
            }
            gpu
        }

        fn script_images(&self, images: &[u32]) {
            self.0.borrow_mut().images.extend(images);
        }

        fn script_present(&self, result: Result<bool, vk::Result>) {
            self.0.borrow_mut().presents.push_back(result);
        }

        fn fence(&self, fence: vk::Fence) -> FenceState {
            self.0.borrow().fences[&fence.as_raw()]
        }

        fn take_log(&self) -> Vec<Call> {
            std::mem::take(&mut self.0.borrow_mut().log)
        }
    }

    impl GpuTimeline for MockGpu {
        fn wait_for_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
            let mut s = self.0.borrow_mut();
            let raw = fence.as_raw();
            s.log.push(Call::Wait(raw));
            let state = s.fences[&raw];
            match state {
                FenceState::Signaled => {}
                FenceState::Pending => {
                    s.log.push(Call::BlockedOn(raw));
                    s.fences.insert(raw, FenceState::Signaled);
                }
                FenceState::Unsignaled => {
                    panic!("wait on fence {raw} that nothing will ever signal")
                }
            }
            Ok(())
        }

        fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
            let mut s = self.0.borrow_mut();
            s.log.push(Call::Reset(fence.as_raw()));
            s.fences.insert(fence.as_raw(), FenceState::Unsignaled);
            Ok(())
        }

        fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
            let mut s = self.0.borrow_mut();
            if let Some(e) = s.acquire_error {
                return Err(e);
            }
            let image = match s.images.pop_front() {
                Some(i) => i,
                None => {
                    let i = s.next_image;
                    s.next_image = (i + 1) % s.image_count;
                    i
                }
            };
            s.log.push(Call::Acquire {
                signal: signal.as_raw(),
                image,
            });
            Ok((image, false))
        }

        fn submit(
            &self,
            cmd: vk::CommandBuffer,
            wait: vk::Semaphore,
            signal: vk::Semaphore,
            fence: vk::Fence,
        ) -> Result<(), vk::Result> {
            let mut s = self.0.borrow_mut();
            if let Some(e) = s.submit_error {
                return Err(e);
            }
            assert_eq!(
                s.fences[&fence.as_raw()],
                FenceState::Unsignaled,
                "submitted with a fence that was not reset"
            );
            s.fences.insert(fence.as_raw(), FenceState::Pending);
            s.log.push(Call::Submit {
                cmd: cmd.as_raw(),
                wait: wait.as_raw(),
                signal: signal.as_raw(),
                fence: fence.as_raw(),
            });
            Ok(())
        }

        fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool, vk::Result> {
            let mut s = self.0.borrow_mut();
            s.log.push(Call::Present {
                image: image_index,
                wait: wait.as_raw(),
            });
            s.presents.pop_front().unwrap_or(Ok(false))
        }
    }

    const IMAGE_AVAILABLE: u64 = 100;
    const RENDER_FINISHED: u64 = 200;
    const IN_FLIGHT: u64 = 300;
    const CMD: u64 = 900;

    fn frame_sync(frames: usize, images: usize) -> FrameSync {
        let slots = (0..frames as u64)
            .map(|i| FrameSlot {
                image_available: vk::Semaphore::from_raw(IMAGE_AVAILABLE + i),
                render_finished: vk::Semaphore::from_raw(RENDER_FINISHED + i),
                in_flight: vk::Fence::from_raw(IN_FLIGHT + i),
            })
            .collect();
        FrameSync::new(slots, images)
    }

    fn cmd() -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(CMD)
    }

    fn frame(sync: &mut FrameSync, gpu: &MockGpu) -> RenderResult<PresentOutcome> {
        let image = sync.acquire(gpu)?;
        sync.submit(gpu, cmd(), image)
    }

    #[test]
    fn first_acquire_does_not_block() {
        let mut sync = frame_sync(MAX_FRAMES_IN_FLIGHT, 3);
        let gpu = MockGpu::new(&sync, 3);

        assert_eq!(sync.acquire(&gpu).unwrap(), 0);
        assert_eq!(
            gpu.take_log(),
            vec![
                Call::Wait(IN_FLIGHT),
                Call::Acquire {
                    signal: IMAGE_AVAILABLE,
                    image: 0
                },
            ]
        );
    }

    #[test]
    fn cursor_returns_after_k_submissions() {
        for k in 1..=4 {
            let mut sync = frame_sync(k, 3);
            let gpu = MockGpu::new(&sync, 3);
            let start = sync.current_frame();
            for i in 0..k {
                assert_eq!(sync.current_frame(), i);
                frame(&mut sync, &gpu).unwrap();
            }
            assert_eq!(sync.current_frame(), start);
        }
    }

    #[test]
    fn many_frames_never_wait_on_an_unsubmitted_fence() {
        for images in 1..=4 {
            let mut sync = frame_sync(MAX_FRAMES_IN_FLIGHT, images);
            let gpu = MockGpu::new(&sync, images as u32);
            for _ in 0..32 {
                assert_eq!(frame(&mut sync, &gpu).unwrap(), PresentOutcome::Presented);
            }
        }
    }

    #[test]
    fn reused_image_waits_for_its_previous_owner() {
        let mut sync = frame_sync(2, 2);
        let gpu = MockGpu::new(&sync, 2);
        gpu.script_images(&[0, 0]);

        frame(&mut sync, &gpu).unwrap();
        assert_eq!(sync.image_owner(0), Some(vk::Fence::from_raw(IN_FLIGHT)));
        assert_eq!(gpu.fence(vk::Fence::from_raw(IN_FLIGHT)), FenceState::Pending);
        gpu.take_log();

        frame(&mut sync, &gpu).unwrap();
        assert_eq!(
            gpu.take_log(),
            vec![
                Call::Wait(IN_FLIGHT + 1),
                Call::Acquire {
                    signal: IMAGE_AVAILABLE + 1,
                    image: 0
                },
                Call::Wait(IN_FLIGHT),
                Call::BlockedOn(IN_FLIGHT),
                Call::Reset(IN_FLIGHT + 1),
                Call::Submit {
                    cmd: CMD,
                    wait: IMAGE_AVAILABLE + 1,
                    signal: RENDER_FINISHED + 1,
                    fence: IN_FLIGHT + 1
                },
                Call::Present {
                    image: 0,
                    wait: RENDER_FINISHED + 1
                },
            ]
        );
        assert_eq!(sync.image_owner(0), Some(vk::Fence::from_raw(IN_FLIGHT + 1)));
    }

    #[test]
    fn distinct_images_do_not_wait_on_each_other() {
        let mut sync = frame_sync(2, 2);
        let gpu = MockGpu::new(&sync, 2);

        frame(&mut sync, &gpu).unwrap();
        frame(&mut sync, &gpu).unwrap();
        let log = gpu.take_log();
        assert!(!log.iter().any(|c| matches!(c, Call::BlockedOn(_))), "{log:?}");
        assert_eq!(sync.image_owner(1), Some(vk::Fence::from_raw(IN_FLIGHT + 1)));
    }

    #[test]
    fn slot_reuse_blocks_on_its_own_fence() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        frame(&mut sync, &gpu).unwrap();
        frame(&mut sync, &gpu).unwrap();
        gpu.take_log();

        // third frame is back on slot 0, whose work is still pending
        sync.acquire(&gpu).unwrap();
        assert_eq!(
            &gpu.take_log()[..2],
            &[Call::Wait(IN_FLIGHT), Call::BlockedOn(IN_FLIGHT)]
        );
    }

    #[test]
    fn fence_is_reset_immediately_before_submit() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        for _ in 0..6 {
            frame(&mut sync, &gpu).unwrap();
        }
        let log = gpu.take_log();
        for (i, call) in log.iter().enumerate() {
            if let Call::Submit { fence, .. } = call {
                assert_eq!(log[i - 1], Call::Reset(*fence));
            }
        }
    }

    #[test]
    fn present_waits_on_the_semaphore_the_submit_signals() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        for _ in 0..4 {
            frame(&mut sync, &gpu).unwrap();
        }
        let log = gpu.take_log();
        let mut acquired = None;
        let mut signaled = None;
        for call in log {
            match call {
                Call::Acquire { signal, .. } => acquired = Some(signal),
                Call::Submit { wait, signal, .. } => {
                    assert_eq!(Some(wait), acquired);
                    signaled = Some(signal);
                }
                Call::Present { wait, .. } => assert_eq!(Some(wait), signaled),
                _ => {}
            }
        }
    }

    #[test]
    fn degraded_presents_are_outcomes() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        gpu.script_present(Ok(true));
        gpu.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        assert_eq!(frame(&mut sync, &gpu).unwrap(), PresentOutcome::Suboptimal);
        assert_eq!(frame(&mut sync, &gpu).unwrap(), PresentOutcome::OutOfDate);
        assert_eq!(frame(&mut sync, &gpu).unwrap(), PresentOutcome::Presented);
        assert_eq!(sync.current_frame(), 1);
    }

    #[test]
    fn present_failure_is_an_error_but_the_cursor_moves() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        gpu.script_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let err = frame(&mut sync, &gpu).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Present(vk::Result::ERROR_SURFACE_LOST_KHR)
        ));
        assert_eq!(sync.current_frame(), 1);
    }

    #[test]
    fn acquire_failure_is_fatal() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        gpu.0.borrow_mut().acquire_error = Some(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let err = sync.acquire(&gpu).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR)
        ));
        assert_eq!(sync.current_frame(), 0);
    }

    #[test]
    fn submit_failure_is_fatal_and_keeps_the_cursor() {
        let mut sync = frame_sync(2, 3);
        let gpu = MockGpu::new(&sync, 3);
        let image = sync.acquire(&gpu).unwrap();
        gpu.0.borrow_mut().submit_error = Some(vk::Result::ERROR_DEVICE_LOST);

        let err = sync.submit(&gpu, cmd(), image).unwrap_err();
        assert!(matches!(err, RenderError::Submit(vk::Result::ERROR_DEVICE_LOST)));
        assert_eq!(sync.current_frame(), 0);
        assert!(!gpu
            .take_log()
            .iter()
            .any(|c| matches!(c, Call::Present { .. })));
    }
}
