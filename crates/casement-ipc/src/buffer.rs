//! Shared-memory buffer queue
//!
//! A fixed ring of pixel buffers crossing the IPC boundary. Each side
//! holds its own half with an explicit per-slot state machine:
//!
//! - producer (client): FREE -> DEQUEUED -> QUEUED, released back to
//!   FREE by `sync_free_state` when the service notifies release
//! - consumer (service): FREE -> QUEUED (`sync_queued_state`, driven by
//!   the transaction naming the key) -> ACQUIRED -> FREE
//!
//! All operations are non-blocking; a starved dequeue or acquire
//! returns `None` and the caller retries on the next vsync.

use crate::error::WmError;
use crate::shm::{SharedMapping, SharedMemory};
use crate::surface::SurfaceControl;
use std::any::Any;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::debug;

/// Key identifying a buffer within its surface
pub type BufferKey = i32;

/// Identity of one shared buffer: optional shm name, key, backing fd
#[derive(Debug)]
pub struct BufferId {
    pub name: Option<String>,
    pub key: BufferKey,
    pub fd: RawFd,
}

/// Ownership state of a buffer slot within one half of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

/// One slot of the ring: mapped memory plus bookkeeping
pub struct BufferSlot {
    key: BufferKey,
    size: usize,
    state: SlotState,
    mapping: SharedMapping,
    /// Opaque per-slot data owned by the UI driver, not by the queue
    cookie: Option<Rc<dyn Any>>,
}

impl BufferSlot {
    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mapping.as_mut_slice()
    }

    pub fn cookie(&self) -> Option<Rc<dyn Any>> {
        self.cookie.clone()
    }

    pub fn set_cookie(&mut self, cookie: Rc<dyn Any>) {
        self.cookie = Some(cookie);
    }
}

/// The slot storage common to both halves
struct BufferQueue {
    slots: Vec<BufferSlot>,
    /// Keys in queue order, oldest first (consumer half only)
    queued: VecDeque<BufferKey>,
}

impl BufferQueue {
    /// Map every buffer of `control` into this process
    fn new(control: &SurfaceControl) -> Result<Self, WmError> {
        let size = control.slot_size();
        let mut slots = Vec::with_capacity(control.buffers.len());
        for id in &control.buffers {
            let memory = SharedMemory::from_fd(nix::unistd::dup(id.fd)?, id.name.clone(), size);
            let mapping = memory.map()?;
            slots.push(BufferSlot {
                key: id.key,
                size,
                state: SlotState::Free,
                mapping,
                cookie: None,
            });
        }
        Ok(Self { slots, queued: VecDeque::new() })
    }

    fn slot_mut(&mut self, key: BufferKey) -> Result<&mut BufferSlot, WmError> {
        self.slots
            .iter_mut()
            .find(|s| s.key == key)
            .ok_or(WmError::UnknownHandle)
    }

    fn slot(&self, key: BufferKey) -> Option<&BufferSlot> {
        self.slots.iter().find(|s| s.key == key)
    }
}

/// Client half: dequeues free slots for drawing and queues them back
pub struct BufferProducer {
    queue: BufferQueue,
}

impl BufferProducer {
    pub fn new(control: &SurfaceControl) -> Result<Self, WmError> {
        Ok(Self { queue: BufferQueue::new(control)? })
    }

    /// Take a FREE slot for drawing; `None` when all slots are in flight
    pub fn dequeue_buffer(&mut self) -> Option<BufferKey> {
        let slot = self.queue.slots.iter_mut().find(|s| s.state == SlotState::Free)?;
        slot.state = SlotState::Dequeued;
        Some(slot.key)
    }

    /// Mark a dequeued slot's pixels ready for the service
    pub fn queue_buffer(&mut self, key: BufferKey) -> Result<(), WmError> {
        let slot = self.queue.slot_mut(key)?;
        if slot.state != SlotState::Dequeued {
            return Err(WmError::BadSlotState("queue_buffer requires DEQUEUED"));
        }
        slot.state = SlotState::Queued;
        Ok(())
    }

    /// Return a dequeued slot unused (the driver declined the frame)
    pub fn cancel_buffer(&mut self, key: BufferKey) -> Result<(), WmError> {
        let slot = self.queue.slot_mut(key)?;
        if slot.state != SlotState::Dequeued {
            return Err(WmError::BadSlotState("cancel_buffer requires DEQUEUED"));
        }
        slot.state = SlotState::Free;
        Ok(())
    }

    /// Release notification from the service: the slot is ours again
    pub fn sync_free_state(&mut self, key: BufferKey) -> Result<(), WmError> {
        let slot = self.queue.slot_mut(key)?;
        match slot.state {
            SlotState::Queued | SlotState::Acquired => {
                slot.state = SlotState::Free;
                Ok(())
            }
            _ => Err(WmError::BadSlotState("sync_free_state requires a slot in flight")),
        }
    }

    pub fn slot(&self, key: BufferKey) -> Option<&BufferSlot> {
        self.queue.slot(key)
    }

    pub fn slot_mut(&mut self, key: BufferKey) -> Result<&mut BufferSlot, WmError> {
        self.queue.slot_mut(key)
    }

    pub fn slot_states(&self) -> Vec<(BufferKey, SlotState)> {
        self.queue.slots.iter().map(|s| (s.key, s.state)).collect()
    }
}

/// Service half: tracks queued keys and hands them to the compositor
pub struct BufferConsumer {
    queue: BufferQueue,
}

impl BufferConsumer {
    pub fn new(control: &SurfaceControl) -> Result<Self, WmError> {
        Ok(Self { queue: BufferQueue::new(control)? })
    }

    /// A transaction named this key: the client's pixels are ready
    pub fn sync_queued_state(&mut self, key: BufferKey) -> Result<(), WmError> {
        let slot = self.queue.slot_mut(key)?;
        if slot.state != SlotState::Free {
            return Err(WmError::BadSlotState("sync_queued_state requires FREE"));
        }
        slot.state = SlotState::Queued;
        self.queue.queued.push_back(key);
        Ok(())
    }

    /// Take the oldest queued slot for composition; `None` when starved
    pub fn acquire_buffer(&mut self) -> Option<BufferKey> {
        let key = self.queue.queued.pop_front()?;
        match self.queue.slot_mut(key) {
            Ok(slot) => {
                slot.state = SlotState::Acquired;
                Some(key)
            }
            Err(_) => {
                debug!("queued key {} vanished before acquire", key);
                None
            }
        }
    }

    /// Composition is done with the slot; the caller notifies the client
    pub fn release_buffer(&mut self, key: BufferKey) -> Result<(), WmError> {
        let slot = self.queue.slot_mut(key)?;
        if slot.state != SlotState::Acquired {
            return Err(WmError::BadSlotState("release_buffer requires ACQUIRED"));
        }
        slot.state = SlotState::Free;
        Ok(())
    }

    pub fn slot(&self, key: BufferKey) -> Option<&BufferSlot> {
        self.queue.slot(key)
    }

    pub fn slot_states(&self) -> Vec<(BufferKey, SlotState)> {
        self.queue.slots.iter().map(|s| (s.key, s.state)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::SurfaceControl;
    use crate::types::{PixelFormat, SurfaceHandle, TokenHandle, WindowHandle};

    fn test_control(depth: usize) -> SurfaceControl {
        let mut buffers = Vec::new();
        let size = PixelFormat::Argb8888.stride(8) * 8;
        for i in 0..depth {
            let memory = SharedMemory::create_anon(size).unwrap();
            let fd = memory.dup_fd().unwrap();
            // The control takes over the dup; the original closes here.
            buffers.push(BufferId { name: None, key: 100 + i as BufferKey, fd });
        }
        SurfaceControl::new(
            TokenHandle(1),
            WindowHandle(1),
            SurfaceHandle(1),
            8,
            8,
            PixelFormat::Argb8888,
            buffers,
        )
    }

    #[test]
    fn full_cycle_returns_slot_to_free() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();
        let mut consumer = BufferConsumer::new(&control).unwrap();

        let key = producer.dequeue_buffer().unwrap();
        assert_eq!(producer.slot(key).unwrap().state(), SlotState::Dequeued);
        producer.queue_buffer(key).unwrap();
        assert_eq!(producer.slot(key).unwrap().state(), SlotState::Queued);
        consumer.sync_queued_state(key).unwrap();
        assert_eq!(consumer.acquire_buffer(), Some(key));
        assert_eq!(consumer.slot(key).unwrap().state(), SlotState::Acquired);
        consumer.release_buffer(key).unwrap();
        producer.sync_free_state(key).unwrap();

        assert_eq!(producer.slot(key).unwrap().state(), SlotState::Free);
        assert_eq!(consumer.slot(key).unwrap().state(), SlotState::Free);
    }

    #[test]
    fn dequeue_starves_without_side_effects() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();

        let a = producer.dequeue_buffer().unwrap();
        let b = producer.dequeue_buffer().unwrap();
        assert_ne!(a, b);

        let before = producer.slot_states();
        assert_eq!(producer.dequeue_buffer(), None);
        assert_eq!(producer.slot_states(), before);
    }

    #[test]
    fn cancel_restores_pre_dequeue_state() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();

        let before = producer.slot_states();
        let key = producer.dequeue_buffer().unwrap();
        producer.cancel_buffer(key).unwrap();
        assert_eq!(producer.slot_states(), before);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();
        let mut consumer = BufferConsumer::new(&control).unwrap();

        assert_eq!(producer.queue_buffer(9999), Err(WmError::UnknownHandle));
        assert_eq!(consumer.sync_queued_state(9999), Err(WmError::UnknownHandle));
    }

    #[test]
    fn queue_requires_dequeued() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();
        let key = control.buffers[0].key;
        assert!(matches!(producer.queue_buffer(key), Err(WmError::BadSlotState(_))));
    }

    #[test]
    fn consumer_acquires_in_fifo_order() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();
        let mut consumer = BufferConsumer::new(&control).unwrap();

        let first = producer.dequeue_buffer().unwrap();
        producer.queue_buffer(first).unwrap();
        consumer.sync_queued_state(first).unwrap();

        let second = producer.dequeue_buffer().unwrap();
        producer.queue_buffer(second).unwrap();
        consumer.sync_queued_state(second).unwrap();

        assert_eq!(consumer.acquire_buffer(), Some(first));
        assert_eq!(consumer.acquire_buffer(), Some(second));
        assert_eq!(consumer.acquire_buffer(), None);
    }

    #[test]
    fn release_requires_acquired() {
        let control = test_control(2);
        let mut consumer = BufferConsumer::new(&control).unwrap();
        let key = control.buffers[0].key;
        assert!(matches!(consumer.release_buffer(key), Err(WmError::BadSlotState(_))));
    }

    #[test]
    fn producer_writes_are_visible_to_consumer() {
        let control = test_control(2);
        let mut producer = BufferProducer::new(&control).unwrap();
        let consumer = BufferConsumer::new(&control).unwrap();

        let key = producer.dequeue_buffer().unwrap();
        producer.slot_mut(key).unwrap().as_mut_slice()[0] = 0xAB;
        assert_eq!(consumer.slot(key).unwrap().as_slice()[0], 0xAB);
    }
}
