//! DMABUF slot custody tracking
//!
//! Each slot index names one DMA buffer for the whole session. At any
//! instant a slot is queued on the capture device, queued on the encoder's
//! OUTPUT queue, or briefly in user-space hands between the two. The pump
//! records every move here, which makes the zero-leak property observable:
//! at steady state no slot may be stranded in user space.

/// Where a DMABUF slot currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Queued on the capture device, waiting to be filled.
    OnCapture,
    /// Dequeued from capture, about to be handed to the encoder.
    InFlight,
    /// Queued on the encoder OUTPUT queue.
    OnEncoder,
}

/// Custody ledger for the session's fixed slot set.
#[derive(Debug)]
pub struct SlotTracker {
    states: Vec<SlotState>,
}

impl SlotTracker {
    /// All slots start queued on capture, matching session init.
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![SlotState::OnCapture; count],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Capture dequeue: the driver handed the filled slot to user space.
    pub fn captured(&mut self, index: u32) -> bool {
        self.transition(index, SlotState::OnCapture, SlotState::InFlight)
    }

    /// The slot was queued on the encoder OUTPUT queue.
    pub fn sent_to_encoder(&mut self, index: u32) -> bool {
        self.transition(index, SlotState::InFlight, SlotState::OnEncoder)
    }

    /// The encoder released the slot back to user space.
    pub fn reclaimed(&mut self, index: u32) -> bool {
        self.transition(index, SlotState::OnEncoder, SlotState::InFlight)
    }

    /// The slot was requeued on the capture device.
    pub fn requeued(&mut self, index: u32) -> bool {
        self.transition(index, SlotState::InFlight, SlotState::OnCapture)
    }

    fn transition(&mut self, index: u32, from: SlotState, to: SlotState) -> bool {
        match self.states.get_mut(index as usize) {
            Some(state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// Number of slots in user-space custody (neither queue holds them).
    pub fn in_flight(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == SlotState::InFlight)
            .count()
    }

    /// True when every slot is parked on one of the two kernel queues.
    pub fn balanced(&self) -> bool {
        self.in_flight() == 0
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.states.get(index as usize).copied()
    }
}
