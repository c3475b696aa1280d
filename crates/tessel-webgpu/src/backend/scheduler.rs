use super::tensor_data::DataId;
use std::collections::HashSet;

/// Lifecycle of the command encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    /// No encoder is open.
    Idle,
    /// Compute passes are being recorded.
    EncoderOpen,
    /// The encoder was handed to the queue; deferred releases are being drained.
    Submitted,
}

/// Resources whose release was held back until the encoder that uses them is submitted.
#[derive(Debug)]
pub struct Drained<U> {
    pub uniforms: Vec<U>,
    pub disposals: Vec<DataId>,
}

/// Bookkeeping half of the encoder batching state machine.
///
/// Holds no device objects: the backend opens, records into and submits the actual
/// encoder, and asks the scheduler when to do so and what to release afterwards.
#[derive(Debug)]
pub struct SubmitScheduler<U> {
    state: EncoderState,
    batch_size: usize,
    passes_in_encoder: usize,
    queue_owned: HashSet<DataId>,
    pending_disposal: Vec<DataId>,
    pending_uniform_release: Vec<U>,
    submissions: u64,
}

impl<U> SubmitScheduler<U> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: EncoderState::Idle,
            batch_size: batch_size.max(1),
            passes_in_encoder: 0,
            queue_owned: HashSet::new(),
            pending_disposal: Vec::new(),
            pending_uniform_release: Vec::new(),
            submissions: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn passes_in_encoder(&self) -> usize {
        self.passes_in_encoder
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions
    }

    /// Called before a pass is recorded. Returns `true` when a new encoder must be
    /// opened (Idle -> EncoderOpen).
    pub fn begin_dispatch(&mut self) -> bool {
        match self.state {
            EncoderState::EncoderOpen => false,
            EncoderState::Idle | EncoderState::Submitted => {
                self.state = EncoderState::EncoderOpen;
                true
            }
        }
    }

    /// Record one compute pass touching `tensors` and owning `uniform` until
    /// submission. Returns `true` once the batch threshold is reached.
    pub fn record_pass(&mut self, tensors: &[DataId], uniform: U) -> bool {
        debug_assert_eq!(self.state, EncoderState::EncoderOpen);
        self.queue_owned.extend(tensors.iter().copied());
        self.pending_uniform_release.push(uniform);
        self.passes_in_encoder += 1;
        self.passes_in_encoder >= self.batch_size
    }

    /// Whether `id` is referenced by the open, unsubmitted encoder.
    pub fn is_queue_owned(&self, id: DataId) -> bool {
        self.queue_owned.contains(&id)
    }

    pub fn defer_disposal(&mut self, id: DataId) {
        if !self.pending_disposal.contains(&id) {
            self.pending_disposal.push(id);
        }
    }

    pub fn is_pending_disposal(&self, id: DataId) -> bool {
        self.pending_disposal.contains(&id)
    }

    /// EncoderOpen -> Submitted. Hands back everything that may now be released.
    pub fn begin_submit(&mut self) -> Drained<U> {
        self.state = EncoderState::Submitted;
        self.passes_in_encoder = 0;
        self.submissions += 1;
        self.queue_owned.clear();
        Drained {
            uniforms: std::mem::take(&mut self.pending_uniform_release),
            disposals: std::mem::take(&mut self.pending_disposal),
        }
    }

    /// Submitted -> Idle.
    pub fn finish_submit(&mut self) {
        self.state = EncoderState::Idle;
    }

    /// Forget all recorded work without submitting it.
    pub fn abandon(&mut self) -> Drained<U> {
        self.state = EncoderState::Idle;
        self.passes_in_encoder = 0;
        self.queue_owned.clear();
        Drained {
            uniforms: std::mem::take(&mut self.pending_uniform_release),
            disposals: std::mem::take(&mut self.pending_disposal),
        }
    }
}
