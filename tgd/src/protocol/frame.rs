// TGD - FRAME BUFFER
// Owned packet buffer with reserved headroom so headers can be pushed in place.
// Ownership of a Frame moves through the data path exactly once: every consumer
// either delivers it, hands it on, or drops it.

/// Headroom reserved in front of fresh frames. Enough for the A-MSDU prefix.
pub const FRAME_HEADROOM: usize = 32;

/// Where a transmit frame entered the core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Host networking stack.
    #[default]
    Host,
    /// Packet-offload engine fast path.
    Offload,
}

/// Side-band metadata attached by offload engines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub origin: FrameOrigin,
    /// Offload engine tag (class of service or context). None when absent.
    pub offload_tag: Option<u32>,
}

#[derive(Clone)]
pub struct Frame {
    buf: Vec<u8>,
    head: usize,
    /// Transmit queue selected by the host (or rewritten by the core).
    pub queue: u8,
    /// Host priority hint (0..8).
    pub priority: u8,
    pub meta: FrameMeta,
}

impl Frame {
    /// Copy `data` into a fresh buffer with default headroom.
    pub fn new(data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(FRAME_HEADROOM + data.len());
        buf.resize(FRAME_HEADROOM, 0);
        buf.extend_from_slice(data);
        Frame { buf, head: FRAME_HEADROOM, queue: 0, priority: 0, meta: FrameMeta::default() }
    }

    /// Take over an existing vector. No headroom; the first push reallocates.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Frame { buf, head: 0, queue: 0, priority: 0, meta: FrameMeta::default() }
    }

    pub fn with_priority(mut self, priority: u8) -> Self { self.priority = priority; self }
    pub fn with_queue(mut self, queue: u8) -> Self { self.queue = queue; self }
    pub fn with_meta(mut self, meta: FrameMeta) -> Self { self.meta = meta; self }

    #[inline(always)] pub fn len(&self) -> usize { self.buf.len() - self.head }
    #[inline(always)] pub fn is_empty(&self) -> bool { self.len() == 0 }
    #[inline(always)] pub fn data(&self) -> &[u8] { &self.buf[self.head..] }
    #[inline(always)] pub fn data_mut(&mut self) -> &mut [u8] { &mut self.buf[self.head..] }
    #[inline(always)] pub fn headroom(&self) -> usize { self.head }

    /// Grow the frame at the front by `n` bytes and return the new front region.
    /// Reallocates when headroom is short.
    pub fn push_front(&mut self, n: usize) -> &mut [u8] {
        if self.head < n {
            let extra = n - self.head + FRAME_HEADROOM;
            let mut grown = Vec::with_capacity(extra + self.buf.len());
            grown.resize(extra, 0);
            grown.extend_from_slice(&self.buf);
            self.buf = grown;
            self.head += extra;
        }
        self.head -= n;
        let head = self.head;
        &mut self.buf[head..head + n]
    }

    /// Drop `n` bytes from the front. Returns false (frame untouched) when too short.
    pub fn pull(&mut self, n: usize) -> bool {
        if n > self.len() {
            return false;
        }
        self.head += n;
        true
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.buf.truncate(self.head + len);
        }
    }

    /// Copy of a sub-slice with the same queue/priority/meta, fresh headroom.
    pub fn clone_region(&self, start: usize, end: usize) -> Frame {
        Frame::new(&self.data()[start..end])
            .with_queue(self.queue)
            .with_priority(self.priority)
            .with_meta(self.meta)
    }

    pub fn into_vec(self) -> Vec<u8> {
        let mut buf = self.buf;
        buf.drain(..self.head);
        buf
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame(len={} q={} prio={} {:?})", self.len(), self.queue, self.priority, self.meta)
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool { self.data() == other.data() }
}
