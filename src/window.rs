/// Sliding replay window over the record sequence numbers of one read epoch.
///
/// Keeps the highest accepted sequence number and a 64-bit bitmap of the
/// records directly below it. The same high-water mark is what compact
/// record headers are reconstructed against.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    latest: Option<u64>,
    window: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seqno` would be accepted, without recording it.
    ///
    /// Records are only marked as seen after they authenticate, so the
    /// check and the update are split.
    pub fn is_fresh(&self, seqno: u64) -> bool {
        let Some(latest) = self.latest else {
            return true;
        };
        if seqno > latest {
            return true;
        }
        let offset = latest - seqno;
        offset < 64 && self.window & (1 << offset) == 0
    }

    /// Record `seqno` as seen.
    pub fn mark(&mut self, seqno: u64) {
        match self.latest {
            None => {
                self.latest = Some(seqno);
                self.window = 1;
            }
            Some(latest) if seqno > latest => {
                let delta = seqno - latest;
                self.window = if delta >= 64 { 0 } else { self.window << delta };
                self.window |= 1;
                self.latest = Some(seqno);
            }
            Some(latest) => {
                let offset = latest - seqno;
                if offset < 64 {
                    self.window |= 1 << offset;
                }
            }
        }
    }

    /// The next sequence number we expect from the peer.
    pub fn next_expected(&self) -> u64 {
        self.latest.map(|l| l + 1).unwrap_or(0)
    }

    /// Rebuild a full sequence number from its `bits` low bits.
    ///
    /// Picks the candidate closest to the next expected sequence number
    /// (RFC 9147 section 4.2.2).
    pub fn reconstruct(&self, low: u64, bits: u32) -> u64 {
        let span = 1u64 << bits;
        let mask = span - 1;
        let expected = self.next_expected();

        let base = (expected & !mask) | (low & mask);
        let mut best = base;
        let mut best_dist = base.abs_diff(expected);

        if let Some(lower) = base.checked_sub(span) {
            let d = lower.abs_diff(expected);
            if d < best_dist {
                best = lower;
                best_dist = d;
            }
        }

        let upper = base + span;
        if upper.abs_diff(expected) < best_dist {
            best = upper;
        }

        best
    }
}
