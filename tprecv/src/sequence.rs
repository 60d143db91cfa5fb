use std::fmt;

use tprecv_common::{MAX_STREAM_ID, TestPacket};

/// Sequence `0` marks a stream with no prior observation.
pub const NO_SEQUENCE: u32 = 0;

/// Loss and ordering verdict for one packet.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Verdict {
    pub dropped: i64,
    pub sequence_error: bool,
}

impl Verdict {
    pub const CLEAN: Verdict = Verdict {
        dropped: 0,
        sequence_error: false,
    };

    #[inline(always)]
    pub const fn is_anomaly(&self) -> bool {
        self.dropped != 0 || self.sequence_error
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct UnknownStream(pub u8);

impl fmt::Display for UnknownStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown stream id {} (valid ids are 0..{})",
            self.0, MAX_STREAM_ID
        )
    }
}

impl std::error::Error for UnknownStream {}

/// Per-stream sequence continuity.
///
/// Must be fed in arrival order: each call compares against the newest
/// sequence seen for the stream, whether or not that one was in order.
pub struct SequenceTracker {
    last_sequence: [u32; MAX_STREAM_ID],
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    #[inline]
    pub const fn new() -> Self {
        Self {
            last_sequence: [NO_SEQUENCE; MAX_STREAM_ID],
        }
    }

    #[inline(always)]
    const fn slot(stream_id: u8) -> Result<usize, UnknownStream> {
        if (stream_id as usize) < MAX_STREAM_ID {
            Ok(stream_id as usize)
        } else {
            Err(UnknownStream(stream_id))
        }
    }

    /// Records `sequence` for `stream_id` and reports what happened since
    /// the previous packet of that stream. With `reset` the stream is
    /// treated as never seen before.
    pub fn check(
        &mut self,
        stream_id: u8,
        sequence: u32,
        reset: bool,
    ) -> Result<Verdict, UnknownStream> {
        let slot = Self::slot(stream_id)?;
        let last = &mut self.last_sequence[slot];

        if reset {
            *last = NO_SEQUENCE;
        }

        if *last == NO_SEQUENCE {
            *last = sequence;
            return Ok(Verdict::CLEAN);
        }

        let verdict = Verdict {
            dropped: sequence as i64 - *last as i64 - 1,
            sequence_error: sequence <= *last,
        };

        *last = sequence;

        Ok(verdict)
    }

    /// Checks a received packet. Flags carried by the packet never reset
    /// the stream.
    #[inline]
    pub fn observe(&mut self, packet: &TestPacket) -> Result<Verdict, UnknownStream> {
        self.check(packet.stream_id, packet.sequence, false)
    }

    #[inline]
    pub fn last_sequence(&self, stream_id: u8) -> Option<u32> {
        let slot = Self::slot(stream_id).ok()?;

        match self.last_sequence[slot] {
            NO_SEQUENCE => None,
            seq => Some(seq),
        }
    }
}
