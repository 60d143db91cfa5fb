#![no_std]

use core::fmt;

pub const TP_ETHER_TYPE: u16 = 0x0808;
pub const ETH_P_1588: u16 = 0x88F7;

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const BROADCAST_ADDR: [u8; ETH_ALEN] = [0xff; ETH_ALEN];

pub const MAX_STREAM_ID: usize = 32;

pub const TS_MAX_NUM: usize = 6;
pub const TS_MAX_SHORT: usize = 1;

pub const TP_FLAG_END_OF_STREAM: u32 = 1 << 0;
pub const TP_FLAG_SMALL_MODE: u32 = 1 << 1;

/// Sender pipeline stage a transmit timestamp slot was taken at.
#[repr(usize)]
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum TxStage {
    IntervalStart = 0,
    Wakeup,
    ProgramSend,
    LastKernelSched,
    LastKernelSwTx,
    LastKernelHwTx,
}

/// Seconds and nanoseconds since the epoch, the same shape as a kernel `timespec`.
#[derive(Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Copy, Clone)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub const LEN: usize = 16;
    pub const ZERO: Timestamp = Timestamp::new(0, 0);

    #[inline(always)]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    #[inline(always)]
    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    #[inline(always)]
    const fn read(buf: &[u8], at: usize) -> Self {
        Self {
            sec: be_i64(buf, at),
            nsec: be_i64(buf, at + 8),
        }
    }

    #[inline(always)]
    fn write(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 8].copy_from_slice(&self.sec.to_be_bytes());
        buf[at + 8..at + 16].copy_from_slice(&self.nsec.to_be_bytes());
    }
}

#[cfg(feature = "user")]
impl From<libc::timespec> for Timestamp {
    #[inline]
    fn from(ts: libc::timespec) -> Self {
        Self::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum DecodeError {
    MalformedPacket { len: usize },
    BufferTooSmall { needed: usize, len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPacket { len } => write!(
                f,
                "malformed test packet: {} bytes, header needs {}",
                len,
                TestPacket::HEADER_LEN
            ),
            Self::BufferTooSmall { needed, len } => {
                write!(f, "buffer too small: need {} bytes, have {}", needed, len)
            }
        }
    }
}

/// A decoded test packet.
///
/// Layout on the wire (multi-byte fields big endian):
///
/// ```text
/// [0..6]   destination mac
/// [6..12]  source mac
/// [12..14] ethertype
/// [14]     version
/// [15]     stream id
/// [16..20] sequence
/// [20..22] interval usec
/// [22..24] offset usec
/// [24..28] flags
/// [28..]   timestamps, 16 bytes each (seconds, nanoseconds)
/// ```
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct TestPacket {
    pub destination_mac: [u8; ETH_ALEN],
    pub source_mac: [u8; ETH_ALEN],
    pub ethertype: u16,
    pub version: u8,
    pub stream_id: u8,
    pub sequence: u32,
    pub interval_usec: u16,
    pub offset_usec: u16,
    pub flags: u32,
    pub timestamps: [Timestamp; TS_MAX_NUM],
}

impl TestPacket {
    pub const HEADER_LEN: usize = 28;
    pub const MAX_LEN: usize = Self::len(TS_MAX_NUM);

    /// Wire length of a packet carrying `count` timestamps.
    #[inline(always)]
    pub const fn len(count: usize) -> usize {
        Self::HEADER_LEN + Timestamp::LEN * count
    }

    /// Decodes the header and as many timestamp slots as `buf` fully holds.
    /// Slots past the end of `buf` are left at zero.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(DecodeError::MalformedPacket { len: buf.len() });
        }

        let mut timestamps = [Timestamp::ZERO; TS_MAX_NUM];
        for (i, ts) in timestamps.iter_mut().enumerate() {
            let at = Self::len(i);
            if at + Timestamp::LEN > buf.len() {
                break;
            }

            *ts = Timestamp::read(buf, at);
        }

        Ok(Self {
            destination_mac: mac(buf, 0),
            source_mac: mac(buf, 6),
            ethertype: be_u16(buf, 12),
            version: buf[14],
            stream_id: buf[15],
            sequence: be_u32(buf, 16),
            interval_usec: be_u16(buf, 20),
            offset_usec: be_u16(buf, 22),
            flags: be_u32(buf, 24),
            timestamps,
        })
    }

    /// Writes the header and the whole timestamp vector into `buf`,
    /// returning the count written. Flags do not shorten the encoding.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, DecodeError> {
        let needed = Self::MAX_LEN;
        if buf.len() < needed {
            return Err(DecodeError::BufferTooSmall {
                needed,
                len: buf.len(),
            });
        }

        buf[0..6].copy_from_slice(&self.destination_mac);
        buf[6..12].copy_from_slice(&self.source_mac);
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        buf[14] = self.version;
        buf[15] = self.stream_id;
        buf[16..20].copy_from_slice(&self.sequence.to_be_bytes());
        buf[20..22].copy_from_slice(&self.interval_usec.to_be_bytes());
        buf[22..24].copy_from_slice(&self.offset_usec.to_be_bytes());
        buf[24..28].copy_from_slice(&self.flags.to_be_bytes());

        for (i, ts) in self.timestamps.iter().enumerate() {
            ts.write(buf, Self::len(i));
        }

        Ok(needed)
    }

    #[inline(always)]
    pub const fn is_end_of_stream(&self) -> bool {
        self.flags & TP_FLAG_END_OF_STREAM != 0
    }

    #[inline(always)]
    pub const fn is_small_mode(&self) -> bool {
        self.flags & TP_FLAG_SMALL_MODE != 0
    }

    /// Number of timestamp slots the sender declared it wrote.
    #[inline(always)]
    pub const fn timestamp_count(&self) -> usize {
        if self.is_small_mode() {
            TS_MAX_SHORT
        } else {
            TS_MAX_NUM
        }
    }

    #[inline(always)]
    pub const fn expected_len(&self) -> usize {
        Self::len(self.timestamp_count())
    }

    /// Whether a capture of `captured_len` bytes holds every declared slot.
    #[inline(always)]
    pub const fn is_complete(&self, captured_len: usize) -> bool {
        captured_len >= self.expected_len()
    }

    #[inline(always)]
    pub const fn timestamp(&self, stage: TxStage) -> Timestamp {
        self.timestamps[stage as usize]
    }
}

#[inline(always)]
const fn mac(buf: &[u8], at: usize) -> [u8; ETH_ALEN] {
    [
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
        buf[at + 4],
        buf[at + 5],
    ]
}

#[inline(always)]
pub const fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline(always)]
const fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline(always)]
const fn be_i64(buf: &[u8], at: usize) -> i64 {
    i64::from_be_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
        buf[at + 4],
        buf[at + 5],
        buf[at + 6],
        buf[at + 7],
    ])
}
