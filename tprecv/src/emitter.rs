use std::io::{self, Write};

use serde::Serialize;
use tprecv_common::{Timestamp, TxStage};

use crate::{capture::CaptureResult, sequence::Verdict, timestamp::to_iso_string};

/// One output line: `{"type": ..., "object": ...}`.
#[derive(Serialize, Debug)]
#[serde(tag = "type", content = "object", rename_all = "kebab-case")]
pub enum Record {
    RxError(RxError),
    RxPacket(RxPacket),
}

#[derive(Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct RxError {
    pub dropped_packets: i64,
    pub sequence_error: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct RxPacket {
    pub stream_id: u8,
    pub sequence_number: u32,
    pub interval_usec: u16,
    pub offset_usec: u16,
    pub timestamps: TimestampSeries,
}

/// Parallel name and value arrays, in pipeline order.
#[derive(Serialize, Default, Debug)]
pub struct TimestampSeries {
    pub names: Vec<&'static str>,
    pub values: Vec<String>,
}

impl TimestampSeries {
    #[inline]
    fn push(&mut self, name: &'static str, ts: &Timestamp) {
        self.names.push(name);
        self.values.push(to_iso_string(ts));
    }
}

impl From<&Verdict> for RxError {
    #[inline]
    fn from(verdict: &Verdict) -> Self {
        Self {
            dropped_packets: verdict.dropped,
            sequence_error: verdict.sequence_error,
        }
    }
}

impl From<&CaptureResult> for RxPacket {
    /// Eight names, or nine with `tx-last-kernel-hardware` inserted before
    /// the receive stamps when the sender filled that slot.
    fn from(result: &CaptureResult) -> Self {
        let packet = &result.packet;
        let mut timestamps = TimestampSeries::default();

        timestamps.push("interval-start", &packet.timestamp(TxStage::IntervalStart));
        timestamps.push("tx-wakeup", &packet.timestamp(TxStage::Wakeup));
        timestamps.push("tx-program", &packet.timestamp(TxStage::ProgramSend));
        timestamps.push(
            "tx-last-kernel-netsched",
            &packet.timestamp(TxStage::LastKernelSched),
        );
        timestamps.push(
            "tx-last-kernel-driver",
            &packet.timestamp(TxStage::LastKernelSwTx),
        );

        let hw_tx = packet.timestamp(TxStage::LastKernelHwTx);
        if !hw_tx.is_zero() {
            timestamps.push("tx-last-kernel-hardware", &hw_tx);
        }

        timestamps.push("rx-hardware", &result.rx_hw);
        timestamps.push("rx-kernel-driver", &result.rx_sw);
        timestamps.push("rx-program", &result.rx_user);

        Self {
            stream_id: packet.stream_id,
            sequence_number: packet.sequence,
            interval_usec: packet.interval_usec,
            offset_usec: packet.offset_usec,
            timestamps,
        }
    }
}

/// Writes records as compact JSON, one per line, flushing after each.
pub struct Emitter<W: Write> {
    out: W,
}

impl<W: Write> Emitter<W> {
    #[inline]
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Emits an `rx-error` record when the verdict is an anomaly, then the
    /// `rx-packet` record. Returns the number of records written.
    pub fn emit(&mut self, result: &CaptureResult) -> io::Result<usize> {
        let mut written = 0;

        if let Some(verdict) = result.verdict.filter(Verdict::is_anomaly) {
            self.write(&Record::RxError(RxError::from(&verdict)))?;
            written += 1;
        }

        self.write(&Record::RxPacket(RxPacket::from(result)))?;

        Ok(written + 1)
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
