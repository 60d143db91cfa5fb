use std::{
    fmt,
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use log::{debug, info, warn};
use tprecv_common::{
    BROADCAST_ADDR, ETH_ALEN, ETH_HLEN, MAX_STREAM_ID, TP_ETHER_TYPE, TestPacket, Timestamp, be_u16,
};

use crate::{
    emitter::Emitter,
    printer::Printer,
    sequence::{SequenceTracker, Verdict},
    timestamp::{self, RxTimestamps},
};

/// A received frame with the ancillary data that came with it.
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub control: &'a [u8],
    pub control_truncated: bool,
    /// Taken right after the receive call returned.
    pub rx_user: Timestamp,
}

pub trait FrameSource {
    /// Blocks for the next frame. `None` means nothing arrived before the
    /// receive timeout.
    fn recv(&mut self) -> io::Result<Option<Frame<'_>>>;
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Classification {
    Runt,
    Filtered,
    Other(u16),
    TestPacket,
}

/// Admission filter and ethertype dispatch. With `own_addr` set, frames
/// not addressed to it or to broadcast are filtered out. Frames carrying
/// `ethertype` are test packets.
pub fn classify(
    data: &[u8],
    own_addr: Option<&[u8; ETH_ALEN]>,
    ethertype: u16,
) -> Classification {
    if data.len() < ETH_HLEN {
        return Classification::Runt;
    }

    let destination = &data[..ETH_ALEN];
    if let Some(own_addr) = own_addr {
        if destination != BROADCAST_ADDR && destination != own_addr {
            return Classification::Filtered;
        }
    }

    match be_u16(data, 12) {
        found if found == ethertype => Classification::TestPacket,
        other => Classification::Other(other),
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct CaptureResult {
    pub packet: TestPacket,
    pub rx_hw: Timestamp,
    pub rx_sw: Timestamp,
    pub rx_user: Timestamp,
    /// `None` when the stream id is out of range and nothing was tracked.
    pub verdict: Option<Verdict>,
}

impl CaptureResult {
    #[inline]
    pub fn assemble(
        packet: TestPacket,
        rx: RxTimestamps,
        rx_user: Timestamp,
        verdict: Option<Verdict>,
    ) -> Self {
        Self {
            packet,
            rx_hw: rx.hardware,
            rx_sw: rx.software,
            rx_user,
            verdict,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Outcome {
    Runt,
    Filtered,
    Skipped(u16),
    Malformed,
    Emitted {
        verdict: Option<Verdict>,
        truncated: bool,
    },
}

#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct CaptureStats {
    pub received: u64,
    pub runts: u64,
    pub filtered: u64,
    pub other: u64,
    pub malformed: u64,
    pub truncated: u64,
    pub control_truncated: u64,
    pub unknown_stream: u64,
    pub anomalies: u64,
    pub dropped: u64,
    pub sequence_errors: u64,
    pub records: u64,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {} frames, {} records; {} anomalies ({} dropped, {} sequence errors); \
             {} filtered, {} other ethertype, {} runts, {} malformed, {} truncated, \
             {} truncated control, {} unknown stream",
            self.received,
            self.records,
            self.anomalies,
            self.dropped,
            self.sequence_errors,
            self.filtered,
            self.other,
            self.runts,
            self.malformed,
            self.truncated,
            self.control_truncated,
            self.unknown_stream,
        )
    }
}

/// Turns frames into records: classify, decode, track, assemble, emit.
pub struct Pipeline<W: Write> {
    own_addr: Option<[u8; ETH_ALEN]>,
    ethertype: u16,
    tracker: SequenceTracker,
    emitter: Emitter<W>,
    stats: CaptureStats,
}

impl<W: Write> Pipeline<W> {
    #[inline]
    pub fn new(own_addr: Option<[u8; ETH_ALEN]>, emitter: Emitter<W>) -> Self {
        Self {
            own_addr,
            ethertype: TP_ETHER_TYPE,
            tracker: SequenceTracker::new(),
            emitter,
            stats: CaptureStats::default(),
        }
    }

    /// Ethertype decoded as test packets, `TP_ETHER_TYPE` unless set.
    #[inline]
    pub fn with_ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = ethertype;
        self
    }

    /// Only writing a record can fail; everything wrong with the frame
    /// itself is counted and reported in the outcome.
    pub fn handle(&mut self, frame: &Frame<'_>) -> io::Result<Outcome> {
        self.stats.received += 1;

        match classify(frame.data, self.own_addr.as_ref(), self.ethertype) {
            Classification::Runt => {
                self.stats.runts += 1;
                debug!("runt frame of {} bytes", frame.data.len());

                return Ok(Outcome::Runt);
            }
            Classification::Filtered => {
                self.stats.filtered += 1;

                return Ok(Outcome::Filtered);
            }
            Classification::Other(ethertype) => {
                self.stats.other += 1;
                if self.stats.other == 1 {
                    warn!(
                        "skipping ethertype {:#06x} frames, only {:#06x} is decoded",
                        ethertype, self.ethertype
                    );
                } else {
                    debug!("skipping ethertype {:#06x}", ethertype);
                }

                return Ok(Outcome::Skipped(ethertype));
            }
            Classification::TestPacket => {}
        }

        let packet = match TestPacket::decode(frame.data) {
            Ok(packet) => packet,
            Err(err) => {
                self.stats.malformed += 1;
                warn!("dropping frame: {}", err);

                return Ok(Outcome::Malformed);
            }
        };

        let truncated = !packet.is_complete(frame.data.len());
        if truncated {
            self.stats.truncated += 1;
            warn!(
                "stream {} seq {}: captured {} of {} bytes, missing timestamps read as zero",
                packet.stream_id,
                packet.sequence,
                frame.data.len(),
                packet.expected_len()
            );
        }

        if frame.control_truncated {
            self.stats.control_truncated += 1;
            warn!("stream {} seq {}: control data truncated", packet.stream_id, packet.sequence);
        }

        let verdict = self.track(&packet);
        let result = CaptureResult::assemble(
            packet,
            timestamp::extract(frame.control),
            frame.rx_user,
            verdict,
        );

        self.stats.records += self.emitter.emit(&result)? as u64;

        Ok(Outcome::Emitted { verdict, truncated })
    }

    fn track(&mut self, packet: &TestPacket) -> Option<Verdict> {
        match self.tracker.observe(packet) {
            Ok(verdict) => {
                if verdict.is_anomaly() {
                    self.stats.anomalies += 1;
                    self.stats.dropped += verdict.dropped.max(0) as u64;
                    self.stats.sequence_errors += verdict.sequence_error as u64;

                    debug!(
                        "stream {} seq {}: dropped={} sequence_error={}",
                        packet.stream_id, packet.sequence, verdict.dropped, verdict.sequence_error
                    );
                }

                Some(verdict)
            }
            Err(err) => {
                self.stats.unknown_stream += 1;
                warn!("seq {}: {}", packet.sequence, err);

                None
            }
        }
    }

    #[inline]
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Streams seen so far with the newest sequence of each.
    pub fn streams(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        (0..MAX_STREAM_ID as u8)
            .filter_map(|id| self.tracker.last_sequence(id).map(|seq| (id, seq)))
    }
}

/// Single-threaded receive loop. Stops when `shutdown` is raised or after
/// `count` received frames.
pub struct CaptureLoop<S: FrameSource, W: Write> {
    source: S,
    pipeline: Pipeline<W>,
    shutdown: Arc<AtomicBool>,
    count: u64,
    printer: Option<Printer>,
}

impl<S: FrameSource, W: Write> CaptureLoop<S, W> {
    #[inline]
    pub fn new(source: S, pipeline: Pipeline<W>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            source,
            pipeline,
            shutdown,
            count: 0,
            printer: None,
        }
    }

    /// `0` keeps receiving until shutdown.
    #[inline]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    #[inline]
    pub fn with_printer(mut self, interval: Duration) -> Self {
        self.printer = (!interval.is_zero()).then(|| Printer::new(interval));
        self
    }

    pub fn run(mut self) -> anyhow::Result<CaptureStats> {
        let mut frames = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Some(frame) = self.source.recv().context("receiving frame")? {
                frames += 1;
                self.pipeline.handle(&frame).context("writing record")?;
            }

            if let Some(printer) = &mut self.printer {
                printer.tick(frames);
            }

            if self.count != 0 && frames >= self.count {
                info!("received {} frames, stopping", frames);
                break;
            }
        }

        for (stream_id, sequence) in self.pipeline.streams() {
            debug!("stream {}: last sequence {}", stream_id, sequence);
        }

        Ok(self.pipeline.stats())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use libc::{SCM_TIMESTAMPING, SOL_SOCKET};
    use serde_json::Value;
    use tprecv_common::TP_FLAG_END_OF_STREAM;

    use super::*;
    use crate::timestamp::tests::{push_cmsg, timestamping_payload};

    const OWN: [u8; ETH_ALEN] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const OTHER: [u8; ETH_ALEN] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x09];

    fn test_frame(destination: [u8; ETH_ALEN], stream_id: u8, sequence: u32) -> Vec<u8> {
        let packet = TestPacket {
            destination_mac: destination,
            source_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x02],
            ethertype: TP_ETHER_TYPE,
            version: 1,
            stream_id,
            sequence,
            interval_usec: 1000,
            offset_usec: 0,
            flags: 0,
            timestamps: [
                Timestamp::new(1_525_428_672, 1),
                Timestamp::new(1_525_428_672, 2),
                Timestamp::new(1_525_428_672, 3),
                Timestamp::new(1_525_428_672, 4),
                Timestamp::new(1_525_428_672, 5),
                // no hardware transmit stamp
                Timestamp::ZERO,
            ],
        };

        let mut buf = vec![0; TestPacket::MAX_LEN];
        packet.encode_into(&mut buf).unwrap();
        buf
    }

    fn frame(data: &[u8]) -> Frame<'_> {
        Frame {
            data,
            control: &[],
            control_truncated: false,
            rx_user: Timestamp::new(1_525_428_673, 0),
        }
    }

    fn output(pipeline: Pipeline<Vec<u8>>) -> Vec<Value> {
        String::from_utf8(pipeline.emitter.into_inner())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Replays owned frames, then raises the shutdown flag.
    struct Replay {
        frames: VecDeque<Vec<u8>>,
        current: Vec<u8>,
        shutdown: Arc<AtomicBool>,
    }

    impl FrameSource for Replay {
        fn recv(&mut self) -> io::Result<Option<Frame<'_>>> {
            match self.frames.pop_front() {
                Some(data) if data.is_empty() => Ok(None),
                Some(data) => {
                    self.current = data;
                    Ok(Some(frame(&self.current)))
                }
                None => {
                    self.shutdown.store(true, Ordering::Relaxed);
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn test_classify() {
        let data = test_frame(OWN, 1, 1);

        assert_eq!(classify(&data, Some(&OWN), TP_ETHER_TYPE), Classification::TestPacket);
        assert_eq!(classify(&data, None, TP_ETHER_TYPE), Classification::TestPacket);
        assert_eq!(classify(&data, Some(&OTHER), TP_ETHER_TYPE), Classification::Filtered);
        assert_eq!(classify(&data[..13], None, TP_ETHER_TYPE), Classification::Runt);

        let broadcast = test_frame(BROADCAST_ADDR, 1, 1);
        assert_eq!(classify(&broadcast, Some(&OTHER), TP_ETHER_TYPE), Classification::TestPacket);

        let mut ipv4 = data.clone();
        ipv4[12..14].copy_from_slice(&[0x08, 0x00]);
        assert_eq!(classify(&ipv4, None, TP_ETHER_TYPE), Classification::Other(0x0800));
        assert_eq!(classify(&ipv4, None, 0x0800), Classification::TestPacket);
    }

    #[test]
    fn test_sequence_verdicts() {
        let mut pipeline = Pipeline::new(Some(OWN), Emitter::new(Vec::new()));

        let outcomes: Vec<_> = [1, 2, 4, 4, 3]
            .into_iter()
            .map(|seq| pipeline.handle(&frame(&test_frame(OWN, 1, seq))).unwrap())
            .collect();

        let verdicts: Vec<_> = outcomes
            .iter()
            .map(|outcome| match outcome {
                Outcome::Emitted { verdict, .. } => verdict.unwrap(),
                other => panic!("unexpected outcome {:?}", other),
            })
            .collect();

        assert!(!verdicts[0].is_anomaly());
        assert!(!verdicts[1].is_anomaly());
        assert_eq!(verdicts[2], Verdict { dropped: 1, sequence_error: false });
        assert!(verdicts[3].sequence_error);
        assert!(verdicts[4].sequence_error);

        let stats = pipeline.stats();
        assert_eq!(stats.anomalies, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.sequence_errors, 2);
        assert_eq!(stats.records, 8);

        let types: Vec<_> = output(pipeline)
            .iter()
            .map(|line| line["type"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            types,
            [
                "rx-packet", "rx-packet", "rx-error", "rx-packet", "rx-error", "rx-packet",
                "rx-error", "rx-packet",
            ]
        );
    }

    #[test]
    fn test_filtering() {
        let mut pipeline = Pipeline::new(Some(OWN), Emitter::new(Vec::new()));

        assert_eq!(
            pipeline.handle(&frame(&test_frame(OTHER, 1, 1))).unwrap(),
            Outcome::Filtered
        );
        assert!(matches!(
            pipeline.handle(&frame(&test_frame(BROADCAST_ADDR, 1, 2))).unwrap(),
            Outcome::Emitted { .. }
        ));

        // filtered frames never reach the tracker
        assert_eq!(
            pipeline.handle(&frame(&test_frame(OWN, 1, 3))).unwrap(),
            Outcome::Emitted {
                verdict: Some(Verdict::CLEAN),
                truncated: false
            }
        );

        let stats = pipeline.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.filtered, 1);
        assert_eq!(output(pipeline).len(), 2);
    }

    #[test]
    fn test_skips_other_ethertypes() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        let mut ptp = test_frame(OWN, 1, 1);
        ptp[12..14].copy_from_slice(&[0x88, 0xf7]);

        assert_eq!(pipeline.handle(&frame(&ptp)).unwrap(), Outcome::Skipped(0x88f7));
        assert_eq!(pipeline.handle(&frame(&ptp[..10])).unwrap(), Outcome::Runt);
        assert_eq!(pipeline.stats().other, 1);
        assert_eq!(pipeline.stats().runts, 1);
        assert!(output(pipeline).is_empty());
    }

    #[test]
    fn test_malformed_is_not_fatal() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        let data = test_frame(OWN, 1, 1);
        assert_eq!(pipeline.handle(&frame(&data[..20])).unwrap(), Outcome::Malformed);
        assert!(matches!(
            pipeline.handle(&frame(&data)).unwrap(),
            Outcome::Emitted { .. }
        ));

        assert_eq!(pipeline.stats().malformed, 1);
        assert_eq!(output(pipeline).len(), 1);
    }

    #[test]
    fn test_truncated_capture() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        let data = test_frame(OWN, 1, 1);
        assert_eq!(
            pipeline.handle(&frame(&data[..TestPacket::HEADER_LEN])).unwrap(),
            Outcome::Emitted {
                verdict: Some(Verdict::CLEAN),
                truncated: true
            }
        );
        assert_eq!(pipeline.stats().truncated, 1);

        let lines = output(pipeline);
        assert_eq!(
            lines[0]["object"]["timestamps"]["values"][0],
            "1970-01-01T00:00:00.000000000Z"
        );
        assert_eq!(lines[0]["object"]["sequence-number"], 1);
    }

    #[test]
    fn test_unknown_stream_still_emits() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        let data = test_frame(OWN, MAX_STREAM_ID as u8, 5);
        assert_eq!(
            pipeline.handle(&frame(&data)).unwrap(),
            Outcome::Emitted {
                verdict: None,
                truncated: false
            }
        );
        assert_eq!(pipeline.stats().unknown_stream, 1);

        let lines = output(pipeline);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "rx-packet");
        assert_eq!(lines[0]["object"]["stream-id"], 32);
    }

    #[test]
    fn test_receive_timestamps_flow_into_record() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        let mut control = Vec::new();
        push_cmsg(
            &mut control,
            SOL_SOCKET,
            SCM_TIMESTAMPING,
            &timestamping_payload([(1_525_428_672, 20), (0, 0), (1_525_428_672, 10)]),
        );

        let data = test_frame(OWN, 1, 1);
        let frame = Frame {
            data: &data,
            control: &control,
            control_truncated: false,
            rx_user: Timestamp::new(1_525_428_672, 30),
        };
        pipeline.handle(&frame).unwrap();

        let lines = output(pipeline);
        let timestamps = &lines[0]["object"]["timestamps"];
        assert_eq!(timestamps["names"][5], "rx-hardware");
        assert_eq!(timestamps["values"][5], "2018-05-04T10:11:12.000000010Z");
        assert_eq!(timestamps["names"][6], "rx-kernel-driver");
        assert_eq!(timestamps["values"][6], "2018-05-04T10:11:12.000000020Z");
        assert_eq!(timestamps["names"][7], "rx-program");
        assert_eq!(timestamps["values"][7], "2018-05-04T10:11:12.000000030Z");
    }

    #[test]
    fn test_end_of_stream_keeps_tracking() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new()));

        pipeline.handle(&frame(&test_frame(OWN, 3, 500))).unwrap();

        let mut last = test_frame(OWN, 3, 501);
        last[24..28].copy_from_slice(&TP_FLAG_END_OF_STREAM.to_be_bytes());
        pipeline.handle(&frame(&last)).unwrap();

        assert_eq!(
            pipeline.handle(&frame(&test_frame(OWN, 3, 501))).unwrap(),
            Outcome::Emitted {
                verdict: Some(Verdict { dropped: -1, sequence_error: true }),
                truncated: false
            }
        );
        assert_eq!(pipeline.stats().anomalies, 1);
        assert_eq!(pipeline.streams().collect::<Vec<_>>(), [(3, 501)]);
    }

    #[test]
    fn test_configured_ethertype() {
        let mut pipeline = Pipeline::new(None, Emitter::new(Vec::new())).with_ethertype(0x88b5);

        let mut data = test_frame(OWN, 1, 1);
        assert_eq!(
            pipeline.handle(&frame(&data)).unwrap(),
            Outcome::Skipped(TP_ETHER_TYPE)
        );

        data[12..14].copy_from_slice(&0x88b5u16.to_be_bytes());
        assert_eq!(
            pipeline.handle(&frame(&data)).unwrap(),
            Outcome::Emitted {
                verdict: Some(Verdict::CLEAN),
                truncated: false
            }
        );

        assert_eq!(pipeline.stats().other, 1);
        let lines = output(pipeline);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["object"]["sequence-number"], 1);
    }

    fn replay(frames: Vec<Vec<u8>>) -> (Replay, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let source = Replay {
            frames: frames.into(),
            current: Vec::new(),
            shutdown: shutdown.clone(),
        };

        (source, shutdown)
    }

    #[test]
    fn test_loop_runs_until_shutdown() {
        let (source, shutdown) = replay(vec![
            test_frame(OWN, 1, 1),
            Vec::new(),
            test_frame(OWN, 1, 2),
            test_frame(OWN, 1, 4),
        ]);

        let pipeline = Pipeline::new(None, Emitter::new(Vec::new()));
        let stats = CaptureLoop::new(source, pipeline, shutdown.clone())
            .with_printer(Duration::ZERO)
            .run()
            .unwrap();

        assert!(shutdown.load(Ordering::Relaxed));
        assert_eq!(stats.received, 3);
        assert_eq!(stats.anomalies, 1);
        assert_eq!(stats.records, 4);
    }

    #[test]
    fn test_loop_stops_after_count() {
        let (source, shutdown) = replay(vec![
            test_frame(OTHER, 1, 1),
            Vec::new(),
            test_frame(OWN, 1, 2),
            test_frame(OWN, 1, 3),
            test_frame(OWN, 1, 4),
        ]);

        let pipeline = Pipeline::new(Some(OWN), Emitter::new(Vec::new()));
        let stats = CaptureLoop::new(source, pipeline, shutdown.clone())
            .with_count(2)
            .run()
            .unwrap();

        // filtered frames count, timeouts do not
        assert_eq!(stats.received, 2);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.records, 1);
        assert!(!shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_loop_honours_shutdown_flag() {
        let (source, shutdown) = replay(vec![test_frame(OWN, 1, 1)]);
        shutdown.store(true, Ordering::Relaxed);

        let pipeline = Pipeline::new(None, Emitter::new(Vec::new()));
        let stats = CaptureLoop::new(source, pipeline, shutdown).run().unwrap();

        assert_eq!(stats.received, 0);
    }
}
