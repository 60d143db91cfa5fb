use std::ptr;

use chrono::{DateTime, SecondsFormat};
use libc::{SCM_TIMESTAMPING, SO_TIMESTAMP, SO_TIMESTAMPNS, SOL_SOCKET, c_int, cmsghdr, timespec};
use log::trace;
use tprecv_common::Timestamp;

/// Receive timestamps reported by the kernel for one frame.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct RxTimestamps {
    pub software: Timestamp,
    pub hardware: Timestamp,
}

/// One control message from a `recvmsg` control buffer.
#[derive(Debug, Copy, Clone)]
pub struct ControlMessage<'a> {
    pub level: c_int,
    pub ty: c_int,
    pub data: &'a [u8],
}

/// Walks the control messages in a raw control buffer.
///
/// Headers are read unaligned and every length is checked against the
/// buffer, so a truncated or garbled buffer ends the walk instead of
/// reading past it.
pub struct ControlMessages<'a> {
    buf: &'a [u8],
}

impl<'a> ControlMessages<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

const HDR_LEN: usize = cmsg_align(size_of::<cmsghdr>());

#[inline(always)]
const fn cmsg_align(len: usize) -> usize {
    (len + size_of::<usize>() - 1) & !(size_of::<usize>() - 1)
}

impl<'a> Iterator for ControlMessages<'a> {
    type Item = ControlMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < size_of::<cmsghdr>() {
            return None;
        }

        let hdr = unsafe { ptr::read_unaligned(self.buf.as_ptr().cast::<cmsghdr>()) };
        let len = hdr.cmsg_len as usize;
        if len < HDR_LEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }

        let data = &self.buf[HDR_LEN..len];
        self.buf = &self.buf[cmsg_align(len).min(self.buf.len())..];

        Some(ControlMessage {
            level: hdr.cmsg_level,
            ty: hdr.cmsg_type,
            data,
        })
    }
}

/// Extracts the software and hardware receive timestamps from the
/// `SCM_TIMESTAMPING` message in `control`. Both are zero when the
/// kernel attached no such message.
pub fn extract(control: &[u8]) -> RxTimestamps {
    let mut rx = RxTimestamps::default();

    for cmsg in ControlMessages::new(control) {
        if cmsg.level != SOL_SOCKET {
            continue;
        }

        match cmsg.ty {
            SCM_TIMESTAMPING => {
                if cmsg.data.len() < size_of::<[timespec; 3]>() {
                    trace!("short SCM_TIMESTAMPING payload: {} bytes", cmsg.data.len());
                    continue;
                }

                // [0] software, [1] unused, [2] raw hardware
                let ts =
                    unsafe { ptr::read_unaligned(cmsg.data.as_ptr().cast::<[timespec; 3]>()) };
                rx.software = ts[0].into();
                rx.hardware = ts[2].into();
            }
            SO_TIMESTAMP | SO_TIMESTAMPNS => {}
            other => trace!("ignoring socket control message type {}", other),
        }
    }

    rx
}

/// ISO 8601 UTC with nanoseconds, e.g. `2018-05-04T10:11:12.000000123Z`.
pub fn to_iso_string(ts: &Timestamp) -> String {
    u32::try_from(ts.nsec)
        .ok()
        .and_then(|nsec| DateTime::from_timestamp(ts.sec, nsec))
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_else(|| format!("{}.{:09}", ts.sec, ts.nsec))
}
