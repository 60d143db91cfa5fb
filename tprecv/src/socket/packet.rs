use std::{
    io::{Error, ErrorKind},
    mem,
    os::fd::RawFd,
    slice,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use libc::*;
use log::debug;
use tprecv_common::Timestamp;

use crate::{
    capture::{Frame, FrameSource},
    socket::{
        SocketError,
        libc::{
            HWTSTAMP_TX_ON, HwRxFilter, HwTstampConfig, HwTstampRequest, SIOCSHWTSTAMP,
            SocketOption, Timestamping,
            sockopt::{SocketReceiveTimeout, SocketReuseAddr, SocketTimestamping},
        },
    },
};

const FRAME_SIZE: usize = 2048;
const CONTROL_SIZE: usize = 1024;

/// `AF_PACKET` raw socket receiving a single ethertype.
pub struct PacketSocket {
    fd: RawFd,
    ethertype: u16,
}

impl PacketSocket {
    pub fn open(ethertype: u16) -> Result<Self, SocketError> {
        let fd = unsafe {
            socket(
                AF_PACKET,
                SOCK_RAW | SOCK_CLOEXEC,
                ethertype.to_be() as c_int,
            )
        };
        if fd < 0 {
            return Err(SocketError::Socket(Error::last_os_error()));
        }

        Ok(PacketSocket { fd, ethertype })
    }

    #[inline]
    pub fn reuse_addr(&self, enable: bool) -> Result<(), SocketError> {
        SocketReuseAddr::set(self.fd, &(enable as c_int))
    }

    #[inline]
    pub fn receive_timeout(&self, timeout: Duration) -> Result<(), SocketError> {
        let tv = timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };

        SocketReceiveTimeout::set(self.fd, &tv)
    }

    #[inline]
    pub fn timestamping(&self, flags: Timestamping) -> Result<(), SocketError> {
        SocketTimestamping::set(self.fd, &(flags.bits() as c_int))
    }

    /// Programs the NIC to stamp transmitted packets and received packets
    /// matching `rx_filter`.
    pub fn hardware_timestamping(
        &self,
        interface: &str,
        rx_filter: HwRxFilter,
    ) -> Result<(), SocketError> {
        let mut config = HwTstampConfig {
            flags: 0,
            tx_type: HWTSTAMP_TX_ON,
            rx_filter: rx_filter as c_int,
        };

        let mut request = HwTstampRequest::new(interface, &mut config)
            .ok_or_else(|| SocketError::InterfaceName(interface.to_owned()))?;

        if unsafe { ioctl(self.fd, SIOCSHWTSTAMP as _, &raw mut request) } != 0 {
            return Err(SocketError::HardwareTimestamping {
                inner: Error::last_os_error(),
                interface: interface.to_owned(),
            });
        }

        debug!(
            "hardware timestamping on {}: tx_type={} rx_filter={}",
            interface, config.tx_type, config.rx_filter
        );

        Ok(())
    }

    pub fn bind(&self, interface_index: u32) -> Result<(), SocketError> {
        let mut sll: sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = AF_PACKET as _;
        sll.sll_protocol = self.ethertype.to_be();
        sll.sll_ifindex = interface_index as _;

        if unsafe {
            bind(
                self.fd,
                &raw const sll as *const sockaddr,
                size_of::<sockaddr_ll>() as socklen_t,
            )
        } != 0
        {
            return Err(SocketError::Bind(Error::last_os_error()));
        }

        Ok(())
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        unsafe { close(self.fd) };
    }
}

/// Owns the receive buffers for one [`PacketSocket`].
pub struct PacketReceiver {
    socket: PacketSocket,
    frame: Box<[u8]>,
    // u64 backing keeps cmsghdr reads aligned
    control: Box<[u64]>,
}

impl PacketReceiver {
    pub fn new(socket: PacketSocket) -> Self {
        Self {
            socket,
            frame: vec![0; FRAME_SIZE].into_boxed_slice(),
            control: vec![0; CONTROL_SIZE / size_of::<u64>()].into_boxed_slice(),
        }
    }
}

impl FrameSource for PacketReceiver {
    fn recv(&mut self) -> std::io::Result<Option<Frame<'_>>> {
        let mut iov = iovec {
            iov_base: self.frame.as_mut_ptr().cast(),
            iov_len: self.frame.len(),
        };

        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = self.control.as_mut_ptr().cast();
        msg.msg_controllen = (self.control.len() * size_of::<u64>()) as _;

        let received = unsafe { recvmsg(self.socket.fd, &raw mut msg, 0) };
        let rx_user = now();

        if received < 0 {
            let err = Error::last_os_error();
            return match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }

        let control_len = (msg.msg_controllen as usize).min(CONTROL_SIZE);
        let control =
            unsafe { slice::from_raw_parts(self.control.as_ptr().cast::<u8>(), control_len) };

        Ok(Some(Frame {
            data: &self.frame[..(received as usize).min(FRAME_SIZE)],
            control,
            control_truncated: msg.msg_flags & MSG_CTRUNC != 0,
            rx_user,
        }))
    }
}

/// Wall clock time, the clock receive timestamps are reported in.
#[inline]
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| Timestamp::new(since.as_secs() as i64, since.subsec_nanos() as i64))
        .unwrap_or(Timestamp::ZERO)
}
