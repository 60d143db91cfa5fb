use std::io::Error;

use bitflags::bitflags;
use libc::*;
use serde::{Deserialize, Serialize};

use crate::socket::{SocketError, libc::sockopt::SocketOptionKind};

pub const SIOCSHWTSTAMP: c_ulong = 0x89b0;
pub const HWTSTAMP_TX_ON: c_int = 1;

pub trait SocketOption<T>: Copy + Default {
    const TYPE: SocketOptionKind;
    const LEVEL: c_int;
    const NAME: c_int;

    #[inline]
    fn set(fd: i32, value: &T) -> Result<(), SocketError> {
        if unsafe {
            setsockopt(
                fd,
                Self::LEVEL,
                Self::NAME,
                value as *const T as *const _,
                size_of::<T>() as _,
            )
        } != 0
        {
            return Err(SocketError::SetSocketOption {
                inner: Error::last_os_error(),
                opt: Self::TYPE,
            });
        }

        Ok(())
    }
}

pub mod sockopt {
    use libc::*;

    use crate::socket::libc::SocketOption;

    macro_rules! option_of {
        ($($stname:ident, $ty:ty, $level:expr, $name:expr)*) => {
            #[derive(Copy, Clone, Debug)]
            pub enum SocketOptionKind {
                $($stname),*
            }

            $(
            #[derive(Copy, Clone, Default, Debug)]
            pub struct $stname;

            impl SocketOption<$ty> for $stname {
                const TYPE: SocketOptionKind = SocketOptionKind::$stname;
                const LEVEL: c_int = $level;
                const NAME: c_int = $name;
            }
            )*
        };
    }

    option_of!(
        SocketReuseAddr, c_int, SOL_SOCKET, SO_REUSEADDR
        SocketReceiveTimeout, timeval, SOL_SOCKET, SO_RCVTIMEO
        SocketTimestamping, c_int, SOL_SOCKET, SO_TIMESTAMPING
    );
}

bitflags! {
    /// `SOF_TIMESTAMPING_*` bits passed with `SO_TIMESTAMPING`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Timestamping: c_uint {
        const TX_HARDWARE = SOF_TIMESTAMPING_TX_HARDWARE;
        const TX_SOFTWARE = SOF_TIMESTAMPING_TX_SOFTWARE;
        const RX_HARDWARE = SOF_TIMESTAMPING_RX_HARDWARE;
        const RX_SOFTWARE = SOF_TIMESTAMPING_RX_SOFTWARE;
        const SOFTWARE = SOF_TIMESTAMPING_SOFTWARE;
        const SYS_HARDWARE = SOF_TIMESTAMPING_SYS_HARDWARE;
        const RAW_HARDWARE = SOF_TIMESTAMPING_RAW_HARDWARE;
    }
}

impl Timestamping {
    pub const RECEIVE: Self = Self::RX_HARDWARE
        .union(Self::RAW_HARDWARE)
        .union(Self::SYS_HARDWARE)
        .union(Self::SOFTWARE)
        .union(Self::RX_SOFTWARE);
}

/// Hardware receive filter programmed through `SIOCSHWTSTAMP`.
#[repr(i32)]
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Debug, Copy, Clone)]
pub enum HwRxFilter {
    #[serde(rename = "HWTSTAMP_FILTER_NONE")]
    Off = 0,
    #[default]
    #[serde(rename = "HWTSTAMP_FILTER_ALL")]
    All = 1,
    #[serde(rename = "HWTSTAMP_FILTER_SOME")]
    Subset = 2,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V1_L4_EVENT")]
    PtpV1L4Event = 3,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V1_L4_SYNC")]
    PtpV1L4Sync = 4,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V1_L4_DELAY_REQ")]
    PtpV1L4DelayReq = 5,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L4_EVENT")]
    PtpV2L4Event = 6,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L4_SYNC")]
    PtpV2L4Sync = 7,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L4_DELAY_REQ")]
    PtpV2L4DelayReq = 8,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L2_EVENT")]
    PtpV2L2Event = 9,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L2_SYNC")]
    PtpV2L2Sync = 10,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_L2_DELAY_REQ")]
    PtpV2L2DelayReq = 11,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_EVENT")]
    PtpV2Event = 12,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_SYNC")]
    PtpV2Sync = 13,
    #[serde(rename = "HWTSTAMP_FILTER_PTP_V2_DELAY_REQ")]
    PtpV2DelayReq = 14,
}

/// `struct hwtstamp_config` from `linux/net_tstamp.h`.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct HwTstampConfig {
    pub flags: c_int,
    pub tx_type: c_int,
    pub rx_filter: c_int,
}

/// `struct ifreq` with the `ifr_data` member of the union selected.
#[repr(C)]
pub struct HwTstampRequest {
    pub name: [c_char; IFNAMSIZ],
    pub data: *mut HwTstampConfig,
    // rest of the ifreq union
    _pad: [u8; 16],
}

impl HwTstampRequest {
    #[inline]
    pub fn new(interface: &str, config: &mut HwTstampConfig) -> Option<Self> {
        let bytes = interface.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
            return None;
        }

        let mut name = [0 as c_char; IFNAMSIZ];
        for (dst, &src) in name.iter_mut().zip(bytes) {
            *dst = src as c_char;
        }

        Some(Self {
            name,
            data: config,
            _pad: [0; 16],
        })
    }
}
