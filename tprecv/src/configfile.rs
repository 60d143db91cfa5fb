use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tprecv_common::{ETH_P_1588, TP_ETHER_TYPE};

use crate::socket::libc::HwRxFilter;

#[derive(Serialize, Deserialize, Debug)]
pub struct Configfile {
    pub capture: CaptureConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CaptureConfig {
    pub interface: String,
    #[serde(default = "default_ethertype")]
    pub ethertype: u16,
    /// Frames to receive before exiting, `0` for no limit.
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub ptp: bool,
    #[serde(default)]
    pub rx_filter: HwRxFilter,
    #[serde(default = "default_true")]
    pub filter_own_address: bool,
    #[serde(default)]
    pub allow_software_only: bool,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

impl CaptureConfig {
    /// PTP mode captures 1588 event frames instead of test packets.
    #[inline]
    pub fn capture_ethertype(&self) -> u16 {
        if self.ptp { ETH_P_1588 } else { self.ethertype }
    }

    /// Ethertype decoded as test packets. In PTP mode nothing captured
    /// carries it, so every frame is skipped.
    #[inline]
    pub fn test_ethertype(&self) -> u16 {
        self.ethertype
    }

    #[inline]
    pub fn hw_rx_filter(&self) -> HwRxFilter {
        if self.ptp {
            HwRxFilter::PtpV2L4Event
        } else {
            self.rx_filter
        }
    }

    #[inline]
    pub fn filters_own_address(&self) -> bool {
        self.filter_own_address && !self.ptp
    }

    #[inline]
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PrinterConfig {
    /// Seconds between rate logs, `0` disables them.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
        }
    }
}

impl PrinterConfig {
    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }
}

const fn default_ethertype() -> u16 {
    TP_ETHER_TYPE
}

const fn default_true() -> bool {
    true
}

const fn default_recv_timeout_ms() -> u64 {
    200
}

const fn default_stats_interval() -> u64 {
    10
}

pub fn parse(filename: &str) -> anyhow::Result<Configfile> {
    let content = std::fs::read_to_string(filename).context("reading file")?;

    parse_str(&content)
}

pub fn parse_str(content: &str) -> anyhow::Result<Configfile> {
    let config: Configfile = toml::from_str(content).context("deserializing file")?;

    // zero SO_RCVTIMEO means no timeout
    if config.capture.recv_timeout_ms == 0 {
        bail!("capture.recv_timeout_ms must be greater than 0");
    }

    Ok(config)
}
