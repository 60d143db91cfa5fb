use std::{fmt, io::Error};

use crate::socket::libc::sockopt::SocketOptionKind;

pub mod libc;
pub mod packet;

#[derive(Debug)]
pub enum SocketError {
    Socket(Error),
    SetSocketOption { inner: Error, opt: SocketOptionKind },
    HardwareTimestamping { inner: Error, interface: String },
    InterfaceName(String),
    Bind(Error),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(inner) => write!(f, "creating packet socket: {}", inner),
            Self::SetSocketOption { inner, opt } => write!(f, "setting {:?}: {}", opt, inner),
            Self::HardwareTimestamping { inner, interface } => write!(
                f,
                "configuring hardware timestamping on {}: {}",
                interface, inner
            ),
            Self::InterfaceName(name) => write!(f, "invalid interface name {:?}", name),
            Self::Bind(inner) => write!(f, "binding packet socket: {}", inner),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Socket(inner)
            | Self::SetSocketOption { inner, .. }
            | Self::HardwareTimestamping { inner, .. }
            | Self::Bind(inner) => Some(inner),
            Self::InterfaceName(_) => None,
        }
    }
}
