mod capture;
mod configfile;
mod emitter;
mod printer;
mod sequence;
mod socket;
mod timestamp;

use std::{
    env, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, bail};
use default_net::get_interfaces;
use log::{debug, info, warn};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    capture::{CaptureLoop, Pipeline},
    configfile::CaptureConfig,
    emitter::Emitter,
    socket::{
        SocketError,
        libc::Timestamping,
        packet::{PacketReceiver, PacketSocket},
    },
};

/// Opens the capture socket with timestamping enabled and bound to the
/// interface. Returns it together with the interface's own address.
fn open_capture(config: &CaptureConfig) -> anyhow::Result<(PacketSocket, Option<[u8; 6]>)> {
    let iface = get_interfaces()
        .into_iter()
        .find(|i| i.name == config.interface)
        .with_context(|| format!("no interface named {}", config.interface))?;

    let ethertype = config.capture_ethertype();
    let socket = PacketSocket::open(ethertype)?;
    socket.reuse_addr(true)?;
    socket.receive_timeout(config.recv_timeout())?;

    match socket.hardware_timestamping(&config.interface, config.hw_rx_filter()) {
        Ok(()) => {}
        Err(err @ SocketError::HardwareTimestamping { .. }) if config.allow_software_only => {
            warn!("{}, continuing with software timestamps", err);
        }
        Err(err) => return Err(err.into()),
    }

    socket.timestamping(Timestamping::RECEIVE)?;
    socket.bind(iface.index)?;

    let own_addr = if config.filters_own_address() {
        let addr = iface.mac_addr.map(|mac| mac.octets());
        if addr.is_none() {
            warn!("{} has no hardware address, not filtering by destination", iface.name);
        }
        addr
    } else {
        None
    };

    info!(
        "capturing ethertype {:#06x} on {} (index {})",
        ethertype, iface.name, iface.index
    );

    Ok((socket, own_addr))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = match env::args().nth(1) {
        Some(arg) if arg == "--version" || arg == "-V" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(arg) if arg.starts_with('-') => bail!("usage: tprecv [CONFIG]"),
        Some(arg) => arg,
        None => "config.toml".to_owned(),
    };

    let configfile = configfile::parse(&path).with_context(|| format!("loading {}", path))?;
    let capture = configfile.capture;

    let (socket, own_addr) = open_capture(&capture).context("opening capture interface")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_loop = shutdown.clone();
    let ethertype = capture.test_ethertype();
    let count = capture.count;
    let interval = configfile.printer.interval();

    let mut task = tokio::task::spawn_blocking(move || {
        let pipeline =
            Pipeline::new(own_addr, Emitter::new(io::stdout().lock())).with_ethertype(ethertype);

        CaptureLoop::new(PacketReceiver::new(socket), pipeline, shutdown_loop)
            .with_count(count)
            .with_printer(interval)
            .run()
    });

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            joined = &mut task => {
                let stats = joined.context("capture loop panicked")??;
                info!("{}", stats);

                return Ok(());
            }
            _ = interrupt.recv() => {
                info!("interrupted, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
            _ = terminate.recv() => {
                info!("terminated, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
            _ = user1.recv() => debug!("SIGUSR1 ignored"),
        }
    }
}
