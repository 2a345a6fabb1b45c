//! The listening side: bind to the requested port or scan the configured
//! range, then turn every accepted TCP connection into a pipe in the
//! accepting state.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::messenger::MessengerCore;
use crate::pipe::Pipe;

/// Consecutive accept failures tolerated before the loop gives up.
const MAX_ACCEPT_ERRORS: u32 = 4;

/// Ports tried when binding with port 0: the configured range minus up to two
/// ports a rebind wants to escape from.
pub(crate) fn candidate_ports(
    range: (u16, u16),
    avoid_port1: u16,
    avoid_port2: u16,
) -> impl Iterator<Item = u16> {
    (range.0..=range.1).filter(move |p| *p != avoid_port1 && *p != avoid_port2)
}

fn new_socket(addr: &SocketAddr) -> std::io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

/// Bind a listener. With a concrete port the address is reused; with port 0
/// the first free port in the configured range is taken instead of an
/// ephemeral one, so peers can find us again after a restart.
pub(crate) async fn bind(
    config: &MessengerConfig,
    bind_addr: SocketAddr,
    avoid_port1: u16,
    avoid_port2: u16,
) -> anyhow::Result<TcpListener> {
    // a fully unspecified address carries no family choice of its own
    let bind_addr = if config.bind_ipv6 && bind_addr.is_ipv4() && bind_addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind_addr.port())
    } else {
        bind_addr
    };

    if bind_addr.port() != 0 {
        let socket = new_socket(&bind_addr).context("creating listen socket")?;
        socket.set_reuseaddr(true).context("setting SO_REUSEADDR")?;
        socket
            .bind(bind_addr)
            .with_context(|| format!("binding to {}", bind_addr))?;
        let listener = socket.listen(128).context("listening")?;
        info!("bound to {}", listener.local_addr()?);
        return Ok(listener);
    }

    for port in candidate_ports(config.port_range, avoid_port1, avoid_port2) {
        let mut addr = bind_addr;
        addr.set_port(port);
        let Ok(socket) = new_socket(&addr) else {
            continue;
        };
        if socket.bind(addr).is_err() {
            continue;
        }
        match socket.listen(128) {
            Ok(listener) => {
                info!("bound on random port {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(e) => {
                debug!("listen on {} failed: {}", addr, e);
                continue;
            }
        }
    }
    bail!(
        "unable to bind to {} on any port in range {}-{}",
        bind_addr,
        config.port_range.0,
        config.port_range.1
    );
}

/// Accept until stopped; every connection becomes a pipe whose reader runs
/// the server half of the handshake.
pub(crate) async fn accept_loop(
    core: Arc<MessengerCore>,
    listener: TcpListener,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("accepter starting");
    let mut errors = 0u32;
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = stop_rx.wait_for(|s| *s) => break,
        };
        match accepted {
            Ok((stream, socket_addr)) => {
                errors = 0;
                debug!("accepted incoming from {}", socket_addr);
                if core.config.tcp_nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("couldn't set TCP_NODELAY: {}", e);
                    }
                }
                if core.destination_stopped() {
                    continue;
                }
                let pipe = Pipe::new_accepting(core.clone(), stream, socket_addr);
                core.add_pipe(pipe.clone()).await;
                pipe.start_reader().await;
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                errors += 1;
                if errors > MAX_ACCEPT_ERRORS {
                    warn!("too many accept failures, giving up");
                    break;
                }
            }
        }
    }
    info!("accepter stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_avoid((100, 104), 0, 0, vec![100, 101, 102, 103, 104])]
    #[case::avoid_one((100, 104), 102, 0, vec![100, 101, 103, 104])]
    #[case::avoid_two((100, 104), 100, 104, vec![101, 102, 103])]
    #[case::avoid_same((100, 102), 101, 101, vec![100, 102])]
    #[case::single((100, 100), 100, 0, vec![])]
    fn test_candidate_ports(
        #[case] range: (u16, u16),
        #[case] avoid1: u16,
        #[case] avoid2: u16,
        #[case] expected: Vec<u16>,
    ) {
        let ports: Vec<u16> = candidate_ports(range, avoid1, avoid2).collect();
        assert_eq!(ports, expected);
    }
}
