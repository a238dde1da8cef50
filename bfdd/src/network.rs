//
// Copyright (c) The Bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::io::IoSliceMut;
use std::net::{
    IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
};
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};
use std::time::Duration;

use bfdd_utils::Sender;
use bfdd_utils::capabilities;
use bfdd_utils::ip::{AddressFamily, IpAddrExt};
use bfdd_utils::socket::{SocketExt, TTL_MAX, UdpSocket, UdpSocketExt};
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendError;
use tracing::debug;

use crate::error::{Error, IoError};
use crate::packet::Packet;
use crate::session::SessionId;
use crate::tasks::messages::input::{TxFailureMsg, UdpRxPacketMsg};

pub const PORT_DST: u16 = 3784;
pub const PORT_SRC_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

// The receiver blocks for at most this long before rearming itself. This is
// liveness insurance, not a protocol timeout.
const RX_SOFT_TIMEOUT: Duration = Duration::from_secs(60);

// Ancillary data about a received packet.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub struct PacketInfo {
    pub src: SocketAddr,
    pub ttl: Option<u8>,
}

pub(crate) fn socket_rx() -> Result<UdpSocket, std::io::Error> {
    // A single listener is shared by all sessions, with IPv4 peers showing
    // up as IPv4-mapped addresses.
    let sockaddr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, PORT_DST));
    let socket =
        capabilities::raise_net(|| UdpSocket::bind_dual_stack(sockaddr))?;

    // GTSM (RFC 5881): drop forwarded packets in the kernel and surface the
    // TTL of the ones that remain.
    socket.set_ipv4_minttl(TTL_MAX)?;
    socket.set_ipv6_min_hopcount(TTL_MAX)?;
    socket.set_ipv4_recvttl(true)?;
    socket.set_ipv6_recv_hoplimit(true)?;

    Ok(socket)
}

pub(crate) fn socket_tx(
    af: AddressFamily,
    addr: IpAddr,
) -> Result<UdpSocket, std::io::Error> {
    // Create socket.
    //
    // RFC 5881 says the following:
    // "The source port MUST be in the range 49152 through 65535.  The same
    // UDP source port number MUST be used for all BFD Control packets
    // associated with a particular session.  The source port number SHOULD
    // be unique among all BFD sessions on the system".
    //
    // For simplicity's sake, let's use 49152 as the source port for all
    // sessions. This shouldn't affect protocol operation, as the
    // remote peer should be able to match the incoming BFD packets
    // to the correct session regardless of the source port number.
    //
    // In any case, a separate Tx socket is required for each session since
    // they can be bound to different addresses.
    let port = *PORT_SRC_RANGE.start();
    let sockaddr = SocketAddr::from((addr, port));
    let socket =
        capabilities::raise_net(|| UdpSocket::bind_reuseaddr(sockaddr))?;

    // Set socket options.
    match af {
        AddressFamily::Ipv4 => {
            socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
            socket.set_ipv4_ttl(TTL_MAX)?;
        }
        AddressFamily::Ipv6 => {
            socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
            socket.set_ipv6_unicast_hops(TTL_MAX)?;
        }
    }

    Ok(socket)
}

pub(crate) async fn send_packet(
    socket: Arc<UdpSocket>,
    sockaddr: SocketAddr,
    packet: Packet,
    sess_id: SessionId,
    tx_packet_count: Arc<AtomicU64>,
    tx_error_count: Arc<AtomicU64>,
    tx_failurep: Sender<TxFailureMsg>,
) {
    // Encode packet.
    let buf = packet.encode();

    // Send packet.
    match socket.send_to(&buf, sockaddr).await {
        Ok(_) => {
            tx_packet_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
        Err(error) => {
            IoError::UdpSendError(error).log();
            tx_error_count.fetch_add(1, atomic::Ordering::Relaxed);

            // The session can't be kept alive without a working socket.
            let _ = tx_failurep.send(TxFailureMsg { sess_id }).await;
        }
    }
}

fn get_packet_src(sa: Option<&socket::SockaddrStorage>) -> Option<SocketAddr> {
    sa.and_then(|sa| {
        sa.as_sockaddr_in()
            .map(|sa| SocketAddrV4::from(*sa).into())
            .or_else(|| {
                sa.as_sockaddr_in6()
                    .map(|sa| SocketAddrV6::from(*sa).into())
            })
    })
}

fn get_packet_ttl(cmsgs: socket::CmsgIterator<'_>) -> Option<u8> {
    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::Ipv4Ttl(ttl) => {
                return Some(ttl as u8);
            }
            ControlMessageOwned::Ipv6HopLimit(hoplimit) => {
                return Some(hoplimit as u8);
            }
            _ => {}
        }
    }

    None
}

pub(crate) async fn read_loop(
    socket: Arc<UdpSocket>,
    udp_packet_rxp: Sender<UdpRxPacketMsg>,
) -> Result<(), SendError<UdpRxPacketMsg>> {
    let mut buf = [0; 1024];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::c_int, libc::c_int);

    loop {
        // Receive data from the network.
        let ready = tokio::time::timeout(
            RX_SOFT_TIMEOUT,
            socket.async_io(tokio::io::Interest::READABLE, || {
                match socket::recvmsg::<socket::SockaddrStorage>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        // Retrieve the source address and the TTL ancillary
                        // datum.
                        let src = get_packet_src(msg.address.as_ref());
                        let ttl = msg.cmsgs().ok().and_then(get_packet_ttl);
                        let truncated =
                            msg.flags.contains(MsgFlags::MSG_TRUNC);
                        Ok((src, ttl, msg.bytes, truncated))
                    }
                    Err(errno) => Err(errno.into()),
                }
            }),
        )
        .await;
        let result = match ready {
            Ok(result) => result,
            // Soft timeout: simply rearm.
            Err(_) => continue,
        };

        match result {
            Ok((src, ttl, bytes, truncated)) => {
                if truncated {
                    IoError::UdpRecvTruncated.log();
                    continue;
                }
                let src = match src {
                    Some(addr) => addr,
                    None => {
                        IoError::UdpRecvMissingSourceAddr.log();
                        continue;
                    }
                };

                // IPv4 peers show up as IPv4-mapped addresses on the
                // dual-stack socket.
                let src =
                    SocketAddr::new(src.ip().to_canonical(), src.port());

                // Validate packet's source address.
                if !src.ip().is_usable() {
                    Error::UdpInvalidSourceAddr(src.ip()).log();
                    continue;
                }

                // Decode packet, discarding malformed ones.
                let packet = match Packet::decode(&iov[0].deref()[0..bytes]) {
                    Ok(packet) => packet,
                    Err(error) => {
                        debug!(%src, %error, "malformed packet");
                        continue;
                    }
                };

                // Notify the BFD main task about the received packet.
                let msg = UdpRxPacketMsg {
                    packet_info: PacketInfo { src, ttl },
                    packet,
                };
                udp_packet_rxp.send(msg).await?;
            }
            Err(error)
                if error.kind() == std::io::ErrorKind::Interrupted =>
            {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::UdpRecvError(error).log();
            }
        }
    }
}
