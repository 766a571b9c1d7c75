//! Thin helpers over an rtnetlink [`Handle`].
//!
//! All functions operate in whatever network namespace the handle's socket
//! was opened in; the caller is responsible for being in the right namespace
//! when it creates the connection.

use std::{net::IpAddr, os::fd::RawFd};

use futures::stream::TryStreamExt;
use ipnetwork::Ipv4Network;
use rtnetlink::Handle;

use crate::{SandplaneError, SandplaneResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the interface index of `iface`.
pub(crate) async fn link_index(handle: &Handle, iface: &str) -> SandplaneResult<u32> {
    let mut links = handle.link().get().match_name(iface.to_string()).execute();

    match links.try_next().await? {
        Some(link) => Ok(link.header.index),
        None => Err(SandplaneError::NetworkSetup(format!(
            "interface '{}' not found",
            iface
        ))),
    }
}

/// Brings the named link up.
pub(crate) async fn set_link_up(handle: &Handle, iface: &str) -> SandplaneResult<()> {
    let index = link_index(handle, iface).await?;
    handle.link().set(index).up().execute().await?;
    Ok(())
}

/// Creates a veth pair; `name` and `peer_name` both appear in the current
/// namespace until one end is moved.
pub(crate) async fn add_veth_pair(
    handle: &Handle,
    name: &str,
    peer_name: &str,
) -> SandplaneResult<()> {
    handle
        .link()
        .add()
        .veth(name.to_string(), peer_name.to_string())
        .execute()
        .await?;
    Ok(())
}

/// Moves the named link into the network namespace referred to by `ns_fd`.
pub(crate) async fn move_link_to_ns(
    handle: &Handle,
    iface: &str,
    ns_fd: RawFd,
) -> SandplaneResult<()> {
    let index = link_index(handle, iface).await?;
    handle.link().set(index).setns_by_fd(ns_fd).execute().await?;
    Ok(())
}

/// Deletes the named link if it exists.
pub(crate) async fn del_link(handle: &Handle, iface: &str) -> SandplaneResult<()> {
    let index = link_index(handle, iface).await?;
    handle.link().del(index).execute().await?;
    Ok(())
}

/// Assigns an IPv4 address with prefix to the named link.
pub(crate) async fn add_address(
    handle: &Handle,
    iface: &str,
    network: Ipv4Network,
) -> SandplaneResult<()> {
    let index = link_index(handle, iface).await?;
    handle
        .address()
        .add(index, IpAddr::V4(network.ip()), network.prefix())
        .execute()
        .await?;
    Ok(())
}

/// Installs the default route via `gateway`.
pub(crate) async fn add_default_route_v4(
    handle: &Handle,
    gateway: std::net::Ipv4Addr,
) -> SandplaneResult<()> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(std::net::Ipv4Addr::UNSPECIFIED, 0)
        .gateway(gateway)
        .execute()
        .await?;
    Ok(())
}

/// Installs a host route to `dest` via `gateway`.
pub(crate) async fn add_route_v4(
    handle: &Handle,
    dest: Ipv4Network,
    gateway: std::net::Ipv4Addr,
) -> SandplaneResult<()> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(dest.ip(), dest.prefix())
        .gateway(gateway)
        .execute()
        .await?;
    Ok(())
}
