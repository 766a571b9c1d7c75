use std::{
    fs::File,
    os::fd::{AsFd, AsRawFd, RawFd},
    process::Command,
    thread,
};

use nix::sched::{setns, CloneFlags};
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::NETNS_RUN_DIR,
    slot::{Slot, NAMESPACE_VETH_NAME, TAP_NAME},
    SandplaneError, SandplaneResult,
};

use super::netlink;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Dedicated OS thread that owns all network namespace manipulation.
///
/// `setns(2)` mutates per-thread state, so namespace work must never migrate
/// between threads mid-operation. Instead of pinning async tasks, every
/// topology request is shipped to this one worker thread, which runs a
/// current-thread runtime for its rtnetlink traffic and restores the host
/// namespace on every exit path. Requests are processed one at a time, which
/// also serializes all `iptables` invocations.
pub struct NetnsWorker {
    /// Request channel into the worker thread.
    tx: mpsc::UnboundedSender<NetnsCommand>,

    /// The worker thread handle, joined on shutdown.
    thread: Option<thread::JoinHandle<()>>,
}

enum NetnsCommand {
    Create {
        slot: Slot,
        reply: oneshot::Sender<SandplaneResult<()>>,
    },
    Remove {
        slot: Slot,
        reply: oneshot::Sender<SandplaneResult<()>>,
    },
    Shutdown,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetnsWorker {
    /// Spawns the worker thread.
    ///
    /// `egress_iface` is the host's default gateway interface, used for the
    /// FORWARD and MASQUERADE rules. Blocks briefly until the thread has
    /// captured the host namespace handle; call during process startup.
    pub fn spawn(egress_iface: impl Into<String>) -> SandplaneResult<Self> {
        let egress_iface = egress_iface.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name("sandplane-netns".to_string())
            .spawn(move || worker_main(rx, ready_tx, egress_iface))?;

        ready_rx
            .recv()
            .map_err(|_| SandplaneError::NetworkSetup("network worker died during init".into()))??;

        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Builds the full namespace topology for `slot`.
    ///
    /// On failure the worker has already removed whatever it created before
    /// the error is returned.
    pub async fn create_topology(&self, slot: &Slot) -> SandplaneResult<()> {
        self.request(|reply| NetnsCommand::Create {
            slot: slot.clone(),
            reply,
        })
        .await
    }

    /// Tears down the namespace topology for `slot`, best-effort.
    pub async fn remove_topology(&self, slot: &Slot) -> SandplaneResult<()> {
        self.request(|reply| NetnsCommand::Remove {
            slot: slot.clone(),
            reply,
        })
        .await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<SandplaneResult<()>>) -> NetnsCommand,
    ) -> SandplaneResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| SandplaneError::NetworkSetup("network worker is gone".into()))?;

        reply_rx
            .await
            .map_err(|_| SandplaneError::NetworkSetup("network worker dropped request".into()))?
    }

    /// Stops the worker thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(NetnsCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for NetnsWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn worker_main(
    mut rx: mpsc::UnboundedReceiver<NetnsCommand>,
    ready_tx: std::sync::mpsc::Sender<SandplaneResult<()>>,
    egress_iface: String,
) {
    let init = (|| -> SandplaneResult<(tokio::runtime::Runtime, File)> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let host_ns = File::open("/proc/self/ns/net")?;
        Ok((rt, host_ns))
    })();

    let (rt, host_ns) = match init {
        Ok(v) => {
            let _ = ready_tx.send(Ok(()));
            v
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            NetnsCommand::Create { slot, reply } => {
                let result = create_topology(&rt, &host_ns, &slot, &egress_iface);
                if result.is_err() {
                    remove_topology(&rt, &slot, &egress_iface);
                }
                let _ = reply.send(result);
            }
            NetnsCommand::Remove { slot, reply } => {
                remove_topology(&rt, &slot, &egress_iface);
                let _ = reply.send(Ok(()));
            }
            NetnsCommand::Shutdown => break,
        }
    }
}

/// Builds the namespace, veth pair, tap device, routes, and NAT rules for a
/// slot. Runs on the worker thread only.
fn create_topology(
    rt: &tokio::runtime::Runtime,
    host_ns: &File,
    slot: &Slot,
    egress_iface: &str,
) -> SandplaneResult<()> {
    let ns_name = slot.netns_name();
    let veth_name = slot.veth_name();

    run_cmd("ip", &["netns", "add", &ns_name])?;
    let ns_file = File::open(format!("{}/{}", NETNS_RUN_DIR, ns_name))?;

    enter_namespace(&ns_file)?;
    {
        // The host namespace must be restored on every exit path, panics
        // included.
        let _restore = scopeguard::guard(host_ns, |host_ns| restore_host_namespace(host_ns));
        in_namespace_setup(rt, host_ns.as_raw_fd(), slot)?;
    }

    // Host side of the veth pair and the route to the sandbox address.
    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        netlink::add_address(&handle, &veth_name, slot.veth_host_cidr()).await?;
        netlink::set_link_up(&handle, &veth_name).await?;
        netlink::add_route_v4(&handle, slot.host_ip_cidr(), slot.veth_peer_cidr().ip()).await?;
        crate::Ok(())
    })?;

    let host_ip = slot.host_ip_cidr().to_string();
    run_cmd(
        "iptables",
        &[
            "-A", "FORWARD", "-i", &veth_name, "-o", egress_iface, "-j", "ACCEPT",
        ],
    )?;
    run_cmd(
        "iptables",
        &[
            "-A", "FORWARD", "-i", egress_iface, "-o", &veth_name, "-j", "ACCEPT",
        ],
    )?;
    run_cmd(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &host_ip,
            "-o",
            egress_iface,
            "-j",
            "MASQUERADE",
        ],
    )?;

    tracing::info!(ns = %ns_name, "sandbox network topology created");
    Ok(())
}

/// The namespace-local half of topology creation. The calling thread must
/// already be inside the slot's namespace.
fn in_namespace_setup(
    rt: &tokio::runtime::Runtime,
    host_ns_fd: RawFd,
    slot: &Slot,
) -> SandplaneResult<()> {
    let veth_name = slot.veth_name();
    let guest_ip = slot.guest_ip().to_string();
    let host_ip = slot.host_ip_cidr().ip().to_string();

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        netlink::set_link_up(&handle, "lo").await?;

        // The veth pair is born in the namespace; the host end is pushed out
        // once the peer is configured.
        netlink::add_veth_pair(&handle, &veth_name, NAMESPACE_VETH_NAME).await?;
        netlink::add_address(&handle, NAMESPACE_VETH_NAME, slot.veth_peer_cidr()).await?;
        netlink::set_link_up(&handle, NAMESPACE_VETH_NAME).await?;
        netlink::move_link_to_ns(&handle, &veth_name, host_ns_fd).await?;
        crate::Ok(())
    })?;

    run_cmd("ip", &["tuntap", "add", TAP_NAME, "mode", "tap"])?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        netlink::add_address(&handle, TAP_NAME, slot.tap_cidr()).await?;
        netlink::set_link_up(&handle, TAP_NAME).await?;
        netlink::add_default_route_v4(&handle, slot.veth_host_cidr().ip()).await?;
        crate::Ok(())
    })?;

    run_cmd(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &guest_ip,
            "-o",
            NAMESPACE_VETH_NAME,
            "-j",
            "SNAT",
            "--to",
            &host_ip,
        ],
    )?;
    run_cmd(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-d",
            &host_ip,
            "-j",
            "DNAT",
            "--to",
            &guest_ip,
        ],
    )?;

    Ok(())
}

/// Removes every host-side artifact of a slot's topology and deletes the
/// namespace. Individual failures are logged and skipped; removal never
/// aborts halfway.
fn remove_topology(rt: &tokio::runtime::Runtime, slot: &Slot, egress_iface: &str) {
    let ns_name = slot.netns_name();
    let veth_name = slot.veth_name();
    let host_ip = slot.host_ip_cidr().to_string();

    warn_on_fail(
        "remove forward rule (out)",
        run_cmd(
            "iptables",
            &[
                "-D", "FORWARD", "-i", &veth_name, "-o", egress_iface, "-j", "ACCEPT",
            ],
        ),
    );
    warn_on_fail(
        "remove forward rule (in)",
        run_cmd(
            "iptables",
            &[
                "-D", "FORWARD", "-i", egress_iface, "-o", &veth_name, "-j", "ACCEPT",
            ],
        ),
    );
    warn_on_fail(
        "remove masquerade rule",
        run_cmd(
            "iptables",
            &[
                "-t",
                "nat",
                "-D",
                "POSTROUTING",
                "-s",
                &host_ip,
                "-o",
                egress_iface,
                "-j",
                "MASQUERADE",
            ],
        ),
    );
    warn_on_fail(
        "remove sandbox route",
        run_cmd("ip", &["route", "del", &host_ip]),
    );

    // Deleting the namespace destroys the in-namespace veth end (and with it
    // the pair), the tap device, and the namespace-local iptables rules.
    warn_on_fail(
        "delete namespace",
        run_cmd("ip", &["netns", "del", &ns_name]),
    );

    // If creation failed before the host end was moved out, the veth pair
    // died with the namespace; only delete a leftover if one is present.
    let leftover = rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        if netlink::link_index(&handle, &veth_name).await.is_ok() {
            netlink::del_link(&handle, &veth_name).await?;
        }
        crate::Ok(())
    });
    warn_on_fail("delete leftover veth", leftover);

    tracing::info!(ns = %ns_name, "sandbox network topology removed");
}

fn enter_namespace(ns_file: &File) -> SandplaneResult<()> {
    setns(ns_file.as_fd(), CloneFlags::CLONE_NEWNET)?;
    Ok(())
}

fn restore_host_namespace(host_ns: &File) {
    // A worker thread stuck inside a sandbox namespace would corrupt every
    // subsequent operation; this must not fail.
    setns(host_ns.as_fd(), CloneFlags::CLONE_NEWNET)
        .expect("failed to restore host network namespace");
}

fn run_cmd(program: &str, args: &[&str]) -> SandplaneResult<()> {
    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        return Err(SandplaneError::NetworkSetup(format!(
            "`{} {}` failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}

fn warn_on_fail(step: &str, result: SandplaneResult<()>) {
    if let Err(e) = result {
        tracing::warn!(step, error = %e, "network teardown step failed, continuing");
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_cmd_reports_stderr() {
        let result = run_cmd("sh", &["-c", "echo boom >&2; exit 1"]);
        match result {
            Err(SandplaneError::NetworkSetup(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected NetworkSetup error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_run_cmd_success() {
        assert!(run_cmd("true", &[]).is_ok());
    }
}
