use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::{SandplaneError, SandplaneResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Client for the hypervisor's HTTP-over-Unix-socket control API.
///
/// The hypervisor exposes a small HTTP/1.1 surface on a per-VM socket. Each
/// call opens a fresh connection with `Connection: close`; the endpoints are
/// only exercised a handful of times during boot, so connection reuse buys
/// nothing.
#[derive(Debug, Clone)]
pub struct HypervisorApi {
    /// Path of the VM's control socket.
    socket_path: PathBuf,
}

/// Body of `PUT /machine-config`.
#[derive(Debug, Serialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,

    /// Guest memory in MiB.
    pub mem_size_mib: u32,

    /// Huge page backing, e.g. `"2M"`. Omitted when unsupported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub huge_pages: Option<String>,
}

/// Body of `PUT /boot-source`.
#[derive(Debug, Serialize)]
pub struct BootSource {
    /// Path of the guest kernel image.
    pub kernel_image_path: String,

    /// Kernel command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

/// Body of `PUT /drives/{id}`.
#[derive(Debug, Serialize)]
pub struct Drive {
    /// The drive id, mirrored in the request path.
    pub drive_id: String,

    /// Host path of the backing image.
    pub path_on_host: String,

    /// Whether this drive is the guest's root device.
    pub is_root_device: bool,

    /// Whether the drive is read-only.
    pub is_read_only: bool,
}

/// Body of `PUT /network-interfaces/{id}`.
#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    /// The interface id, mirrored in the request path.
    pub iface_id: String,

    /// Host tap device backing the interface.
    pub host_dev_name: String,
}

/// Body of `PUT /snapshot/load`.
#[derive(Debug, Serialize)]
pub struct SnapshotLoad {
    /// Path of the VM state snapshot file.
    pub snapshot_path: String,

    /// Backing for restored guest memory.
    pub mem_backend: MemBackend,

    /// Whether to resume the VM immediately after restoring.
    pub resume_vm: bool,
}

/// Guest memory backend description for snapshot load.
#[derive(Debug, Serialize)]
pub struct MemBackend {
    /// Backend kind; always a file-backed snapshot here.
    pub backend_type: String,

    /// Path of the memory snapshot file.
    pub backend_path: String,
}

/// Body of `PATCH /vm`.
#[derive(Debug, Serialize)]
pub struct VmStateUpdate {
    /// The requested state, `Paused` or `Resumed`.
    pub state: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorApi {
    /// Creates a client for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Waits until the hypervisor starts accepting connections.
    ///
    /// The socket file appears a moment after the process starts; polls every
    /// 100ms up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> SandplaneResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SandplaneError::HypervisorApi(format!(
                            "control socket {} not ready: {}",
                            self.socket_path.display(),
                            e
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Configures machine resources.
    pub async fn put_machine_config(&self, config: &MachineConfig) -> SandplaneResult<()> {
        self.request("PUT", "/machine-config", Some(serde_json::to_string(config)?))
            .await
    }

    /// Configures the boot source kernel.
    pub async fn put_boot_source(&self, boot_source: &BootSource) -> SandplaneResult<()> {
        self.request(
            "PUT",
            "/boot-source",
            Some(serde_json::to_string(boot_source)?),
        )
        .await
    }

    /// Attaches a drive.
    pub async fn put_drive(&self, drive: &Drive) -> SandplaneResult<()> {
        let path = format!("/drives/{}", drive.drive_id);
        self.request("PUT", &path, Some(serde_json::to_string(drive)?))
            .await
    }

    /// Attaches a network interface.
    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> SandplaneResult<()> {
        let path = format!("/network-interfaces/{}", iface.iface_id);
        self.request("PUT", &path, Some(serde_json::to_string(iface)?))
            .await
    }

    /// Restores the VM from a snapshot.
    pub async fn load_snapshot(&self, load: &SnapshotLoad) -> SandplaneResult<()> {
        self.request("PUT", "/snapshot/load", Some(serde_json::to_string(load)?))
            .await
    }

    /// Pauses or resumes the VM.
    pub async fn patch_vm_state(&self, state: &str) -> SandplaneResult<()> {
        let body = serde_json::to_string(&VmStateUpdate {
            state: state.to_string(),
        })?;
        self.request("PATCH", "/vm", Some(body)).await
    }

    /// Writes guest metadata into the metadata service.
    pub async fn put_mmds(&self, metadata: &serde_json::Value) -> SandplaneResult<()> {
        self.request("PUT", "/mmds", Some(serde_json::to_string(metadata)?))
            .await
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<String>,
    ) -> SandplaneResult<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            SandplaneError::HypervisorApi(format!(
                "connect {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let body = body.unwrap_or_default();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );

        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        let response = String::from_utf8_lossy(&response);

        let status = parse_status_line(&response)?;
        if status >= 400 {
            let fault = response
                .split_once("\r\n\r\n")
                .map(|(_, b)| b.trim())
                .unwrap_or("");
            return Err(SandplaneError::HypervisorApi(format!(
                "{} {} returned {}: {}",
                method, path, status, fault
            )));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_status_line(response: &str) -> SandplaneResult<u16> {
    let status_line = response.lines().next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());

    code.ok_or_else(|| {
        SandplaneError::HypervisorApi(format!("malformed response status line: {status_line:?}"))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line("HTTP/1.1 204 No Content\r\n\r\n").unwrap(),
            204
        );
        assert_eq!(
            parse_status_line("HTTP/1.1 400 Bad Request\r\n\r\n{\"fault_message\":\"x\"}").unwrap(),
            400
        );
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn test_machine_config_serialization() {
        let config = MachineConfig {
            vcpu_count: 2,
            mem_size_mib: 512,
            huge_pages: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"vcpu_count":2,"mem_size_mib":512}"#);

        let config = MachineConfig {
            vcpu_count: 2,
            mem_size_mib: 512,
            huge_pages: Some("2M".to_string()),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""huge_pages":"2M""#));
    }

    #[tokio::test]
    async fn test_request_round_trip_over_unix_socket() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket_path)?;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let api = HypervisorApi::new(&socket_path);
        api.patch_vm_state("Resumed").await?;

        let request = server.await.unwrap();
        assert!(request.starts_with("PATCH /vm HTTP/1.1\r\n"));
        assert!(request.contains(r#"{"state":"Resumed"}"#));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_surfaces_fault_message() -> SandplaneResult<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket_path)?;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 400 Bad Request\r\n\r\n{\"fault_message\":\"no snapshot\"}",
                )
                .await
                .unwrap();
        });

        let api = HypervisorApi::new(&socket_path);
        let result = api.patch_vm_state("Resumed").await;

        match result {
            Err(SandplaneError::HypervisorApi(msg)) => assert!(msg.contains("no snapshot")),
            other => panic!("expected HypervisorApi error, got {:?}", other.err()),
        }
        Ok(())
    }
}
