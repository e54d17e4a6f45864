//! Userspace connector: `wireguard-go` daemons configured over their UAPI socket
//!
//! Each interface this connector starts is a `wireguard-go -f utun` child
//! owned by the connector. The daemon writes the kernel-assigned `utunN` to
//! `<run dir>/<name>.name` and listens on `<run dir>/utunN.sock`. Interfaces
//! started elsewhere (wg-quick, another process) are read and converged over
//! the same socket but never stopped.
//!
//! URL form: `darwin://?binary=/opt/homebrew/bin/wireguard-go`

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::exec::command::{CommandRunner, ProcessRunner};
use super::exec::darwin::{DarwinTool, RUN_DIR};
use super::exec::NetworkTool;
use super::{expect_kind, resolve_endpoint};
use crate::codec::uapi::{parse_errno, parse_get, render_set, GET_REQUEST};
use crate::driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats,
    LinkState, PeerStats,
};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::{desired_routes, diff_routes, plan_addresses, plan_device, plan_mtu};
use crate::validation::{normalize_cidr, validate_interface_name};

const DEFAULT_BINARY: &str = "wireguard-go";
const NAME_FILE_POLL: Duration = Duration::from_millis(100);
const NAME_FILE_ATTEMPTS: usize = 50;

struct ManagedDevice {
    tun: String,
    child: Child,
}

pub struct UserspaceConnector {
    binary: String,
    run_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    tool: DarwinTool,
    devices: Mutex<HashMap<String, ManagedDevice>>,
}

impl UserspaceConnector {
    pub fn new(raw_url: &str) -> WgctlResult<Self> {
        let url = BackendUrl::parse(raw_url)?;
        expect_kind(&url, BackendKind::Darwin)?;
        if url.has_authority() {
            return Err(WgctlError::Validation(
                "darwin backend does not support remote host/user/port in url".to_string(),
            ));
        }
        let binary = url
            .option("binary")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BINARY)
            .to_string();

        Ok(Self::with_parts(
            binary,
            RUN_DIR,
            Arc::new(ProcessRunner::new(false)),
        ))
    }

    pub fn with_parts(
        binary: impl Into<String>,
        run_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let run_dir = run_dir.into();
        Self {
            binary: binary.into(),
            tool: DarwinTool::with_run_dir(runner.clone(), run_dir.clone()),
            run_dir,
            runner,
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn socket_path(&self, tun: &str) -> PathBuf {
        self.run_dir.join(format!("{}.sock", tun))
    }

    fn name_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.name", name))
    }

    /// One request/reply exchange on the daemon's socket
    async fn request(&self, tun: &str, body: &str) -> WgctlResult<String> {
        let path = self.socket_path(tun);
        let mut stream = UnixStream::connect(&path).await?;
        stream.write_all(body.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let done = line.trim().is_empty() && !reply.is_empty();
            reply.push_str(&line);
            if done {
                break;
            }
        }
        Ok(reply)
    }

    /// `utunN` for `name` when its daemon socket exists
    async fn live_tun(&self, name: &str) -> Option<String> {
        let tun = self.tool.resolve(name).await;
        tokio::fs::try_exists(self.socket_path(&tun))
            .await
            .unwrap_or(false)
            .then_some(tun)
    }

    async fn read_device(&self, name: &str, tun: &str) -> WgctlResult<Device> {
        let reply = self.request(tun, GET_REQUEST).await?;
        let mut device = parse_get(name, &reply)?;
        device.interface.name = name.to_string();
        if let Some(link) = self.tool.link(name).await? {
            device.interface.addresses = link.reported_addresses();
            device.interface.mtu = link.mtu;
        }
        Ok(device)
    }

    async fn spawn(&self, name: &str) -> WgctlResult<ManagedDevice> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        let name_file = self.name_file(name);
        let _ = tokio::fs::remove_file(&name_file).await;

        info!("Starting {} for {}", self.binary, name);
        let child = Command::new(&self.binary)
            .args(["-f", "utun"])
            .env("WG_TUN_NAME_FILE", &name_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WgctlError::CommandFailed {
                cmd: format!("{} -f utun", self.binary),
                code: None,
                output: e.to_string(),
            })?;

        let mut managed = ManagedDevice {
            tun: String::new(),
            child,
        };
        for _ in 0..NAME_FILE_ATTEMPTS {
            if let Some(status) = managed.child.try_wait()? {
                return Err(WgctlError::CommandFailed {
                    cmd: format!("{} -f utun", self.binary),
                    code: status.code(),
                    output: "daemon exited before creating its interface".to_string(),
                });
            }
            if let Ok(tun) = tokio::fs::read_to_string(&name_file).await {
                let tun = tun.trim().to_string();
                if !tun.is_empty() && tokio::fs::try_exists(self.socket_path(&tun)).await.unwrap_or(false) {
                    debug!("{} is running as {}", name, tun);
                    managed.tun = tun;
                    return Ok(managed);
                }
            }
            tokio::time::sleep(NAME_FILE_POLL).await;
        }

        let _ = managed.child.kill().await;
        Err(WgctlError::Transport(format!(
            "{} did not create an interface for {}",
            self.binary, name
        )))
    }

    async fn configure(&self, options: &ConfigureOptions, tun: &str) -> WgctlResult<()> {
        let name = options.name();
        let current = parse_get(name, &self.request(tun, GET_REQUEST).await?)?;
        let options = &options
            .clone()
            .with_private_key(Some(&current.wireguard.private_key));

        let mut update = plan_device(&current, options);
        if update.firewall_mark.take().is_some() {
            debug!("Ignoring firewall mark for {}: not supported by userspace daemons", name);
        }
        for peer in update.peers.iter_mut() {
            if let Some(endpoint) = peer.endpoint.take() {
                peer.endpoint = Some(resolve_endpoint(&endpoint).await?.to_string());
            }
        }
        if !update.is_empty() {
            debug!("Applying {} peer change(s) to {}", update.peers.len(), name);
            parse_errno(&self.request(tun, &render_set(&update)?).await?)?;
        }

        let link = self
            .tool
            .link(name)
            .await?
            .ok_or_else(|| WgctlError::NotFound(format!("interface {}", name)))?;
        let addresses = plan_addresses(&link.addresses, &options.interface.address)?;
        for address in &addresses.remove {
            self.tool.remove_address(name, address).await?;
        }
        if let Some(address) = &addresses.add {
            self.tool.add_address(name, address).await?;
        }
        if let Some(mtu) = plan_mtu(link.mtu, options.interface.mtu) {
            self.tool.set_mtu(name, mtu).await?;
        }
        if !link.up {
            self.runner.run("ifconfig", &[tun, "up"]).await?;
        }

        let desired = desired_routes(&options.wireguard.peers)?;
        let preserve = vec![normalize_cidr(&options.interface.address)?];
        let plan = diff_routes(&self.tool.routes(name).await?, &desired, &preserve);
        for route in plan.add.iter().chain(plan.update.iter()) {
            self.tool.replace_route(name, route).await?;
        }
        for route in &plan.remove {
            self.tool.remove_route(name, route).await?;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, mut managed: ManagedDevice) {
        info!("Stopping {} ({})", name, managed.tun);
        if let Err(e) = managed.child.kill().await {
            warn!("Failed to stop daemon for {}: {}", name, e);
        }
        let _ = tokio::fs::remove_file(self.name_file(name)).await;
        let _ = tokio::fs::remove_file(self.socket_path(&managed.tun)).await;
    }
}

fn socket_stems(entries: &[PathBuf]) -> Vec<String> {
    let mut stems: Vec<String> = entries
        .iter()
        .filter(|path| path.extension().map(|ext| ext == "sock").unwrap_or(false))
        .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string))
        .collect();
    stems.sort();
    stems
}

async fn list_dir(dir: &Path) -> WgctlResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

#[async_trait]
impl Driver for UserspaceConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Darwin
    }

    async fn device(&self, name: &str) -> WgctlResult<Device> {
        validate_interface_name(name)?;
        let tun = self
            .live_tun(name)
            .await
            .ok_or_else(|| WgctlError::NotFound(format!("wireguard interface {}", name)))?;
        self.read_device(name, &tun).await
    }

    async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device> {
        let options = options.validated()?;
        let name = options.name();

        let mut devices = self.devices.lock().await;
        let exited = match devices.get_mut(name) {
            Some(managed) => managed.child.try_wait()?.is_some(),
            None => false,
        };
        if exited {
            warn!("Daemon for {} exited, starting a new one", name);
            devices.remove(name);
        }

        let tun = match devices.get(name) {
            Some(managed) => managed.tun.clone(),
            None => match self.live_tun(name).await {
                Some(tun) => {
                    debug!("Adopting running interface {} ({})", name, tun);
                    tun
                }
                None => {
                    let managed = self.spawn(name).await?;
                    let tun = managed.tun.clone();
                    devices.insert(name.to_string(), managed);
                    tun
                }
            },
        };

        if let Err(e) = self.configure(&options, &tun).await {
            if let Some(managed) = devices.remove(name) {
                warn!("Configuring {} failed, stopping it: {}", name, e);
                self.stop(name, managed).await;
            }
            return Err(e);
        }
        drop(devices);

        self.read_device(name, &tun).await
    }

    async fn down(&self, name: &str) -> WgctlResult<()> {
        validate_interface_name(name)?;
        let managed = self.devices.lock().await.remove(name);
        match managed {
            Some(managed) => self.stop(name, managed).await,
            None => debug!("{} is not managed by this connector, leaving it", name),
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> WgctlResult<bool> {
        validate_interface_name(name)?;
        if let Some(managed) = self.devices.lock().await.get_mut(name) {
            return Ok(managed.child.try_wait()?.is_none());
        }
        Ok(self.live_tun(name).await.is_some())
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        validate_interface_name(name)?;
        if self.live_tun(name).await.is_none() {
            return Ok(None);
        }
        self.tool.stats(name).await
    }

    async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>> {
        validate_interface_name(name)?;
        let Some(tun) = self.live_tun(name).await else {
            return Ok(None);
        };
        let device = parse_get(name, &self.request(&tun, GET_REQUEST).await?)?;
        Ok(device.peer_stats(peer_public_key))
    }

    async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>> {
        let mut servers = Vec::new();
        for tun in socket_stems(&list_dir(&self.run_dir).await?) {
            let name = self.tool.logical_name(&tun).await?;
            if known_interfaces.iter().any(|known| *known == name || *known == tun) {
                continue;
            }
            match self.read_device(&name, &tun).await {
                Ok(device) => servers.push(ForeignServer::from_device(device, LinkState::Up, "wireguard")),
                Err(e) => warn!("Skipping stale socket for {}: {}", tun, e),
            }
        }
        Ok(servers)
    }

    async fn close(&self) -> WgctlResult<()> {
        let drained: Vec<(String, ManagedDevice)> = self.devices.lock().await.drain().collect();
        for (name, managed) in drained {
            self.stop(&name, managed).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::exec::testing::ScriptedRunner;
    use super::*;
    use crate::driver::keys::{encode_key, key_to_hex};
    use crate::driver::{InterfaceOptions, PeerOptions, WireguardOptions};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn key(byte: u8) -> String {
        encode_key(&[byte; 32])
    }

    /// Answers `get` with `state` and `set` with success, recording every request
    fn serve(listener: UnixListener, state: String, requests: Arc<StdMutex<Vec<String>>>) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut request = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap() == 0 || line == "\n" {
                        break;
                    }
                    request.push_str(&line);
                }
                let reply = if request.starts_with("get=1") {
                    format!("{}errno=0\n\n", state)
                } else {
                    "errno=0\n\n".to_string()
                };
                requests.lock().unwrap().push(request);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
    }

    fn state() -> String {
        format!(
            "private_key={}\nlisten_port=51820\npublic_key={}\nallowed_ip=10.0.1.0/24\nrx_bytes=42\ntx_bytes=7\nprotocol_version=1\n",
            key_to_hex(&key(1)).unwrap(),
            key_to_hex(&key(2)).unwrap()
        )
    }

    const IFCONFIG: &str = "utun7: flags=8051<UP,POINTOPOINT,RUNNING,MULTICAST> mtu 1420\n\tinet 10.0.0.1 --> 10.0.0.1 netmask 0xffffff00\n";

    fn fixture() -> (TempDir, Arc<ScriptedRunner>, Arc<StdMutex<Vec<String>>>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("wg7.name"), "utun7\n").unwrap();
        let listener = UnixListener::bind(dir.path().join("utun7.sock")).unwrap();
        let requests = Arc::new(StdMutex::new(Vec::new()));
        serve(listener, state(), requests.clone());

        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("ifconfig utun7", IFCONFIG).ok(
            "netstat -rn -f inet",
            "Destination Gateway Flags Netif Expire\n10.0.1/24 utun7 USc utun7\n",
        );
        (dir, runner, requests)
    }

    #[test]
    fn test_url() {
        let connector = UserspaceConnector::new("darwin://?binary=/opt/wg/wireguard-go").unwrap();
        assert_eq!(connector.binary, "/opt/wg/wireguard-go");
        assert_eq!(UserspaceConnector::new("darwin://").unwrap().binary, DEFAULT_BINARY);
        assert!(UserspaceConnector::new("darwin://host").is_err());
        assert!(UserspaceConnector::new("exec://").is_err());
    }

    #[tokio::test]
    async fn test_device_reads_uapi_and_link() {
        let (dir, runner, _) = fixture();
        let connector = UserspaceConnector::with_parts("wireguard-go", dir.path(), runner);

        let device = connector.device("wg7").await.unwrap();
        assert_eq!(device.interface.name, "wg7");
        assert_eq!(device.interface.addresses, vec!["10.0.0.1/24"]);
        assert_eq!(device.wireguard.listen_port, 51820);
        assert_eq!(device.wireguard.peers[0].stats.receive_bytes, 42);

        assert!(connector.status("wg7").await.unwrap());
        assert!(!connector.status("wg8").await.unwrap());
        assert!(connector.device("wg8").await.unwrap_err().is_not_found());
        let stats = connector.peer_stats("wg7", &key(2)).await.unwrap().unwrap();
        assert_eq!(stats.transmit_bytes, 7);
    }

    #[tokio::test]
    async fn test_up_converges_running_interface() {
        let (dir, runner, requests) = fixture();
        let connector = UserspaceConnector::with_parts("wireguard-go", dir.path(), runner.clone());

        let options = ConfigureOptions {
            interface: InterfaceOptions {
                name: "wg7".to_string(),
                address: "10.0.0.1/24".to_string(),
                mtu: 1420,
                ..Default::default()
            },
            wireguard: WireguardOptions {
                private_key: key(1),
                listen_port: Some(51820),
                firewall_mark: Some(9),
                peers: vec![
                    PeerOptions {
                        public_key: key(2),
                        allowed_ips: vec!["10.0.1.0/24".to_string()],
                        ..Default::default()
                    },
                    PeerOptions {
                        public_key: key(3),
                        endpoint: Some("203.0.113.10:51820".to_string()),
                        allowed_ips: vec!["10.0.2.0/24".to_string()],
                        persistent_keepalive: 25,
                        ..Default::default()
                    },
                ],
            },
        };
        connector.up(&options).await.unwrap();

        let requests = requests.lock().unwrap().clone();
        let set = requests.iter().find(|r| r.starts_with("set=1")).unwrap();
        assert!(set.contains(&format!("public_key={}\n", key_to_hex(&key(3)).unwrap())));
        assert!(set.contains("endpoint=203.0.113.10:51820\n"));
        assert!(set.contains("allowed_ip=10.0.2.0/24\n"));
        assert!(!set.contains("fwmark"));
        assert!(!set.contains("private_key"));

        assert!(runner.called("route -n -q add -inet -net 10.0.2.0/24 -interface utun7"));
        assert!(!runner.called_with_prefix("ifconfig utun7 mtu"));
        assert!(!runner.called_with_prefix("route -n -q delete"));

        // Adopted interfaces are not stopped by down()
        connector.down("wg7").await.unwrap();
        assert!(dir.path().join("utun7.sock").exists());
    }

    #[tokio::test]
    async fn test_empty_private_key_keeps_daemon_key() {
        let (dir, runner, requests) = fixture();
        let connector = UserspaceConnector::with_parts("wireguard-go", dir.path(), runner.clone());

        let options = ConfigureOptions {
            interface: InterfaceOptions {
                name: "wg7".to_string(),
                address: "10.0.0.1/24".to_string(),
                mtu: 1420,
                ..Default::default()
            },
            wireguard: WireguardOptions {
                private_key: String::new(),
                listen_port: Some(51820),
                firewall_mark: None,
                peers: vec![PeerOptions {
                    public_key: key(2),
                    allowed_ips: vec!["10.0.1.0/24".to_string()],
                    ..Default::default()
                }],
            },
        };
        connector.up(&options).await.unwrap();
        let device = connector.up(&options).await.unwrap();
        assert_eq!(device.wireguard.private_key, key(1));

        let requests = requests.lock().unwrap().clone();
        assert!(requests.iter().all(|r| r.starts_with("get=1")));
        assert!(!runner.called_with_prefix("route -n -q add"));
    }

    #[tokio::test]
    async fn test_foreign_servers() {
        let (dir, runner, _) = fixture();
        let connector = UserspaceConnector::with_parts("wireguard-go", dir.path(), runner);

        let servers = connector.find_foreign_servers(&[]).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "wg7");
        assert_eq!(servers[0].interface.state, LinkState::Up);

        let servers = connector.find_foreign_servers(&["wg7".to_string()]).await.unwrap();
        assert!(servers.is_empty());
        connector.close().await.unwrap();
    }
}
