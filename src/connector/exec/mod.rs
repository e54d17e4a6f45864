//! `wg` / `wg-quick` driven connector
//!
//! Configuration lives in `<dir>/<name>.conf` and is the source of truth:
//! `up()` always rewrites it, then either brings the interface up with
//! `wg-quick up` or converges it in place with `wg syncconf` plus address,
//! MTU and route fixes through the platform's network tool. When the live
//! path fails the interface is restarted from the file.
//!
//! URL form: `exec:///etc/wireguard?sudo=true`

pub mod command;
pub mod darwin;
pub mod linux;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use self::command::{failure_text, CommandRunner, ProcessRunner};
use super::expect_kind;
use crate::codec::dump::parse_dump;
use crate::codec::wgquick::{parse_config, render_config, ConfigDocument};
use crate::driver::{
    BackendKind, BackendUrl, ConfigureOptions, Device, Driver, ForeignServer, InterfaceStats,
    LinkState, PeerStats,
};
use crate::error::{WgctlError, WgctlResult};
use crate::reconcile::{
    desired_routes, diff_routes, plan_addresses, plan_mtu, AddressEntry, RouteEntry,
};
use crate::validation::{normalize_cidr, validate_interface_name};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

/// Live link view reported by a platform tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDetails {
    /// Kernel name, `utunN` on macOS
    pub name: String,
    pub addresses: Vec<AddressEntry>,
    pub mtu: u32,
    pub up: bool,
}

impl LinkDetails {
    /// Addresses worth reporting, link-local ones left out
    pub fn reported_addresses(&self) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|entry| !entry.link_scope)
            .map(|entry| entry.address.clone())
            .collect()
    }
}

/// Platform specific link, address and route operations
///
/// Every method takes the WireGuard interface name as `wg` knows it.
#[async_trait]
pub trait NetworkTool: Send + Sync {
    /// `None` when the interface does not exist
    async fn link(&self, name: &str) -> WgctlResult<Option<LinkDetails>>;

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>>;

    async fn routes(&self, name: &str) -> WgctlResult<Vec<RouteEntry>>;

    async fn add_address(&self, name: &str, address: &str) -> WgctlResult<()>;

    async fn remove_address(&self, name: &str, address: &str) -> WgctlResult<()>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> WgctlResult<()>;

    /// Add the route or rewrite its attributes
    async fn replace_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()>;

    async fn remove_route(&self, name: &str, route: &RouteEntry) -> WgctlResult<()>;

    /// Map a name printed by `wg show interfaces` back to the configured one
    async fn logical_name(&self, reported: &str) -> WgctlResult<String> {
        Ok(reported.to_string())
    }
}

fn is_missing_interface(error: &WgctlError) -> bool {
    failure_text(error)
        .map(|text| {
            text.contains("no such device")
                || text.contains("unable to access interface")
                || text.contains("does not exist")
                || text.contains("is not a wireguard interface")
        })
        .unwrap_or(false)
}

fn is_missing_file(error: &WgctlError) -> bool {
    match error {
        WgctlError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        other => failure_text(other)
            .map(|text| text.contains("no such file or directory"))
            .unwrap_or(false),
    }
}

pub struct ExecConnector {
    config_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    tool: Arc<dyn NetworkTool>,
}

impl ExecConnector {
    pub fn new(raw_url: &str) -> WgctlResult<Self> {
        let url = BackendUrl::parse(raw_url)?;
        expect_kind(&url, BackendKind::Exec)?;
        let config_dir = config_dir_from_url(&url)?;
        let sudo = url.bool_option("sudo", false)?;

        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(sudo));
        let tool: Arc<dyn NetworkTool> = if cfg!(target_os = "macos") {
            Arc::new(darwin::DarwinTool::new(runner.clone()))
        } else {
            Arc::new(linux::IpTool::new(runner.clone()))
        };

        info!(
            "Exec connector using {} (sudo: {})",
            config_dir.display(),
            sudo
        );
        Ok(Self::with_parts(config_dir, runner, tool))
    }

    /// Build from explicit parts; used with recording runners in tests
    pub fn with_parts(
        config_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        tool: Arc<dyn NetworkTool>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            runner,
            tool,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", name))
    }

    async fn wg(&self, args: &[&str]) -> WgctlResult<String> {
        self.runner.run("wg", args).await
    }

    async fn wg_quick(&self, action: &str, target: &str) -> WgctlResult<String> {
        self.runner.run("wg-quick", &[action, target]).await
    }

    /// `wg show <name> dump`, `None` when the interface is not there
    async fn dump(&self, name: &str) -> WgctlResult<Option<Device>> {
        match self.wg(&["show", name, "dump"]).await {
            Ok(output) => parse_dump(name, &output).map(Some),
            Err(e) if is_missing_interface(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_config(&self, name: &str) -> WgctlResult<Option<ConfigDocument>> {
        let path = self.config_path(name);
        match self.read_file(&path).await {
            Ok(content) => parse_config(name, &content).map(Some),
            Err(e) if is_missing_file(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, path: &Path) -> WgctlResult<String> {
        if self.runner.elevated() {
            let path = path.to_string_lossy();
            return self.runner.run("cat", &[path.as_ref()]).await;
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn list_config_files(&self) -> WgctlResult<Vec<PathBuf>> {
        let mut files = Vec::new();

        if self.runner.elevated() {
            let dir = self.config_dir.to_string_lossy();
            let output = match self
                .runner
                .run(
                    "find",
                    &[dir.as_ref(), "-maxdepth", "1", "-type", "f", "-name", "*.conf", "-print"],
                )
                .await
            {
                Ok(output) => output,
                Err(e) if is_missing_file(&e) => return Ok(files),
                Err(e) => return Err(e),
            };
            files.extend(
                output
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(PathBuf::from),
            );
        } else {
            let mut entries = match tokio::fs::read_dir(&self.config_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_file()
                    && path.extension().map(|ext| ext == "conf").unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Replace `<dir>/<name>.conf` without ever exposing a partial file
    async fn write_config(&self, name: &str, content: &str) -> WgctlResult<PathBuf> {
        let path = self.config_path(name);

        if self.runner.elevated() {
            let temp = std::env::temp_dir().join(format!("wgctl-{}.conf", uuid::Uuid::new_v4()));
            write_private(&temp, content).await?;
            let result = self.install_config(&temp, &path).await;
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                debug!("Failed to remove {}: {}", temp.display(), e);
            }
            result?;
        } else {
            tokio::fs::create_dir_all(&self.config_dir).await?;
            let temp = self
                .config_dir
                .join(format!(".{}-{}.conf.tmp", name, uuid::Uuid::new_v4()));
            if let Err(e) = write_private(&temp, content).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
            if let Err(e) = tokio::fs::rename(&temp, &path).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }
        }

        debug!("Wrote {}", path.display());
        Ok(path)
    }

    async fn install_config(&self, temp: &Path, path: &Path) -> WgctlResult<()> {
        let dir = self.config_dir.to_string_lossy();
        self.runner
            .run("install", &["-d", "-m", "0755", dir.as_ref()])
            .await?;
        let temp = temp.to_string_lossy();
        let path = path.to_string_lossy();
        self.runner
            .run("install", &["-m", "0600", temp.as_ref(), path.as_ref()])
            .await?;
        Ok(())
    }

    /// Apply a rewritten config to a running interface without dropping it
    async fn sync_live(&self, options: &ConfigureOptions, path: &Path) -> WgctlResult<()> {
        let name = options.name();
        let path = path.to_string_lossy();

        let stripped = self.wg_quick("strip", &path).await?;
        self.runner
            .run_with_input("wg", &["syncconf", name, "/dev/stdin"], &stripped)
            .await?;

        let link = self
            .tool
            .link(name)
            .await?
            .ok_or_else(|| WgctlError::NotFound(format!("interface {}", name)))?;

        let addresses = plan_addresses(&link.addresses, &options.interface.address)?;
        for address in &addresses.remove {
            info!("Removing address {} from {}", address, name);
            self.tool.remove_address(name, address).await?;
        }
        if let Some(address) = &addresses.add {
            info!("Adding address {} to {}", address, name);
            self.tool.add_address(name, address).await?;
        }

        if let Some(mtu) = plan_mtu(link.mtu, options.interface.mtu) {
            info!("Setting MTU of {} to {}", name, mtu);
            self.tool.set_mtu(name, mtu).await?;
        }

        let desired = desired_routes(&options.wireguard.peers)?;
        let preserve = vec![normalize_cidr(&options.interface.address)?];
        let existing = self.tool.routes(name).await?;
        let plan = diff_routes(&existing, &desired, &preserve);
        if !plan.is_empty() {
            info!(
                "Reconciling routes on {}: {} to add, {} to update, {} to remove",
                name,
                plan.add.len(),
                plan.update.len(),
                plan.remove.len()
            );
        }
        for route in plan.add.iter().chain(plan.update.iter()) {
            self.tool.replace_route(name, route).await?;
        }
        for route in &plan.remove {
            self.tool.remove_route(name, route).await?;
        }

        Ok(())
    }

    async fn quick_down(&self, name: &str, path: &Path) -> WgctlResult<()> {
        let target = path.to_string_lossy();
        match self.wg_quick("down", &target).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("wg-quick down {} failed, retrying by name: {}", target, e);
                self.wg_quick("down", name).await.map(|_| ()).map_err(|_| e)
            }
        }
    }

    async fn live_device(&self, name: &str) -> WgctlResult<Option<(Device, bool)>> {
        let Some(mut device) = self.dump(name).await? else {
            return Ok(None);
        };
        let link = self.tool.link(name).await?;
        device.interface.name = name.to_string();
        let up = match &link {
            Some(link) => {
                device.interface.addresses = link.reported_addresses();
                device.interface.mtu = link.mtu;
                link.up
            }
            None => true,
        };
        Ok(Some((device, up)))
    }
}

fn config_dir_from_url(url: &BackendUrl) -> WgctlResult<PathBuf> {
    if url.has_authority() {
        return Err(WgctlError::Validation(
            "exec backend does not support remote host/user/port in url".to_string(),
        ));
    }
    let path = url.path.trim();
    if path.is_empty() || path == "/" {
        return Ok(PathBuf::from(DEFAULT_CONFIG_DIR));
    }
    let dir = PathBuf::from(path.trim_end_matches('/'));
    if !dir.is_absolute() {
        return Err(WgctlError::Validation(format!(
            "exec backend path must be absolute: {:?}",
            path
        )));
    }
    Ok(dir)
}

async fn write_private(path: &Path, content: &str) -> WgctlResult<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl Driver for ExecConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Exec
    }

    async fn device(&self, name: &str) -> WgctlResult<Device> {
        validate_interface_name(name)?;
        if let Some((mut device, _)) = self.live_device(name).await? {
            if let Ok(Some(doc)) = self.read_config(name).await {
                device.interface.description = doc.device.interface.description;
            }
            return Ok(device);
        }

        match self.read_config(name).await? {
            Some(doc) => {
                debug!("Interface {} is down, reporting its config file", name);
                Ok(doc.device)
            }
            None => Err(WgctlError::NotFound(format!("wireguard interface {}", name))),
        }
    }

    async fn up(&self, options: &ConfigureOptions) -> WgctlResult<Device> {
        let options = options.validated()?;
        let name = options.name();

        let live = self.dump(name).await?;
        let current_key = match &live {
            Some(device) => Some(device.wireguard.private_key.clone()),
            None => match self.read_config(name).await {
                Ok(doc) => doc.map(|doc| doc.device.wireguard.private_key),
                Err(e) => {
                    warn!("Ignoring unreadable config for {}: {}", name, e);
                    None
                }
            },
        };
        let options = options.clone().with_private_key(current_key.as_deref());
        let path = self.write_config(name, &render_config(&options)).await?;

        if live.is_none() {
            info!("Bringing up {}", name);
            self.wg_quick("up", &path.to_string_lossy()).await?;
        } else if let Err(e) = self.sync_live(&options, &path).await {
            warn!(
                "live reconfiguration of {} failed, restarting interface: {}",
                name, e
            );
            if let Err(down_err) = self.quick_down(name, &path).await {
                warn!("Failed to stop {} during restart: {}", name, down_err);
            }
            self.wg_quick("up", &path.to_string_lossy()).await?;
        }

        self.device(name).await
    }

    async fn down(&self, name: &str) -> WgctlResult<()> {
        validate_interface_name(name)?;
        if self.dump(name).await?.is_none() {
            debug!("Interface {} is already down", name);
            return Ok(());
        }
        info!("Bringing down {}", name);
        self.quick_down(name, &self.config_path(name)).await
    }

    async fn status(&self, name: &str) -> WgctlResult<bool> {
        validate_interface_name(name)?;
        Ok(self.live_device(name).await?.map(|(_, up)| up).unwrap_or(false))
    }

    async fn stats(&self, name: &str) -> WgctlResult<Option<InterfaceStats>> {
        validate_interface_name(name)?;
        if self.dump(name).await?.is_none() {
            return Ok(None);
        }
        self.tool.stats(name).await
    }

    async fn peer_stats(&self, name: &str, peer_public_key: &str) -> WgctlResult<Option<PeerStats>> {
        validate_interface_name(name)?;
        Ok(self
            .dump(name)
            .await?
            .and_then(|device| device.peer_stats(peer_public_key)))
    }

    async fn find_foreign_servers(&self, known_interfaces: &[String]) -> WgctlResult<Vec<ForeignServer>> {
        let is_known = |name: &str| known_interfaces.iter().any(|known| known == name);
        let mut servers: Vec<ForeignServer> = Vec::new();

        let listed = self.wg(&["show", "interfaces"]).await?;
        for reported in listed.split_whitespace() {
            let name = self.tool.logical_name(reported).await?;
            if is_known(&name) {
                continue;
            }
            let Some((device, up)) = self.live_device(&name).await? else {
                continue;
            };
            let doc = self.read_config(&name).await.ok().flatten();
            let mut server = ForeignServer::from_device(device, LinkState::from_up(up), "wireguard");
            if let Some(doc) = doc {
                server.description = doc.device.interface.description;
                server.hooks = doc.hooks;
            }
            servers.push(server);
        }

        for path in self.list_config_files().await? {
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_interface_name(name).is_err()
                || is_known(name)
                || servers.iter().any(|server| server.name == name)
            {
                continue;
            }
            let doc = match self.read_file(&path).await.and_then(|content| parse_config(name, &content)) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Skipping foreign config {}: {}", path.display(), e);
                    continue;
                }
            };
            let mut server = ForeignServer::from_device(doc.device, LinkState::Down, "wireguard");
            server.hooks = doc.hooks;
            servers.push(server);
        }

        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn close(&self) -> WgctlResult<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;
    use crate::driver::keys::{encode_key, public_key_from_private};
    use crate::driver::{InterfaceOptions, PeerOptions, WireguardOptions};
    use tempfile::TempDir;

    const NO_DEVICE: &str = "Unable to access interface: No such device";

    fn key(byte: u8) -> String {
        encode_key(&[byte; 32])
    }

    fn options() -> ConfigureOptions {
        ConfigureOptions {
            interface: InterfaceOptions {
                name: "wg0".to_string(),
                description: "office".to_string(),
                address: "10.0.0.1/24".to_string(),
                mtu: 1420,
                ..Default::default()
            },
            wireguard: WireguardOptions {
                private_key: key(1),
                listen_port: Some(51820),
                firewall_mark: None,
                peers: vec![PeerOptions {
                    public_key: key(2),
                    allowed_ips: vec!["10.0.1.0/24".to_string()],
                    ..Default::default()
                }],
            },
        }
    }

    fn dump() -> String {
        format!(
            "{}\t{}\t51820\toff\n{}\t(none)\t(none)\t10.0.1.0/24\t0\t0\t0\toff\n",
            key(1),
            public_key_from_private(&key(1)).unwrap(),
            key(2)
        )
    }

    const LINK_JSON: &str = r#"[{"ifname":"wg0","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],"mtu":1420,"operstate":"UNKNOWN","addr_info":[{"family":"inet","local":"10.0.0.1","prefixlen":24,"scope":"global"}]}]"#;
    const ROUTES_V4: &str = r#"[{"dst":"10.0.0.0/24","protocol":"kernel","scope":"link"},{"dst":"10.0.1.0/24","protocol":"boot","scope":"link"}]"#;

    fn connector(dir: &TempDir, runner: &Arc<ScriptedRunner>) -> ExecConnector {
        let runner: Arc<dyn CommandRunner> = runner.clone();
        let tool: Arc<dyn NetworkTool> = Arc::new(linux::IpTool::new(runner.clone()));
        ExecConnector::with_parts(dir.path(), runner, tool)
    }

    fn path_of(dir: &TempDir, name: &str) -> String {
        dir.path().join(format!("{}.conf", name)).to_string_lossy().into_owned()
    }

    #[test]
    fn test_url_validation() {
        assert_eq!(
            config_dir_from_url(&BackendUrl::parse("exec://").unwrap()).unwrap(),
            PathBuf::from(DEFAULT_CONFIG_DIR)
        );
        assert_eq!(
            config_dir_from_url(&BackendUrl::parse("exec:///srv/wg/").unwrap()).unwrap(),
            PathBuf::from("/srv/wg")
        );
        assert!(ExecConnector::new("exec://host/etc/wireguard").is_err());
        assert!(ExecConnector::new("exec://root@/etc/wireguard").is_err());
        assert!(ExecConnector::new("exec:///etc/wireguard?sudo=maybe").is_err());
        assert!(ExecConnector::new("routeros:///etc/wireguard").is_err());

        let connector = ExecConnector::new("exec:///etc/wireguard?sudo=true").unwrap();
        assert_eq!(connector.config_dir(), Path::new("/etc/wireguard"));
        assert!(connector.runner.elevated());
    }

    #[tokio::test]
    async fn test_up_creates_missing_interface() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .fail("wg show wg0 dump", NO_DEVICE)
            .ok("wg show wg0 dump", &dump())
            .ok("ip -j address show dev wg0", LINK_JSON);

        let device = connector(&dir, &runner).up(&options()).await.unwrap();

        let path = path_of(&dir, "wg0");
        assert!(runner.called(&format!("wg-quick up {}", path)));
        assert!(!runner.called_with_prefix("wg syncconf"));
        assert_eq!(device.wireguard.peers.len(), 1);
        assert_eq!(device.interface.addresses, vec!["10.0.0.1/24"]);
        assert_eq!(device.interface.description, "office");

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("[Interface]\n# office\nAddress = 10.0.0.1/24\n"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_up_converged_interface_only_syncs() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .ok("wg show wg0 dump", &dump())
            .ok(&format!("wg-quick strip {}", path_of(&dir, "wg0")), "[Interface]\n")
            .ok("ip -j address show dev wg0", LINK_JSON)
            .ok("ip -j -4 route show dev wg0", ROUTES_V4)
            .ok("ip -j -6 route show dev wg0", "[]");

        connector(&dir, &runner).up(&options()).await.unwrap();

        assert!(runner.called("wg syncconf wg0 /dev/stdin"));
        assert_eq!(runner.inputs(), vec!["[Interface]\n".to_string()]);
        assert!(!runner.called_with_prefix("wg-quick up"));
        assert!(!runner.called_with_prefix("ip address"));
        assert!(!runner.called_with_prefix("ip link set"));
        assert!(!runner.called_with_prefix("ip -4 route"));
    }

    #[tokio::test]
    async fn test_up_reconciles_drift_in_place() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let drifted_link = r#"[{"ifname":"wg0","flags":["UP"],"mtu":1500,"addr_info":[{"family":"inet","local":"10.9.0.1","prefixlen":24,"scope":"global"}]}]"#;
        let drifted_routes = r#"[{"dst":"10.0.0.0/24","protocol":"kernel","scope":"link"},{"dst":"10.0.7.0/24","protocol":"boot","scope":"link"},{"dst":"10.0.8.0/24","protocol":"static","scope":"link"}]"#;
        runner
            .ok("wg show wg0 dump", &dump())
            .ok("ip -j address show dev wg0", drifted_link)
            .ok("ip -j -4 route show dev wg0", drifted_routes)
            .ok("ip -j -6 route show dev wg0", "[]");

        connector(&dir, &runner).up(&options()).await.unwrap();

        assert!(runner.called("ip address del 10.9.0.1/24 dev wg0"));
        assert!(runner.called("ip address add 10.0.0.1/24 dev wg0"));
        assert!(runner.called("ip link set dev wg0 mtu 1420"));
        assert!(runner.called("ip -4 route replace 10.0.1.0/24 dev wg0 proto boot scope link"));
        assert!(runner.called("ip -4 route del 10.0.7.0/24 dev wg0"));
        // Routes owned by someone else stay
        assert!(!runner.called_with_prefix("ip -4 route del 10.0.8.0/24"));
        assert!(!runner.called_with_prefix("ip -4 route del 10.0.0.0/24"));
    }

    #[tokio::test]
    async fn test_up_restarts_when_live_sync_fails() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let path = path_of(&dir, "wg0");
        runner
            .ok("wg show wg0 dump", &dump())
            .fail("wg syncconf wg0 /dev/stdin", "Line unrecognized")
            .ok("ip -j address show dev wg0", LINK_JSON);

        connector(&dir, &runner).up(&options()).await.unwrap();

        let calls = runner.calls();
        let down = calls.iter().position(|c| *c == format!("wg-quick down {}", path)).unwrap();
        let up = calls.iter().position(|c| *c == format!("wg-quick up {}", path)).unwrap();
        assert!(down < up);
    }

    #[tokio::test]
    async fn test_down() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("wg show wg0 dump", NO_DEVICE);
        connector(&dir, &runner).down("wg0").await.unwrap();
        assert!(!runner.called_with_prefix("wg-quick"));

        let runner = Arc::new(ScriptedRunner::new());
        let path = path_of(&dir, "wg0");
        runner
            .ok("wg show wg0 dump", &dump())
            .fail(&format!("wg-quick down {}", path), "config not found");
        connector(&dir, &runner).down("wg0").await.unwrap();
        assert!(runner.called("wg-quick down wg0"));
    }

    #[tokio::test]
    async fn test_device_falls_back_to_config_file() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("wg show wg0 dump", NO_DEVICE).fail("wg show wg1 dump", NO_DEVICE);
        std::fs::write(dir.path().join("wg0.conf"), render_config(&options())).unwrap();

        let connector = connector(&dir, &runner);
        let device = connector.device("wg0").await.unwrap();
        assert_eq!(device.interface.description, "office");
        assert_eq!(device.wireguard.listen_port, 51820);

        let err = connector.device("wg1").await.unwrap_err();
        assert!(err.is_not_found());

        assert!(!connector.status("wg0").await.unwrap());
        assert!(connector.stats("wg0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_stats() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.ok("wg show wg0 dump", &dump());
        let connector = connector(&dir, &runner);

        assert!(connector.peer_stats("wg0", &key(2)).await.unwrap().is_some());
        assert!(connector.peer_stats("wg0", &key(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_foreign_servers() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .ok("wg show interfaces", "wg0 wg1\n")
            .ok("wg show wg1 dump", &dump())
            .ok("ip -j address show dev wg1", LINK_JSON);

        let mut stopped = options();
        stopped.interface.name = "wg2".to_string();
        stopped.interface.hooks = vec![crate::driver::HookOptions {
            command: "echo up".to_string(),
            run_on_post_up: true,
            ..Default::default()
        }];
        std::fs::write(dir.path().join("wg2.conf"), render_config(&stopped)).unwrap();
        std::fs::write(dir.path().join("wg0.conf"), render_config(&options())).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let servers = connector(&dir, &runner)
            .find_foreign_servers(&["wg0".to_string()])
            .await
            .unwrap();

        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["wg1", "wg2"]);
        assert_eq!(servers[0].interface.state, LinkState::Up);
        assert_eq!(servers[0].kind, "wireguard");
        assert_eq!(servers[1].interface.state, LinkState::Down);
        assert_eq!(servers[1].hooks.len(), 1);
        assert_eq!(servers[1].description, "office");
    }
}
