//! Exec connector behaviour around wg-quick configuration files
//!
//! A fake runner reports every interface as absent, so only the
//! configuration directory drives the results.

use async_trait::async_trait;
use libwgctl::codec::wgquick::render_config;
use libwgctl::connector::exec::command::CommandRunner;
use libwgctl::connector::exec::linux::IpTool;
use libwgctl::connector::exec::ExecConnector;
use libwgctl::driver::keys::encode_key;
use libwgctl::driver::{
    ConfigureOptions, Driver, HookOptions, InterfaceOptions, PeerOptions, WireguardOptions,
};
use libwgctl::error::{WgctlError, WgctlResult};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct AbsentInterfaces {
    calls: Mutex<Vec<String>>,
}

impl AbsentInterfaces {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for AbsentInterfaces {
    async fn run(&self, program: &str, args: &[&str]) -> WgctlResult<String> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        if program == "wg" && args.first() == Some(&"show") && args.len() > 2 {
            return Err(WgctlError::CommandFailed {
                cmd: line,
                code: Some(1),
                output: "Unable to access interface: No such device".to_string(),
            });
        }
        Ok(String::new())
    }

    async fn run_with_input(&self, program: &str, args: &[&str], _input: &str) -> WgctlResult<String> {
        self.run(program, args).await
    }
}

fn connector(dir: &TempDir, runner: &Arc<AbsentInterfaces>) -> ExecConnector {
    let runner: Arc<dyn CommandRunner> = runner.clone();
    ExecConnector::with_parts(dir.path(), runner.clone(), Arc::new(IpTool::new(runner)))
}

fn options() -> ConfigureOptions {
    ConfigureOptions {
        interface: InterfaceOptions {
            name: "wg0".to_string(),
            description: "branch office".to_string(),
            address: "10.20.0.1/24".to_string(),
            dns: vec!["10.20.0.53".to_string()],
            mtu: 1380,
            hooks: vec![HookOptions {
                command: "iptables -A FORWARD -i wg0 -j ACCEPT".to_string(),
                run_on_post_up: true,
                ..Default::default()
            }],
        },
        wireguard: WireguardOptions {
            private_key: encode_key(&[7; 32]),
            listen_port: Some(51821),
            firewall_mark: Some(0x2a),
            peers: vec![PeerOptions {
                public_key: encode_key(&[8; 32]),
                endpoint: Some("198.51.100.7:51820".to_string()),
                allowed_ips: vec!["10.20.0.2/32".to_string()],
                preshared_key: None,
                persistent_keepalive: 15,
            }],
        },
    }
}

#[tokio::test]
async fn test_down_interface_is_read_from_config_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("wg0.conf"), render_config(&options())).unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    let device = connector.device("wg0").await.unwrap();
    assert_eq!(device.interface.description, "branch office");
    assert_eq!(device.interface.mtu, 1380);
    assert_eq!(device.wireguard.listen_port, 51821);
    assert_eq!(device.wireguard.firewall_mark, 42);
    assert_eq!(device.wireguard.peers.len(), 1);
    assert_eq!(
        device.wireguard.peers[0].endpoint.as_deref(),
        Some("198.51.100.7:51820")
    );

    assert!(!connector.status("wg0").await.unwrap());
    assert!(connector.stats("wg0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_interface_and_config() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    let err = connector.device("wg3").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(connector.peer_stats("wg3", &encode_key(&[8; 32])).await.unwrap().is_none());
}

#[tokio::test]
async fn test_down_of_absent_interface_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    connector.down("wg0").await.unwrap();
    assert!(runner.calls().iter().all(|call| !call.starts_with("wg-quick")));
}

#[tokio::test]
async fn test_invalid_names_never_reach_the_runner() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    assert!(connector.device("wg0; rm -rf /").await.is_err());
    assert!(connector.down("../etc/passwd").await.is_err());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_empty_private_key_keeps_config_key() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("wg0.conf"), render_config(&options())).unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    let mut desired = options();
    desired.wireguard.private_key.clear();
    connector.up(&desired).await.unwrap();
    let device = connector.up(&desired).await.unwrap();

    assert_eq!(device.wireguard.private_key, encode_key(&[7; 32]));
    let written = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
    assert!(written.contains(&format!("PrivateKey = {}", encode_key(&[7; 32]))));
}

#[tokio::test]
async fn test_new_interface_gets_generated_key() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(AbsentInterfaces::default());
    let connector = connector(&dir, &runner);

    let mut desired = options();
    desired.wireguard.private_key.clear();
    let first = connector.up(&desired).await.unwrap();
    assert!(!first.wireguard.private_key.is_empty());

    let second = connector.up(&desired).await.unwrap();
    assert_eq!(second.wireguard.private_key, first.wireguard.private_key);
    assert!(runner.calls().iter().any(|call| call.starts_with("wg-quick up")));
}
