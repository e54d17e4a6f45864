//! wg-quick configuration documents
//!
//! ```text
//! [Interface]
//! # office uplink
//! Address = 10.0.0.1/24
//! PrivateKey = ...
//! ListenPort = 51820
//!
//! [Peer]
//! PublicKey = ...
//! AllowedIPs = 10.0.0.2/32, fd00::2/128
//! ```

use std::fmt::Write as _;
use std::time::Duration;

use crate::driver::keys::public_key_from_private;
use crate::driver::{
    ConfigureOptions, Device, HookOptions, InterfaceOptions, Peer, PeerOptions, WireguardOptions,
};
use crate::error::{WgctlError, WgctlResult};
use crate::validation::normalize_cidr;

use super::{parse_config_int, split_csv};

/// A parsed configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    pub device: Device,
    pub dns: Vec<String>,
    pub hooks: Vec<HookOptions>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Clone, Copy)]
enum HookStage {
    PreUp,
    PostUp,
    PreDown,
    PostDown,
}

impl HookStage {
    const ALL: [HookStage; 4] = [HookStage::PreUp, HookStage::PostUp, HookStage::PreDown, HookStage::PostDown];

    fn key(self) -> &'static str {
        match self {
            HookStage::PreUp => "PreUp",
            HookStage::PostUp => "PostUp",
            HookStage::PreDown => "PreDown",
            HookStage::PostDown => "PostDown",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        HookStage::ALL
            .into_iter()
            .find(|stage| stage.key().eq_ignore_ascii_case(key))
    }

    fn enabled(self, hook: &HookOptions) -> bool {
        match self {
            HookStage::PreUp => hook.run_on_pre_up,
            HookStage::PostUp => hook.run_on_post_up,
            HookStage::PreDown => hook.run_on_pre_down,
            HookStage::PostDown => hook.run_on_post_down,
        }
    }

    fn enable(self, hook: &mut HookOptions) {
        match self {
            HookStage::PreUp => hook.run_on_pre_up = true,
            HookStage::PostUp => hook.run_on_post_up = true,
            HookStage::PreDown => hook.run_on_pre_down = true,
            HookStage::PostDown => hook.run_on_post_down = true,
        }
    }
}

/// Parse a wg-quick document for interface `name`
pub fn parse_config(name: &str, content: &str) -> WgctlResult<ConfigDocument> {
    let mut doc = ConfigDocument {
        device: Device::named(name),
        ..Default::default()
    };
    let mut section = Section::None;
    let mut interface_has_keys = false;

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            if section == Section::Interface && !interface_has_keys && doc.device.interface.description.is_empty() {
                doc.device.interface.description = comment.trim().to_string();
            }
            continue;
        }

        let stripped = match line.find('#') {
            Some(idx) => line[..idx].trim(),
            None => line,
        };
        if stripped.is_empty() {
            continue;
        }

        if stripped.eq_ignore_ascii_case("[interface]") {
            section = Section::Interface;
            continue;
        }
        if stripped.eq_ignore_ascii_case("[peer]") {
            section = Section::Peer;
            doc.device.wireguard.peers.push(Peer::default());
            continue;
        }

        let Some((key, value)) = stripped.split_once('=') else {
            continue;
        };
        let key = key.trim();
        // Hook commands go to the shell verbatim, `#` included
        let value = match (HookStage::from_key(key), line.split_once('=')) {
            (Some(_), Some((_, full))) => full.trim(),
            _ => value.trim(),
        };

        match section {
            Section::Interface => {
                interface_has_keys = true;
                parse_interface_key(&mut doc, key, value)?;
            }
            Section::Peer => {
                if let Some(peer) = doc.device.wireguard.peers.last_mut() {
                    parse_peer_key(peer, key, value)?;
                }
            }
            Section::None => {}
        }
    }

    if !doc.device.wireguard.private_key.is_empty() {
        doc.device.wireguard.public_key = public_key_from_private(&doc.device.wireguard.private_key)
            .map_err(|e| WgctlError::Parse(format!("invalid private key in config: {}", e)))?;
    }

    Ok(doc)
}

fn parse_interface_key(doc: &mut ConfigDocument, key: &str, value: &str) -> WgctlResult<()> {
    let device = &mut doc.device;
    match key.to_ascii_lowercase().as_str() {
        "address" => {
            let addresses = split_csv(value);
            for address in &addresses {
                normalize_cidr(address)
                    .map_err(|_| WgctlError::Parse(format!("invalid interface address {:?}", address)))?;
            }
            device.interface.addresses = addresses;
        }
        "privatekey" => device.wireguard.private_key = value.to_string(),
        "listenport" => {
            device.wireguard.listen_port = parse_bounded(value, "listen port")?;
        }
        "fwmark" => {
            device.wireguard.firewall_mark = parse_bounded(value, "fwmark")?;
        }
        "mtu" => {
            device.interface.mtu = parse_bounded(value, "mtu")?;
        }
        "dns" => doc.dns = split_csv(value),
        other => {
            if let Some(stage) = HookStage::from_key(other) {
                add_hook(&mut doc.hooks, stage, value);
            }
        }
    }
    Ok(())
}

fn parse_peer_key(peer: &mut Peer, key: &str, value: &str) -> WgctlResult<()> {
    match key.to_ascii_lowercase().as_str() {
        "publickey" => peer.public_key = value.to_string(),
        "presharedkey" => peer.preshared_key = Some(value.to_string()).filter(|v| !v.is_empty()),
        "endpoint" => peer.endpoint = Some(value.to_string()).filter(|v| !v.is_empty()),
        "allowedips" => {
            let allowed_ips = split_csv(value);
            for allowed_ip in &allowed_ips {
                normalize_cidr(allowed_ip)
                    .map_err(|_| WgctlError::Parse(format!("invalid peer allowed ip {:?}", allowed_ip)))?;
            }
            peer.allowed_ips = allowed_ips;
        }
        "persistentkeepalive" => {
            let seconds: u16 = parse_bounded(value, "persistent keepalive")?;
            peer.persistent_keepalive = Duration::from_secs(seconds as u64);
        }
        _ => {}
    }
    Ok(())
}

fn parse_bounded<T: TryFrom<u64>>(value: &str, what: &str) -> WgctlResult<T> {
    let parsed = parse_config_int(value)
        .map_err(|e| WgctlError::Parse(format!("invalid {} {:?}: {}", what, value, e)))?;
    T::try_from(parsed).map_err(|_| WgctlError::Parse(format!("{} {:?} out of range", what, value)))
}

/// Merge hook lines sharing a command into one hook with several stages
fn add_hook(hooks: &mut Vec<HookOptions>, stage: HookStage, command: &str) {
    if command.is_empty() {
        return;
    }
    match hooks.iter_mut().find(|h| h.command == command) {
        Some(hook) => stage.enable(hook),
        None => {
            let mut hook = HookOptions {
                command: command.to_string(),
                ..Default::default()
            };
            stage.enable(&mut hook);
            hooks.push(hook);
        }
    }
}

/// Render a document for `options`; zero-valued settings are left out
pub fn render_config(options: &ConfigureOptions) -> String {
    let iface = &options.interface;
    let wg = &options.wireguard;
    let mut out = String::new();

    out.push_str("[Interface]\n");
    if !iface.description.is_empty() {
        let _ = writeln!(out, "# {}", iface.description.replace(['\r', '\n'], " "));
    }
    let _ = writeln!(out, "Address = {}", iface.address);
    let _ = writeln!(out, "PrivateKey = {}", wg.private_key);
    if let Some(port) = wg.listen_port.filter(|p| *p > 0) {
        let _ = writeln!(out, "ListenPort = {}", port);
    }
    if let Some(mark) = wg.firewall_mark.filter(|m| *m > 0) {
        let _ = writeln!(out, "FwMark = {}", mark);
    }
    if iface.mtu > 0 {
        let _ = writeln!(out, "MTU = {}", iface.mtu);
    }
    if !iface.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", iface.dns.join(", "));
    }
    for stage in HookStage::ALL {
        for hook in iface.hooks.iter().filter(|h| stage.enabled(h)) {
            let _ = writeln!(out, "{} = {}", stage.key(), hook.command);
        }
    }

    for peer in &wg.peers {
        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(psk) = peer.preshared_key() {
            let _ = writeln!(out, "PresharedKey = {}", psk);
        }
        if let Some(endpoint) = peer.endpoint() {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
        }
        if peer.persistent_keepalive > 0 {
            let _ = writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive);
        }
    }

    out
}

impl ConfigDocument {
    /// Desired configuration equivalent to this document
    ///
    /// Only the first `Address` entry is carried over.
    pub fn to_options(&self) -> ConfigureOptions {
        let device = &self.device;
        ConfigureOptions {
            interface: InterfaceOptions {
                name: device.interface.name.clone(),
                description: device.interface.description.clone(),
                address: device.interface.addresses.first().cloned().unwrap_or_default(),
                dns: self.dns.clone(),
                mtu: device.interface.mtu,
                hooks: self.hooks.clone(),
            },
            wireguard: WireguardOptions {
                private_key: device.wireguard.private_key.clone(),
                listen_port: Some(device.wireguard.listen_port).filter(|p| *p > 0),
                firewall_mark: Some(device.wireguard.firewall_mark).filter(|m| *m > 0),
                peers: device.wireguard.peers.iter().map(PeerOptions::from).collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::keys::encode_key;

    fn key(byte: u8) -> String {
        encode_key(&[byte; 32])
    }

    fn options() -> ConfigureOptions {
        ConfigureOptions {
            interface: InterfaceOptions {
                name: "wg0".to_string(),
                description: "office uplink".to_string(),
                address: "10.0.0.1/24".to_string(),
                dns: vec!["1.1.1.1".to_string()],
                mtu: 1420,
                hooks: vec![HookOptions {
                    command: "iptables -A FORWARD -i %i -j ACCEPT".to_string(),
                    run_on_post_up: true,
                    run_on_pre_down: true,
                    ..Default::default()
                }],
            },
            wireguard: WireguardOptions {
                private_key: key(1),
                listen_port: Some(51820),
                firewall_mark: Some(42),
                peers: vec![
                    PeerOptions {
                        public_key: key(3),
                        endpoint: Some("203.0.113.10:51820".to_string()),
                        allowed_ips: vec!["10.0.0.3/32".to_string()],
                        preshared_key: Some(key(9)),
                        persistent_keepalive: 25,
                    },
                    PeerOptions {
                        public_key: key(2),
                        endpoint: None,
                        allowed_ips: vec!["10.0.0.2/32".to_string(), "fd00::2/128".to_string()],
                        preshared_key: None,
                        persistent_keepalive: 0,
                    },
                ],
            },
        }
    }

    #[test]
    fn test_render_layout() {
        let rendered = render_config(&options());
        assert!(rendered.starts_with("[Interface]\n# office uplink\nAddress = 10.0.0.1/24\n"));
        assert!(rendered.contains("ListenPort = 51820\n"));
        assert!(rendered.contains("FwMark = 42\n"));
        assert!(rendered.contains("MTU = 1420\n"));
        assert!(rendered.contains("DNS = 1.1.1.1\n"));
        assert!(rendered.contains("PostUp = iptables -A FORWARD -i %i -j ACCEPT\n"));
        assert!(rendered.contains("PreDown = iptables -A FORWARD -i %i -j ACCEPT\n"));
        assert!(rendered.contains("AllowedIPs = 10.0.0.2/32, fd00::2/128\n"));
        assert!(rendered.contains("PersistentKeepalive = 25\n"));

        // Peers are written in desired order
        let first = rendered.find(&key(3)).unwrap();
        let second = rendered.find(&key(2)).unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_render_omits_zero_values() {
        let mut opts = options();
        opts.wireguard.firewall_mark = Some(0);
        opts.wireguard.listen_port = None;
        opts.interface.mtu = 0;
        opts.interface.description.clear();
        let rendered = render_config(&opts);
        assert!(!rendered.contains("FwMark"));
        assert!(!rendered.contains("ListenPort"));
        assert!(!rendered.contains("MTU"));
        assert!(!rendered.contains('#'));
    }

    #[test]
    fn test_round_trip_options() {
        let opts = options();
        let parsed = parse_config("wg0", &render_config(&opts)).unwrap();
        assert_eq!(parsed.to_options(), opts);
    }

    #[test]
    fn test_round_trip_document() {
        let doc = render_config(&options());
        let reparsed = parse_config("wg0", &doc).unwrap();
        assert_eq!(render_config(&reparsed.to_options()), doc);
    }

    #[test]
    fn test_parse_hex_fwmark() {
        let content = format!("[Interface]\nPrivateKey = {}\nFwMark = 0x2a\n", key(1));
        let doc = parse_config("wg0", &content).unwrap();
        assert_eq!(doc.device.wireguard.firewall_mark, 42);

        let content = "[Interface]\nFwMark = off\n";
        assert_eq!(parse_config("wg0", content).unwrap().device.wireguard.firewall_mark, 0);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_strips_comments() {
        let content = format!(
            "[INTERFACE]\n# my server\naddress = 10.9.0.1/24 # inline\nprivatekey = {}\nlistenport = 51000\n\n[peer]\npublickey = {}\nallowedips = 10.9.0.2/32\npersistentkeepalive = off\n",
            key(1),
            key(2)
        );
        let doc = parse_config("wg9", &content).unwrap();
        assert_eq!(doc.device.interface.description, "my server");
        assert_eq!(doc.device.interface.addresses, vec!["10.9.0.1/24"]);
        assert_eq!(doc.device.wireguard.listen_port, 51000);
        assert_eq!(doc.device.wireguard.peers.len(), 1);
        assert_eq!(doc.device.wireguard.peers[0].persistent_keepalive, Duration::ZERO);
        assert_eq!(
            doc.device.wireguard.public_key,
            public_key_from_private(&key(1)).unwrap()
        );
    }

    #[test]
    fn test_comment_after_keys_is_not_description() {
        let content = "[Interface]\nAddress = 10.0.0.1/24\n# not a description\n";
        let doc = parse_config("wg0", content).unwrap();
        assert!(doc.device.interface.description.is_empty());
    }

    #[test]
    fn test_hooks_are_merged_by_command() {
        let content = "[Interface]\nPostUp = echo up\nPostDown = echo up\nPreUp = echo pre\n";
        let doc = parse_config("wg0", content).unwrap();
        assert_eq!(doc.hooks.len(), 2);
        assert!(doc.hooks[0].run_on_post_up && doc.hooks[0].run_on_post_down);
        assert!(doc.hooks[1].run_on_pre_up);
    }

    #[test]
    fn test_hook_commands_keep_hash() {
        let mut opts = options();
        opts.interface.hooks = vec![HookOptions {
            command: "iptables -A INPUT -i %i -m comment --comment \"#wg\" -j ACCEPT".to_string(),
            run_on_post_up: true,
            ..Default::default()
        }];

        let parsed = parse_config("wg0", &render_config(&opts)).unwrap();
        assert_eq!(parsed.hooks.len(), 1);
        assert_eq!(parsed.hooks[0].command, opts.interface.hooks[0].command);
        assert_eq!(parsed.to_options(), opts);

        // Other keys still drop trailing comments
        let content = "[Interface]\nPostUp = echo a # b\nMTU = 1400 # jumbo off\n";
        let doc = parse_config("wg0", content).unwrap();
        assert_eq!(doc.hooks[0].command, "echo a # b");
        assert_eq!(doc.device.interface.mtu, 1400);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(parse_config("wg0", "[Interface]\nAddress = nope\n").is_err());
        assert!(parse_config("wg0", "[Interface]\nListenPort = 70000\n").is_err());
        assert!(parse_config("wg0", "[Peer]\nAllowedIPs = 10.0.0.0/33\n").is_err());
        assert!(parse_config("wg0", "[Interface]\nPrivateKey = short\n").is_err());
    }
}
