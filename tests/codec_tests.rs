//! wg-quick documents and `wg show dump` output feeding the planners

use libwgctl::codec::dump::parse_dump;
use libwgctl::codec::wgquick::{parse_config, render_config};
use libwgctl::driver::keys::{encode_key, public_key_from_private};
use libwgctl::reconcile::{desired_routes, diff_routes, plan_device, RouteEntry};

fn key(byte: u8) -> String {
    encode_key(&[byte; 32])
}

fn document() -> String {
    format!(
        "[Interface]
# Branch office
Address = 10.30.0.1/24
PrivateKey = {}
ListenPort = 51822
FwMark = 0x2a
MTU = 1400
DNS = 10.30.0.53, fd30::53
PostUp = iptables -A FORWARD -i %i -j ACCEPT
PreDown = iptables -D FORWARD -i %i -j ACCEPT

[Peer]
# laptop
PublicKey = {}
PresharedKey = {}
Endpoint = 203.0.113.40:51820
AllowedIPs = 10.30.0.2/32, fd30::2/128
PersistentKeepalive = 25

[Peer]
PublicKey = {}
AllowedIPs = 10.40.0.0/16
",
        key(3),
        key(4),
        key(5),
        key(6)
    )
}

fn live_dump() -> String {
    format!(
        "{}\t{}\t51822\t0x2a\n\
         {}\t{}\t203.0.113.40:51820\t10.30.0.2/32,fd30::2/128\t1700000000\t1024\t2048\t25\n\
         {}\t(none)\t(none)\t10.40.0.0/16\t0\t0\t0\toff\n",
        key(3),
        public_key_from_private(&key(3)).unwrap(),
        key(4),
        key(5),
        key(6)
    )
}

#[test]
fn test_document_to_options() {
    let doc = parse_config("wg0", &document()).unwrap();
    let options = doc.to_options();
    options.validate().unwrap();

    assert_eq!(options.interface.description, "Branch office");
    assert_eq!(options.interface.address, "10.30.0.1/24");
    assert_eq!(options.interface.mtu, 1400);
    assert_eq!(options.interface.dns, vec!["10.30.0.53", "fd30::53"]);
    assert_eq!(options.interface.hooks.len(), 2);
    assert!(options.interface.hooks[0].run_on_post_up);
    assert!(options.interface.hooks[1].run_on_pre_down);
    assert_eq!(options.wireguard.listen_port, Some(51822));
    assert_eq!(options.wireguard.firewall_mark, Some(42));
    assert_eq!(options.wireguard.peers.len(), 2);
    assert_eq!(options.wireguard.peers[0].persistent_keepalive, 25);
    assert_eq!(options.wireguard.peers[0].preshared_key.as_deref(), Some(key(5).as_str()));
    assert!(options.wireguard.peers[1].endpoint.is_none());

    assert_eq!(
        doc.device.wireguard.public_key,
        public_key_from_private(&key(3)).unwrap()
    );
}

#[test]
fn test_rendered_document_parses_back_to_same_options() {
    let options = parse_config("wg0", &document()).unwrap().to_options();
    let rendered = render_config(&options);
    assert!(rendered.contains("FwMark = 42\n"));

    let reparsed = parse_config("wg0", &rendered).unwrap().to_options();
    assert_eq!(reparsed, options);
}

#[test]
fn test_live_state_matching_document_needs_no_writes() {
    let options = parse_config("wg0", &document()).unwrap().to_options();
    let live = parse_dump("wg0", &live_dump()).unwrap();

    assert_eq!(live.wireguard.firewall_mark, 42);
    assert!(plan_device(&live, &options).is_empty());
}

#[test]
fn test_allowed_ip_drift_is_one_targeted_write() {
    let mut options = parse_config("wg0", &document()).unwrap().to_options();
    options.wireguard.peers[1].allowed_ips.push("10.41.0.0/16".to_string());
    let live = parse_dump("wg0", &live_dump()).unwrap();

    let update = plan_device(&live, &options);
    assert!(update.private_key.is_none());
    assert!(update.listen_port.is_none());
    assert!(update.firewall_mark.is_none());
    assert_eq!(update.peers.len(), 1);

    let peer = &update.peers[0];
    assert_eq!(peer.public_key, key(6));
    assert!(peer.update_only);
    assert!(peer.replace_allowed_ips);
    assert!(peer.endpoint.is_none());
    assert!(peer.preshared_key.is_none());
    assert_eq!(peer.allowed_ips.len(), 2);
}

#[test]
fn test_routes_follow_document_peers() {
    let options = parse_config("wg0", &document()).unwrap().to_options();
    let desired = desired_routes(&options.wireguard.peers).unwrap();
    assert_eq!(desired.len(), 3);

    let existing = vec![
        // Subnet route the kernel installed with the address
        RouteEntry {
            destination: "10.30.0.0/24".to_string(),
            scope: 253,
            protocol: 2,
            kind: 1,
        },
        RouteEntry::owned("10.30.0.2/32"),
        RouteEntry::owned("10.99.0.0/16"),
    ];
    let plan = diff_routes(&existing, &desired, &["10.30.0.0/24".to_string()]);

    let added: Vec<&str> = plan.add.iter().map(|r| r.destination.as_str()).collect();
    assert_eq!(added, vec!["10.40.0.0/16", "fd30::2/128"]);
    assert!(plan.update.is_empty());
    assert_eq!(plan.remove, vec![RouteEntry::owned("10.99.0.0/16")]);
}
