//! OS-specific network plumbing behind the `PlatformNet` capability.
//!
//! Everything that shells out — routes, DNS, sysctl, iptables — lives here
//! so the session core never touches the host. Route and DNS failures are
//! warnings; the tunnel still carries traffic without them.

use std::fs;
use std::net::IpAddr;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use log::{debug, warn};

#[cfg(target_os = "linux")]
const RESOLV_CONF: &str = "/etc/resolv.conf";
#[cfg(target_os = "linux")]
const RESOLV_BACKUP: &str = "/etc/resolv.conf.vpnbackup";

pub trait PlatformNet: Send + Sync {
    /// Enable forwarding and masquerade the VPN subnet out the default
    /// interface. Called once when the server's TUN comes up.
    fn setup_server(&self, tun: &str, subnet: &Ipv4Net) -> Result<()>;

    /// Undo `setup_server`'s masquerade rule.
    fn teardown_server(&self, tun: &str, subnet: &Ipv4Net) -> Result<()>;

    /// Point the default route at the TUN (keeping a pinned host route to
    /// the server via the original gateway) and install the VPN DNS.
    fn setup_client(&self, tun: &str, server_host: &str, dns: &[IpAddr]) -> Result<()>;

    /// Restore routes and DNS changed by `setup_client`.
    fn restore_client(&self, tun: &str, server_host: &str) -> Result<()>;
}

/// Runs the real host commands.
pub struct HostNet {
    original_gw: Mutex<Option<String>>,
}

impl HostNet {
    pub fn new() -> Self {
        Self {
            original_gw: Mutex::new(None),
        }
    }
}

impl Default for HostNet {
    fn default() -> Self {
        Self::new()
    }
}

fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {}", program))?;
    if !status.success() {
        bail!("{} {} exited with {}", program, args.join(" "), status);
    }
    Ok(())
}

fn run_quiet(program: &str, args: &[&str]) {
    if let Err(err) = run(program, args) {
        debug!("{}", err);
    }
}

fn run_or_warn(program: &str, args: &[&str]) {
    if let Err(err) = run(program, args) {
        warn!("{}", err);
    }
}

/// Default gateway address, parsed from the routing table.
fn default_gateway() -> Result<String> {
    #[cfg(target_os = "linux")]
    {
        let output = Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .context("failed to run ip route")?;
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            let fields: Vec<&str> = text.split_whitespace().collect();
            for pair in fields.windows(2) {
                if pair[0] == "via" {
                    return Ok(pair[1].to_string());
                }
            }
        }
        bail!("no default gateway found");
    }
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .context("failed to run route")?;
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines() {
                if let Some(rest) = line.trim().strip_prefix("gateway:") {
                    return Ok(rest.trim().to_string());
                }
            }
        }
        bail!("no default gateway found");
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    bail!("unsupported platform");
}

/// Interface the default route leaves through, for the masquerade rule.
#[cfg(target_os = "linux")]
fn default_interface() -> String {
    if let Ok(output) = Command::new("ip").args(["route", "show", "default"]).output() {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            let fields: Vec<&str> = text.split_whitespace().collect();
            for pair in fields.windows(2) {
                if pair[0] == "dev" {
                    return pair[1].to_string();
                }
            }
        }
    }
    "eth0".to_string()
}

/// Nameservers currently configured on the host.
#[cfg(target_os = "linux")]
fn current_dns() -> Vec<String> {
    let mut servers = Vec::new();
    if let Ok(text) = fs::read_to_string(RESOLV_CONF) {
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("nameserver") {
                if let Some(addr) = fields.next() {
                    servers.push(addr.to_string());
                }
            }
        }
    }
    servers
}

#[cfg(target_os = "linux")]
fn setup_dns(dns: &[IpAddr]) -> Result<()> {
    if dns.is_empty() {
        return Ok(());
    }
    debug!("current DNS servers: {:?}", current_dns());
    if let Err(err) = fs::copy(RESOLV_CONF, RESOLV_BACKUP) {
        warn!("failed to back up {}: {}", RESOLV_CONF, err);
    }
    let mut content = String::new();
    for server in dns {
        content.push_str(&format!("nameserver {}\n", server));
    }
    fs::write(RESOLV_CONF, content).context("failed to rewrite resolv.conf")
}

#[cfg(target_os = "linux")]
fn restore_dns() {
    if fs::metadata(RESOLV_BACKUP).is_ok() {
        if let Err(err) = fs::rename(RESOLV_BACKUP, RESOLV_CONF) {
            warn!("failed to restore {}: {}", RESOLV_CONF, err);
        }
    }
}

#[cfg(target_os = "macos")]
fn setup_dns(dns: &[IpAddr]) -> Result<()> {
    if dns.is_empty() {
        return Ok(());
    }
    let servers: Vec<String> = dns.iter().map(|d| d.to_string()).collect();
    for service in network_services() {
        let mut args = vec!["-setdnsservers".to_string(), service];
        args.extend(servers.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_or_warn("networksetup", &args);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn restore_dns() {
    for service in network_services() {
        run_quiet("networksetup", &["-setdnsservers", &service, "Empty"]);
    }
}

#[cfg(target_os = "macos")]
fn network_services() -> Vec<String> {
    let output = match Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
    {
        Ok(out) => out,
        Err(_) => return Vec::new(),
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('*'))
        .map(str::to_string)
        .collect()
}

impl PlatformNet for HostNet {
    #[cfg(target_os = "linux")]
    fn setup_server(&self, _tun: &str, subnet: &Ipv4Net) -> Result<()> {
        run_or_warn("sysctl", &["-w", "net.ipv4.ip_forward=1"]);
        let iface = default_interface();
        run_or_warn(
            "iptables",
            &[
                "-t", "nat", "-A", "POSTROUTING",
                "-s", &subnet.to_string(),
                "-o", &iface,
                "-j", "MASQUERADE",
            ],
        );
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn teardown_server(&self, _tun: &str, subnet: &Ipv4Net) -> Result<()> {
        let iface = default_interface();
        run_quiet(
            "iptables",
            &[
                "-t", "nat", "-D", "POSTROUTING",
                "-s", &subnet.to_string(),
                "-o", &iface,
                "-j", "MASQUERADE",
            ],
        );
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn setup_client(&self, tun: &str, server_host: &str, dns: &[IpAddr]) -> Result<()> {
        let gw = default_gateway().context("cannot discover default gateway")?;
        *self.original_gw.lock().expect("gateway lock") = Some(gw.clone());

        // Pin the server behind the original gateway, then swing the default
        // route onto the TUN via the two half-default routes.
        run_or_warn("ip", &["route", "add", server_host, "via", &gw]);
        run_quiet("ip", &["route", "del", "default"]);
        run_or_warn("ip", &["route", "add", "0.0.0.0/1", "dev", tun]);
        run_or_warn("ip", &["route", "add", "128.0.0.0/1", "dev", tun]);

        if let Err(err) = setup_dns(dns) {
            warn!("failed to set up DNS: {}", err);
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn restore_client(&self, _tun: &str, server_host: &str) -> Result<()> {
        run_quiet("ip", &["route", "del", "0.0.0.0/1"]);
        run_quiet("ip", &["route", "del", "128.0.0.0/1"]);
        run_quiet("ip", &["route", "del", server_host]);
        if let Some(gw) = self.original_gw.lock().expect("gateway lock").take() {
            run_or_warn("ip", &["route", "add", "default", "via", &gw]);
        }
        restore_dns();
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn setup_server(&self, _tun: &str, _subnet: &Ipv4Net) -> Result<()> {
        run_or_warn("sysctl", &["-w", "net.inet.ip.forwarding=1"]);
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn teardown_server(&self, _tun: &str, _subnet: &Ipv4Net) -> Result<()> {
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn setup_client(&self, tun: &str, server_host: &str, dns: &[IpAddr]) -> Result<()> {
        let gw = default_gateway().context("cannot discover default gateway")?;
        *self.original_gw.lock().expect("gateway lock") = Some(gw.clone());

        run_or_warn("route", &["add", "-host", server_host, &gw]);
        run_or_warn("route", &["add", "-net", "0.0.0.0/1", "-interface", tun]);
        run_or_warn("route", &["add", "-net", "128.0.0.0/1", "-interface", tun]);

        if let Err(err) = setup_dns(dns) {
            warn!("failed to set up DNS: {}", err);
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn restore_client(&self, _tun: &str, server_host: &str) -> Result<()> {
        run_quiet("route", &["delete", "-net", "0.0.0.0/1"]);
        run_quiet("route", &["delete", "-net", "128.0.0.0/1"]);
        run_quiet("route", &["delete", "-host", server_host]);
        restore_dns();
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn setup_server(&self, _tun: &str, _subnet: &Ipv4Net) -> Result<()> {
        bail!("unsupported platform");
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn teardown_server(&self, _tun: &str, _subnet: &Ipv4Net) -> Result<()> {
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn setup_client(&self, _tun: &str, _server_host: &str, _dns: &[IpAddr]) -> Result<()> {
        bail!("unsupported platform");
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn restore_client(&self, _tun: &str, _server_host: &str) -> Result<()> {
        Ok(())
    }
}

/// Records operations instead of touching the host. Test double.
#[derive(Default)]
pub struct RecordingNet {
    ops: Mutex<Vec<String>>,
}

impl RecordingNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().expect("ops lock").clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().expect("ops lock").push(op);
    }
}

impl PlatformNet for RecordingNet {
    fn setup_server(&self, tun: &str, subnet: &Ipv4Net) -> Result<()> {
        self.record(format!("setup_server {} {}", tun, subnet));
        Ok(())
    }

    fn teardown_server(&self, tun: &str, subnet: &Ipv4Net) -> Result<()> {
        self.record(format!("teardown_server {} {}", tun, subnet));
        Ok(())
    }

    fn setup_client(&self, tun: &str, server_host: &str, dns: &[IpAddr]) -> Result<()> {
        self.record(format!("setup_client {} {} dns={:?}", tun, server_host, dns));
        Ok(())
    }

    fn restore_client(&self, tun: &str, server_host: &str) -> Result<()> {
        self.record(format!("restore_client {} {}", tun, server_host));
        Ok(())
    }
}
