use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{net::UdpSocket, process::Command};
use tracing::{debug, info, warn};

use launcher_common::{
    protocol::{build_heartbeat_payload, parse_shutdown, HEARTBEAT_PORT, MAX_DATAGRAM_LEN},
    HardwareAddress,
};

const DEFAULT_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
struct AgentConfig {
    mac: HardwareAddress,
    broadcast: Ipv4Addr,
    interval: Duration,
    shutdown_cmd: Option<String>,
}

impl AgentConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), default_mac)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        fallback_mac: impl FnOnce() -> anyhow::Result<HardwareAddress>,
    ) -> anyhow::Result<Self> {
        let mac = match lookup("AGENT_MAC") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid AGENT_MAC `{value}`"))?,
            None => fallback_mac()?,
        };

        let broadcast = match lookup("AGENT_BROADCAST_ADDR") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid AGENT_BROADCAST_ADDR `{value}`"))?,
            None => Ipv4Addr::BROADCAST,
        };

        let interval_ms = lookup("AGENT_INTERVAL_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_INTERVAL_MS);

        let shutdown_cmd = lookup("AGENT_SHUTDOWN_CMD").filter(|cmd| !cmd.trim().is_empty());

        Ok(Self {
            mac,
            broadcast,
            interval: Duration::from_millis(interval_ms),
            shutdown_cmd,
        })
    }
}

fn default_mac() -> anyhow::Result<HardwareAddress> {
    let mac = mac_address::get_mac_address()
        .context("failed to read host hardware address")?
        .context("no interface with a hardware address; set AGENT_MAC")?;
    Ok(HardwareAddress::new(mac.bytes()))
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env()?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], HEARTBEAT_PORT));
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind agent socket at {bind_addr}"))?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;
    let socket = Arc::new(socket);

    info!(
        "agent for {} started: heartbeat every {}ms to {}, shutdown {}",
        config.mac,
        config.interval.as_millis(),
        config.broadcast,
        config.shutdown_cmd.as_deref().unwrap_or("dry-run"),
    );

    spawn_heartbeat_loop(socket.clone(), config.clone());
    listen_for_shutdown(&socket, &config).await
}

fn spawn_heartbeat_loop(socket: Arc<UdpSocket>, config: AgentConfig) {
    tokio::spawn(async move {
        let payload = build_heartbeat_payload(&config.mac);
        let target = SocketAddrV4::new(config.broadcast, HEARTBEAT_PORT);
        let mut interval = tokio::time::interval(config.interval);

        loop {
            interval.tick().await;
            if let Err(err) = socket.send_to(payload.as_bytes(), target).await {
                warn!("heartbeat send failed: {err}");
            }
        }
    });
}

async fn listen_for_shutdown(socket: &UdpSocket, config: &AgentConfig) -> anyhow::Result<()> {
    let mut buf = [0_u8; MAX_DATAGRAM_LEN];
    loop {
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .context("agent socket receive failed")?;

        if !is_shutdown_for(&buf[..len], &config.mac) {
            continue;
        }

        info!("shutdown requested by {peer}");
        match config.shutdown_cmd.as_deref() {
            Some(cmd) => run_shutdown(cmd).await,
            None => info!("dry-run: AGENT_SHUTDOWN_CMD not set, ignoring"),
        }
    }
}

// Only exact address matches count; our own heartbeats arrive here too.
fn is_shutdown_for(datagram: &[u8], mac: &HardwareAddress) -> bool {
    parse_shutdown(datagram).is_some_and(|target| target == *mac)
}

async fn run_shutdown(cmd: &str) {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(cmd);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    };

    match command.status().await {
        Ok(status) if status.success() => debug!("shutdown command finished"),
        Ok(status) => warn!("shutdown command exited with {status}"),
        Err(err) => warn!("failed to run shutdown command `{cmd}`: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const MAC: HardwareAddress = HardwareAddress::new([0x22, 0x33, 0x4D, 0x06, 0x43, 0xED]);

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned(), || Ok(MAC))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.mac, MAC);
        assert_eq!(config.broadcast, Ipv4Addr::BROADCAST);
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.shutdown_cmd, None);
    }

    #[test]
    fn env_overrides_are_parsed() {
        let config = config_from(&[
            ("AGENT_MAC", "aa-bb-cc-dd-ee-ff"),
            ("AGENT_BROADCAST_ADDR", "192.168.1.255"),
            ("AGENT_INTERVAL_MS", "250"),
            ("AGENT_SHUTDOWN_CMD", "systemctl poweroff"),
        ])
        .unwrap();

        assert_eq!(
            config.mac,
            HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
        assert_eq!(config.broadcast, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.shutdown_cmd.as_deref(), Some("systemctl poweroff"));
    }

    #[test]
    fn bad_values_are_rejected_or_defaulted() {
        assert!(config_from(&[("AGENT_MAC", "nope")]).is_err());
        assert!(config_from(&[("AGENT_BROADCAST_ADDR", "300.1.1.1")]).is_err());

        let config =
            config_from(&[("AGENT_INTERVAL_MS", "0"), ("AGENT_SHUTDOWN_CMD", "  ")]).unwrap();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.shutdown_cmd, None);
    }

    #[test]
    fn shutdown_matches_only_own_address() {
        assert!(is_shutdown_for(b"SHUTDOWN_ESP|22334D0643ED", &MAC));
        assert!(is_shutdown_for(b"SHUTDOWN_ESP|22334d0643ed\n", &MAC));
        assert!(!is_shutdown_for(b"SHUTDOWN_ESP|AABBCCDDEEFF", &MAC));
        assert!(!is_shutdown_for(b"HEARTBEAT|22334D0643ED", &MAC));
    }
}
