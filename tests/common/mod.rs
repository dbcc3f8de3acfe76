//! Shared fixtures for the integration tests

#![allow(dead_code)]

use kioskmesh::attestation::{HardwareAttestor, HardwareProbe};
use kioskmesh::config::Config;
use kioskmesh::node::Node;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SECRET: &str = "fleet-secret-01";

/// In-memory hardware view.
#[derive(Default, Clone)]
pub struct StaticProbe {
    files: HashMap<String, String>,
    devices: HashMap<String, Vec<u8>>,
    commands: HashMap<String, String>,
}

impl StaticProbe {
    /// Looks like a Raspberry Pi 4 kiosk.
    pub fn kiosk() -> Self {
        let mut probe = Self::default();
        let files = [
            (
                "/proc/cpuinfo",
                "processor\t: 0\nHardware\t: BCM2835\nRevision\t: c03114\nSerial\t\t: 10000000a3b4c5d6\nModel\t\t: Raspberry Pi 4 Model B Rev 1.4\n",
            ),
            ("/proc/device-tree/model", "Raspberry Pi 4 Model B Rev 1.4\0"),
            ("/proc/device-tree/compatible", "raspberrypi,4-model-b\0brcm,bcm2711\0"),
            ("/proc/modules", "vc4 290816 2 - Live 0x0000000000000000\n"),
            ("/sys/class/thermal/thermal_zone0/temp", "47250\n"),
            ("/dev/vchiq", ""),
            ("/dev/vcio", ""),
            ("/dev/gpiomem", ""),
        ];
        for (path, contents) in files {
            probe.files.insert(path.to_string(), contents.to_string());
        }
        probe.devices.insert(
            "/dev/hwrng".to_string(),
            (0..1024usize).map(|i| (i * 167 % 256) as u8).collect(),
        );
        probe
            .commands
            .insert("vcgencmd get_mem gpu".to_string(), "gpu=76M\n".to_string());
        probe
            .commands
            .insert("vcgencmd get_mem arm".to_string(), "arm=948M\n".to_string());
        let otp: String = (8..30).map(|row| format!("{:02}:{:08x}\n", row, row * 4099)).collect();
        probe.commands.insert("vcgencmd otp_dump".to_string(), otp);
        probe
    }

    /// A generic virtual machine: no SoC interfaces at all.
    pub fn virtual_machine() -> Self {
        let mut probe = Self::default();
        probe.files.insert(
            "/sys/class/dmi/id/product_name".to_string(),
            "KVM Virtual Machine\n".to_string(),
        );
        probe
            .files
            .insert("/etc/machine-id".to_string(), "5f1c0a9e7d3b4c2a".to_string());
        probe
    }
}

impl HardwareProbe for StaticProbe {
    fn read_file(&self, path: &str) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn read_bytes(&self, path: &str, len: usize) -> io::Result<Vec<u8>> {
        let bytes = self
            .devices
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(bytes.iter().copied().take(len).collect())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.devices.contains_key(path)
    }

    fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        self.commands
            .get(&format!("{} {}", program, args.join(" ")))
            .cloned()
    }
}

pub fn config(peer_id: &str, trusted: &[&str], dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.node.peer_id = peer_id.to_string();
    config.node.hostname = format!("{}.local", peer_id);
    config.network.network_secret = SECRET.to_string();
    config.network.trusted_peers = trusted.iter().map(|p| p.to_string()).collect();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.listen_port = 0;
    config.network.sync_interval_secs = 3600;
    config.network.transfer_timeout_secs = 5;
    config.storage.data_dir = dir.path().to_path_buf();
    config.mining.initial_difficulty = 2;
    config
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub addr: SocketAddr,
    _dir: TempDir,
}

impl TestNode {
    pub async fn start(peer_id: &str, trusted: &[&str]) -> Self {
        Self::start_with(peer_id, trusted, |_| {}).await
    }

    pub async fn start_with(peer_id: &str, trusted: &[&str], adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = config(peer_id, trusted, &dir);
        adjust(&mut config);
        let node = Node::open(config, HardwareAttestor::new(Box::new(StaticProbe::kiosk()))).unwrap();
        let addr = node.start().await.unwrap();
        Self {
            node,
            addr,
            _dir: dir,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
