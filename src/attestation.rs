//! Heuristic hardware attestation
//!
//! Decides whether this node looks like the expected kiosk board (a
//! Raspberry Pi class SoC) and is therefore allowed to mine and issue reward
//! tokens. The checks are heuristics over `/proc`, `/sys`, `/dev` and
//! `vcgencmd`; they raise the cost of running a node in a VM, nothing more.
//!
//! Every check returns a [`CheckResult`] with the reason it passed or failed.
//! All filesystem and command access goes through [`HardwareProbe`] so the
//! aggregation can be exercised without the hardware.

use crate::error::KioskError;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::process::Command;
use tracing::{debug, info, warn};

pub const ELIGIBILITY_THRESHOLD: f64 = 0.7;
/// Anti-spoofing heuristics that must pass out of six.
pub const ANTI_SPOOFING_REQUIRED: usize = 5;
const RNG_SAMPLE_BYTES: usize = 1024;
const RNG_MIN_ENTROPY: f64 = 7.0;
const RNG_QUALITY_ENTROPY: f64 = 7.5;
/// Highest share of the sample a single byte value may take.
const RNG_MAX_BYTE_SHARE: f64 = 0.02;
const OTP_MIN_ROWS: usize = 8;

const CPUINFO: &str = "/proc/cpuinfo";
const HWRNG: &str = "/dev/hwrng";
const VCHIQ: &str = "/dev/vchiq";
const VCIO: &str = "/dev/vcio";
const DT_MODEL: &str = "/proc/device-tree/model";
const DT_COMPATIBLE: &str = "/proc/device-tree/compatible";
const DMI_PRODUCT: &str = "/sys/class/dmi/id/product_name";
const MODULES: &str = "/proc/modules";
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const GPIOMEM: &str = "/dev/gpiomem";
const MEMINFO: &str = "/proc/meminfo";
const MACHINE_ID: &str = "/etc/machine-id";

const VM_MARKERS: [&str; 7] = [
    "qemu",
    "kvm",
    "virtualbox",
    "vmware",
    "xen",
    "bochs",
    "hyper-v",
];
const PLATFORM_MODULES: [&str; 5] = ["bcm2835", "vc4", "v3d", "brcmfmac", "raspberrypi"];

/// Source of raw hardware observations.
pub trait HardwareProbe: Send + Sync {
    fn read_file(&self, path: &str) -> io::Result<String>;
    fn read_bytes(&self, path: &str, len: usize) -> io::Result<Vec<u8>>;
    fn exists(&self, path: &str) -> bool;
    fn command_output(&self, program: &str, args: &[&str]) -> Option<String>;
}

/// Probe backed by the real system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn read_file(&self, path: &str) -> io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_bytes(&self, path: &str, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        File::open(path)?.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn exists(&self, path: &str) -> bool {
        std::path::Path::new(path).exists()
    }

    fn command_output(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program).args(args).output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub weight: f64,
    pub required: bool,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, weight: f64, required: bool, outcome: Result<String, String>) -> Self {
        let (passed, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        Self {
            name: name.to_string(),
            passed,
            weight,
            required,
            detail,
        }
    }

    fn heuristic(name: &str, outcome: Result<String, String>) -> Self {
        Self::new(name, 0.0, false, outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationReport {
    pub eligible: bool,
    pub confidence_score: f64,
    pub weighted_score: f64,
    pub hardware_model: String,
    pub anti_spoofing_passed: bool,
    pub anti_spoofing_score: usize,
    pub checks: Vec<CheckResult>,
    pub anti_spoofing: Vec<CheckResult>,
    pub checked_at: i64,
}

impl AttestationReport {
    /// Mining requires both the hardware verdict and anti-spoofing.
    pub fn mining_allowed(&self) -> bool {
        self.eligible && self.anti_spoofing_passed
    }

    pub fn require_mining_role(&self) -> Result<(), KioskError> {
        if self.mining_allowed() {
            return Ok(());
        }
        let failed: Vec<&str> = self
            .checks
            .iter()
            .chain(self.anti_spoofing.iter())
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        Err(KioskError::Attestation(format!(
            "mining role denied (eligible: {}, anti-spoofing {}/6, failed: {})",
            self.eligible,
            self.anti_spoofing_score,
            failed.join(", ")
        )))
    }
}

/// Weighted score, maximum possible score and the eligibility verdict.
pub fn aggregate(checks: &[CheckResult]) -> (f64, f64, bool) {
    let max_score: f64 = checks.iter().map(|c| c.weight).sum();
    let score: f64 = checks.iter().filter(|c| c.passed).map(|c| c.weight).sum();
    let required_ok = checks.iter().filter(|c| c.required).all(|c| c.passed);
    (score, max_score, score >= ELIGIBILITY_THRESHOLD && required_ok)
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in sample {
        counts[b as usize] += 1;
    }
    let len = sample.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn cpuinfo_field(cpuinfo: &str, field: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim().to_string())
    })
}

fn cpu_serial(probe: &dyn HardwareProbe) -> Option<String> {
    let cpuinfo = probe.read_file(CPUINFO).ok()?;
    cpuinfo_field(&cpuinfo, "Serial")
}

fn clean_dt(value: &str) -> String {
    value.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string()
}

/// Megabytes from `vcgencmd get_mem <which>` output such as `gpu=76M`.
fn vcgencmd_mem(probe: &dyn HardwareProbe, which: &str) -> Option<u64> {
    let output = probe.command_output("vcgencmd", &["get_mem", which])?;
    let value = output.trim().split_once('=')?.1;
    value.trim_end_matches('M').parse().ok()
}

/// Stable identifier for this machine: CPU serial, then machine-id, else a
/// random value (which binds tokens to this process only).
pub fn stable_hardware_id() -> String {
    hardware_id_from(&SystemProbe)
}

pub fn hardware_id_from(probe: &dyn HardwareProbe) -> String {
    if let Some(serial) = cpu_serial(probe).filter(|s| !s.is_empty()) {
        return serial;
    }
    if let Ok(id) = probe.read_file(MACHINE_ID) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    warn!("No stable hardware identifier found; using a random one");
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct HardwareAttestor {
    probe: Box<dyn HardwareProbe>,
    last_report: RwLock<Option<AttestationReport>>,
}

impl Default for HardwareAttestor {
    fn default() -> Self {
        Self::new(Box::new(SystemProbe))
    }
}

impl HardwareAttestor {
    pub fn new(probe: Box<dyn HardwareProbe>) -> Self {
        Self {
            probe,
            last_report: RwLock::new(None),
        }
    }

    /// Stable identifier of the probed hardware, used to bind tokens.
    pub fn hardware_id(&self) -> String {
        hardware_id_from(self.probe.as_ref())
    }

    pub fn last_report(&self) -> Option<AttestationReport> {
        self.last_report.read().clone()
    }

    /// Run every check and anti-spoofing heuristic.
    pub fn verify_eligibility(&self) -> AttestationReport {
        let probe = self.probe.as_ref();
        let rng_sample = probe.read_bytes(HWRNG, RNG_SAMPLE_BYTES);

        let checks = vec![
            CheckResult::new("cpu_serial", 0.25, true, self.check_cpu_serial()),
            CheckResult::new("hardware_rng", 0.20, true, check_rng_entropy(&rng_sample)),
            CheckResult::new("gpu_proximity", 0.20, true, self.check_gpu()),
            CheckResult::new("mailbox_device", 0.15, false, self.check_mailbox()),
            CheckResult::new("chip_identification", 0.10, false, self.check_chip_id()),
            CheckResult::new("otp_registers", 0.10, false, self.check_otp()),
        ];
        let anti_spoofing = vec![
            CheckResult::heuristic("no_vm_indicators", self.check_no_vm()),
            CheckResult::heuristic("rng_quality", check_rng_quality(&rng_sample)),
            CheckResult::heuristic("platform_modules", self.check_modules()),
            CheckResult::heuristic("temperature_sensor", self.check_temperature()),
            CheckResult::heuristic("gpio_access", self.check_gpio()),
            CheckResult::heuristic("unified_memory", self.check_unified_memory()),
        ];

        let (weighted_score, max_score, eligible) = aggregate(&checks);
        let anti_spoofing_score = anti_spoofing.iter().filter(|c| c.passed).count();
        let report = AttestationReport {
            eligible,
            confidence_score: if max_score > 0.0 { weighted_score / max_score } else { 0.0 },
            weighted_score,
            hardware_model: self.hardware_model(),
            anti_spoofing_passed: anti_spoofing_score >= ANTI_SPOOFING_REQUIRED,
            anti_spoofing_score,
            checks,
            anti_spoofing,
            checked_at: chrono::Utc::now().timestamp(),
        };

        for check in report.checks.iter().chain(report.anti_spoofing.iter()) {
            debug!("attestation {}: passed={} ({})", check.name, check.passed, check.detail);
        }
        info!(
            "Hardware attestation: eligible={} confidence={:.2} anti_spoofing={}/6 model={}",
            report.eligible, report.confidence_score, report.anti_spoofing_score, report.hardware_model
        );
        *self.last_report.write() = Some(report.clone());
        report
    }

    fn hardware_model(&self) -> String {
        if let Ok(model) = self.probe.read_file(DT_MODEL) {
            let model = clean_dt(&model);
            if !model.is_empty() {
                return model;
            }
        }
        self.probe
            .read_file(CPUINFO)
            .ok()
            .and_then(|c| cpuinfo_field(&c, "Model"))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn check_cpu_serial(&self) -> Result<String, String> {
        let serial = cpu_serial(self.probe.as_ref()).ok_or("no Serial line in /proc/cpuinfo")?;
        if serial.len() != 16 || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("serial '{}' is not 16 hex digits", serial));
        }
        if serial.chars().all(|c| c == '0') {
            return Err("serial is all zeros".to_string());
        }
        Ok(format!("serial {}", serial))
    }

    fn check_gpu(&self) -> Result<String, String> {
        if self.probe.exists(VCHIQ) {
            return Ok(format!("{} present", VCHIQ));
        }
        match vcgencmd_mem(self.probe.as_ref(), "gpu") {
            Some(mb) if mb > 0 => Ok(format!("gpu memory split {}M", mb)),
            _ => Err("no VideoCore interface found".to_string()),
        }
    }

    fn check_mailbox(&self) -> Result<String, String> {
        if self.probe.exists(VCIO) {
            Ok(format!("{} present", VCIO))
        } else {
            Err(format!("{} missing", VCIO))
        }
    }

    fn check_chip_id(&self) -> Result<String, String> {
        let cpuinfo = self.probe.read_file(CPUINFO).unwrap_or_default();
        let signals = [
            cpuinfo_field(&cpuinfo, "Hardware")
                .map(|h| h.to_ascii_uppercase().contains("BCM"))
                .unwrap_or(false),
            self.probe
                .read_file(DT_MODEL)
                .map(|m| m.contains("Raspberry Pi"))
                .unwrap_or(false),
            self.probe
                .read_file(DT_COMPATIBLE)
                .map(|c| c.contains("brcm,bcm"))
                .unwrap_or(false),
        ];
        let found = signals.iter().filter(|&&s| s).count();
        if found >= 2 {
            Ok(format!("{}/3 chip signals agree", found))
        } else {
            Err(format!("only {}/3 chip signals", found))
        }
    }

    fn check_otp(&self) -> Result<String, String> {
        let dump = self
            .probe
            .command_output("vcgencmd", &["otp_dump"])
            .ok_or("otp_dump unavailable")?;
        let rows = dump
            .lines()
            .filter(|line| match line.trim().split_once(':') {
                Some((row, value)) => {
                    row.len() == 2
                        && row.chars().all(|c| c.is_ascii_digit())
                        && value.len() == 8
                        && value.chars().all(|c| c.is_ascii_hexdigit())
                }
                None => false,
            })
            .count();
        if rows >= OTP_MIN_ROWS {
            Ok(format!("{} OTP rows", rows))
        } else {
            Err(format!("{} well-formed OTP rows", rows))
        }
    }

    fn check_no_vm(&self) -> Result<String, String> {
        let cpuinfo = self.probe.read_file(CPUINFO).unwrap_or_default();
        if cpuinfo
            .lines()
            .filter(|l| l.starts_with("flags") || l.starts_with("Features"))
            .any(|l| l.split_whitespace().any(|w| w == "hypervisor"))
        {
            return Err("cpu reports hypervisor flag".to_string());
        }
        if let Ok(product) = self.probe.read_file(DMI_PRODUCT) {
            let product = product.to_ascii_lowercase();
            if let Some(marker) = VM_MARKERS.iter().find(|m| product.contains(*m)) {
                return Err(format!("DMI product names {}", marker));
            }
        }
        Ok("no virtualization markers".to_string())
    }

    fn check_modules(&self) -> Result<String, String> {
        let modules = self.probe.read_file(MODULES).map_err(|e| e.to_string())?;
        let found: Vec<&str> = PLATFORM_MODULES
            .iter()
            .copied()
            .filter(|m| modules.lines().any(|l| l.starts_with(m)))
            .collect();
        if found.is_empty() {
            Err("no platform kernel modules loaded".to_string())
        } else {
            Ok(format!("modules: {}", found.join(",")))
        }
    }

    fn check_temperature(&self) -> Result<String, String> {
        let celsius = match self.probe.read_file(THERMAL_ZONE) {
            Ok(raw) => raw
                .trim()
                .parse::<f64>()
                .map(|milli| milli / 1000.0)
                .map_err(|e| format!("unparseable temperature: {}", e))?,
            Err(_) => self
                .probe
                .command_output("vcgencmd", &["measure_temp"])
                .and_then(|out| {
                    out.trim()
                        .strip_prefix("temp=")?
                        .trim_end_matches("'C")
                        .parse::<f64>()
                        .ok()
                })
                .ok_or("no temperature sensor")?,
        };
        if (15.0..=95.0).contains(&celsius) {
            Ok(format!("{:.1}C", celsius))
        } else {
            Err(format!("implausible temperature {:.1}C", celsius))
        }
    }

    fn check_gpio(&self) -> Result<String, String> {
        if self.probe.exists(GPIOMEM) {
            Ok(format!("{} present", GPIOMEM))
        } else {
            Err(format!("{} missing", GPIOMEM))
        }
    }

    fn check_unified_memory(&self) -> Result<String, String> {
        let probe = self.probe.as_ref();
        if let (Some(arm), Some(gpu)) = (vcgencmd_mem(probe, "arm"), vcgencmd_mem(probe, "gpu")) {
            if arm > 0 && gpu > 0 {
                return Ok(format!("arm={}M gpu={}M", arm, gpu));
            }
        }
        let meminfo = probe.read_file(MEMINFO).unwrap_or_default();
        let cma = meminfo
            .lines()
            .find_map(|l| l.strip_prefix("CmaTotal:"))
            .and_then(|v| v.split_whitespace().next()?.parse::<u64>().ok())
            .unwrap_or(0);
        if cma > 0 {
            Ok(format!("CMA pool {} kB", cma))
        } else {
            Err("no shared CPU/GPU memory signal".to_string())
        }
    }
}

fn check_rng_entropy(sample: &io::Result<Vec<u8>>) -> Result<String, String> {
    let sample = sample.as_ref().map_err(|e| format!("{}: {}", HWRNG, e))?;
    let entropy = shannon_entropy(sample);
    if entropy >= RNG_MIN_ENTROPY {
        Ok(format!("{:.2} bits/byte", entropy))
    } else {
        Err(format!("low entropy {:.2} bits/byte", entropy))
    }
}

fn check_rng_quality(sample: &io::Result<Vec<u8>>) -> Result<String, String> {
    let sample = sample.as_ref().map_err(|e| format!("{}: {}", HWRNG, e))?;
    let entropy = shannon_entropy(sample);
    let mut counts = [0usize; 256];
    for &b in sample {
        counts[b as usize] += 1;
    }
    let max_share = counts.iter().copied().max().unwrap_or(0) as f64 / sample.len().max(1) as f64;
    if entropy >= RNG_QUALITY_ENTROPY && max_share <= RNG_MAX_BYTE_SHARE {
        Ok(format!("{:.2} bits/byte, max share {:.3}", entropy, max_share))
    } else {
        Err(format!("entropy {:.2}, max share {:.3}", entropy, max_share))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default, Clone)]
    pub(crate) struct FakeProbe {
        pub files: HashMap<String, String>,
        pub devices: HashMap<String, Vec<u8>>,
        pub commands: HashMap<String, String>,
    }

    impl FakeProbe {
        pub(crate) fn without(mut self, path: &str) -> Self {
            self.files.remove(path);
            self.devices.remove(path);
            self
        }

        fn with_file(mut self, path: &str, contents: &str) -> Self {
            self.files.insert(path.to_string(), contents.to_string());
            self
        }
    }

    impl HardwareProbe for FakeProbe {
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

    /// A probe that looks like a Raspberry Pi 4 kiosk.
    pub(crate) fn raspberry_pi() -> FakeProbe {
        let mut probe = FakeProbe::default();
        probe.files.insert(
            CPUINFO.to_string(),
            "processor\t: 0\nFeatures\t: fp asimd evtstrm crc32 cpuid\nHardware\t: BCM2835\nRevision\t: c03114\nSerial\t\t: 10000000a3b4c5d6\nModel\t\t: Raspberry Pi 4 Model B Rev 1.4\n".to_string(),
        );
        probe
            .files
            .insert(DT_MODEL.to_string(), "Raspberry Pi 4 Model B Rev 1.4\0".to_string());
        probe
            .files
            .insert(DT_COMPATIBLE.to_string(), "raspberrypi,4-model-b\0brcm,bcm2711\0".to_string());
        probe.files.insert(
            MODULES.to_string(),
            "vc4 290816 2 - Live 0x0000000000000000\nbcm2835_codec 49152 0 - Live 0x0000000000000000\n".to_string(),
        );
        probe.files.insert(THERMAL_ZONE.to_string(), "48312\n".to_string());
        probe.files.insert(VCHIQ.to_string(), String::new());
        probe.files.insert(VCIO.to_string(), String::new());
        probe.files.insert(GPIOMEM.to_string(), String::new());
        probe.devices.insert(
            HWRNG.to_string(),
            (0..RNG_SAMPLE_BYTES).map(|i| (i * 167 % 256) as u8).collect(),
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

    fn attest(probe: FakeProbe) -> AttestationReport {
        HardwareAttestor::new(Box::new(probe)).verify_eligibility()
    }

    #[test]
    fn test_raspberry_pi_is_eligible_and_passes_anti_spoofing() {
        let report = attest(raspberry_pi());
        assert!(report.eligible);
        assert!(report.anti_spoofing_passed);
        assert!((report.confidence_score - 1.0).abs() < 1e-9);
        assert_eq!(report.hardware_model, "Raspberry Pi 4 Model B Rev 1.4");
        assert!(report.require_mining_role().is_ok());
    }

    #[test]
    fn test_missing_required_check_denies_eligibility() {
        // Losing the RNG costs 0.20 and fails a required check.
        let report = attest(raspberry_pi().without(HWRNG));
        assert!(!report.eligible);

        // Losing the GPU interface: score 0.80 is still above threshold.
        let mut probe = raspberry_pi().without(VCHIQ);
        probe.commands.remove("vcgencmd get_mem gpu");
        let report = attest(probe);
        assert!(report.weighted_score >= ELIGIBILITY_THRESHOLD);
        assert!(!report.eligible);
    }

    #[test]
    fn test_optional_checks_only_lower_confidence() {
        let mut probe = raspberry_pi().without(VCIO);
        probe.commands.remove("vcgencmd otp_dump");
        let report = attest(probe);
        assert!(report.eligible);
        assert!((report.confidence_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_gating_rule() {
        let check = |passed, weight, required| CheckResult {
            name: "c".to_string(),
            passed,
            weight,
            required,
            detail: String::new(),
        };
        let all = vec![check(true, 0.5, true), check(true, 0.3, true), check(false, 0.2, false)];
        assert!(aggregate(&all).2);

        let missing_required = vec![check(true, 0.9, true), check(false, 0.1, true)];
        assert!(!aggregate(&missing_required).2);

        let low_score = vec![check(true, 0.6, true), check(false, 0.4, false)];
        assert!(!aggregate(&low_score).2);
    }

    #[test]
    fn test_virtual_machine_fails_anti_spoofing() {
        let probe = raspberry_pi()
            .with_file(
                CPUINFO,
                "processor\t: 0\nflags\t\t: fpu vme sse2 hypervisor\nSerial\t\t: 10000000a3b4c5d6\n",
            )
            .with_file(DMI_PRODUCT, "QEMU Standard PC (Q35 + ICH9, 2009)\n")
            .with_file(MODULES, "virtio_net 57344 0 - Live\n")
            .without(GPIOMEM);
        let report = attest(probe);
        assert!(!report.anti_spoofing_passed);
        assert!(!report.mining_allowed());
        assert!(matches!(report.require_mining_role(), Err(KioskError::Attestation(_))));
    }

    #[test]
    fn test_constant_rng_output_fails() {
        let mut probe = raspberry_pi();
        probe.devices.insert(HWRNG.to_string(), vec![0xAA; RNG_SAMPLE_BYTES]);
        let report = attest(probe);
        let rng = report.checks.iter().find(|c| c.name == "hardware_rng").unwrap();
        assert!(!rng.passed);
        assert!(!report.eligible);
    }

    #[test]
    fn test_hardware_id_prefers_cpu_serial() {
        assert_eq!(hardware_id_from(&raspberry_pi()), "10000000a3b4c5d6");
        let probe = FakeProbe::default().with_file(MACHINE_ID, "4c4c4544004e\n");
        assert_eq!(hardware_id_from(&probe), "4c4c4544004e");
        assert_eq!(hardware_id_from(&FakeProbe::default()).len(), 32);
    }

    fn check<'a>(report: &'a AttestationReport, name: &str) -> &'a CheckResult {
        report.checks.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_missing_cpu_serial_is_not_eligible() {
        let kiosk = raspberry_pi().with_file(
            CPUINFO,
            "processor\t: 0\nHardware\t: BCM2835\nRevision\t: c03114\nModel\t\t: Raspberry Pi 4 Model B Rev 1.4\n",
        );
        let report = attest(kiosk);
        let serial = check(&report, "cpu_serial");
        assert!(!serial.passed);
        assert!(serial.detail.contains("no Serial line"));
        // 0.75 of the weight is left, which is enough, but the check is required.
        assert!(report.weighted_score >= ELIGIBILITY_THRESHOLD);
        assert!(!report.eligible);
        assert!(report.require_mining_role().is_err());

        let report = attest(raspberry_pi().with_file(CPUINFO, "Serial\t\t: 0000000000000000\n"));
        assert!(!check(&report, "cpu_serial").passed);
        assert!(!report.eligible);
    }

    #[test]
    fn test_one_chip_signal_of_three_is_not_enough() {
        let kiosk = raspberry_pi()
            .without(DT_MODEL)
            .with_file(DT_COMPATIBLE, "generic,arm64\0");
        let report = attest(kiosk);
        let chip = check(&report, "chip_identification");
        assert!(!chip.passed);
        assert_eq!(chip.detail, "only 1/3 chip signals");
        // The check is optional: it costs its weight, not eligibility.
        assert!((report.weighted_score - 0.90).abs() < 1e-9);
        assert!(report.eligible);

        let report = attest(raspberry_pi().without(DT_MODEL));
        let chip = check(&report, "chip_identification");
        assert!(chip.passed);
        assert_eq!(chip.detail, "2/3 chip signals agree");
    }
}
