//! Bootstrap configuration.
//!
//! Values are layered: CLI flag, then environment (both handled by clap), then
//! an optional JSON file at `~/.config/tapnat/config.json`, then built-in
//! defaults matching the classic `tap0` / `enp1s0` / `192.0.2.0/24` setup.

use std::fs;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TapnatError};

pub const DEFAULT_TAP_INTERFACE: &str = "tap0";
pub const DEFAULT_UPLINK_INTERFACE: &str = "enp1s0";
pub const DEFAULT_NAT_SUBNET: &str = "192.0.2.0/24";
pub const DEFAULT_IPTABLES: &str = "iptables";

/// Linux IFNAMSIZ minus the trailing NUL.
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Parse an IPv4 CIDR and mask off the host bits (`192.0.2.7/24` becomes
/// `192.0.2.0/24`), which is how iptables lists the rule.
///
/// The prefix length must be plain decimal digits without leading zeros.
pub fn parse_subnet(s: &str) -> Result<Ipv4Net> {
    let s = s.trim();
    let Some((_, prefix)) = s.split_once('/') else {
        return Err(TapnatError::Config(format!("missing '/' in CIDR: {}", s)));
    };

    let canonical = !prefix.is_empty()
        && prefix.bytes().all(|b| b.is_ascii_digit())
        && (prefix == "0" || !prefix.starts_with('0'));
    if !canonical {
        return Err(TapnatError::Config(format!(
            "invalid prefix length in CIDR: {}",
            s
        )));
    }

    s.parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| TapnatError::Config(format!("invalid CIDR {}: {}", s, e)))
}

fn deserialize_subnet<'de, D>(deserializer: D) -> std::result::Result<Option<Ipv4Net>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_subnet(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Check a Linux network interface name.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TapnatError::Config("interface name is empty".into()));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(TapnatError::Config(format!(
            "interface name {} is longer than {} bytes",
            name, MAX_INTERFACE_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(TapnatError::Config(format!(
            "interface name {} is reserved",
            name
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        return Err(TapnatError::Config(format!(
            "interface name {:?} contains an invalid character",
            name
        )));
    }
    Ok(())
}

/// The values the bootstrap action operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetConfig {
    /// Virtual interface the guest traffic arrives on (e.g. "tap0").
    pub tap_interface: String,
    /// Physical interface traffic egresses through (e.g. "enp1s0").
    pub uplink_interface: String,
    /// Source range to masquerade.
    pub nat_subnet: Ipv4Net,
}

impl NetConfig {
    pub fn new(
        tap_interface: impl Into<String>,
        uplink_interface: impl Into<String>,
        nat_subnet: Ipv4Net,
    ) -> Result<Self> {
        let config = Self {
            tap_interface: tap_interface.into(),
            uplink_interface: uplink_interface.into(),
            nat_subnet,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_interface_name(&self.tap_interface)?;
        validate_interface_name(&self.uplink_interface)?;
        if self.tap_interface == self.uplink_interface {
            return Err(TapnatError::Config(format!(
                "TAP and uplink interface are both {}",
                self.tap_interface
            )));
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tap_interface: DEFAULT_TAP_INTERFACE.into(),
            uplink_interface: DEFAULT_UPLINK_INTERFACE.into(),
            nat_subnet: DEFAULT_NAT_SUBNET.parse().expect("valid IPv4 CIDR"),
        }
    }
}

/// Persisted settings file.
///
/// Every field is optional so a file only needs to name what it overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub tap_interface: Option<String>,

    #[serde(default)]
    pub uplink_interface: Option<String>,

    #[serde(default, deserialize_with = "deserialize_subnet")]
    pub nat_subnet: Option<Ipv4Net>,

    /// Path or name of the iptables binary.
    #[serde(default)]
    pub iptables: Option<String>,
}

impl FileConfig {
    /// Default file path: `~/.config/tapnat/config.json`.
    ///
    /// Returns `None` if the config directory can't be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tapnat").join("config.json"))
    }

    /// Load from an explicit path. A missing or malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            TapnatError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&contents)
            .map_err(|e| TapnatError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Load from the default location, falling back to an empty config when
    /// the file does not exist.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Values explicitly supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tap_interface: Option<String>,
    pub uplink_interface: Option<String>,
    pub nat_subnet: Option<String>,
    pub iptables: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub net: NetConfig,
    pub iptables: String,
}

impl Settings {
    /// Merge overrides on top of the file config on top of the defaults.
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self> {
        let defaults = NetConfig::default();

        let nat_subnet = match overrides.nat_subnet {
            Some(cidr) => parse_subnet(&cidr)?,
            None => file.nat_subnet.unwrap_or(defaults.nat_subnet),
        };

        let net = NetConfig::new(
            overrides
                .tap_interface
                .or(file.tap_interface)
                .unwrap_or(defaults.tap_interface),
            overrides
                .uplink_interface
                .or(file.uplink_interface)
                .unwrap_or(defaults.uplink_interface),
            nat_subnet,
        )?;

        let iptables = overrides
            .iptables
            .or(file.iptables)
            .unwrap_or_else(|| DEFAULT_IPTABLES.to_string());

        Ok(Self { net, iptables })
    }
}
