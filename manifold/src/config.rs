//! Configuration intake for a plugin process.
//!
//! The runtime itself never reads files; it consumes the fully
//! populated [`Config`] produced here. The loader searches the
//! usual places, applies the command line, and validates the result
//! before the plugin is allowed to start.

use manifold_api::{types::Error, Result};
use serde_derive::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use toml::{self, value};
use tracing::Level;

#[derive(Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub id: IdConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub network: Network,
    #[serde(default, rename = "dynamicRegistration")]
    pub dynamic_registration: DynamicRegistration,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub device: Vec<DeviceConfig>,
}

impl Config {
    pub fn log_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }
}

/// Selects the components that feed the plugin's namespace UUID.
/// With the defaults, only the plugin tag contributes, which keeps
/// device IDs stable across machines.
#[derive(Deserialize, Clone)]
pub struct IdConfig {
    #[serde(default, rename = "useMachineID")]
    pub use_machine_id: bool,
    #[serde(default = "def_true", rename = "usePluginTag")]
    pub use_plugin_tag: bool,
    #[serde(default, rename = "useEnv")]
    pub use_env: Vec<String>,
    #[serde(default, rename = "useCustom")]
    pub use_custom: Vec<String>,
}

impl Default for IdConfig {
    fn default() -> Self {
        IdConfig {
            use_machine_id: false,
            use_plugin_tag: true,
            use_env: vec![],
            use_custom: vec![],
        }
    }
}

/// Chooses whether dispatches within one scheduler iteration are
/// sequenced or concurrent.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Serial,
    Parallel,
}

#[derive(Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub read: ReadSettings,
    #[serde(default)]
    pub write: WriteSettings,
    #[serde(default)]
    pub listen: ListenSettings,
    #[serde(default)]
    pub transaction: TransactionSettings,
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReadSettings {
    #[serde(default)]
    pub disable: bool,
    /// Minimum wall time, in seconds, between the start of
    /// successive read iterations.
    #[serde(default = "def_interval")]
    pub interval: f64,
    /// Inter-device sleep, in seconds, within a single serial
    /// iteration.
    #[serde(default)]
    pub delay: f64,
    #[serde(default = "def_queue_size")]
    pub queue_size: usize,
}

impl Default for ReadSettings {
    fn default() -> Self {
        ReadSettings {
            disable: false,
            interval: def_interval(),
            delay: 0.0,
            queue_size: def_queue_size(),
        }
    }
}

impl ReadSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay)
    }
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WriteSettings {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "def_interval")]
    pub interval: f64,
    #[serde(default)]
    pub delay: f64,
    #[serde(default = "def_queue_size")]
    pub queue_size: usize,
    #[serde(default = "def_batch_size")]
    pub batch_size: usize,
}

impl Default for WriteSettings {
    fn default() -> Self {
        WriteSettings {
            disable: false,
            interval: def_interval(),
            delay: 0.0,
            queue_size: def_queue_size(),
            batch_size: def_batch_size(),
        }
    }
}

impl WriteSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay)
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct ListenSettings {
    #[serde(default)]
    pub disable: bool,
}

#[derive(Deserialize, Clone)]
pub struct TransactionSettings {
    /// Seconds a transaction record survives after its last update.
    #[serde(default = "def_txn_ttl")]
    pub ttl: f64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings { ttl: def_txn_ttl() }
    }
}

impl TransactionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl)
    }
}

/// Token-bucket rate limiting applied to every dispatch. A rate of
/// 0 disables the limiter.
#[derive(Deserialize, Clone, Default)]
pub struct LimiterSettings {
    #[serde(default)]
    pub rate: f64,
    #[serde(default)]
    pub burst: u32,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "def_cache_ttl")]
    pub ttl: f64,
    #[serde(default = "def_cache_size")]
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: false,
            ttl: def_cache_ttl(),
            max_size: def_cache_size(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl)
    }
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Tcp,
    Unix,
}

#[derive(Deserialize, Clone)]
pub struct Network {
    #[serde(default, rename = "type")]
    pub kind: NetworkKind,
    #[serde(default = "def_address")]
    pub address: String,
    #[serde(default)]
    pub tls: Option<value::Table>,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            kind: NetworkKind::Tcp,
            address: def_address(),
            tls: None,
        }
    }
}

/// Arbitrary key/value maps handed to the plugin's device
/// registrar, one call per entry, during the startup window.
#[derive(Deserialize, Clone, Default)]
pub struct DynamicRegistration {
    #[serde(default)]
    pub config: Vec<value::Table>,
}

#[derive(Deserialize, Clone, Default)]
pub struct HealthConfig {
    #[serde(default, rename = "healthFile")]
    pub health_file: Option<String>,
    #[serde(default)]
    pub checks: HealthChecks,
}

#[derive(Deserialize, Clone, Default)]
pub struct HealthChecks {
    #[serde(default, rename = "disableDefaults")]
    pub disable_defaults: bool,
}

/// One `[[device]]` section: the durable description from which a
/// device instance is built.
#[derive(Deserialize, Clone, Default)]
pub struct DeviceConfig {
    /// The device's kind tag, e.g. `"temperature"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The handler that drives the device. Defaults to the kind
    /// tag.
    pub handler: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Protocol-specific data, passed through to the handler.
    #[serde(default)]
    pub data: value::Table,
    /// Names of the outputs the device produces.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Optional multiplier applied to every numeric reading the
    /// device produces.
    pub scale: Option<f64>,
}

impl DeviceConfig {
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.kind)
    }
}

fn def_true() -> bool {
    true
}

fn def_interval() -> f64 {
    1.0
}

fn def_queue_size() -> usize {
    128
}

fn def_batch_size() -> usize {
    16
}

fn def_txn_ttl() -> f64 {
    300.0
}

fn def_cache_ttl() -> f64 {
    180.0
}

fn def_cache_size() -> usize {
    128
}

fn def_address() -> String {
    String::from("127.0.0.1:5001")
}

/// Produces a copy of a configuration value with every secret
/// blotted out: any value whose key contains `pass` (in any case)
/// becomes the literal string `"REDACTED"`, recursively through
/// nested tables and arrays. The input is not touched; logging and
/// `--print-config` go through this, the runtime keeps the
/// original.
pub fn redact(val: &value::Value) -> value::Value {
    match val {
        value::Value::Table(table) => value::Value::Table(
            table
                .iter()
                .map(|(k, v)| {
                    if k.to_lowercase().contains("pass") {
                        (
                            k.clone(),
                            value::Value::String("REDACTED".into()),
                        )
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect(),
        ),
        value::Value::Array(items) => {
            value::Value::Array(items.iter().map(redact).collect())
        }
        other => other.clone(),
    }
}

fn from_cmdline(mut cfg: (Config, value::Value)) -> (bool, (Config, value::Value)) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("Manifold device plugin")
        .version(crate_version!())
        .about("Exposes a fleet of devices to an upstream monitor.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enables debug logging"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the (redacted) configuration and exits"),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        cfg.0.debug = true
    }

    // Return the config built from the command line and a flag
    // indicating the user wants the final configuration displayed.

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<(Config, value::Value)> {
    let raw: value::Value = toml::from_str(contents)
        .map_err(|e| Error::Config(format!("{}", e)))?;
    let cfg: Config = toml::from_str(contents)
        .map_err(|e| Error::Config(format!("{}", e)))?;

    validate(&cfg)?;
    Ok((cfg, raw))
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.settings.read.interval < 0.0
        || cfg.settings.read.delay < 0.0
        || cfg.settings.write.interval < 0.0
        || cfg.settings.write.delay < 0.0
    {
        return Err(Error::Config(
            "intervals and delays can't be negative".into(),
        ));
    }

    if cfg.settings.read.queue_size == 0
        || cfg.settings.write.queue_size == 0
        || cfg.settings.write.batch_size == 0
    {
        return Err(Error::Config(
            "queue and batch sizes must be at least 1".into(),
        ));
    }

    if cfg.settings.transaction.ttl <= 0.0 {
        return Err(Error::Config(
            "'settings.transaction.ttl' must be positive".into(),
        ));
    }

    if cfg.settings.limiter.rate < 0.0 {
        return Err(Error::Config(
            "'settings.limiter.rate' can't be negative".into(),
        ));
    }

    if cfg.settings.cache.enabled && cfg.settings.cache.ttl <= 0.0 {
        return Err(Error::Config(
            "'settings.cache.ttl' must be positive".into(),
        ));
    }

    if cfg.network.tls.is_some() {
        return Err(Error::Config(
            "'network.tls' is not supported; terminate TLS in front \
             of the plugin"
                .into(),
        ));
    }

    for dev in &cfg.device {
        if dev.kind.is_empty() {
            return Err(Error::Config(
                "a [[device]] section is missing its 'type'".into(),
            ));
        }
        if let Some(scale) = dev.scale {
            if scale == 0.0 {
                return Err(Error::Config(format!(
                    "device of type '{}' has a scale of 0",
                    &dev.kind
                )));
            }
        }
    }

    Ok(())
}

async fn from_file(path: &str) -> Option<Result<(Config, value::Value)>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg(name: &str) -> Result<(Config, value::Value)> {
    // An explicit environment override wins; a plugin run under a
    // supervisor typically sets this.

    if let Ok(path) = env::var("MANIFOLD_PLUGIN_CONFIG") {
        if let Some(cfg) = from_file(&path).await {
            return cfg;
        }
        return Err(Error::Config(format!(
            "couldn't read config file '{}'",
            &path
        )));
    }

    // Create a vector of directories that could contain a
    // configuration file. The directories will be searched in their
    // order within the vector.

    let file_name = format!("{}.toml", name);
    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/manifold/"));
    dirs.push(String::from("/etc/manifold/"));

    // Iterate through the directories. The first file that is found
    // and can be parsed is used as the configuration.

    for dir in dirs {
        let file = format!("{}{}", &dir, &file_name);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok((Config::default(), value::Value::Table(value::Table::new())))
}

fn dump_config(raw: &value::Value) {
    println!("Configuration:");
    println!("{}", redact(raw));
}

/// Loads the configuration for the named plugin. Returns `None` if
/// the process should exit instead of running (after
/// `--print-config`, for instance.)
pub async fn get(name: &str) -> Option<Config> {
    match find_cfg(name).await {
        Ok(cfg) => {
            let (print_cfg, (cfg, raw)) = from_cmdline((cfg.0, cfg.1));

            if print_cfg {
                dump_config(&raw);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let (cfg, _) = parse_config("").unwrap();

        assert!(!cfg.debug);
        assert!(cfg.id.use_plugin_tag);
        assert!(!cfg.id.use_machine_id);
        assert_eq!(cfg.settings.mode, Mode::Serial);
        assert_eq!(cfg.settings.read.interval, 1.0);
        assert_eq!(cfg.settings.read.queue_size, 128);
        assert_eq!(cfg.settings.write.batch_size, 16);
        assert_eq!(cfg.settings.transaction.ttl, 300.0);
        assert_eq!(cfg.settings.limiter.rate, 0.0);
        assert!(!cfg.settings.cache.enabled);
        assert_eq!(cfg.network.kind, NetworkKind::Tcp);
        assert!(cfg.device.is_empty());
    }

    #[test]
    fn test_full_config() {
        let (cfg, _) = parse_config(
            r#"
debug = true

[id]
useMachineID = true
usePluginTag = false
useEnv = ["RACK"]
useCustom = ["site-a"]

[settings]
mode = "parallel"

[settings.read]
interval = 0.5
delay = 0.01
queueSize = 64

[settings.write]
interval = 2.0
queueSize = 32
batchSize = 4

[settings.transaction]
ttl = 60.0

[settings.limiter]
rate = 10.0
burst = 5

[settings.cache]
enabled = true
ttl = 30.0
maxSize = 16

[network]
type = "unix"
address = "example"

[health]
healthFile = "/tmp/manifold-health"

[health.checks]
disableDefaults = true

[[dynamicRegistration.config]]
base = "airflow"
count = 3

[[device]]
type = "temperature"
outputs = ["temperature"]
scale = 0.1

[device.metadata]
model = "mux8"

[device.data]
channel = 4

[[device]]
type = "led"
handler = "led"
outputs = ["state"]
"#,
        )
        .unwrap();

        assert!(cfg.debug);
        assert!(cfg.id.use_machine_id);
        assert!(!cfg.id.use_plugin_tag);
        assert_eq!(cfg.id.use_env, vec!["RACK"]);
        assert_eq!(cfg.id.use_custom, vec!["site-a"]);
        assert_eq!(cfg.settings.mode, Mode::Parallel);
        assert_eq!(cfg.settings.read.interval, 0.5);
        assert_eq!(cfg.settings.read.queue_size, 64);
        assert_eq!(cfg.settings.write.batch_size, 4);
        assert_eq!(cfg.settings.limiter.rate, 10.0);
        assert_eq!(cfg.settings.limiter.burst, 5);
        assert!(cfg.settings.cache.enabled);
        assert_eq!(cfg.settings.cache.max_size, 16);
        assert_eq!(cfg.network.kind, NetworkKind::Unix);
        assert_eq!(cfg.network.address, "example");
        assert_eq!(
            cfg.health.health_file.as_deref(),
            Some("/tmp/manifold-health")
        );
        assert!(cfg.health.checks.disable_defaults);
        assert_eq!(cfg.dynamic_registration.config.len(), 1);
        assert_eq!(cfg.device.len(), 2);
        assert_eq!(cfg.device[0].kind, "temperature");
        assert_eq!(cfg.device[0].handler_name(), "temperature");
        assert_eq!(cfg.device[0].scale, Some(0.1));
        assert_eq!(cfg.device[0].metadata["model"], "mux8");
        assert_eq!(cfg.device[1].handler_name(), "led");
    }

    #[test]
    fn test_validation() {
        assert!(parse_config(
            r#"
[settings.read]
interval = -1.0
"#
        )
        .is_err());
        assert!(parse_config(
            r#"
[settings.write]
queueSize = 0
"#
        )
        .is_err());
        assert!(parse_config(
            r#"
[settings.transaction]
ttl = 0.0
"#
        )
        .is_err());
        assert!(parse_config(
            r#"
[network.tls]
cert = "/x.pem"
"#
        )
        .is_err());
        assert!(parse_config(
            r#"
[[device]]
type = "t"
scale = 0.0
"#
        )
        .is_err());
    }

    #[test]
    fn test_redaction() {
        let val: value::Value = toml::from_str(
            r#"
[db]
pass = "s3cret"
host = "h"

[[accounts]]
name = "svc"
Password = "hunter2"

[outer]
passphrase = "x"
"#,
        )
        .unwrap();

        let redacted = redact(&val);

        // Every `pass`-keyed value is blotted out, other values
        // survive, and the original is untouched.

        assert_eq!(
            redacted["db"]["pass"],
            value::Value::String("REDACTED".into())
        );
        assert_eq!(
            redacted["db"]["host"],
            value::Value::String("h".into())
        );
        assert_eq!(
            redacted["accounts"][0]["Password"],
            value::Value::String("REDACTED".into())
        );
        assert_eq!(
            redacted["accounts"][0]["name"],
            value::Value::String("svc".into())
        );
        assert_eq!(
            redacted["outer"]["passphrase"],
            value::Value::String("REDACTED".into())
        );

        assert_eq!(
            val["db"]["pass"],
            value::Value::String("s3cret".into())
        );
        assert_eq!(
            val["accounts"][0]["Password"],
            value::Value::String("hunter2".into())
        );
    }
}
