//! # Configuration Registry
//!
//! A process-wide, dotted-key configuration store consumed by the clock
//! domains, TSpec tables, and audio/CRF streams. Values are looked up by
//! name at the point of use rather than threaded through constructors, the
//! same shape the original environment's config plugin presented to the
//! core.
//!
//! Keys are resolved in this order: an environment variable named
//! `AVB_<KEY_WITH_UNDERSCORES_UPPERCASED>`, then a `config.toml` /
//! `avb_config.toml` file in the current directory, then the built-in
//! default. Unknown keys passed to [`get_string`] / [`get_u64`] with no
//! registered default return `None` and log a warning, matching "unknown
//! keys are ignored with a warning."

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::RwLock;

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::new());
}

/// A single configuration value, either a string or an unsigned 64-bit
/// integer, mirroring the two value kinds the original registry exposed.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    /// A string-valued entry (e.g. `compatibility.audio`).
    Str(String),
    /// A uint64-valued entry (e.g. `tspec.interval.high`).
    U64(u64),
}

/// The resolved configuration snapshot: defaults overlaid with
/// environment variables, then a `config.toml`/`avb_config.toml` file.
#[derive(Debug, Clone)]
pub struct Config {
    values: HashMap<String, ConfigValue>,
}

fn defaults() -> HashMap<String, ConfigValue> {
    use ConfigValue::{Str, U64};
    let mut m = HashMap::new();
    // Traffic specification tables (class A / high = 125us, class B / low = 250us).
    m.insert("tspec.interval.high".into(), U64(125_000));
    m.insert("tspec.interval.low".into(), U64(250_000));
    m.insert("tspec.vlanid.high".into(), U64(2));
    m.insert("tspec.vlanid.low".into(), U64(2));
    m.insert("tspec.vlanprio.high".into(), U64(3));
    m.insert("tspec.vlanprio.low".into(), U64(2));
    m.insert("tspec.presenttime.high".into(), U64(2_000_000));
    m.insert("tspec.presenttime.low".into(), U64(50_000_000));

    m.insert("audio.clock.timeout".into(), U64(2_000_000_000));
    m.insert("audio.clock.bend.rate".into(), U64(0));
    m.insert("audio.clock.bend.max".into(), U64(0));
    m.insert("audio.clock.bend.stream".into(), Str(String::new()));
    m.insert("xmit.clk.updateinterval".into(), U64(0));
    m.insert("clock.hwcapture.nominal".into(), U64(0));

    m.insert("clk.recovery.from".into(), Str(String::new()));
    m.insert("clk.recovery.using".into(), Str(String::new()));
    m.insert("clk.rx.timeconstant".into(), U64(100));
    m.insert("clk.rx.deviation.longterm".into(), U64(10_000));
    m.insert("clk.rx.deviation.unlock".into(), U64(1_000));
    m.insert("clk.rx.lock.threshold1".into(), U64(10_000));
    m.insert("clk.rx.lock.threshold2".into(), U64(100));
    m.insert("clk.sw.timeconstant".into(), U64(20_000));
    m.insert("clk.sw.deviation.longterm".into(), U64(50_000));
    m.insert("clk.sw.deviation.unlock".into(), U64(500));
    m.insert("clk.sw.lock.threshold1".into(), U64(1_000_000));
    m.insert("clk.sw.lock.threshold2".into(), U64(100));

    m.insert("clock.ctrl.gain".into(), U64(100)); // scaled 1e-9, see clock::controller defaults
    m.insert("clock.ctrl.coeff1".into(), U64(500_000)); // scaled 1e-6
    m.insert("clock.ctrl.coeff2".into(), U64(500_000)); // scaled 1e-6
    m.insert("clock.ctrl.coeff3".into(), U64(800_000)); // scaled 1e-6
    m.insert("clock.ctrl.coeff4".into(), U64(0));
    m.insert("clock.ctrl.holdoff".into(), U64(60_000)); // microseconds
    m.insert("clock.ctrl.wait".into(), U64(25_000));
    m.insert("clock.ctrl.lockcount".into(), U64(5));
    m.insert("clock.ctrl.lockthreshold".into(), U64(2)); // scaled 1e-6
    m.insert("clock.ctrl.engage".into(), U64(1));

    m.insert("rx.validation.mode".into(), U64(1)); // once
    m.insert("rx.validation.threshold".into(), U64(100));
    m.insert("rx.clk.updateinterval".into(), U64(0));
    m.insert("rx.excess.payload".into(), U64(0));
    m.insert("crf.rx.holdoff".into(), U64(100));

    m.insert("compatibility.audio".into(), Str(String::new()));
    m.insert("audio.tstamp.sparse".into(), U64(0));
    m.insert("audio.tstamp.buffer".into(), U64(0));

    m.insert("testtone.gain".into(), U64(0x7FFF));
    m.insert("testtone.saturate".into(), U64(1));
    m
}

impl Config {
    fn new() -> Self {
        let mut config = Config { values: defaults() };

        for (key, value) in config.values.clone() {
            let env_key = format!("AVB_{}", key.to_uppercase().replace('.', "_"));
            if let Ok(raw) = env::var(&env_key) {
                config.apply_override(&key, &raw, &value);
            }
        }

        let config_paths = ["./config.toml", "./avb_config.toml"];
        for path in &config_paths {
            if let Ok(mut file) = File::open(path) {
                let mut content = String::new();
                if file.read_to_string(&mut content).is_ok() {
                    config.apply_toml_lines(&content);
                }
            }
        }

        config
    }

    fn apply_override(&mut self, key: &str, raw: &str, current: &ConfigValue) {
        let raw = raw.trim();
        match current {
            ConfigValue::U64(_) => {
                if let Ok(v) = raw.parse::<u64>() {
                    self.values.insert(key.to_string(), ConfigValue::U64(v));
                } else {
                    log::warn!("config key {} expects a u64, got {:?}", key, raw);
                }
            }
            ConfigValue::Str(_) => {
                self.values
                    .insert(key.to_string(), ConfigValue::Str(raw.to_string()));
            }
        }
    }

    fn apply_toml_lines(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');

            match self.values.get(key).cloned() {
                Some(current) => self.apply_override(key, value, &current),
                None => log::warn!("ignoring unknown configuration key {:?}", key),
            }
        }
    }

    /// Re-resolves the global configuration from scratch (defaults,
    /// environment, then file), replacing whatever was previously loaded.
    pub fn reload() {
        let new_config = Config::new();
        if let Ok(mut config) = CONFIG.write() {
            *config = new_config;
        }
    }
}

/// Returns a uint64-valued configuration entry, or `None` if the key is
/// unregistered.
pub fn get_u64(key: &str) -> Option<u64> {
    match CONFIG.read().unwrap().values.get(key) {
        Some(ConfigValue::U64(v)) => Some(*v),
        Some(ConfigValue::Str(_)) => {
            log::warn!("config key {} is string-valued, not u64", key);
            None
        }
        None => {
            log::warn!("unknown configuration key {:?}", key);
            None
        }
    }
}

/// Returns a string-valued configuration entry, or `None` if the key is
/// unregistered.
pub fn get_string(key: &str) -> Option<String> {
    match CONFIG.read().unwrap().values.get(key) {
        Some(ConfigValue::Str(v)) => Some(v.clone()),
        Some(ConfigValue::U64(_)) => {
            log::warn!("config key {} is u64-valued, not string", key);
            None
        }
        None => {
            log::warn!("unknown configuration key {:?}", key);
            None
        }
    }
}

/// Creates a default config template file if it doesn't exist.
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# AVB stream handler configuration
# This is a template. Replace the values with your actual configuration.

tspec.interval.high = "125000"
rx.validation.threshold = "100"
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_spec_keys() {
        assert_eq!(get_u64("tspec.interval.high"), Some(125_000));
        assert_eq!(get_u64("rx.validation.threshold"), Some(100));
        assert_eq!(get_string("compatibility.audio"), Some(String::new()));
    }

    #[test]
    fn unknown_key_returns_none() {
        assert_eq!(get_u64("no.such.key"), None);
    }
}
