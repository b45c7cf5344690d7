// TGD - CONFIGURATION
// Defaults, then an optional `key = value` file, then TGD_* environment
// variables, then command-line flags. Later layers win. Section headers in the
// file only group keys; every key name is global.

use std::path::Path;
use std::time::Duration;

use log::LevelFilter;

use crate::error::{Result, TgdError};
use crate::protocol::amsdu::FrameFormat;
use crate::protocol::fw_msg::QUEUE_STATS_MAX_LINKS;
use crate::route::{BackendChoice, BackendKind, BackendOptions};

const ENV_PREFIX: &str = "TGD_";

const KEYS: [&str; 10] = [
    "num_virt_links", "auto_up", "frame_format", "fc_enable", "bh_flow_control", "queue_stats",
    "qstats_tick_ms", "backend", "dpaa2_handle_local", "log_level",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TgdConfig {
    /// Link interfaces per radio.
    pub num_virt_links: usize,
    /// Open every radio right after probe.
    pub auto_up: bool,
    pub frame_format: FrameFormat,
    pub fc_enable: bool,
    pub bh_flow_control: bool,
    pub queue_stats: bool,
    pub qstats_tick_ms: u64,
    pub backend: BackendChoice,
    pub dpaa2_handle_local: bool,
    pub log_level: LevelFilter,
}

impl Default for TgdConfig {
    fn default() -> Self {
        TgdConfig {
            num_virt_links: 2,
            auto_up: true,
            frame_format: FrameFormat::Short,
            fc_enable: true,
            bh_flow_control: true,
            queue_stats: true,
            qstats_tick_ms: 20,
            backend: BackendChoice::Auto,
            dpaa2_handle_local: false,
            log_level: LevelFilter::Info,
        }
    }
}

fn invalid(key: &str, value: &str) -> TgdError {
    TgdError::Config(format!("invalid value {:?} for {}", value, key))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_backend(value: &str) -> Result<BackendChoice> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "auto" => BackendChoice::Auto,
        "linux" => BackendChoice::Only(BackendKind::Linux),
        "nss" => BackendChoice::Only(BackendKind::Nss),
        "pfe" => BackendChoice::Only(BackendKind::Pfe),
        "dpaa2" => BackendChoice::Only(BackendKind::Dpaa2),
        _ => return Err(invalid("backend", value)),
    })
}

fn parse_level(value: &str) -> Result<LevelFilter> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return Err(invalid("log_level", value)),
    })
}

impl TgdConfig {
    /// Apply one setting. Unknown keys are errors.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "num_virt_links" => {
                let n: usize = value.parse().map_err(|_| invalid(key, value))?;
                if n == 0 || n > QUEUE_STATS_MAX_LINKS {
                    return Err(TgdError::Config(format!("num_virt_links must be 1..={}", QUEUE_STATS_MAX_LINKS)));
                }
                self.num_virt_links = n;
            }
            "auto_up" => self.auto_up = parse_bool(key, value)?,
            "frame_format" => {
                self.frame_format = match value.to_ascii_lowercase().as_str() {
                    "short" => FrameFormat::Short,
                    "std" => FrameFormat::StdShort,
                    _ => return Err(invalid(key, value)),
                }
            }
            "fc_enable" => self.fc_enable = parse_bool(key, value)?,
            "bh_flow_control" => self.bh_flow_control = parse_bool(key, value)?,
            "queue_stats" => self.queue_stats = parse_bool(key, value)?,
            "qstats_tick_ms" => {
                let ms: u64 = value.parse().map_err(|_| invalid(key, value))?;
                if ms == 0 {
                    return Err(invalid(key, value));
                }
                self.qstats_tick_ms = ms;
            }
            "backend" => self.backend = parse_backend(value)?,
            "dpaa2_handle_local" => self.dpaa2_handle_local = parse_bool(key, value)?,
            "log_level" => self.log_level = parse_level(value)?,
            _ => return Err(TgdError::Config(format!("unknown key {}", key))),
        }
        Ok(())
    }

    /// Overlay `TGD_<KEY>` variables. Names outside the key set are skipped
    /// (see [`unknown_env`]); bad values for known keys are errors.
    pub fn apply_env<I: IntoIterator<Item = (String, String)>>(&mut self, vars: I) -> Result<()> {
        for (name, value) in vars {
            let Some(key) = env_key(&name) else { continue };
            self.set(&key, &value)?;
        }
        Ok(())
    }

    /// Daemon command line: `--config PATH --links N --log-level L --backend B`.
    /// `env` is the process environment, passed in so callers control it.
    pub fn from_args<I>(args: &[String], env: I) -> Result<TgdConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut flags: Vec<(&str, &str)> = Vec::new();
        let mut path: Option<&str> = None;
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let key = match flag {
                "--config" => None,
                "--links" => Some("num_virt_links"),
                "--log-level" => Some("log_level"),
                "--backend" => Some("backend"),
                other => return Err(TgdError::Config(format!("unknown argument {}", other))),
            };
            i += 1;
            let value = args.get(i).ok_or_else(|| TgdError::Config(format!("{} needs a value", flag)))?;
            match key {
                Some(k) => flags.push((k, value.as_str())),
                None => path = Some(value.as_str()),
            }
            i += 1;
        }

        let mut cfg = match path {
            Some(p) => load_config(Path::new(p))?,
            None => TgdConfig::default(),
        };
        cfg.apply_env(env)?;
        for (k, v) in flags {
            cfg.set(k, v)?;
        }
        Ok(cfg)
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            choice: self.backend,
            format: self.frame_format,
            dpaa2_handle_local: self.dpaa2_handle_local,
            ..BackendOptions::default()
        }
    }

    pub fn qstats_tick(&self) -> Duration { Duration::from_millis(self.qstats_tick_ms) }
}

/// Parse file text on top of the defaults. `#` and `;` start comments.
pub fn parse_config(text: &str) -> Result<TgdConfig> {
    let mut cfg = TgdConfig::default();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.split(['#', ';']).next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            if !line.ends_with(']') || line.len() < 3 {
                return Err(TgdError::Config(format!("line {}: bad section header", n + 1)));
            }
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| TgdError::Config(format!("line {}: expected key = value", n + 1)))?;
        cfg.set(key.trim(), value)
            .map_err(|e| TgdError::Config(format!("line {}: {}", n + 1, e)))?;
    }
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<TgdConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TgdError::Config(format!("{}: {}", path.display(), e)))?;
    parse_config(&text)
}

fn env_key(name: &str) -> Option<String> {
    let key = name.strip_prefix(ENV_PREFIX)?.to_ascii_lowercase();
    KEYS.contains(&key.as_str()).then_some(key)
}

/// `TGD_*` variables that name no setting. The daemon warns about these once
/// its logger is up.
pub fn unknown_env<I: IntoIterator<Item = (String, String)>>(vars: I) -> Vec<String> {
    vars.into_iter()
        .map(|(name, _)| name)
        .filter(|name| name.starts_with(ENV_PREFIX) && env_key(name).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn file_overrides_defaults() {
        let cfg = parse_config(
            "# radio setup\n\
             [driver]\n\
             num_virt_links = 4\n\
             backend = dpaa2   ; offload\n\
             [datapath]\n\
             frame_format = std\n\
             queue_stats = off\n",
        )
        .unwrap();
        assert_eq!(cfg.num_virt_links, 4);
        assert_eq!(cfg.backend, BackendChoice::Only(BackendKind::Dpaa2));
        assert_eq!(cfg.frame_format, FrameFormat::StdShort);
        assert!(!cfg.queue_stats);
        assert!(cfg.auto_up);
        assert_eq!(cfg.qstats_tick(), Duration::from_millis(20));
    }

    #[test]
    fn bad_input_is_a_config_error() {
        assert!(matches!(parse_config("num_virt_links = 0"), Err(TgdError::Config(_))));
        assert!(matches!(parse_config("num_virt_links = 17"), Err(TgdError::Config(_))));
        assert!(matches!(parse_config("auto_up = maybe"), Err(TgdError::Config(_))));
        assert!(matches!(parse_config("colour = blue"), Err(TgdError::Config(_))));
        assert!(matches!(parse_config("[driver"), Err(TgdError::Config(_))));
        assert!(matches!(parse_config("backend"), Err(TgdError::Config(_))));
    }

    #[test]
    fn env_then_flags() {
        let env = vec![
            ("TGD_LOG_LEVEL".to_string(), "debug".to_string()),
            ("TGD_NUM_VIRT_LINKS".to_string(), "3".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let cfg = TgdConfig::from_args(&args(&["--links", "5", "--backend", "linux"]), env).unwrap();
        assert_eq!(cfg.log_level, LevelFilter::Debug);
        assert_eq!(cfg.num_virt_links, 5);
        assert_eq!(cfg.backend_options().choice, BackendChoice::Only(BackendKind::Linux));
    }

    #[test]
    fn bad_arguments() {
        assert!(TgdConfig::from_args(&args(&["--links"]), Vec::new()).is_err());
        assert!(TgdConfig::from_args(&args(&["--verbose"]), Vec::new()).is_err());
        assert!(TgdConfig::from_args(&args(&["--config", "/nonexistent/tgd.conf"]), Vec::new()).is_err());
        let env = vec![("TGD_AUTO_UP".to_string(), "maybe".to_string())];
        assert!(TgdConfig::from_args(&[], env).is_err());
    }

    #[test]
    fn foreign_env_names_are_skipped() {
        let env = || vec![
            ("TGD_HOME".to_string(), "/opt/tgd".to_string()),
            ("TGD_BACKEND".to_string(), "pfe".to_string()),
            ("TGD_".to_string(), String::new()),
            ("PATH".to_string(), "/bin".to_string()),
        ];
        let cfg = TgdConfig::from_args(&[], env()).unwrap();
        assert_eq!(cfg.backend, BackendChoice::Only(BackendKind::Pfe));
        assert_eq!(unknown_env(env()), vec!["TGD_HOME".to_string(), "TGD_".to_string()]);
    }
}
