use std::{
    collections::HashMap,
    env, fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    use_env: bool,
    pub config_path: PathBuf,
}

impl Config {
    /// Defaults, then the rc file if present, then `NBCALL_*` environment variables.
    pub fn load() -> Self {
        let config_path = default_config_path();
        let mut map = default_map();

        if config_path.exists() {
            if let Ok(file) = fs::File::open(&config_path) {
                read_pairs(BufReader::new(file), &mut map);
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self {
            inner: map,
            use_env: true,
            config_path,
        }
    }

    /// Defaults overlaid by one rc file. The environment is not consulted.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut map = default_map();
        let file = fs::File::open(path)
            .with_context(|| format!("reading config file: {}", path.display()))?;
        read_pairs(BufReader::new(file), &mut map);
        Ok(Self {
            inner: map,
            use_env: false,
            config_path: path.to_path_buf(),
        })
    }

    /// Defaults overlaid by explicit pairs. The environment is not consulted.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = default_map();
        for (k, v) in pairs {
            map.insert(k.into(), v.into());
        }
        Self {
            inner: map,
            use_env: false,
            config_path: default_config_path(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if self.use_env {
            if let Ok(v) = env::var(key) {
                return Some(v);
            }
        }
        self.inner.get(key).filter(|v| !v.is_empty()).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    pub fn kernel_name(&self) -> String {
        self.get("NBCALL_KERNEL_NAME")
            .unwrap_or_else(|| DEFAULT_KERNEL_NAME.to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.get_u64("NBCALL_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        )
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.get_u64("NBCALL_UNIT_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.get_usize("NBCALL_MAX_OUTPUT_BYTES")
            .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(
            self.get_u64("NBCALL_GRACE_PERIOD_MS")
                .unwrap_or(DEFAULT_GRACE_PERIOD_MS),
        )
    }

    pub fn log_level(&self) -> String {
        self.get("NBCALL_LOG").unwrap_or_else(|| "info".to_string())
    }
}

/// Typed engine settings parsed from a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub kernel_name: String,
    pub timeout: Duration,
    pub unit_timeout: Option<Duration>,
    pub max_output_bytes: usize,
    pub grace_period: Duration,
    pub continue_on_warning: bool,
    /// Interpreter override for python kernels.
    pub python: Option<PathBuf>,
}

impl KernelConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            kernel_name: cfg.kernel_name(),
            timeout: cfg.timeout(),
            unit_timeout: cfg.unit_timeout(),
            max_output_bytes: cfg.max_output_bytes(),
            grace_period: cfg.grace_period(),
            continue_on_warning: cfg.get_bool("NBCALL_CONTINUE_ON_WARNING"),
            python: cfg.get_path("NBCALL_PYTHON"),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            unit_timeout: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            continue_on_warning: false,
            python: None,
        }
    }
}

pub const DEFAULT_KERNEL_NAME: &str = "python3";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2000;

fn read_pairs<R: BufRead>(reader: R, map: &mut HashMap<String, String>) {
    for line in reader.lines().map_while(|l| l.ok()) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "NBCALL_KERNEL_NAME",
        "NBCALL_TIMEOUT_SECONDS",
        "NBCALL_UNIT_TIMEOUT_SECONDS",
        "NBCALL_MAX_OUTPUT_BYTES",
        "NBCALL_GRACE_PERIOD_MS",
        "NBCALL_CONTINUE_ON_WARNING",
        "NBCALL_PYTHON",
        "NBCALL_LOG",
    ];

    // NBCALL_* for forward-compat
    KEYS.contains(&k) || k.starts_with("NBCALL_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("nbcall").join("nbcallrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    m.insert("NBCALL_KERNEL_NAME".into(), DEFAULT_KERNEL_NAME.into());
    m.insert("NBCALL_LOG".into(), "info".into());

    // Numbers
    m.insert(
        "NBCALL_TIMEOUT_SECONDS".into(),
        DEFAULT_TIMEOUT_SECONDS.to_string(),
    );
    m.insert(
        "NBCALL_MAX_OUTPUT_BYTES".into(),
        DEFAULT_MAX_OUTPUT_BYTES.to_string(),
    );
    m.insert(
        "NBCALL_GRACE_PERIOD_MS".into(),
        DEFAULT_GRACE_PERIOD_MS.to_string(),
    );

    // Bools as strings
    m.insert("NBCALL_CONTINUE_ON_WARNING".into(), "false".into());

    m
}
