//! Configuration: environment variables and a `KEY=VALUE` config file are
//! equivalent read-only parameter sources; the environment wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use scr_api_types::CopyType;

lazy_static! {
    static ref CONFIG_LINE_REGEX: Regex =
        Regex::new(r"^\s*([A-Za-z0-9_]+)\s*=\s*(.*?)\s*$").unwrap();
}

/// Read-only key/value source for configuration parameters.
pub trait ParamSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment.
pub struct EnvSource;

impl ParamSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// `KEY=VALUE` lines; `#` starts a comment.
pub struct FileSource {
    values: HashMap<String, String>,
}

impl FileSource {
    pub fn parse(data: &str) -> Self {
        let mut values = HashMap::new();
        for line in data.lines() {
            let line = line.split('#').next().unwrap_or("");
            if let Some(caps) = CONFIG_LINE_REGEX.captures(line) {
                values.insert(caps[1].to_owned(), caps[2].to_owned());
            }
        }
        Self { values }
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)
            .map_err(|err| format_err!("unable to read config file {:?} - {}", path, err))?;
        Ok(Self::parse(&data))
    }
}

impl ParamSource for FileSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Layered parameter lookup, first source wins.
#[derive(Default)]
pub struct Params {
    sources: Vec<Box<dyn ParamSource + Send + Sync>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self) -> Self {
        self.sources.push(Box::new(EnvSource));
        self
    }

    pub fn with_source(mut self, source: impl ParamSource + Send + Sync + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.get(key))
    }
}

/// The full configuration surface, with the library's defaults.
#[derive(Clone, Debug)]
pub struct Config {
    pub enabled: bool,
    pub debug: u32,
    pub log_enable: bool,

    pub username: Option<String>,
    pub jobid: Option<String>,
    pub jobname: Option<String>,

    pub cntl_base: PathBuf,
    pub cache_base: PathBuf,
    /// Checkpoints to keep per cache base.
    pub cache_size: usize,

    pub copy_type: CopyType,
    pub hop_distance: usize,
    pub set_size: usize,

    pub halt_seconds: u64,

    /// Chunk size for pairwise file exchanges.
    pub mpi_buf_size: usize,
    /// Buffer size for cache<->PFS file copies.
    pub file_buf_size: usize,

    pub distribute: bool,
    pub fetch: bool,
    pub fetch_width: usize,

    /// Flush every N checkpoints; 0 disables flushing.
    pub flush: u64,
    pub flush_width: usize,
    pub flush_on_restart: bool,
    pub global_restart: bool,

    pub flush_async: bool,
    pub flush_async_bw: f64,
    pub flush_async_percent: f64,

    pub crc_on_copy: bool,
    pub crc_on_flush: bool,
    pub crc_on_delete: bool,

    pub checkpoint_interval: u64,
    pub checkpoint_seconds: u64,
    pub checkpoint_overhead: f64,

    /// Parallel file system prefix.
    pub prefix: PathBuf,

    /// Override the node name; defaults to `gethostname`.
    pub hostname: Option<String>,

    /// Terminate the process when a halt condition fires (the production
    /// behavior); tests disable this and observe the halted flag instead.
    pub exit_on_halt: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: 0,
            log_enable: true,
            username: std::env::var("USER").ok(),
            jobid: std::env::var("SLURM_JOBID").ok(),
            jobname: None,
            cntl_base: PathBuf::from("/tmp"),
            cache_base: PathBuf::from("/tmp"),
            cache_size: 2,
            copy_type: CopyType::Xor,
            hop_distance: 1,
            set_size: 8,
            halt_seconds: 0,
            mpi_buf_size: 128 * 1024,
            file_buf_size: 1024 * 1024,
            distribute: true,
            fetch: true,
            fetch_width: 256,
            flush: 10,
            flush_width: 256,
            flush_on_restart: false,
            global_restart: false,
            flush_async: false,
            flush_async_bw: 0.0,
            flush_async_percent: 0.0,
            crc_on_copy: false,
            crc_on_flush: true,
            crc_on_delete: false,
            checkpoint_interval: 0,
            checkpoint_seconds: 0,
            checkpoint_overhead: 0.0,
            prefix: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            hostname: None,
            exit_on_halt: true,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value.parse::<i64>().map(|v| v != 0).unwrap_or(false)
}

impl Config {
    /// Apply the parameter surface over the defaults.
    pub fn from_params(params: &Params) -> Result<Self, Error> {
        let mut config = Config::default();

        if let Some(v) = params.get("SCR_ENABLE") {
            config.enabled = parse_bool(&v);
        }
        if !config.enabled {
            return Ok(config);
        }

        if let Some(v) = params.get("SCR_DEBUG") {
            config.debug = v.parse().unwrap_or(0);
        }
        if let Some(v) = params.get("SCR_LOG_ENABLE") {
            config.log_enable = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_USER_NAME") {
            config.username = Some(v);
        }
        if let Some(v) = params.get("SCR_JOB_ID") {
            config.jobid = Some(v);
        }
        if let Some(v) = params.get("SCR_JOB_NAME") {
            config.jobname = Some(v);
        }
        if let Some(v) = params.get("SCR_CNTL_BASE") {
            config.cntl_base = PathBuf::from(v);
        }
        if let Some(v) = params.get("SCR_CACHE_BASE") {
            config.cache_base = PathBuf::from(v);
        }
        if let Some(v) = params.get("SCR_CACHE_SIZE") {
            config.cache_size = v.parse()?;
        }
        if let Some(v) = params.get("SCR_COPY_TYPE") {
            if v.eq_ignore_ascii_case("FILE") {
                bail!(
                    "SCR_COPY_TYPE=FILE (descriptor lists from a config file) is not supported; \
                     use LOCAL, PARTNER or XOR"
                );
            }
            config.copy_type = v.parse()?;
        }
        if let Some(v) = params.get("SCR_SET_SIZE") {
            config.set_size = v.parse()?;
        }
        if let Some(v) = params.get("SCR_HOP_DISTANCE") {
            config.hop_distance = v.parse()?;
        }
        if let Some(v) = params.get("SCR_HALT_SECONDS") {
            config.halt_seconds = v.parse()?;
        }
        if let Some(v) = params.get("SCR_MPI_BUF_SIZE") {
            config.mpi_buf_size = parse_byte_count(&v)?;
        }
        if let Some(v) = params.get("SCR_FILE_BUF_SIZE") {
            config.file_buf_size = parse_byte_count(&v)?;
        }
        if let Some(v) = params.get("SCR_DISTRIBUTE") {
            config.distribute = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_FETCH") {
            config.fetch = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_FETCH_WIDTH") {
            config.fetch_width = v.parse()?;
        }
        if let Some(v) = params.get("SCR_FLUSH") {
            config.flush = v.parse()?;
        }
        if let Some(v) = params.get("SCR_FLUSH_WIDTH") {
            config.flush_width = v.parse()?;
        }
        if let Some(v) = params.get("SCR_FLUSH_ON_RESTART") {
            config.flush_on_restart = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_GLOBAL_RESTART") {
            config.global_restart = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_FLUSH_ASYNC") {
            config.flush_async = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_FLUSH_ASYNC_BW") {
            config.flush_async_bw = v.parse()?;
        }
        if let Some(v) = params.get("SCR_FLUSH_ASYNC_PERCENT") {
            config.flush_async_percent = v.parse()?;
        }
        if let Some(v) = params.get("SCR_CRC_ON_COPY") {
            config.crc_on_copy = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_CRC_ON_FLUSH") {
            config.crc_on_flush = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_CRC_ON_DELETE") {
            config.crc_on_delete = parse_bool(&v);
        }
        if let Some(v) = params.get("SCR_CHECKPOINT_INTERVAL") {
            config.checkpoint_interval = v.parse()?;
        }
        if let Some(v) = params.get("SCR_CHECKPOINT_SECONDS") {
            config.checkpoint_seconds = v.parse()?;
        }
        if let Some(v) = params.get("SCR_CHECKPOINT_OVERHEAD") {
            config.checkpoint_overhead = v.parse()?;
        }
        if let Some(v) = params.get("SCR_PREFIX") {
            config.prefix = PathBuf::from(v);
        }

        Ok(config)
    }

    pub fn username(&self) -> Result<&str, Error> {
        self.username
            .as_deref()
            .ok_or_else(|| format_err!("username is not set; set SCR_USER_NAME"))
    }

    pub fn jobid(&self) -> Result<&str, Error> {
        self.jobid
            .as_deref()
            .ok_or_else(|| format_err!("jobid is not set; set SCR_JOB_ID"))
    }
}

/// Byte counts accept an optional `KB`/`MB`/`GB` suffix.
fn parse_byte_count(value: &str) -> Result<usize, Error> {
    let value = value.trim();
    let (digits, mult) = match value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
    {
        None => (value, 1usize),
        Some(split) => {
            let mult = match value[split..].trim().to_uppercase().as_str() {
                "KB" | "K" => 1024,
                "MB" | "M" => 1024 * 1024,
                "GB" | "G" => 1024 * 1024 * 1024,
                "B" | "" => 1,
                other => bail!("unknown byte suffix '{}'", other),
            };
            (&value[..split], mult)
        }
    };
    let count: usize = digits
        .parse()
        .map_err(|_| format_err!("invalid byte count '{}'", value))?;
    Ok(count * mult)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_source_parses_lines() {
        let src = FileSource::parse(
            "# comment\nSCR_COPY_TYPE = PARTNER\nSCR_CACHE_SIZE=3 # trailing\n\nbadline\n",
        );
        assert_eq!(src.get("SCR_COPY_TYPE").as_deref(), Some("PARTNER"));
        assert_eq!(src.get("SCR_CACHE_SIZE").as_deref(), Some("3"));
        assert_eq!(src.get("SCR_FLUSH"), None);
    }

    #[test]
    fn layered_lookup_and_defaults() {
        let params = Params::new()
            .with_source(FileSource::parse("SCR_SET_SIZE=4\nSCR_MPI_BUF_SIZE=64KB\n"));
        let config = Config::from_params(&params).unwrap();
        assert_eq!(config.set_size, 4);
        assert_eq!(config.mpi_buf_size, 64 * 1024);
        assert_eq!(config.copy_type, CopyType::Xor);
        assert_eq!(config.cache_size, 2);
    }

    #[test]
    fn byte_counts() {
        assert_eq!(parse_byte_count("4096").unwrap(), 4096);
        assert_eq!(parse_byte_count("1MB").unwrap(), 1024 * 1024);
        assert_eq!(parse_byte_count("2 K").unwrap(), 2048);
        assert!(parse_byte_count("12XB").is_err());
    }
}
