use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// OpenAI Batch API の入力ファイル上限 (200 MB)。
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 200 * 1024 * 1024;
/// 1 バッチあたりのリクエスト数上限。
pub const DEFAULT_MAX_CHUNK_LINES: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("unknown log format: {other}")),
        }
    }
}

/// Host-level settings shared by every invocation.
///
/// Per-work submission settings live in [`crate::store::models::WorkConfig`] and are
/// snapshotted into the work record instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    data_dir: PathBuf,
    api_base_url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
    total_timeout: Duration,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    list_page_size: u32,
    max_chunk_bytes: u64,
    max_chunk_lines: usize,
    resident: bool,
    log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から設定値を読み込み、検証する。
    ///
    /// # Errors
    /// 数値やブール値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = match env::var_os("BATCHWORK_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };
        let api_base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/".to_string());
        let api_key = env::var("OPENAI_API_KEY").ok().filter(|key| !key.is_empty());

        let connect_timeout = parse_duration_ms("BATCHWORK_CONNECT_TIMEOUT_MS", 3000)?;
        // Result files can be large; keep the total budget generous.
        let total_timeout = parse_duration_ms("BATCHWORK_TOTAL_TIMEOUT_MS", 600_000)?;

        let http_max_retries = parse_usize("BATCHWORK_HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = parse_u64("BATCHWORK_HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = parse_u64("BATCHWORK_HTTP_BACKOFF_CAP_MS", 10000)?;

        let list_page_size = parse_u32("BATCHWORK_LIST_PAGE_SIZE", 100)?;
        if list_page_size == 0 || list_page_size > 100 {
            return Err(ConfigError::Invalid {
                name: "BATCHWORK_LIST_PAGE_SIZE",
                source: anyhow::anyhow!("value must be between 1 and 100"),
            });
        }
        let max_chunk_bytes = parse_u64("BATCHWORK_MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES)?;
        let max_chunk_lines = parse_usize("BATCHWORK_MAX_CHUNK_LINES", DEFAULT_MAX_CHUNK_LINES)?;
        if max_chunk_bytes == 0 || max_chunk_lines == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCHWORK_MAX_CHUNK_BYTES",
                source: anyhow::anyhow!("chunk limits must be greater than zero"),
            });
        }

        let resident = parse_bool("BATCHWORK_RESIDENT", false)?;
        let log_format = parse_from_str("BATCHWORK_LOG_FORMAT", LogFormat::Text)?;

        Ok(Self {
            data_dir,
            api_base_url,
            api_key,
            connect_timeout,
            total_timeout,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            list_page_size,
            max_chunk_bytes,
            max_chunk_lines,
            resident,
            log_format,
        })
    }

    /// Returns a copy rooted at `data_dir`; used by tests and embedding programs.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("works.sqlite")
    }

    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    #[must_use]
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    #[must_use]
    pub fn http_max_retries(&self) -> usize {
        self.http_max_retries
    }

    #[must_use]
    pub fn http_backoff_base_ms(&self) -> u64 {
        self.http_backoff_base_ms
    }

    #[must_use]
    pub fn http_backoff_cap_ms(&self) -> u64 {
        self.http_backoff_cap_ms
    }

    #[must_use]
    pub fn list_page_size(&self) -> u32 {
        self.list_page_size
    }

    #[must_use]
    pub fn max_chunk_bytes(&self) -> u64 {
        self.max_chunk_bytes
    }

    #[must_use]
    pub fn max_chunk_lines(&self) -> usize {
        self.max_chunk_lines
    }

    #[must_use]
    pub fn resident(&self) -> bool {
        self.resident
    }

    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".batchwork")
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let ms = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(ms))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_from_str<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = anyhow::Error>,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|source| ConfigError::Invalid { name, source }),
        Err(_) => Ok(default),
    }
}
