use crate::error::ForecourtError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Built-in defaults, in the same INI shape the configuration file uses.
/// A missing file or a missing section falls back to these values.
const DEFAULT_CONFIGURATION: &str = "\
[sql]
thread_pool_size=5
lazy_worker=false

[ipc_endpoint]
database_name=forecourt
threads=104
admin_sessions=1

[stream_endpoint]
port=12345
threads=104

[fdw]
name=forecourt
threads=104

[data_store]
log_location=
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlConfig {
    pub thread_pool_size: usize,
    pub lazy_worker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEndpointConfig {
    pub database_name: String,
    pub threads: usize,
    pub admin_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpointConfig {
    pub port: u16,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdwConfig {
    pub name: String,
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreConfig {
    /// Filesystem path of the transaction log; empty means logging disabled.
    pub log_location: String,
}

/// Whole-server configuration assembled from the INI file layered over the
/// built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub sql: SqlConfig,
    pub ipc_endpoint: IpcEndpointConfig,
    pub stream_endpoint: StreamEndpointConfig,
    pub fdw: FdwConfig,
    pub data_store: DataStoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults =
            parse_ini(DEFAULT_CONFIGURATION).expect("built-in default configuration must parse");
        Self::from_sections(&defaults).expect("built-in default configuration must be complete")
    }
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

impl ServerConfig {
    /// Loads configuration from `path`. A missing file yields the defaults;
    /// a present file has its sections layered over the defaults key by key.
    /// A section name the defaults do not know is an orphan entry and fails
    /// the load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForecourtError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "configuration file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ForecourtError::Io(e)),
        };
        Self::parse(&text)
    }

    /// Parses an INI document layered over the defaults. Exposed separately
    /// so tests and tools can feed configuration text directly.
    pub fn parse(text: &str) -> Result<Self, ForecourtError> {
        let mut sections =
            parse_ini(DEFAULT_CONFIGURATION).expect("built-in default configuration must parse");
        let overrides = parse_ini(text)?;
        for (name, entries) in overrides {
            let Some(section) = sections.get_mut(&name) else {
                return Err(ForecourtError::ConfigOrphan { section: name });
            };
            for (key, value) in entries {
                section.insert(key, value);
            }
        }
        Self::from_sections(&sections)
    }

    fn from_sections(sections: &Sections) -> Result<Self, ForecourtError> {
        Ok(Self {
            sql: SqlConfig {
                thread_pool_size: get_parsed(sections, "sql", "thread_pool_size")?,
                lazy_worker: get_parsed(sections, "sql", "lazy_worker")?,
            },
            ipc_endpoint: IpcEndpointConfig {
                database_name: get_raw(sections, "ipc_endpoint", "database_name")?.to_string(),
                threads: get_parsed(sections, "ipc_endpoint", "threads")?,
                admin_sessions: get_parsed(sections, "ipc_endpoint", "admin_sessions")?,
            },
            stream_endpoint: StreamEndpointConfig {
                port: get_parsed(sections, "stream_endpoint", "port")?,
                threads: get_parsed(sections, "stream_endpoint", "threads")?,
            },
            fdw: FdwConfig {
                name: get_raw(sections, "fdw", "name")?.to_string(),
                threads: get_parsed(sections, "fdw", "threads")?,
            },
            data_store: DataStoreConfig {
                log_location: get_raw(sections, "data_store", "log_location")?.to_string(),
            },
        })
    }
}

fn get_raw<'a>(sections: &'a Sections, section: &str, key: &str) -> Result<&'a str, ForecourtError> {
    sections
        .get(section)
        .and_then(|entries| entries.get(key))
        .map(String::as_str)
        .ok_or_else(|| ForecourtError::ConfigParse(format!("missing [{section}] {key}")))
}

fn get_parsed<T>(sections: &Sections, section: &str, key: &str) -> Result<T, ForecourtError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_raw(sections, section, key)?;
    raw.parse::<T>()
        .map_err(|e| ForecourtError::ConfigParse(format!("[{section}] {key}={raw}: {e}")))
}

fn parse_ini(text: &str) -> Result<Sections, ForecourtError> {
    let mut sections: Sections = BTreeMap::new();
    let mut current: Option<String> = None;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or_else(|| {
                ForecourtError::ConfigParse(format!("line {}: unterminated section", lineno + 1))
            })?;
            current = Some(name.trim().to_string());
            sections.entry(name.trim().to_string()).or_default();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ForecourtError::ConfigParse(format!(
                "line {}: expected key=value, got '{line}'",
                lineno + 1
            )));
        };
        let Some(section) = &current else {
            return Err(ForecourtError::ConfigParse(format!(
                "line {}: entry before any section",
                lineno + 1
            )));
        };
        sections
            .get_mut(section)
            .expect("current section was inserted on declaration")
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}
