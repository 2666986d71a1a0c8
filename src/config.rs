//! Configuration for metagate
//!
//! CLI arguments and environment handling use clap; the target table is a
//! TOML file deserialized into [`MetaConfig`] and validated into a
//! [`TargetRegistry`](crate::target::TargetRegistry).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::dn::Scope;
use crate::types::Result;

/// metagate - routing and connection pooling for directory proxies
#[derive(Parser, Debug, Clone)]
#[command(name = "metagate")]
#[command(about = "Multi-target routing and connection pool engine for directory proxies")]
pub struct Args {
    /// Path to the TOML target table
    #[arg(short, long, env = "METAGATE_CONFIG", default_value = "metagate.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operator commands
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Validate the configuration and print the target table
    Check,

    /// Print the candidate targets for an operation
    Route {
        /// Operation type
        #[arg(long, value_enum)]
        op: OpArg,

        /// Request DN (the new entry's DN for add)
        #[arg(long)]
        dn: String,

        /// New superior for rename
        #[arg(long)]
        new_parent: Option<String>,

        /// Search scope (search only)
        #[arg(long, default_value = "sub")]
        scope: String,
    },

    /// Open a privileged session to every target and report quarantine state
    Ping,
}

/// Operation names accepted by `route`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpArg {
    Add,
    Delete,
    Modify,
    Compare,
    Rename,
    Search,
    Bind,
    RootBind,
}

/// What to do when a candidate target fails during fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Keep going with the remaining candidates, remembering the error
    #[default]
    Continue,
    /// Fail the whole request
    Stop,
}

/// When requests are sent to targets under the proxy's own identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyAuthzMode {
    /// Anonymous non-bind requests share an anonymous entry
    #[default]
    Legacy,
    /// Anonymous requests run as the proxy identity
    Anonymous,
    /// Anonymous requests always share an anonymous entry
    NoAnonymous,
    /// Authenticated requests run as the proxy identity
    Always,
}

/// Transport security for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    #[default]
    None,
    /// StartTLS, failing the handshake when it is refused
    Start,
    /// StartTLS, continuing in clear text when it is refused
    TryStart,
    /// TLS from the first byte (also implied by an `ldaps://` URI)
    Ldaps,
}

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Index of the target used when several own a DN and the probe is inconclusive
    #[serde(default)]
    pub default_target: Option<usize>,

    #[serde(default)]
    pub on_error: OnError,

    /// DN to target cache lifetime: `disabled`, `forever` or seconds
    #[serde(default = "default_dncache_ttl")]
    pub dncache_ttl: String,

    #[serde(default)]
    pub proxy_authz: ProxyAuthzMode,

    #[serde(default)]
    pub pool: PoolConfig,

    pub targets: Vec<TargetConfig>,
}

/// Pool-wide defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum lifetime of a pool entry in seconds
    #[serde(default)]
    pub conn_ttl_secs: Option<u64>,

    /// Maximum idle time of an unreferenced pool entry in seconds
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Interval of the background sweep; 0 disables it
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            conn_ttl_secs: None,
            idle_timeout_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// One remote directory server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Display name; defaults to `target-<index>`
    #[serde(default)]
    pub name: Option<String>,

    /// Server URIs, tried in order
    pub uris: Vec<String>,

    /// Naming context served by this target
    pub suffix: String,

    #[serde(default)]
    pub scope: Scope,

    /// Branches below the suffix this target must not serve
    #[serde(default)]
    pub subtree_exclude: Vec<String>,

    /// Suffix the remote server uses for this naming context, when it differs
    #[serde(default)]
    pub remote_suffix: Option<String>,

    /// Protocol version (only 3 is supported by the network transport)
    #[serde(default = "default_version")]
    pub version: u8,

    #[serde(default)]
    pub tls: TlsMode,

    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,

    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Overrides `pool.idle_timeout_secs`
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Overrides `pool.conn_ttl_secs`
    #[serde(default)]
    pub conn_ttl_secs: Option<u64>,

    /// Handshake retries after a bind timeout
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Quarantine schedule, e.g. `"10,3;60,+"`
    #[serde(default)]
    pub quarantine: Option<String>,

    /// Proxy identity used for privileged sessions
    #[serde(default)]
    pub idassert: Option<IdAssertConfig>,
}

/// Administrative credentials for identity assertion
#[derive(Clone, Serialize, Deserialize)]
pub struct IdAssertConfig {
    pub authc_dn: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for IdAssertConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAssertConfig")
            .field("authc_dn", &self.authc_dn)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_dncache_ttl() -> String {
    "forever".to_string()
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_version() -> u8 {
    3
}
fn default_bind_timeout_ms() -> u64 {
    5_000
}
fn default_network_timeout_ms() -> u64 {
    10_000
}
fn default_retries() -> u32 {
    3
}

impl MetaConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
