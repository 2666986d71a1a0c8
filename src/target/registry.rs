//! Target registry
//!
//! The immutable table of configured remote servers, built once from
//! [`MetaConfig`] at startup. Nothing here is mutated afterwards, so it is
//! shared as `Arc<TargetRegistry>` without locking.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::quarantine::QuarantinePolicy;
use crate::config::{MetaConfig, OnError, ProxyAuthzMode, TargetConfig, TlsMode};
use crate::dn::{Dn, Scope};
use crate::pool::PoolSettings;
use crate::routing::CacheTtl;
use crate::types::{MetaError, Result};

/// Proxy identity asserted on privileged sessions
#[derive(Clone)]
pub struct IdAssert {
    pub authc_dn: Dn,
    pub password: Zeroizing<String>,
}

impl fmt::Debug for IdAssert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAssert")
            .field("authc_dn", &self.authc_dn.as_str())
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A configured remote directory server
#[derive(Debug, Clone)]
pub struct Target {
    pub index: usize,
    pub name: String,
    pub uris: Vec<String>,
    pub suffix: Dn,
    pub scope: Scope,
    pub subtree_exclude: Vec<Dn>,
    pub remote_suffix: Option<Dn>,
    pub version: u8,
    pub tls: TlsMode,
    pub bind_timeout: Duration,
    pub network_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub conn_ttl: Option<Duration>,
    pub retries: u32,
    pub quarantine: QuarantinePolicy,
    pub idassert: Option<IdAssert>,
}

impl Target {
    /// Whether this target can serve `dn` for a request of `request_scope`.
    ///
    /// A DN inside the suffix matches according to the target's own scope
    /// unless it falls under an excluded branch. A DN above the suffix
    /// matches only for subtree requests, since the suffix then lies inside
    /// the requested subtree.
    pub fn is_candidate(&self, dn: &Dn, request_scope: Scope) -> bool {
        if let Some(below) = dn.levels_below(&self.suffix) {
            if self.subtree_exclude.iter().any(|ex| dn.is_within(ex)) {
                return false;
            }
            return match self.scope {
                Scope::Sub => true,
                Scope::Subordinate => below > 0,
                Scope::One => below == 1,
                Scope::Base => below == 0,
            };
        }

        request_scope == Scope::Sub && self.suffix.is_within(dn)
    }

    fn from_config(index: usize, cfg: &TargetConfig, pool: &PoolSettings) -> Result<Self> {
        let name = cfg.name.clone().unwrap_or_else(|| format!("target-{}", index));
        let bad = |why: String| MetaError::Config(format!("target \"{}\": {}", name, why));

        if cfg.uris.is_empty() {
            return Err(bad("at least one URI is required".into()));
        }
        if let Some(uri) = cfg.uris.iter().find(|u| !u.contains("://")) {
            return Err(bad(format!("malformed URI \"{}\"", uri)));
        }
        if !(2..=3).contains(&cfg.version) {
            return Err(bad(format!("unsupported protocol version {}", cfg.version)));
        }

        let suffix = Dn::parse(&cfg.suffix).map_err(|e| bad(e.to_string()))?;
        let mut subtree_exclude = Vec::with_capacity(cfg.subtree_exclude.len());
        for raw in &cfg.subtree_exclude {
            let ex = Dn::parse(raw).map_err(|e| bad(e.to_string()))?;
            if !ex.is_within(&suffix) || ex == suffix {
                return Err(bad(format!("subtree-exclude \"{}\" must be below the suffix", raw)));
            }
            subtree_exclude.push(ex);
        }

        let remote_suffix = match &cfg.remote_suffix {
            Some(raw) => Some(Dn::parse(raw).map_err(|e| bad(e.to_string()))?),
            None => None,
        };

        let quarantine = match &cfg.quarantine {
            Some(s) => s.parse()?,
            None => QuarantinePolicy::Never,
        };

        let idassert = match &cfg.idassert {
            Some(ia) => Some(IdAssert {
                authc_dn: Dn::parse(&ia.authc_dn).map_err(|e| bad(e.to_string()))?,
                password: Zeroizing::new(ia.password.clone()),
            }),
            None => None,
        };

        Ok(Self {
            index,
            name,
            uris: cfg.uris.clone(),
            suffix,
            scope: cfg.scope,
            subtree_exclude,
            remote_suffix,
            version: cfg.version,
            tls: cfg.tls,
            bind_timeout: Duration::from_millis(cfg.bind_timeout_ms),
            network_timeout: Duration::from_millis(cfg.network_timeout_ms),
            idle_timeout: cfg.idle_timeout_secs.map(Duration::from_secs).or(pool.idle_timeout),
            conn_ttl: cfg.conn_ttl_secs.map(Duration::from_secs).or(pool.conn_ttl),
            retries: cfg.retries,
            quarantine,
            idassert,
        })
    }
}

/// Printable summary of one target
#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub index: usize,
    pub name: String,
    pub suffix: String,
    pub scope: Scope,
    pub uris: Vec<String>,
    pub quarantine: String,
    pub idassert: bool,
}

/// Immutable table of all targets plus the global routing settings
#[derive(Debug)]
pub struct TargetRegistry {
    targets: Vec<Arc<Target>>,
    pub default_target: Option<usize>,
    pub on_error: OnError,
    pub dncache_ttl: CacheTtl,
    pub proxy_authz: ProxyAuthzMode,
    pub pool: PoolSettings,
}

impl TargetRegistry {
    /// Validate a configuration and build the registry
    pub fn from_config(config: &MetaConfig) -> Result<Self> {
        if config.targets.is_empty() {
            return Err(MetaError::Config("no targets configured".into()));
        }
        if let Some(idx) = config.default_target {
            if idx >= config.targets.len() {
                return Err(MetaError::Config(format!(
                    "default_target {} out of range ({} targets)",
                    idx,
                    config.targets.len()
                )));
            }
        }

        let pool = PoolSettings::from_config(&config.pool);
        let targets = config
            .targets
            .iter()
            .enumerate()
            .map(|(i, cfg)| Target::from_config(i, cfg, &pool).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        for t in &targets {
            debug!(
                target_idx = t.index,
                name = %t.name,
                suffix = %t.suffix,
                uris = ?t.uris,
                "Registered target"
            );
        }
        info!("Target registry loaded: {} target(s)", targets.len());

        Ok(Self {
            targets,
            default_target: config.default_target,
            on_error: config.on_error,
            dncache_ttl: config.dncache_ttl.parse()?,
            proxy_authz: config.proxy_authz,
            pool,
        })
    }

    /// Build a registry from already-constructed targets with default settings
    pub fn from_targets(targets: Vec<Target>) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
            default_target: None,
            on_error: OnError::default(),
            dncache_ttl: CacheTtl::Forever,
            proxy_authz: ProxyAuthzMode::default(),
            pool: PoolSettings::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<Target>> {
        self.targets.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.iter()
    }

    /// Quarantine policies in target order
    pub fn quarantine_policies(&self) -> Vec<QuarantinePolicy> {
        self.targets.iter().map(|t| t.quarantine.clone()).collect()
    }

    /// Summaries for operator output
    pub fn summaries(&self) -> Vec<TargetSummary> {
        self.targets
            .iter()
            .map(|t| TargetSummary {
                index: t.index,
                name: t.name.clone(),
                suffix: t.suffix.to_string(),
                scope: t.scope,
                uris: t.uris.clone(),
                quarantine: t.quarantine.to_string(),
                idassert: t.idassert.is_some(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(toml: &str) -> Result<TargetRegistry> {
        TargetRegistry::from_config(&MetaConfig::from_toml_str(toml)?)
    }

    fn target(suffix: &str, scope: Scope) -> Target {
        let cfg = TargetConfig {
            name: None,
            uris: vec!["ldap://t".into()],
            suffix: suffix.into(),
            scope,
            subtree_exclude: vec![],
            remote_suffix: None,
            version: 3,
            tls: TlsMode::None,
            bind_timeout_ms: 1000,
            network_timeout_ms: 1000,
            idle_timeout_secs: None,
            conn_ttl_secs: None,
            retries: 0,
            quarantine: None,
            idassert: None,
        };
        Target::from_config(0, &cfg, &PoolSettings::default()).unwrap()
    }

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn test_candidate_by_target_scope() {
        let sub = target("ou=people,dc=x", Scope::Sub);
        assert!(sub.is_candidate(&dn("ou=people,dc=x"), Scope::Base));
        assert!(sub.is_candidate(&dn("uid=a,ou=people,dc=x"), Scope::Base));
        assert!(!sub.is_candidate(&dn("ou=groups,dc=x"), Scope::Base));

        let children = target("ou=people,dc=x", Scope::Subordinate);
        assert!(!children.is_candidate(&dn("ou=people,dc=x"), Scope::Base));
        assert!(children.is_candidate(&dn("uid=a,ou=people,dc=x"), Scope::Base));

        let one = target("ou=people,dc=x", Scope::One);
        assert!(one.is_candidate(&dn("uid=a,ou=people,dc=x"), Scope::Base));
        assert!(!one.is_candidate(&dn("cn=b,uid=a,ou=people,dc=x"), Scope::Base));

        let base = target("ou=people,dc=x", Scope::Base);
        assert!(base.is_candidate(&dn("ou=people,dc=x"), Scope::Base));
        assert!(!base.is_candidate(&dn("uid=a,ou=people,dc=x"), Scope::Base));
    }

    #[test]
    fn test_superior_dn_matches_only_for_subtree_requests() {
        let t = target("ou=people,dc=x", Scope::Sub);
        assert!(t.is_candidate(&dn("dc=x"), Scope::Sub));
        assert!(!t.is_candidate(&dn("dc=x"), Scope::Base));
        assert!(!t.is_candidate(&dn("dc=x"), Scope::One));
    }

    #[test]
    fn test_subtree_exclude() {
        let reg = registry(
            r#"
[[targets]]
uris = ["ldap://a"]
suffix = "dc=x"
subtree_exclude = ["ou=private,dc=x"]
"#,
        )
        .unwrap();
        let t = reg.get(0).unwrap();
        assert!(t.is_candidate(&dn("uid=a,ou=people,dc=x"), Scope::Base));
        assert!(!t.is_candidate(&dn("ou=private,dc=x"), Scope::Base));
        assert!(!t.is_candidate(&dn("uid=a,ou=private,dc=x"), Scope::Base));
    }

    #[test]
    fn test_validation_errors() {
        assert!(registry("targets = []").is_err());
        assert!(registry(
            r#"
default_target = 1
[[targets]]
uris = ["ldap://a"]
suffix = "dc=x"
"#
        )
        .is_err());
        assert!(registry(
            r#"
[[targets]]
uris = []
suffix = "dc=x"
"#
        )
        .is_err());
        assert!(registry(
            r#"
[[targets]]
uris = ["ldap://a"]
suffix = "dc=x"
subtree_exclude = ["dc=y"]
"#
        )
        .is_err());
        assert!(registry(
            r#"
[[targets]]
uris = ["ldap://a"]
suffix = "dc=x"
version = 4
"#
        )
        .is_err());
    }

    #[test]
    fn test_pool_defaults_flow_into_targets() {
        let reg = registry(
            r#"
[pool]
idle_timeout_secs = 30
conn_ttl_secs = 600

[[targets]]
uris = ["ldap://a"]
suffix = "dc=x"

[[targets]]
name = "groups"
uris = ["ldap://b"]
suffix = "ou=groups,dc=y"
idle_timeout_secs = 5
quarantine = "10,3;60,+"
"#,
        )
        .unwrap();

        let a = reg.get(0).unwrap();
        assert_eq!(a.name, "target-0");
        assert_eq!(a.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(a.conn_ttl, Some(Duration::from_secs(600)));

        let b = reg.get(1).unwrap();
        assert_eq!(b.name, "groups");
        assert_eq!(b.idle_timeout, Some(Duration::from_secs(5)));
        assert!(matches!(b.quarantine, QuarantinePolicy::Schedule(ref blocks) if blocks.len() == 2));
        assert_eq!(reg.summaries()[1].quarantine, "10,3;60,+");
    }
}
