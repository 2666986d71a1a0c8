//! Network transport built on ldap3
//!
//! Each connection is driven by its own spawned task, the way ldap3 expects.
//! Operation handlers reach the `ldap3::Ldap` handle through
//! [`LdapConnection::handle`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, SearchOptions};
use tracing::{debug, warn};

use super::{ConnectParams, Connector, DirectoryConnection};
use crate::config::TlsMode;
use crate::types::{MetaError, Result, ResultCode};

/// Connector for real directory servers
#[derive(Debug, Clone, Default)]
pub struct LdapConnector;

impl LdapConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open(&self, params: &ConnectParams, uri: &str, starttls: bool) -> Result<Ldap> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(params.network_timeout)
            .set_starttls(starttls);

        let (conn, ldap) = LdapConnAsync::with_settings(settings, uri)
            .await
            .map_err(|e| map_ldap_error(uri, e))?;

        let driver_uri = uri.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(uri = %driver_uri, "LDAP connection driver stopped: {}", e);
            }
        });

        Ok(ldap)
    }
}

#[async_trait]
impl Connector for LdapConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DirectoryConnection>> {
        if params.version != 3 {
            return Err(MetaError::Protocol(format!(
                "protocol version {} not supported for {}",
                params.version, params.uri
            )));
        }

        let uri = match params.tls {
            TlsMode::Ldaps if params.uri.starts_with("ldap://") => {
                params.uri.replacen("ldap://", "ldaps://", 1)
            }
            _ => params.uri.clone(),
        };

        let ldap = match params.tls {
            TlsMode::Start => self.open(params, &uri, true).await?,
            TlsMode::TryStart => match self.open(params, &uri, true).await {
                Ok(ldap) => ldap,
                Err(e) if !e.is_transport() => {
                    warn!(uri = %uri, "StartTLS refused, continuing without TLS: {}", e);
                    self.open(params, &uri, false).await?
                }
                Err(e) => return Err(e),
            },
            TlsMode::None | TlsMode::Ldaps => self.open(params, &uri, false).await?,
        };

        debug!(target_idx = params.target, uri = %uri, "LDAP connection opened");
        Ok(Arc::new(LdapConnection {
            uri,
            ldap,
            op_timeout: params.op_timeout,
        }))
    }
}

/// Connection to one directory server
pub struct LdapConnection {
    uri: String,
    ldap: Ldap,
    op_timeout: Duration,
}

impl LdapConnection {
    /// Clone of the ldap3 handle for issuing operations
    pub fn handle(&self) -> Ldap {
        self.ldap.clone()
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }
}

#[async_trait]
impl DirectoryConnection for LdapConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn simple_bind(&self, dn: &str, password: &str) -> Result<()> {
        let mut ldap = self.ldap.clone();
        let res = ldap
            .with_timeout(self.op_timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| map_ldap_error(&self.uri, e))?;
        check_rc(res.rc, &res.text)
    }

    async fn probe_base(&self, dn: &str) -> Result<bool> {
        let mut ldap = self.ldap.clone();
        let ldap3::SearchResult(entries, res) = ldap
            .with_timeout(self.op_timeout)
            .with_search_options(SearchOptions::new().sizelimit(1))
            .search(dn, ldap3::Scope::Base, "(objectClass=*)", vec!["1.1"])
            .await
            .map_err(|e| map_ldap_error(&self.uri, e))?;

        match res.rc {
            0 | 4 => Ok(!entries.is_empty()),
            32 => Ok(false),
            rc => check_rc(rc, &res.text).map(|_| false),
        }
    }

    async fn close(&self) {
        let mut ldap = self.ldap.clone();
        if let Err(e) = ldap.unbind().await {
            debug!(uri = %self.uri, "Unbind failed: {}", e);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn check_rc(rc: u32, text: &str) -> Result<()> {
    match ResultCode::from_code(rc) {
        ResultCode::Success => Ok(()),
        ResultCode::InvalidCredentials => Err(MetaError::InvalidCredentials),
        ResultCode::Unavailable | ResultCode::Busy => Err(MetaError::ServerDown(text.to_string())),
        code => Err(MetaError::Remote {
            code,
            message: text.to_string(),
        }),
    }
}

/// Map an ldap3 error onto the engine taxonomy
pub fn map_ldap_error(uri: &str, err: LdapError) -> MetaError {
    match err {
        LdapError::Timeout { .. } => MetaError::NetworkTimeout(uri.to_string()),
        LdapError::LdapResult { result } => match check_rc(result.rc, &result.text) {
            Err(e) => e,
            Ok(()) => MetaError::Internal(format!("{}: unexpected success result", uri)),
        },
        other => MetaError::ServerDown(format!("{}: {}", uri, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert!(check_rc(0, "").is_ok());
        assert_eq!(check_rc(49, "bad"), Err(MetaError::InvalidCredentials));
        assert!(check_rc(52, "down").unwrap_err().is_transport());
        assert_eq!(
            check_rc(53, "no").unwrap_err().result_code(),
            ResultCode::UnwillingToPerform
        );
    }

    #[tokio::test]
    async fn test_version_two_rejected_without_dialing() {
        let params = ConnectParams {
            target: 0,
            uri: "ldap://192.0.2.1:389".into(),
            version: 2,
            tls: TlsMode::None,
            network_timeout: Duration::from_millis(10),
            op_timeout: Duration::from_millis(10),
        };
        let err = LdapConnector::new().connect(&params).await.err().unwrap();
        assert!(matches!(err, MetaError::Protocol(_)));
        assert!(!err.counts_against_target());
    }
}
