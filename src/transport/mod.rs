//! Transport seam between the engine and remote directory servers
//!
//! The engine only needs to open a connection, bind on it, run a presence
//! probe and close it. Everything else a handler does with a connection goes
//! through [`DirectoryConnection::as_any`] to the concrete client.

pub mod ldap;
pub mod memory;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::TlsMode;
use crate::target::Target;
use crate::types::Result;

pub use ldap::{LdapConnection, LdapConnector};
pub use memory::{MemoryConnection, MemoryConnector, MemoryDirectory};

/// Parameters for opening one connection to one target URI
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub target: usize,
    pub uri: String,
    pub version: u8,
    pub tls: TlsMode,
    pub network_timeout: Duration,
    pub op_timeout: Duration,
}

impl ConnectParams {
    pub fn for_target(target: &Target, uri: &str) -> Self {
        Self {
            target: target.index,
            uri: uri.to_string(),
            version: target.version,
            tls: target.tls,
            network_timeout: target.network_timeout,
            op_timeout: target.network_timeout,
        }
    }
}

/// An open connection to a remote directory server
#[async_trait]
pub trait DirectoryConnection: Send + Sync {
    /// URI this connection was opened to
    fn uri(&self) -> &str;

    /// Simple bind; an empty DN binds anonymously
    async fn simple_bind(&self, dn: &str, password: &str) -> Result<()>;

    /// Base-scope `(objectClass=*)` search capped at one entry.
    ///
    /// `Ok(false)` when the entry does not exist on this server.
    async fn probe_base(&self, dn: &str) -> Result<bool>;

    /// Unbind and drop the underlying transport
    async fn close(&self);

    /// Access to the concrete client for operation handlers
    fn as_any(&self) -> &dyn Any;
}

/// Opens connections to remote directory servers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn DirectoryConnection>>;
}
