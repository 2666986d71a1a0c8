//! DN translation between the proxy namespace and each target's namespace

use std::sync::Arc;

use crate::dn::Dn;
use crate::target::TargetRegistry;
use crate::types::{MetaError, Result};

/// Where a DN being rewritten appears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteContext {
    BindDn,
    RequestDn,
    SearchBase,
    NewParent,
}

/// Translates DNs before they are sent to a target.
///
/// Failures abort the attempt on that target only and are reported as
/// `UnwillingToPerform` or `Other`.
pub trait DnRewriter: Send + Sync {
    fn rewrite(&self, target: usize, context: RewriteContext, dn: &Dn) -> Result<Dn>;
}

/// Passes DNs through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRewriter;

impl DnRewriter for IdentityRewriter {
    fn rewrite(&self, _target: usize, _context: RewriteContext, dn: &Dn) -> Result<Dn> {
        Ok(dn.clone())
    }
}

/// Replaces each target's virtual suffix with the suffix the remote server uses
#[derive(Debug, Clone, Default)]
pub struct SuffixMassage {
    rules: Vec<Option<(Dn, Dn)>>,
}

impl SuffixMassage {
    pub fn from_registry(registry: &TargetRegistry) -> Self {
        Self {
            rules: registry
                .iter()
                .map(|t| t.remote_suffix.clone().map(|remote| (t.suffix.clone(), remote)))
                .collect(),
        }
    }

    /// True when no target rewrites anything
    pub fn is_noop(&self) -> bool {
        self.rules.iter().all(Option::is_none)
    }

    pub fn into_shared(self) -> Arc<dyn DnRewriter> {
        if self.is_noop() {
            Arc::new(IdentityRewriter)
        } else {
            Arc::new(self)
        }
    }
}

impl DnRewriter for SuffixMassage {
    fn rewrite(&self, target: usize, _context: RewriteContext, dn: &Dn) -> Result<Dn> {
        match self.rules.get(target) {
            Some(Some((virtual_suffix, remote))) if !dn.is_root() => {
                dn.replace_suffix(virtual_suffix, remote).ok_or_else(|| {
                    MetaError::Unwilling(format!("\"{}\" is outside the naming context of target {}", dn, target))
                })
            }
            _ => Ok(dn.clone()),
        }
    }
}
