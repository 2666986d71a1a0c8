//! Distinguished names
//!
//! A `Dn` is stored normalized (attribute types and values lowercased,
//! surrounding whitespace removed, multi-valued RDNs sorted) so that suffix
//! comparisons are plain component comparisons.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{MetaError, Result};

/// Normalized distinguished name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Dn {
    norm: String,
    rdns: Vec<String>,
}

/// Search scope, used both for target naming contexts and request scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Base,
    #[serde(alias = "onelevel", alias = "one-level")]
    One,
    #[default]
    #[serde(alias = "subtree")]
    Sub,
    #[serde(alias = "children")]
    Subordinate,
}

impl FromStr for Scope {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "one" | "onelevel" | "one-level" => Ok(Self::One),
            "sub" | "subtree" => Ok(Self::Sub),
            "subordinate" | "children" => Ok(Self::Subordinate),
            other => Err(MetaError::Config(format!("unknown scope \"{}\"", other))),
        }
    }
}

impl Dn {
    /// The empty (root) DN
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and normalize a DN string
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::root());
        }

        let mut rdns = Vec::new();
        for rdn in split_unescaped(raw, ',') {
            let rdn = rdn.trim();
            if rdn.is_empty() {
                return Err(MetaError::InvalidDn(raw.to_string()));
            }
            rdns.push(normalize_rdn(rdn).ok_or_else(|| MetaError::InvalidDn(raw.to_string()))?);
        }

        Ok(Self::from_rdns(rdns))
    }

    fn from_rdns(rdns: Vec<String>) -> Self {
        Self {
            norm: rdns.join(","),
            rdns,
        }
    }

    /// Normalized string form
    pub fn as_str(&self) -> &str {
        &self.norm
    }

    /// Whether this is the root DN
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDN components
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Parent DN; the root is its own parent
    pub fn parent(&self) -> Dn {
        if self.rdns.len() <= 1 {
            return Self::root();
        }
        Self::from_rdns(self.rdns[1..].to_vec())
    }

    /// True when `suffix` is a suffix of this DN (equal DNs included)
    pub fn is_within(&self, suffix: &Dn) -> bool {
        let (n, m) = (self.rdns.len(), suffix.rdns.len());
        m <= n && self.rdns[n - m..] == suffix.rdns[..]
    }

    /// Swap `old` for `new` as the suffix of this DN
    pub fn replace_suffix(&self, old: &Dn, new: &Dn) -> Option<Dn> {
        let below = self.levels_below(old)?;
        let mut rdns = self.rdns[..below].to_vec();
        rdns.extend(new.rdns.iter().cloned());
        Some(Self::from_rdns(rdns))
    }

    /// Number of RDNs between this DN and `suffix`, if it lies within it
    pub fn levels_below(&self, suffix: &Dn) -> Option<usize> {
        self.is_within(suffix).then(|| self.rdns.len() - suffix.rdns.len())
    }
}

impl FromStr for Dn {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.norm)
    }
}

/// Split on `sep` outside of backslash escapes and double quotes
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn normalize_rdn(rdn: &str) -> Option<String> {
    let mut avas = Vec::new();
    for ava in split_unescaped(rdn, '+') {
        let mut halves = split_unescaped(ava, '=');
        if halves.len() < 2 {
            return None;
        }
        let attr = halves.remove(0).trim().to_ascii_lowercase();
        // '=' may legitimately appear escaped in the value
        let value = ava[ava.find('=')? + 1..].trim().to_lowercase();
        if attr.is_empty() {
            return None;
        }
        avas.push(format!("{}={}", attr, value));
    }
    avas.sort();
    Some(avas.join("+"))
}
