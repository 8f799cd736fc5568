//! DNS resolver collaborator and its resolv.conf backend.

use thiserror::Error;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_RESOLV_CONF: &str = "/run/netconnd/resolv.conf";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("resolv.conf path {0:?} has no parent directory")]
    NoParent(PathBuf),
}

pub trait Resolver: Send + Sync {
    /// Replaces the system resolver configuration.
    fn set_dns_from_lists(&self, servers: &[String], search_domains: &[String]) -> bool;
}

/// Writes resolver state into a resolv.conf formatted file.
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
}

impl ResolvConf {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn render(servers: &[String], search_domains: &[String]) -> String {
        let mut content = String::new();
        for server in servers {
            content.push_str(&format!("nameserver {server}\n"));
        }
        if !search_domains.is_empty() {
            content.push_str(&format!("search {}\n", search_domains.join(" ")));
        }
        content
    }

    /// Rewrites the file through a sibling temporary file and a rename so that
    /// readers never see a partial configuration. Empty lists remove the file.
    pub fn write(&self, servers: &[String], search_domains: &[String]) -> Result<(), Error> {
        if servers.is_empty() && search_domains.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::NoParent(self.path.clone()))?;
        fs::create_dir_all(parent)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, Self::render(servers, search_domains))?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl Resolver for ResolvConf {
    fn set_dns_from_lists(&self, servers: &[String], search_domains: &[String]) -> bool {
        match self.write(servers, search_domains) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), ?servers, ?search_domains, "updated resolver configuration");
                true
            }
            Err(error) => {
                tracing::error!(%error, path = %self.path.display(), "failed to write resolver configuration");
                false
            }
        }
    }
}
