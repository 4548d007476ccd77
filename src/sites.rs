//! Discovery of hosted WordPress sites
//!
//! A site is any `<sites_root>/<domain>/` directory whose
//! `public_html/wp-config.php` exists. Database credentials are read from
//! the `define(...)` constants in that file. The site list is cached and
//! only rescanned after an explicit invalidation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::fs as tokio_fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backup::BACKUPS_DIR;

/// Directory holding a site's web content
pub const CONTENT_DIR: &str = "public_html";

const WP_CONFIG: &str = "wp-config.php";

static WP_DEFINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"define\s*\(\s*['"](DB_NAME|DB_USER|DB_PASSWORD|DB_HOST)['"]\s*,\s*['"]([^'"]*)['"]"#)
        .expect("valid wp-config regex")
});

/// Credentials needed to dump or restore a site's database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
}

/// A hosted site
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    pub domain: String,
    pub root: PathBuf,
    pub content_root: PathBuf,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_host: String,
    #[serde(skip_serializing)]
    pub db_password: Option<String>,
}

impl Site {
    /// A site rooted at `root` with no database configured
    pub fn new(domain: &str, root: &Path) -> Self {
        Self {
            domain: domain.to_string(),
            root: root.to_path_buf(),
            content_root: root.join(CONTENT_DIR),
            db_name: None,
            db_user: None,
            db_host: "127.0.0.1".to_string(),
            db_password: None,
        }
    }

    /// Directory holding this site's backup folders
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    /// Full credentials, if every part is known
    pub fn credentials(&self) -> Option<DbCredentials> {
        Some(DbCredentials {
            name: self.db_name.clone()?,
            user: self.db_user.clone()?,
            password: self.db_password.clone()?,
            host: self.db_host.clone(),
        })
    }

    /// Fill database fields from the contents of `wp-config.php`
    fn apply_wp_config(&mut self, contents: &str) {
        for caps in WP_DEFINE.captures_iter(contents) {
            let value = caps[2].to_string();
            match &caps[1] {
                "DB_NAME" => self.db_name = Some(value),
                "DB_USER" => self.db_user = Some(value),
                "DB_PASSWORD" => self.db_password = Some(value),
                "DB_HOST" if !value.is_empty() => self.db_host = value,
                _ => {}
            }
        }
    }
}

/// Lookup of hosted sites by domain
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    /// Find one site
    async fn find(&self, domain: &str) -> Option<Site>;

    /// All known sites, sorted by domain
    async fn all(&self) -> Vec<Site>;

    /// Drop any cached state so the next lookup rescans
    async fn invalidate(&self);
}

/// Site directory backed by a scan of the sites root
pub struct FsSiteDirectory {
    sites_root: PathBuf,
    cache: RwLock<Option<Vec<Site>>>,
}

impl FsSiteDirectory {
    pub fn new(sites_root: &Path) -> Self {
        Self {
            sites_root: sites_root.to_path_buf(),
            cache: RwLock::new(None),
        }
    }

    async fn scan(&self) -> Vec<Site> {
        let mut sites = Vec::new();

        let mut entries = match tokio_fs::read_dir(&self.sites_root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.sites_root.display(), error = %e, "Cannot read sites root");
                return sites;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read sites root entry");
                    break;
                }
            };
            let root = entry.path();
            if !root.is_dir() {
                continue;
            }
            let Some(domain) = root.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let wp_config = root.join(CONTENT_DIR).join(WP_CONFIG);
            let contents = match tokio_fs::read_to_string(&wp_config).await {
                Ok(contents) => contents,
                Err(_) => continue,
            };

            let mut site = Site::new(domain, &root);
            site.apply_wp_config(&contents);
            sites.push(site);
        }

        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        debug!(count = sites.len(), "Scanned sites root");
        sites
    }

    async fn cached(&self) -> Vec<Site> {
        if let Some(sites) = self.cache.read().await.as_ref() {
            return sites.clone();
        }

        let mut cache = self.cache.write().await;
        if let Some(sites) = cache.as_ref() {
            return sites.clone();
        }
        let sites = self.scan().await;
        *cache = Some(sites.clone());
        sites
    }
}

#[async_trait]
impl SiteDirectory for FsSiteDirectory {
    async fn find(&self, domain: &str) -> Option<Site> {
        self.cached().await.into_iter().find(|s| s.domain == domain)
    }

    async fn all(&self) -> Vec<Site> {
        self.cached().await
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
