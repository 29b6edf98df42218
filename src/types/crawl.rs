use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::CrawlType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    Starting,
    Running,
    Stopping,
    Complete,
    PartialComplete,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageRef {
    pub name: String,
    #[serde(default)]
    pub custom: bool,
}

impl StorageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            custom: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlFile {
    pub filename: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub crc32: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub replicas: BTreeSet<StorageRef>,
    #[serde(default)]
    pub presigned_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expire_at: Option<OffsetDateTime>,
}

impl CrawlFile {
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            hash: String::new(),
            crc32: 0,
            size,
            replicas: BTreeSet::new(),
            presigned_url: None,
            expire_at: None,
        }
    }

    /// A cached URL is usable strictly before its expiry.
    pub fn cached_url(&self, now: OffsetDateTime) -> Option<&str> {
        match (self.presigned_url.as_deref(), self.expire_at) {
            (Some(url), Some(expire_at)) if now < expire_at => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseCrawl {
    pub id: String,
    pub oid: String,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub userid: Option<String>,
    #[serde(rename = "type")]
    pub crawl_type: CrawlType,
    pub state: CrawlState,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub files: Vec<CrawlFile>,
    #[serde(default)]
    pub collection_ids: BTreeSet<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished: Option<OffsetDateTime>,
}

impl BaseCrawl {
    pub fn new(
        id: impl Into<String>,
        oid: impl Into<String>,
        crawl_type: CrawlType,
        state: CrawlState,
    ) -> Self {
        Self {
            id: id.into(),
            oid: oid.into(),
            cid: None,
            userid: None,
            crawl_type,
            state,
            name: None,
            description: None,
            tags: Vec::new(),
            files: Vec::new(),
            collection_ids: BTreeSet::new(),
            started: None,
            finished: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn total_file_size(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |acc, file| acc.saturating_add(file.size))
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut CrawlFile> {
        self.files.iter_mut().find(|file| file.filename == filename)
    }
}

/// Metadata edits on an archived item; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CrawlUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub collection_ids: Option<Vec<String>>,
}

impl CrawlUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn has_metadata(&self) -> bool {
        self.name.is_some() || self.description.is_some() || self.tags.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlFileOut {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub crc32: u32,
    pub size: u64,
    pub crawl_id: String,
    pub num_replicas: usize,
    pub expire_at: String,
}

impl CrawlFileOut {
    /// Without a `path` the expiry is left empty as well, so a listing never
    /// shows an expiry for a URL it does not include.
    pub fn from_file(file: &CrawlFile, crawl_id: &str, path: Option<&str>) -> Self {
        let expire_at = path
            .and(file.expire_at)
            .and_then(|at| at.format(&Rfc3339).ok())
            .unwrap_or_default();
        Self {
            name: file.filename.clone(),
            path: path.unwrap_or_default().to_string(),
            hash: file.hash.clone(),
            crc32: file.crc32,
            size: file.size,
            crawl_id: crawl_id.to_string(),
            num_replicas: file.replicas.len(),
            expire_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn cached_url_is_only_usable_before_expiry() {
        let mut file = CrawlFile::new("a.wacz", 10);
        let now = datetime!(2024-05-01 12:00 UTC);
        assert_eq!(file.cached_url(now), None);

        file.presigned_url = Some("https://signed/a".to_string());
        file.expire_at = Some(datetime!(2024-05-01 12:10 UTC));
        assert_eq!(file.cached_url(now), Some("https://signed/a"));
        assert_eq!(file.cached_url(datetime!(2024-05-01 12:10 UTC)), None);
    }

    #[test]
    fn descriptor_renders_empty_expiry_for_unresolved_files() {
        let mut file = CrawlFile::new("a.wacz", 10);
        file.replicas.insert(StorageRef::new("backup"));
        let out = CrawlFileOut::from_file(&file, "crawl-1", None);
        assert_eq!(out.expire_at, "");
        assert_eq!(out.path, "");
        assert_eq!(out.num_replicas, 1);

        file.presigned_url = Some("https://signed/a".to_string());
        file.expire_at = Some(datetime!(2024-05-01 12:10 UTC));
        let out = CrawlFileOut::from_file(&file, "crawl-1", None);
        assert_eq!(out.expire_at, "");

        let out = CrawlFileOut::from_file(&file, "crawl-1", Some("https://signed/a"));
        assert_eq!(out.expire_at, "2024-05-01T12:10:00Z");
        assert_eq!(out.path, "https://signed/a");
    }

    #[test]
    fn crawl_documents_use_camel_case_shape() {
        let mut crawl = BaseCrawl::new("c1", "org-1", CrawlType::Upload, CrawlState::Complete);
        crawl.files.push(CrawlFile::new("a.wacz", 10));
        let json = serde_json::to_value(&crawl).expect("json");
        assert_eq!(json["type"], "upload");
        assert_eq!(json["collectionIds"], serde_json::json!([]));
        assert!(json["files"][0]["presignedUrl"].is_null());
        assert!(json["files"][0]["expireAt"].is_null());
    }
}
