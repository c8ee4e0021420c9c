//! Local filesystem driver.
//!
//! Storage layout under the configured root:
//! ```text
//! {root}/
//!   {address}/
//!     {bucket}/{path}                 # Content
//!   .hestia-metadata/
//!     {address}/{bucket}/{path}.json  # {"content-type": ...}
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hestia_core::{
    paginate, parse_bytes, ConnectionContext, DeleteRequest, Driver, DriverApi, DriverInit,
    DriverSpaceInfo, HestiaError, ListEntry, ListFilesResponse, ReadRequest, ReadResult,
    RegisterOutcome, RegisterRequest, Result, WriteRequest,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

const METADATA_DIRNAME: &str = ".hestia-metadata";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
struct DiskOptions {
    #[serde(default = "default_root")]
    storage_root_directory: String,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default)]
    max_user_storage: serde_json::Value,
    #[serde(default)]
    max_total_storage: serde_json::Value,
}

fn default_root() -> String {
    "./hestia-storage".to_string()
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(rename = "content-type")]
    content_type: String,
}

/// Stores each user's buckets as plain files below a root directory.
#[derive(Debug)]
pub struct DiskDriver {
    id: String,
    root: PathBuf,
    page_size: usize,
    /// 0 = unlimited
    max_user_storage: u64,
    /// 0 = unlimited
    max_total_storage: u64,
}

impl Default for DiskDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskDriver {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            root: PathBuf::from(default_root()),
            page_size: default_page_size(),
            max_user_storage: 0,
            max_total_storage: 0,
        }
    }

    /// Join `parts` below `base`, refusing anything that is not a plain relative path.
    fn contained(base: &Path, parts: &[&str]) -> Result<PathBuf> {
        let mut out = base.to_path_buf();
        for part in parts {
            let rel = Path::new(part);
            let mut any = false;
            for c in rel.components() {
                match c {
                    Component::Normal(seg) => {
                        out.push(seg);
                        any = true;
                    }
                    Component::CurDir => {}
                    _ => {
                        return Err(HestiaError::not_allowed(
                            "Path is not formatted correctly (i.e. is relative)!",
                        ))
                    }
                }
            }
            if !any {
                return Err(HestiaError::not_allowed("Path must not be empty"));
            }
        }
        Ok(out)
    }

    fn content_path(&self, ctx: &ConnectionContext, bucket: &str, path: &str) -> Result<PathBuf> {
        Self::contained(&self.root, &[&ctx.address, bucket, path])
    }

    fn sidecar_path(&self, ctx: &ConnectionContext, bucket: &str, path: &str) -> Result<PathBuf> {
        let p = Self::contained(&self.root.join(METADATA_DIRNAME), &[&ctx.address, bucket, path])?;
        let mut s = p.into_os_string();
        s.push(".json");
        Ok(PathBuf::from(s))
    }

    fn user_dir(&self, address: &str) -> Result<PathBuf> {
        Self::contained(&self.root, &[address])
    }

    fn user_metadata_dir(&self, address: &str) -> Result<PathBuf> {
        Self::contained(&self.root.join(METADATA_DIRNAME), &[address])
    }

    async fn size_of(path: PathBuf) -> u64 {
        tokio::task::spawn_blocking(move || dir_size(&path))
            .await
            .unwrap_or(0)
    }

    async fn validate_storage(&self, address: &str) -> Result<()> {
        if self.max_user_storage > 0
            && Self::size_of(self.user_dir(address)?).await >= self.max_user_storage
        {
            return Err(HestiaError::not_allowed("User has reached their storage limit!"));
        }
        if self.max_total_storage > 0 && Self::size_of(self.root.clone()).await >= self.max_total_storage {
            return Err(HestiaError::not_allowed(
                "Disk (driver) has reached the alloted size limit!",
            ));
        }
        Ok(())
    }

    async fn read_content_type(sidecar: &Path) -> String {
        match fs::read(sidecar).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw)
                .map(|s| s.content_type)
                .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string()),
            Err(_) => DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

/// Write atomically via a temp file next to the target.
async fn write_atomic(target: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            HestiaError::Io(format!(
                "Failed to create parent directory for {}: {}",
                target.display(),
                e
            ))
        })?;
    }

    let mut temp = target.as_os_str().to_owned();
    temp.push(".hestia.tmp");
    let temp_path = PathBuf::from(temp);

    fs::write(&temp_path, data).await.map_err(|e| {
        HestiaError::Io(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    fs::rename(&temp_path, target).await.map_err(|e| {
        HestiaError::Io(format!(
            "Failed to rename temp file to {}: {}",
            target.display(),
            e
        ))
    })
}

fn dir_size(path: &Path) -> u64 {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    match std::fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| dir_size(&e.path()))
            .sum(),
        Err(_) => 0,
    }
}

struct WalkedFile {
    rel: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Every file below `dir`, as `/`-joined paths relative to it.
fn walk_files(dir: &Path, rel: &str, out: &mut Vec<WalkedFile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == METADATA_DIRNAME || name.ends_with(".hestia.tmp") {
            continue;
        }
        let child_rel = if rel.is_empty() {
            name
        } else {
            format!("{}/{}", rel, name)
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            walk_files(&entry.path(), &child_rel, out);
        } else if meta.is_file() {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.as_secs() as i64, d.subsec_nanos()));
            out.push(WalkedFile {
                rel: child_rel,
                size: meta.len(),
                modified,
            });
        }
    }
}

#[async_trait]
impl Driver for DiskDriver {
    async fn init(
        &mut self,
        id: &str,
        options: &serde_json::Value,
        _api: DriverApi,
    ) -> Result<DriverInit> {
        let options: DiskOptions = if options.is_null() {
            serde_json::from_value(serde_json::json!({}))?
        } else {
            serde_json::from_value(options.clone())?
        };

        self.id = id.to_string();
        self.root = PathBuf::from(&options.storage_root_directory);
        self.page_size = options.page_size.max(1);
        self.max_user_storage = parse_bytes(&options.max_user_storage)?;
        self.max_total_storage = parse_bytes(&options.max_total_storage)?;

        fs::create_dir_all(&self.root).await.map_err(|e| {
            HestiaError::Io(format!(
                "Failed to create storage root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        if self.max_total_storage > 0 && Self::size_of(self.root.clone()).await >= self.max_total_storage {
            warn!("Disk driver \"{}\" has reached the alloted size limit!", id);
        }

        info!(
            "Disk driver \"{}\" storing under {}",
            id,
            self.root.display()
        );

        Ok(DriverInit {
            name: "Harddisk".to_string(),
            long_id: "hestia.driver.disk".to_string(),
            icon: None,
            multi_instance: true,
            multi_user: false,
            auto_registerable: true,
        })
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path))]
    async fn perform_read(&self, req: ReadRequest<'_>) -> Result<ReadResult> {
        let p = self.content_path(req.ctx, req.bucket, req.path)?;

        match fs::metadata(&p).await {
            Ok(m) if m.is_file() => {}
            _ => return Err(HestiaError::not_found(format!("{}/{}", req.bucket, req.path))),
        }

        let data = fs::read(&p).await?;
        let content_type =
            Self::read_content_type(&self.sidecar_path(req.ctx, req.bucket, req.path)?).await;

        debug!("Read {} bytes from {}", data.len(), p.display());
        Ok(ReadResult::Content {
            content_type,
            data: Bytes::from(data),
        })
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path, data_len = req.content.len()))]
    async fn perform_write(&self, req: WriteRequest<'_>) -> Result<()> {
        let p = self.content_path(req.ctx, req.bucket, req.path)?;
        self.validate_storage(&req.ctx.address).await?;

        if let Ok(m) = fs::metadata(&p).await {
            if !m.is_file() {
                return Err(HestiaError::malformed(
                    "Path is a directory, cannot be written to!",
                ));
            }
        }

        write_atomic(&p, &req.content).await?;

        let sidecar = serde_json::to_vec(&Sidecar {
            content_type: req.content_type.to_string(),
        })?;
        write_atomic(&self.sidecar_path(req.ctx, req.bucket, req.path)?, &sidecar).await?;

        debug!("Wrote {} bytes to {}", req.content.len(), p.display());
        Ok(())
    }

    #[instrument(skip(self, req), level = "debug", fields(driver = %self.id, bucket = req.bucket, path = req.path))]
    async fn perform_delete(&self, req: DeleteRequest<'_>) -> Result<()> {
        let p = self.content_path(req.ctx, req.bucket, req.path)?;

        match fs::metadata(&p).await {
            Ok(m) if m.is_file() => fs::remove_file(&p).await?,
            Ok(_) => fs::remove_dir_all(&p).await?,
            Err(_) => return Err(HestiaError::not_found(format!("{}/{}", req.bucket, req.path))),
        }

        let sidecar = self.sidecar_path(req.ctx, req.bucket, req.path)?;
        if let Err(e) = fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove sidecar {}: {}", sidecar.display(), e);
            }
        }

        debug!("Deleted {}", p.display());
        Ok(())
    }

    #[instrument(skip(self, ctx), level = "debug", fields(driver = %self.id))]
    async fn list_files(
        &self,
        prefix: &str,
        page: usize,
        extended: bool,
        ctx: &ConnectionContext,
    ) -> Result<ListFilesResponse> {
        let user_dir = self.user_dir(&ctx.address)?;
        let dir = if prefix.trim_matches('/').is_empty() {
            user_dir
        } else {
            Self::contained(&user_dir, &[prefix])?
        };

        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(HestiaError::malformed("Not a directory.")),
            Err(_) => return Err(HestiaError::not_found(prefix.to_string())),
        }

        let walk_dir = dir.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk_files(&walk_dir, "", &mut out);
            out
        })
        .await
        .map_err(|e| HestiaError::Io(format!("Directory walk failed: {}", e)))?;
        files.sort_by(|a, b| a.rel.cmp(&b.rel));

        let listed = paginate(files, page, self.page_size);
        let meta_dir = self.user_metadata_dir(&ctx.address)?;
        let prefix_rel = prefix.trim_matches('/');

        let mut entries = Vec::with_capacity(listed.entries.len());
        for f in listed.entries {
            if extended {
                let rel_to_user = if prefix_rel.is_empty() {
                    f.rel.clone()
                } else {
                    format!("{}/{}", prefix_rel, f.rel)
                };
                let mut sidecar = meta_dir.join(&rel_to_user).into_os_string();
                sidecar.push(".json");
                let content_type = Self::read_content_type(Path::new(&sidecar)).await;
                entries.push(ListEntry::Extended {
                    name: f.rel,
                    content_length: f.size,
                    content_type: Some(content_type),
                    last_modified_date: f.modified.map(|t| t.timestamp_millis()),
                });
            } else {
                entries.push(ListEntry::Name(f.rel));
            }
        }

        Ok(ListFilesResponse {
            entries,
            next_page: listed.next_page,
        })
    }

    async fn get_info(&self, ctx: &ConnectionContext) -> Result<DriverSpaceInfo> {
        let used = Self::size_of(self.user_dir(&ctx.address)?).await;
        Ok(DriverSpaceInfo {
            space_used: used as i64,
            space_available: (self.max_user_storage > 0).then_some(self.max_user_storage),
        })
    }

    async fn register(
        &self,
        user: Option<&ConnectionContext>,
        _redirect_uri: Option<&str>,
        _req: Option<&RegisterRequest>,
    ) -> Result<RegisterOutcome> {
        let user =
            user.ok_or_else(|| HestiaError::malformed("Must have user object to register."))?;

        fs::create_dir_all(self.user_dir(&user.address)?).await?;
        fs::create_dir_all(self.user_metadata_dir(&user.address)?).await?;

        info!("Registered {} on disk driver \"{}\"", user.address, self.id);
        Ok(RegisterOutcome::Finish {
            address: user.address.clone(),
            userdata: serde_json::Value::Null,
        })
    }

    async fn unregister(&self, ctx: &ConnectionContext) -> Result<()> {
        for dir in [self.user_dir(&ctx.address)?, self.user_metadata_dir(&ctx.address)?] {
            if fs::metadata(&dir).await.is_ok() {
                fs::remove_dir_all(&dir).await?;
            }
        }
        info!("Unregistered {} from disk driver \"{}\"", ctx.address, self.id);
        Ok(())
    }
}
