//! Dark provisioning: writes dashboards where Grafana's file provider picks
//! them up, one directory per folder: `<root>/<folder>/<uid>.json`.

#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dark_core::DashboardCreator;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

pub const DEFAULT_FOLDER: &str = "General";

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid json")]
    InvalidJson(#[from] serde_json::Error),
    #[error("dashboard spec must be a JSON object")]
    NotAnObject,
    #[error("invalid {field} {value:?}")]
    InvalidName { field: &'static str, value: String },
    #[error("{op} {}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> ProvisionError + 'a {
    move |source| ProvisionError::Io { op, path: path.to_path_buf(), source }
}

fn check_name(field: &'static str, value: &str) -> Result<(), ProvisionError> {
    let bad = value.is_empty() || value.starts_with('.') || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(ProvisionError::InvalidName { field, value: value.to_string() });
    }
    Ok(())
}

/// Set the dashboard uid and drop the numeric id Grafana assigns itself.
pub fn prepare_dashboard(uid: &str, raw_spec: &[u8]) -> Result<Vec<u8>, ProvisionError> {
    let mut dashboard: Value = serde_json::from_slice(raw_spec)?;
    let obj = dashboard.as_object_mut().ok_or(ProvisionError::NotAnObject)?;
    obj.insert("uid".to_string(), Value::String(uid.to_string()));
    obj.remove("id");
    Ok(serde_json::to_vec_pretty(&dashboard)?)
}

pub struct FileProvisioner {
    root: PathBuf,
}

impl FileProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    /// Where the dashboard `uid` of `folder` is written.
    pub fn path_for(&self, folder: &str, uid: &str) -> PathBuf {
        let folder = if folder.is_empty() { DEFAULT_FOLDER } else { folder };
        self.root.join(folder).join(format!("{}.json", uid))
    }

    async fn folders(&self) -> Result<Vec<PathBuf>, ProvisionError> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err("listing", &self.root)(e)),
        };
        while let Some(entry) = rd.next_entry().await.map_err(io_err("listing", &self.root))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    /// Remove `uid` from every folder except `keep`. Returns how many files went away.
    async fn remove_from_folders(&self, uid: &str, keep: Option<&Path>) -> Result<usize, ProvisionError> {
        let file = format!("{}.json", uid);
        let mut removed = 0;
        for dir in self.folders().await? {
            if Some(dir.as_path()) == keep {
                continue;
            }
            let path = dir.join(&file);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed dashboard file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err("removing", &path)(e)),
            }
        }
        Ok(removed)
    }

    pub async fn write(&self, folder: &str, uid: &str, raw_spec: &[u8]) -> Result<PathBuf, ProvisionError> {
        check_name("uid", uid)?;
        if !folder.is_empty() {
            check_name("folder", folder)?;
        }
        let body = prepare_dashboard(uid, raw_spec)?;
        let path = self.path_for(folder, uid);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await.map_err(io_err("creating", &dir))?;

        let tmp = dir.join(format!(".{}.json.tmp", uid));
        tokio::fs::write(&tmp, &body).await.map_err(io_err("writing", &tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err("renaming", &tmp))?;

        // the dashboard may have moved folders
        self.remove_from_folders(uid, Some(&dir)).await?;
        counter!("provision_writes_total", 1u64);
        info!(path = %path.display(), "dashboard provisioned");
        Ok(path)
    }

    pub async fn remove(&self, uid: &str) -> Result<usize, ProvisionError> {
        check_name("uid", uid)?;
        let removed = self.remove_from_folders(uid, None).await?;
        counter!("provision_deletes_total", 1u64);
        info!(uid, removed, "dashboard removed");
        Ok(removed)
    }
}

#[async_trait]
impl DashboardCreator for FileProvisioner {
    async fn from_raw_spec(&self, folder: &str, uid: &str, raw_spec: &[u8]) -> anyhow::Result<()> {
        self.write(folder, uid, raw_spec).await?;
        Ok(())
    }

    async fn delete(&self, uid: &str) -> anyhow::Result<()> {
        self.remove(uid).await?;
        Ok(())
    }
}
