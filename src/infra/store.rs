use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use tokio::{io::AsyncWriteExt, sync::RwLock};

use crate::domain::{model::DesiredSpec, port::DesiredStateStore};

/// Desired state cached in memory and mirrored to a JSON file.
///
/// Writes go to a synced sibling temp file which is then renamed over the
/// target, so neither a concurrent reader nor a restarted process sees a
/// partial record. Reads reload the file whenever its modification time or
/// length moved, so processes sharing the path observe each other's writes.
pub struct FileDesiredStateStore {
    path: PathBuf,
    current: RwLock<Loaded>,
}

type FileStamp = Option<(SystemTime, u64)>;

struct Loaded {
    spec: Option<DesiredSpec>,
    stamp: FileStamp,
}

impl FileDesiredStateStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let stamp = file_stamp(&path).await?;
        let spec = load(&path).await?;
        Ok(Self {
            path,
            current: RwLock::new(Loaded { spec, stamp }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, spec: &DesiredSpec) -> Result<(), Error> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let bytes = serde_json::to_vec_pretty(spec)?;
        let tmp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        #[cfg(unix)]
        tokio::fs::File::open(parent).await?.sync_all().await?;
        Ok(())
    }
}

async fn file_stamp(path: &Path) -> Result<FileStamp, Error> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some((metadata.modified()?, metadata.len()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Can't stat desired state file {:?}", path)),
    }
}

async fn load(path: &Path) -> Result<Option<DesiredSpec>, Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("Can't parse desired state from {:?}", path)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Can't read desired state from {:?}", path)),
    }
}

#[async_trait]
impl DesiredStateStore for FileDesiredStateStore {
    async fn get(&self) -> Result<Option<DesiredSpec>, Error> {
        let stamp = file_stamp(&self.path).await?;
        {
            let current = self.current.read().await;
            if current.stamp == stamp {
                return Ok(current.spec.clone());
            }
        }
        let mut current = self.current.write().await;
        let spec = load(&self.path).await?;
        debug!("Desired state reloaded from {:?}", self.path);
        *current = Loaded {
            spec: spec.clone(),
            stamp,
        };
        Ok(spec)
    }

    async fn set(&self, spec: DesiredSpec) -> Result<(), Error> {
        let mut current = self.current.write().await;
        self.persist(&spec)
            .await
            .with_context(|| format!("Can't persist desired state to {:?}", self.path))?;
        debug!("Desired state persisted to {:?}", self.path);
        *current = Loaded {
            spec: Some(spec),
            stamp: file_stamp(&self.path).await?,
        };
        Ok(())
    }
}

/// Reads and writes the desired state through a remote api component.
pub struct HttpDesiredStateStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDesiredStateStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Can't build desired state client")?,
        })
    }
}

#[async_trait]
impl DesiredStateStore for HttpDesiredStateStore {
    async fn get(&self) -> Result<Option<DesiredSpec>, Error> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .context("Desired state store unreachable")?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<DesiredSpec>()
                .await
                .map(Some)
                .context("Can't decode desired state"),
            status => Err(anyhow!("Desired state store answered {}", status)),
        }
    }

    async fn set(&self, spec: DesiredSpec) -> Result<(), Error> {
        self.client
            .post(format!("{}/deploy", self.base_url))
            .json(&spec)
            .send()
            .await
            .context("Desired state store unreachable")?
            .error_for_status()
            .context("Desired state store rejected the deployment")?;
        Ok(())
    }
}
