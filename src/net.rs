use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// The slice of HTTP the host needs.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// `Content-Length` from a HEAD request, `None` when the header is absent.
    async fn head_content_length(&self, url: &str) -> Result<Option<u64>>;
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn head_content_length(&self, url: &str) -> Result<Option<u64>> {
        let resp = self.client.head(url).send().await?.error_for_status()?;
        Ok(resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok()))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Size of the resource at `url`: HEAD first, full fetch when the server
/// does not say.
pub async fn file_size(fetcher: &dyn HttpFetcher, url: &str) -> Result<u64> {
    match fetcher.head_content_length(url).await {
        Ok(Some(len)) => return Ok(len),
        Ok(None) => debug!("No content-length for {url}, fetching body"),
        Err(e) => warn!("HEAD {url} failed ({e:#}), fetching body"),
    }
    let body = fetcher
        .fetch_bytes(url)
        .await
        .with_context(|| format!("could not fetch {url}"))?;
    Ok(body.len() as u64)
}

/// The platform's download capability.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Store the resource under `filename`, renaming on conflict. Returns
    /// the path actually written.
    async fn download(&self, url: &str, filename: &str) -> Result<PathBuf>;
}

/// Saves downloads into a directory. Existing files are never overwritten.
pub struct FsDownloader {
    dir: PathBuf,
    fetcher: Arc<dyn HttpFetcher>,
}

impl FsDownloader {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self { dir: dir.into(), fetcher }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    async fn download(&self, url: &str, filename: &str) -> Result<PathBuf> {
        let name = sanitize_filename(filename)?;
        let bytes = self.fetcher.fetch_bytes(url).await?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("could not create {}", self.dir.display()))?;
        let path = write_unique(&self.dir, &name, &bytes)?;
        info!("Downloaded {url} to {}", path.display());
        Ok(path)
    }
}

fn sanitize_filename(filename: &str) -> Result<String> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim().to_string())
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." {
        bail!("invalid filename `{filename}`");
    }
    Ok(name)
}

/// `name.ext`, `name (1).ext`, `name (2).ext`, ...
fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

fn write_unique(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    for n in 0..10_000 {
        let target = dir.join(candidate_name(name, n));
        match tmp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => tmp = e.file,
            Err(e) => return Err(e.error.into()),
        }
    }
    Err(anyhow!("no free filename for `{name}` in {}", dir.display()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Serves canned bodies; `lengths` controls what HEAD reports.
    #[derive(Default)]
    pub struct StaticFetcher {
        pub bodies: HashMap<String, Vec<u8>>,
        pub lengths: HashMap<String, u64>,
    }

    #[async_trait]
    impl HttpFetcher for StaticFetcher {
        async fn head_content_length(&self, url: &str) -> Result<Option<u64>> {
            if !self.bodies.contains_key(url) {
                bail!("404 for {url}");
            }
            Ok(self.lengths.get(url).copied())
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
            self.bodies.get(url).cloned().ok_or_else(|| anyhow!("404 for {url}"))
        }
    }

    fn fetcher() -> StaticFetcher {
        let mut f = StaticFetcher::default();
        f.bodies.insert("https://a/img.png".into(), vec![1, 2, 3, 4]);
        f.bodies.insert("https://a/big.png".into(), vec![0; 10]);
        f.lengths.insert("https://a/big.png".into(), 2048);
        f
    }

    #[tokio::test]
    async fn size_prefers_head() {
        assert_eq!(file_size(&fetcher(), "https://a/big.png").await.unwrap(), 2048);
    }

    #[tokio::test]
    async fn size_falls_back_to_body() {
        assert_eq!(file_size(&fetcher(), "https://a/img.png").await.unwrap(), 4);
        assert!(file_size(&fetcher(), "https://a/missing.png").await.is_err());
    }

    #[test]
    fn candidate_names() {
        assert_eq!(candidate_name("cat.png", 0), "cat.png");
        assert_eq!(candidate_name("cat.png", 2), "cat (2).png");
        assert_eq!(candidate_name("README", 1), "README (1)");
        assert_eq!(candidate_name(".hidden", 1), ".hidden (1)");
    }

    #[tokio::test]
    async fn conflicting_downloads_are_renamed() {
        let dir = TempDir::new().unwrap();
        let dl = FsDownloader::new(dir.path(), Arc::new(fetcher()));
        let first = dl.download("https://a/img.png", "img.png").await.unwrap();
        let second = dl.download("https://a/img.png", "img.png").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "img.png");
        assert_eq!(second.file_name().unwrap(), "img (1).png");
        assert_eq!(fs::read(&first).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(fs::read(&second).unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn filename_cannot_escape_download_dir() {
        let dir = TempDir::new().unwrap();
        let dl = FsDownloader::new(dir.path().join("out"), Arc::new(fetcher()));
        let path = dl.download("https://a/img.png", "../../etc/img.png").await.unwrap();
        assert_eq!(path, dir.path().join("out").join("img.png"));
        assert!(dl.download("https://a/img.png", "..").await.is_err());
    }
}
