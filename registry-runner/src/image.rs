use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};
use tracing::info;

/// Makes sure `file` holds the image behind `url`. An existing file counts as
/// cached and is never fetched again. Downloads land in `<file>.part` first
/// so an interrupted transfer is never taken for a cached image.
pub async fn ensure_image_file(
    client: &Client,
    url: &str,
    file: &Path,
    sha256: Option<&str>,
) -> Result<PathBuf> {
    if fs::try_exists(file).await? {
        info!("image {} already cached", file.display());
        return Ok(file.to_path_buf());
    }

    let part = part_path(file);
    if let Err(err) = download(client, url, &part, sha256).await {
        let _ = fs::remove_file(&part).await;
        return Err(err);
    }
    fs::rename(&part, file)
        .await
        .with_context(|| format!("could not move {} into place", part.display()))?;
    Ok(file.to_path_buf())
}

async fn download(client: &Client, url: &str, part: &Path, sha256: Option<&str>) -> Result<()> {
    info!("downloading {url} to {}", part.display());
    let mut resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("could not fetch {url}"))?;
    if !resp.status().is_success() {
        bail!("fetching {url} failed: status={}", resp.status().as_u16());
    }

    let mut out = fs::File::create(part)
        .await
        .with_context(|| format!("could not create {}", part.display()))?;
    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        hasher.update(&chunk);
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;
    drop(out);

    let digest = format!("{:x}", hasher.finalize());
    if let Some(expected) = sha256 {
        if !digest.eq_ignore_ascii_case(expected.trim()) {
            bail!("checksum mismatch for {url}: expected {expected}, got {digest}");
        }
    }
    info!("downloaded {written} bytes, sha256 {digest}");
    Ok(())
}

fn part_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    const BODY: &[u8] = b"not really a qcow2";

    fn body_digest() -> String {
        format!("{:x}", Sha256::digest(BODY))
    }

    async fn serve() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/img/img.qcow2",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    BODY
                }),
            )
            .route("/img/missing.qcow2", get(|| async { StatusCode::NOT_FOUND }))
            .with_state(hits.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/img", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (base, hits)
    }

    #[tokio::test]
    async fn fetches_once() {
        let (base, hits) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("img.qcow2");
        let client = Client::new();
        let url = format!("{base}/img.qcow2");

        let path = ensure_image_file(&client, &url, &file, Some(&body_digest()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        ensure_image_file(&client, &url, &file, None).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!part_path(&file).exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let (base, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("img.qcow2");

        let err = ensure_image_file(&Client::new(), &format!("{base}/img.qcow2"), &file, Some("00"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!file.exists());
        assert!(!part_path(&file).exists());
    }

    #[tokio::test]
    async fn http_errors_are_fatal() {
        let (base, _) = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing.qcow2");

        let err = ensure_image_file(&Client::new(), &format!("{base}/missing.qcow2"), &file, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(!file.exists());
    }
}
