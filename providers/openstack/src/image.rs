use anyhow::{bail, Context, Result};
use common::provider::{Image, ImageRequest};
use reqwest::Body;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::OpenStack;

#[derive(Debug, Deserialize)]
struct ImageBody {
    id: String,
    name: Option<String>,
    size: Option<u64>,
    status: String,
}

impl From<ImageBody> for Image {
    fn from(body: ImageBody) -> Self {
        Image {
            id: body.id,
            name: body.name.unwrap_or_default(),
            size_bytes: body.size,
            status: body.status,
        }
    }
}

pub(crate) async fn create_image(os: &OpenStack, request: &ImageRequest) -> Result<Image> {
    // Glance v2 takes custom properties as top level string fields.
    let mut body = Map::new();
    body.insert("name".into(), Value::from(request.name.clone()));
    body.insert("container_format".into(), Value::from(request.container_format.clone()));
    body.insert("disk_format".into(), Value::from(request.disk_format.clone()));
    for (k, v) in &request.properties {
        body.insert(k.clone(), Value::from(v.clone()));
    }

    let url = format!("{}/images", os.session.image);
    let created: ImageBody = os
        .send(
            os.post(&url).json(&Value::Object(body)),
            &format!("create image {}", request.name),
        )
        .await?;

    let rollback = os.rollback(
        format!("{}/images/{}", os.session.image, created.id),
        format!("image {}", created.id),
    );
    match upload(os, request, &created.id).await {
        Ok(image) => {
            rollback.disarm();
            Ok(image)
        }
        Err(err) => {
            rollback.run().await;
            Err(err)
        }
    }
}

async fn upload(os: &OpenStack, request: &ImageRequest, id: &str) -> Result<Image> {
    let file = File::open(&request.local_file_path)
        .await
        .with_context(|| format!("could not open {}", request.local_file_path.display()))?;
    let len = file.metadata().await?.len();
    info!(
        "uploading {} ({} bytes) to image {}",
        request.local_file_path.display(),
        len,
        id
    );
    let upload_url = format!("{}/images/{}/file", os.session.image, id);
    os.checked(
        os.put(&upload_url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len)
            .body(Body::wrap_stream(ReaderStream::new(file))),
        &format!("upload image {}", request.name),
    )
    .await?;

    wait_for_active(os, id).await
}

async fn wait_for_active(os: &OpenStack, id: &str) -> Result<Image> {
    let url = format!("{}/images/{}", os.session.image, id);
    loop {
        let image: ImageBody = os.send(os.get(&url), &format!("get image {id}")).await?;
        match image.status.as_str() {
            "active" => return Ok(image.into()),
            "killed" | "deleted" | "pending_delete" => {
                bail!("image {id} ended up {}", image.status)
            }
            _ => tokio::time::sleep(os.poll_interval).await,
        }
    }
}

pub(crate) async fn delete_image(os: &OpenStack, image: &Image) -> Result<()> {
    let url = format!("{}/images/{}", os.session.image, image.id);
    os.send_delete(&url, &format!("delete image {}", image.name))
        .await
}
