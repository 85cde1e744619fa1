// Build Handler
// HTTP endpoints for submitting builds and polling their status

use crate::error::{RpcError, RpcResult};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use isoforge_service::{userdata, workspace, BuildRequest, JobRegistry, Release};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

/// Body of `POST /api/v1/iso/generate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// `local` or `download`
    pub source_type: String,
    #[serde(rename = "sourceISO", default)]
    pub source_iso: Option<String>,
    #[serde(default)]
    pub code_name: Option<String>,
    #[serde(rename = "destinationISO")]
    pub destination_iso: String,
    pub user_data: String,
    #[serde(default)]
    pub package_list: Vec<String>,
    #[serde(rename = "useHWEKernel", default)]
    pub use_hwe_kernel: bool,
    #[serde(default)]
    pub md5_checksum: bool,
    #[serde(default)]
    pub gpg_verify: bool,
}

impl GenerateRequest {
    /// Check the wire fields and turn them into a build request.
    ///
    /// Remote callers only name a file inside the output directory; absolute
    /// destinations are left to the CLI.
    pub fn into_build_request(self) -> RpcResult<BuildRequest> {
        if !workspace::is_contained(&self.destination_iso) {
            return Err(RpcError::InvalidRequest(format!(
                "destinationISO '{}' must be a relative path inside the output directory",
                self.destination_iso
            )));
        }

        let release = match self.code_name.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(name.parse::<Release>()?),
        };

        let request = match self.source_type.as_str() {
            "local" => {
                let path = self
                    .source_iso
                    .filter(|path| !path.trim().is_empty())
                    .ok_or_else(|| {
                        RpcError::InvalidRequest(
                            "sourceISO is required when sourceType is local".to_string(),
                        )
                    })?;
                let mut request = BuildRequest::local(path, self.destination_iso);
                request.release = release;
                request
            }
            "download" => {
                let release = release.ok_or_else(|| {
                    RpcError::InvalidRequest(
                        "codeName is required when sourceType is download".to_string(),
                    )
                })?;
                BuildRequest::download(release, self.destination_iso)
            }
            other => {
                return Err(RpcError::InvalidRequest(format!(
                    "sourceType must be 'local' or 'download' (got '{}')",
                    other
                )))
            }
        };

        userdata::validate(self.user_data.as_bytes())?;

        Ok(request
            .with_user_data(userdata::with_cloud_config_header(self.user_data.as_bytes()))
            .with_packages(self.package_list)
            .with_hwe_kernel(self.use_hwe_kernel)
            .with_checksum_update(self.md5_checksum)
            .with_signature_verification(self.gpg_verify))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn generate(
    State(registry): State<JobRegistry>,
    Json(body): Json<GenerateRequest>,
) -> RpcResult<Json<Value>> {
    let request = body.into_build_request()?;
    let id = registry.submit(request).await?;

    Ok(Json(json!({
        "success": true,
        "buildID": id,
        "message": "ISO generation started",
    })))
}

pub async fn status(
    State(registry): State<JobRegistry>,
    Path(id): Path<String>,
) -> RpcResult<Json<Value>> {
    let job = registry.status(&id).await?;
    Ok(Json(json!({ "success": true, "status": job })))
}

pub async fn logs(
    State(registry): State<JobRegistry>,
    Path(id): Path<String>,
) -> RpcResult<Json<Value>> {
    let logs = registry.logs(&id).await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

pub async fn builds(State(registry): State<JobRegistry>) -> Json<Value> {
    let builds = registry.list().await;
    Json(json!({ "success": true, "builds": builds }))
}

/// Stream a completed build's image as an attachment
pub async fn download(
    State(registry): State<JobRegistry>,
    Path(id): Path<String>,
) -> RpcResult<Response> {
    let path = registry.artifact(&id).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        RpcError::NotFound(format!("cannot open {}: {}", path.display(), e))
    })?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.iso", id));
    tracing::info!(build = %id, path = %path.display(), "serving artifact");

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ];
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}
