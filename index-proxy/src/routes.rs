//! HTTP routing for the Simple Repository API: project list, per-project
//! file list, artifact download, and cache-invalidation endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use index_cache::{CoreFacade, Yanked};
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::error::Error;
use crate::fetchers::{http_artifact::HttpArtifactFetcher, http_metadata::HttpMetadataFetcher};
use crate::storage::local_fs::LocalFsStorage;

pub struct AppState {
    pub facade: CoreFacade<HttpMetadataFetcher, HttpArtifactFetcher, LocalFsStorage>,
    pub binary_file_mime_type: bool,
}

pub type State = Arc<AppState>;

pub fn get_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/:project/", get(project_files))
        .route("/:project/:filename", get(get_artifact))
        .route("/-/invalidate", post(invalidate_all))
        .route("/-/invalidate/:project", post(invalidate_project))
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("json"))
        .unwrap_or(false)
}

#[derive(Serialize)]
struct ApiMeta {
    #[serde(rename = "api-version")]
    api_version: &'static str,
}

const API_VERSION: ApiMeta = ApiMeta { api_version: "1.0" };

#[derive(Serialize)]
struct ProjectJson {
    name: String,
}

#[derive(Serialize)]
struct ProjectsResponse {
    meta: ApiMeta,
    projects: Vec<ProjectJson>,
}

#[derive(Serialize)]
struct FileJson {
    filename: String,
    url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    hashes: BTreeMap<String, String>,
    #[serde(rename = "requires-python", skip_serializing_if = "Option::is_none")]
    requires_python: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(rename = "upload-time", skip_serializing_if = "Option::is_none")]
    upload_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    yanked: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct FilesResponse {
    meta: ApiMeta,
    name: String,
    files: Vec<FileJson>,
}

fn yanked_json(yanked: &Yanked) -> Option<serde_json::Value> {
    match yanked {
        Yanked::No => None,
        Yanked::YesNoReason => Some(serde_json::Value::Bool(true)),
        Yanked::YesWithReason(reason) => Some(serde_json::Value::String(reason.clone())),
    }
}

fn file_json(file: &index_cache::FileEntry) -> FileJson {
    FileJson {
        filename: file.filename.clone(),
        url: file.url.clone(),
        hashes: file.hashes.clone(),
        requires_python: file.requires_python.clone(),
        size: file.size,
        upload_time: file.upload_time.clone(),
        yanked: yanked_json(&file.yanked),
    }
}

async fn index(Extension(state): Extension<State>, headers: HeaderMap) -> Result<Response, Error> {
    let projects = state.facade.list_projects().await?;

    if wants_json(&headers) {
        let body = ProjectsResponse {
            meta: API_VERSION,
            projects: projects
                .into_iter()
                .map(|p| ProjectJson {
                    name: p.name.as_str().to_string(),
                })
                .collect(),
        };
        return Ok(Json(body).into_response());
    }

    let mut html = String::from("<!DOCTYPE html><html><body>\n");
    for project in projects {
        html.push_str(&format!(
            "<a href=\"{name}/\">{name}</a><br/>\n",
            name = project.name.as_str()
        ));
    }
    html.push_str("</body></html>\n");
    Ok(Html(html).into_response())
}

async fn project_files(
    Extension(state): Extension<State>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let files = state.facade.list_files(&project).await?;

    if wants_json(&headers) {
        let body = FilesResponse {
            meta: API_VERSION,
            name: index_cache::normalize_project_name(&project),
            files: files.iter().map(file_json).collect(),
        };
        return Ok(Json(body).into_response());
    }

    let mut html = String::from("<!DOCTYPE html><html><body>\n");
    for file in &files {
        let mut attrs = String::new();
        if let Some(requires_python) = &file.requires_python {
            attrs.push_str(&format!(" data-requires-python=\"{requires_python}\""));
        }
        match &file.yanked {
            Yanked::No => {}
            Yanked::YesNoReason => attrs.push_str(" data-yanked=\"\""),
            Yanked::YesWithReason(reason) => {
                attrs.push_str(&format!(" data-yanked=\"{reason}\""))
            }
        }
        html.push_str(&format!(
            "<a href=\"{url}\"{attrs}>{filename}</a><br/>\n",
            url = file.url,
            filename = file.filename
        ));
    }
    html.push_str("</body></html>\n");
    Ok(Html(html).into_response())
}

async fn get_artifact(
    Extension(state): Extension<State>,
    Path((project, filename)): Path<(String, String)>,
) -> Result<Response, Error> {
    let artifact = state.facade.fetch_artifact(&project, &filename).await?;

    let content_type = if state.binary_file_mime_type {
        "application/octet-stream".to_string()
    } else {
        artifact
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string())
    };

    let stream = ReaderStream::new(artifact.reader);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .expect("static headers always build a valid response");

    if let Some(content_length) = artifact.content_length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, content_length.into());
    }

    Ok(response)
}

async fn invalidate_all(Extension(state): Extension<State>) -> Result<StatusCode, Error> {
    state.facade.invalidate_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate_project(
    Extension(state): Extension<State>,
    Path(project): Path<String>,
) -> Result<StatusCode, Error> {
    state.facade.invalidate(&project).await?;
    Ok(StatusCode::NO_CONTENT)
}
