//! Fetches Simple Repository API documents over HTTP, preferring the
//! structured JSON representation and falling back to tolerant HTML anchor
//! parsing (spec §4.5).

use std::time::Duration;

use async_trait::async_trait;
use index_cache::{normalize_project_name, CoreError, FetchedMeta, FileEntry, ProjectListEntry, Result, Yanked};
use reqwest::{header, StatusCode, Url};
use scraper::{Html, Selector};
use serde::Deserialize;

const ACCEPT: &str = "application/vnd.pypi.simple.v1+json, text/html;q=0.01";

pub struct HttpMetadataFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpMetadataFetcher {
    pub fn new(client: reqwest::Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    fn project_url(index_url: &str, project: &str) -> String {
        let base = index_url.trim_end_matches('/');
        format!("{base}/{project}/")
    }

    async fn get(&self, url: &str) -> Result<(StatusCode, Option<String>, String)> {
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, ACCEPT)
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response
            .text()
            .await
            .map_err(|e| CoreError::UpstreamProtocol(e.to_string()))?;

        Ok((status, content_type, body))
    }
}

fn classify_transport_error(err: reqwest::Error) -> CoreError {
    CoreError::UpstreamUnavailable(err.to_string())
}

fn classify_status(status: StatusCode) -> Option<CoreError> {
    if status == StatusCode::NOT_FOUND {
        return Some(CoreError::NotFound);
    }
    if status.is_server_error() {
        return Some(CoreError::UpstreamUnavailable(format!(
            "upstream returned {status}"
        )));
    }
    if status.is_client_error() {
        return Some(CoreError::UpstreamProtocol(format!(
            "upstream returned {status}"
        )));
    }
    None
}

#[async_trait]
impl index_cache::MetadataFetcher for HttpMetadataFetcher {
    async fn fetch_projects(&self, index_url: &str) -> Result<FetchedMeta<Vec<ProjectListEntry>>> {
        let (status, content_type, body) = self.get(index_url).await?;
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let projects = if is_json(content_type.as_deref()) {
            parse_projects_json(&body)?
        } else {
            parse_projects_html(&body)
        };

        Ok(FetchedMeta {
            payload: projects,
            etag: None,
        })
    }

    async fn fetch_files(
        &self,
        index_url: &str,
        project: &str,
    ) -> Result<FetchedMeta<Vec<FileEntry>>> {
        let url = Self::project_url(index_url, project);
        let (status, content_type, body) = self.get(&url).await?;
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let files = if is_json(content_type.as_deref()) {
            parse_files_json(&body)?
        } else {
            parse_files_html(&body, &url)
        };

        Ok(FetchedMeta {
            payload: files,
            etag: None,
        })
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.contains("json"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct ProjectsDoc {
    #[serde(default)]
    projects: Vec<ProjectDoc>,
}

#[derive(Debug, Deserialize)]
struct ProjectDoc {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FilesDoc {
    #[serde(default)]
    files: Vec<FileDoc>,
}

#[derive(Debug, Deserialize)]
struct FileDoc {
    filename: String,
    url: String,
    #[serde(default)]
    hashes: std::collections::BTreeMap<String, String>,
    #[serde(default, rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "upload-time")]
    upload_time: Option<String>,
    #[serde(default)]
    yanked: Option<YankedDoc>,
    #[serde(default, rename = "dist-info-metadata")]
    dist_info_metadata: Option<CoreMetadataDoc>,
    #[serde(default, rename = "core-metadata")]
    core_metadata: Option<CoreMetadataDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YankedDoc {
    Bool(bool),
    Reason(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoreMetadataDoc {
    Bool(bool),
    Hashes(std::collections::BTreeMap<String, String>),
}

fn yanked_from_doc(doc: Option<YankedDoc>) -> Yanked {
    match doc {
        None => Yanked::No,
        Some(YankedDoc::Bool(false)) => Yanked::No,
        Some(YankedDoc::Bool(true)) => Yanked::YesNoReason,
        Some(YankedDoc::Reason(reason)) if reason.is_empty() => Yanked::YesNoReason,
        Some(YankedDoc::Reason(reason)) => Yanked::YesWithReason(reason),
    }
}

fn core_metadata_from_doc(
    doc: Option<CoreMetadataDoc>,
) -> Option<std::collections::BTreeMap<String, String>> {
    match doc {
        None => None,
        Some(CoreMetadataDoc::Bool(false)) => None,
        Some(CoreMetadataDoc::Bool(true)) => Some(std::collections::BTreeMap::new()),
        Some(CoreMetadataDoc::Hashes(hashes)) => Some(hashes),
    }
}

fn parse_projects_json(body: &str) -> Result<Vec<ProjectListEntry>> {
    let doc: ProjectsDoc =
        serde_json::from_str(body).map_err(|e| CoreError::UpstreamProtocol(e.to_string()))?;
    Ok(doc
        .projects
        .into_iter()
        .map(|p| ProjectListEntry {
            name: normalize_project_name(&p.name).into(),
        })
        .collect())
}

fn parse_files_json(body: &str) -> Result<Vec<FileEntry>> {
    let doc: FilesDoc =
        serde_json::from_str(body).map_err(|e| CoreError::UpstreamProtocol(e.to_string()))?;
    Ok(doc
        .files
        .into_iter()
        .map(|f| FileEntry {
            filename: f.filename,
            url: f.url,
            hashes: f.hashes,
            requires_python: f.requires_python,
            size: f.size,
            upload_time: f.upload_time,
            yanked: yanked_from_doc(f.yanked),
            core_metadata: core_metadata_from_doc(f.dist_info_metadata.or(f.core_metadata)),
        })
        .collect())
}

fn parse_projects_html(body: &str) -> Vec<ProjectListEntry> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("a").expect("static selector is valid");

    document
        .select(&selector)
        .filter_map(|el| {
            let name = el.text().collect::<String>();
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(ProjectListEntry {
                name: normalize_project_name(name).into(),
            })
        })
        .collect()
}

/// Resolves `href` against the page it was found on. The Simple Repository
/// API does not require HTML indices to emit absolute links, but
/// `FileEntry.url` is always an absolute upstream URL, so a relative href
/// has to be joined against `page_url` before it can be stored.
fn resolve_href(page_url: &str, href: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|resolved| resolved.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn parse_files_html(body: &str, page_url: &str) -> Vec<FileEntry> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("a").expect("static selector is valid");

    document
        .select(&selector)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            let filename = el.text().collect::<String>();
            let filename = filename.trim();
            if filename.is_empty() {
                return None;
            }

            let requires_python = el
                .value()
                .attr("data-requires-python")
                .map(|s| s.to_string());

            let yanked = match el.value().attr("data-yanked") {
                None => Yanked::No,
                Some(reason) if reason.is_empty() => Yanked::YesNoReason,
                Some(reason) => Yanked::YesWithReason(reason.to_string()),
            };

            let core_metadata = el
                .value()
                .attr("data-dist-info-metadata")
                .or_else(|| el.value().attr("data-core-metadata"))
                .map(|_| std::collections::BTreeMap::new());

            Some(FileEntry {
                filename: filename.to_string(),
                url: resolve_href(page_url, href),
                hashes: std::collections::BTreeMap::new(),
                requires_python,
                size: None,
                upload_time: None,
                yanked,
                core_metadata,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_project_list() {
        let body = r#"{"meta":{"api-version":"1.0"},"projects":[{"name":"NumPy"},{"name":"Django"}]}"#;
        let projects = parse_projects_json(body).unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name.as_str(), "numpy");
        assert_eq!(projects[1].name.as_str(), "django");
    }

    #[test]
    fn parses_json_files_with_yanked_variants() {
        let body = r#"{"meta":{"api-version":"1.0"},"name":"foo","files":[
            {"filename":"foo-1.0.tar.gz","url":"https://example/foo-1.0.tar.gz"},
            {"filename":"foo-1.1.tar.gz","url":"https://example/foo-1.1.tar.gz","yanked":true},
            {"filename":"foo-1.2.tar.gz","url":"https://example/foo-1.2.tar.gz","yanked":"broken build"}
        ]}"#;
        let files = parse_files_json(body).unwrap();
        assert_eq!(files[0].yanked, Yanked::No);
        assert_eq!(files[1].yanked, Yanked::YesNoReason);
        assert_eq!(
            files[2].yanked,
            Yanked::YesWithReason("broken build".to_string())
        );
    }

    #[test]
    fn parses_html_anchor_list_tolerantly() {
        let body = r#"<!DOCTYPE html><html><body>
            <a href="foo-1.0.tar.gz">foo-1.0.tar.gz</a>
            <a href="foo-1.1.tar.gz" data-yanked="">foo-1.1.tar.gz</a>
            <a href="foo-1.2.tar.gz" data-yanked="broken build">foo-1.2.tar.gz</a>
            <a>not a link, skipped</a>
        </body></html>"#;
        let files = parse_files_html(body, "https://example.test/simple/foo/");
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].yanked, Yanked::No);
        assert_eq!(files[1].yanked, Yanked::YesNoReason);
        assert_eq!(
            files[2].yanked,
            Yanked::YesWithReason("broken build".to_string())
        );
    }

    #[test]
    fn relative_hrefs_are_resolved_against_the_page_url() {
        let body = r#"<!DOCTYPE html><html><body>
            <a href="foo-1.0.tar.gz">foo-1.0.tar.gz</a>
        </body></html>"#;
        let files = parse_files_html(body, "https://example.test/simple/foo/");
        assert_eq!(
            files[0].url,
            "https://example.test/simple/foo/foo-1.0.tar.gz"
        );
    }

    #[test]
    fn absolute_hrefs_are_kept_verbatim() {
        let body = r#"<!DOCTYPE html><html><body>
            <a href="https://files.example/foo-1.0.tar.gz">foo-1.0.tar.gz</a>
        </body></html>"#;
        let files = parse_files_html(body, "https://example.test/simple/foo/");
        assert_eq!(files[0].url, "https://files.example/foo-1.0.tar.gz");
    }

    #[test]
    fn malformed_json_is_upstream_protocol_error() {
        let err = parse_projects_json("not json").unwrap_err();
        assert!(matches!(err, CoreError::UpstreamProtocol(_)));
    }
}
