use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode, header};
use tracing::debug;

use crate::gateway::{FetchError, FetchedResponse, GatewayRequest, GatewayResponse, OriginFetch};

/// Origin serving files from a local directory.
///
/// `/` maps to the index file. Missing files answer `404`, other read
/// failures `500`; both go through the gateway's fallback path like any
/// other unusable response.
#[derive(Clone, Debug)]
pub struct DirectoryOrigin {
    root: PathBuf,
    index_file: String,
}

impl DirectoryOrigin {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a request URL onto a file below the root, rejecting anything that
    /// could escape it.
    fn resolve(&self, url: &str) -> Option<PathBuf> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let relative = match path.trim_start_matches('/') {
            "" => self.index_file.as_str(),
            rest => rest,
        };

        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl OriginFetch for DirectoryOrigin {
    async fn fetch(&self, request: &GatewayRequest) -> Result<FetchedResponse, FetchError> {
        let Some(file) = self.resolve(&request.url) else {
            debug!(url = %request.url, "rejected path outside origin root");
            return Ok(FetchedResponse::basic(not_found()));
        };

        let response = match tokio::fs::read(&file).await {
            Ok(content) => GatewayResponse::ok(content)
                .with_header(header::CONTENT_TYPE, content_type_for(&file)),
            Err(err) if err.kind() == ErrorKind::NotFound => not_found(),
            Err(err) => GatewayResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("server error: {}", err.kind()),
            ),
        };
        Ok(FetchedResponse::basic(response))
    }
}

fn not_found() -> GatewayResponse {
    GatewayResponse::new(StatusCode::NOT_FOUND, "file not found")
}

fn content_type_for(file: &Path) -> HeaderValue {
    let mime = mime_guess::from_path(file).first_or_octet_stream();
    let textual = mime.type_() == mime_guess::mime::TEXT
        || mime.subtype() == mime_guess::mime::JAVASCRIPT
        || mime.subtype() == mime_guess::mime::JSON;
    let value = if textual && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{mime}; charset=utf-8")
    } else {
        mime.to_string()
    };
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}
