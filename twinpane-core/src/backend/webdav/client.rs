use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use url::Url;

use super::multistatus::{self, DavResource, PROPFIND_BODY};
use crate::error::SourceError;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Thin WebDAV client over one `reqwest::Client`.
#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl DavClient {
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            http,
            base_url: parse_base(base_url)?,
            credentials,
        })
    }

    /// URL of a canonical source path; collections get a trailing slash.
    pub fn url_for(&self, path: &str, collection: bool) -> Result<Url, SourceError> {
        join_url(&self.base_url, path, collection)
    }

    /// Source path of an `href` from a multistatus response.
    pub fn path_of(&self, href: &str) -> Result<String, SourceError> {
        let url = self
            .base_url
            .join(href)
            .map_err(|err| SourceError::Transport(format!("bad href {href:?}: {err}")))?;
        let decoded = percent_decode_str(url.path()).decode_utf8_lossy();
        let base = percent_decode_str(self.base_url.path()).decode_utf8_lossy();
        let base = base.trim_end_matches('/');
        let relative = decoded.strip_prefix(base).unwrap_or(&decoded);
        let path = paths::canonicalize(&format!("/{relative}"));
        Ok(path)
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some(credentials) => {
                builder.basic_auth(&credentials.username, Some(&credentials.password))
            }
            None => builder,
        }
    }

    pub async fn propfind(&self, path: &str, depth: u8) -> Result<Vec<DavResource>, SourceError> {
        let url = self.url_for(path, false)?;
        let response = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let response = Self::handle_response(response, path).await?;
        let body = response.text().await?;
        multistatus::parse(&body)
    }

    pub async fn get(&self, path: &str) -> Result<Response, SourceError> {
        let url = self.url_for(path, false)?;
        let response = self.request(Method::GET, url).send().await?;
        Self::handle_response(response, path).await
    }

    pub async fn put(
        &self,
        url: Url,
        body: Body,
        length: u64,
        headers: HeaderMap,
        path: &str,
    ) -> Result<(), SourceError> {
        let response = self
            .request(Method::PUT, url)
            .headers(headers)
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        Self::handle_response(response, path).await.map(drop)
    }

    pub async fn mkcol(&self, url: Url, headers: HeaderMap, path: &str) -> Result<(), SourceError> {
        let response = self
            .request(dav_method("MKCOL")?, url)
            .headers(headers)
            .send()
            .await?;
        Self::handle_response(response, path).await.map(drop)
    }

    pub async fn move_to(
        &self,
        from: Url,
        to: &Url,
        overwrite: bool,
        headers: HeaderMap,
        path: &str,
    ) -> Result<(), SourceError> {
        let response = self
            .request(dav_method("MOVE")?, from)
            .header("Destination", to.as_str())
            .header("Overwrite", if overwrite { "T" } else { "F" })
            .headers(headers)
            .send()
            .await?;
        Self::handle_response(response, path).await.map(drop)
    }

    pub async fn delete(&self, url: Url, path: &str) -> Result<(), SourceError> {
        let response = self.request(Method::DELETE, url).send().await?;
        Self::handle_response(response, path).await.map(drop)
    }

    async fn handle_response(response: Response, path: &str) -> Result<Response, SourceError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            Err(SourceError::NotFound(path.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::Api { status, body })
        }
    }
}

fn dav_method(name: &str) -> Result<Method, SourceError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|err| SourceError::Transport(format!("invalid method {name}: {err}")))
}

pub(crate) fn parse_base(raw: &str) -> Result<Url, SourceError> {
    let mut url = Url::parse(raw)
        .map_err(|err| SourceError::InvalidConfig(format!("invalid url {raw:?}: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(SourceError::InvalidConfig(format!(
            "url {raw:?} cannot hold paths"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn join_url(base: &Url, path: &str, collection: bool) -> Result<Url, SourceError> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            SourceError::InvalidConfig(format!("url {base} cannot hold paths"))
        })?;
        segments.pop_if_empty();
        let mut pushed = false;
        for segment in path.split(paths::SEPARATOR).filter(|s| !s.is_empty()) {
            segments.push(segment);
            pushed = true;
        }
        if collection || !pushed {
            segments.push("");
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DavClient {
        DavClient::new(
            "https://cloud.example.com/remote.php/dav/files/ann",
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn encodes_path_segments() {
        let client = client();
        assert_eq!(
            client.url_for("/Photos/summer 2024.jpg", false).unwrap().as_str(),
            "https://cloud.example.com/remote.php/dav/files/ann/Photos/summer%202024.jpg"
        );
        assert_eq!(
            client.url_for("/Photos", true).unwrap().as_str(),
            "https://cloud.example.com/remote.php/dav/files/ann/Photos/"
        );
        assert_eq!(
            client.url_for("/", false).unwrap().as_str(),
            "https://cloud.example.com/remote.php/dav/files/ann/"
        );
    }

    #[test]
    fn maps_hrefs_back_to_paths() {
        let client = client();
        assert_eq!(
            client
                .path_of("/remote.php/dav/files/ann/Photos/summer%202024.jpg")
                .unwrap(),
            "/Photos/summer 2024.jpg"
        );
        assert_eq!(
            client.path_of("/remote.php/dav/files/ann/").unwrap(),
            "/"
        );
        assert_eq!(
            client
                .path_of("https://cloud.example.com/remote.php/dav/files/ann/Docs/")
                .unwrap(),
            "/Docs"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            parse_base("mailto:ann@example.com"),
            Err(SourceError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_base("not a url"),
            Err(SourceError::InvalidConfig(_))
        ));
    }
}
