use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{Request, Response};
use serde::Serialize;
use url::Url;

/// Generic HTTP client.
///
/// A trait is used here so to facilitate native HTTP/TLS when compiled for
/// mobile applications. Implementations must not retry: the engine treats
/// every transport failure as terminal.
#[async_trait]
pub trait AsyncHttpClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

pub(crate) fn base_request() -> http::request::Builder {
    Request::builder()
}

/// Build a `POST` request with an `application/x-www-form-urlencoded` body.
pub(crate) fn form_post_request<T: Serialize>(
    url: &Url,
    body: &T,
) -> Result<(http::request::Builder, Vec<u8>)> {
    let bytes = serde_urlencoded::to_string(body)
        .context("unable to encode form body")?
        .into_bytes();
    Ok((
        base_request()
            .method("POST")
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded"),
        bytes,
    ))
}

/// Build a `POST` request with an `application/json` body.
pub(crate) fn json_post_request<T: Serialize>(url: &Url, body: &T) -> Result<(http::request::Builder, Vec<u8>)> {
    let bytes = serde_json::to_vec(body).context("unable to encode json body")?;
    Ok((
        base_request()
            .method("POST")
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json"),
        bytes,
    ))
}

/// Execute a request and return `(status, body)`, treating the body as
/// opaque bytes. Status interpretation is left to the caller's
/// per-endpoint error table.
pub(crate) async fn send<H: AsyncHttpClient + ?Sized>(
    http: &H,
    request: Request<Vec<u8>>,
) -> Result<(u16, Vec<u8>)> {
    let response = http
        .execute(request)
        .await
        .context("http request failed")?;
    let status = response.status().as_u16();
    Ok((status, response.into_body()))
}

pub(crate) fn body_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}
