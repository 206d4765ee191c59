//! HTTPS client for the WeCom API.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use wedrive_token_cache::{DEFAULT_TTL, TokenError, TokenFuture, TokenGrant, TokenSource};

use crate::types::{
    Envelope, FinishResponse, InitOutcome, InitResponse, TokenResponse, UploadFinishRequest,
    UploadInitRequest, UploadPartRequest,
};
use crate::{ApiError, ApiFuture, DriveApi};

pub const DEFAULT_BASE_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin";

/// Per-request timeout, sized for a 2 MiB part.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// WeCom API client for one corp identity.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    corp_id: String,
    secret: String,
}

impl Client {
    /// Creates a client with the default request timeout.
    pub fn new(corp_id: &str, secret: &str) -> Result<Self, ApiError> {
        Self::with_timeout(corp_id, secret, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(corp_id: &str, secret: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            corp_id: corp_id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Points the client at another API root.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Performs a GET request and decodes the JSON body.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(endpoint, "GET");
        let resp = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(strip_url)?;
        read_body(resp).await
    }

    /// Performs a token-authenticated POST with a JSON body.
    async fn post_json<T, B>(&self, endpoint: &str, access_token: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(endpoint, "POST");
        let resp = self
            .http
            .post(&url)
            .query(&[("access_token", access_token)])
            .json(body)
            .send()
            .await
            .map_err(strip_url)?;
        read_body(resp).await
    }
}

/// Drops the request URL from transport errors; it carries the access token.
fn strip_url(err: reqwest::Error) -> ApiError {
    ApiError::Http(err.without_url())
}

async fn read_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let body = resp.bytes().await.map_err(strip_url)?;
    decode(&body)
}

/// Checks the `errcode` envelope, then decodes the payload.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if envelope.errcode != 0 {
        return Err(ApiError::Remote {
            code: envelope.errcode,
            message: envelope.errmsg,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

impl DriveApi for Client {
    fn upload_init<'a>(
        &'a self,
        access_token: &'a str,
        request: &'a UploadInitRequest,
    ) -> ApiFuture<'a, InitOutcome> {
        Box::pin(async move {
            let resp: InitResponse = self
                .post_json("/wedrive/file_upload_init", access_token, request)
                .await?;
            resp.into_outcome()
        })
    }

    fn upload_part<'a>(
        &'a self,
        access_token: &'a str,
        request: &'a UploadPartRequest,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let _: Envelope = self
                .post_json("/wedrive/file_upload_part", access_token, request)
                .await?;
            Ok(())
        })
    }

    fn upload_finish<'a>(
        &'a self,
        access_token: &'a str,
        upload_key: &'a str,
    ) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let resp: FinishResponse = self
                .post_json(
                    "/wedrive/file_upload_finish",
                    access_token,
                    &UploadFinishRequest { upload_key },
                )
                .await?;
            if resp.fileid.is_empty() {
                return Err(ApiError::Malformed("missing fileid".into()));
            }
            Ok(resp.fileid)
        })
    }
}

impl TokenSource for Client {
    fn fetch_token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            let resp: TokenResponse = self
                .get_json(
                    "/gettoken",
                    &[
                        ("corpid", self.corp_id.as_str()),
                        ("corpsecret", self.secret.as_str()),
                    ],
                )
                .await
                .map_err(token_error)?;
            if resp.access_token.is_empty() {
                return Err(TokenError::Malformed("missing access_token".into()));
            }
            Ok(TokenGrant {
                access_token: resp.access_token,
                expires_in: resp.expires_in.map_or(DEFAULT_TTL, Duration::from_secs),
            })
        })
    }
}

fn token_error(err: ApiError) -> TokenError {
    match err {
        ApiError::Remote { code, message } => TokenError::Rejected { code, message },
        ApiError::Json(e) => TokenError::Malformed(e.to_string()),
        ApiError::Malformed(m) => TokenError::Malformed(m),
        other => TokenError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Reads one HTTP request, headers and body, off the stream.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Starts a one-shot mock server. The handle yields the raw request.
    async fn mock_server(status: u16, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let resp = format!(
                "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
            request
        });

        (url, handle)
    }

    fn client(url: String) -> Client {
        Client::new("corp-1", "secret-1").unwrap().with_base_url(url)
    }

    fn init_request() -> UploadInitRequest {
        UploadInitRequest {
            space_id: "space-1".into(),
            parent_id: "space-1".into(),
            file_name: "report.pdf".into(),
            size: 3,
            block_sha: vec!["a9993e364706816aba3e25717850c26c9cd0d89d".into()],
            skip_push_card: false,
        }
    }

    #[tokio::test]
    async fn fetch_token_parses_grant() {
        let (url, handle) = mock_server(
            200,
            r#"{"errcode":0,"errmsg":"ok","access_token":"AT-1","expires_in":3600}"#,
        )
        .await;

        let grant = client(url).fetch_token().await.unwrap();
        assert_eq!(grant.access_token, "AT-1");
        assert_eq!(grant.expires_in, Duration::from_secs(3600));

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /gettoken?"));
        assert!(request.contains("corpid=corp-1"));
        assert!(request.contains("corpsecret=secret-1"));
    }

    #[tokio::test]
    async fn fetch_token_defaults_lifetime() {
        let (url, handle) = mock_server(200, r#"{"errcode":0,"access_token":"AT-2"}"#).await;
        let grant = client(url).fetch_token().await.unwrap();
        assert_eq!(grant.expires_in, DEFAULT_TTL);
        handle.abort();
    }

    #[tokio::test]
    async fn fetch_token_rejected_by_platform() {
        let (url, handle) =
            mock_server(200, r#"{"errcode":40013,"errmsg":"invalid corpid"}"#).await;
        let err = client(url).fetch_token().await.unwrap_err();
        assert_eq!(
            err,
            TokenError::Rejected {
                code: 40013,
                message: "invalid corpid".into()
            }
        );
        handle.abort();
    }

    #[tokio::test]
    async fn fetch_token_without_token_is_malformed() {
        let (url, handle) = mock_server(200, r#"{"errcode":0}"#).await;
        let err = client(url).fetch_token().await.unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn upload_init_sends_block_fingerprints() {
        let (url, handle) =
            mock_server(200, r#"{"errcode":0,"errmsg":"ok","upload_key":"K-1"}"#).await;

        let outcome = client(url).upload_init("AT", &init_request()).await.unwrap();
        assert_eq!(
            outcome,
            InitOutcome::Session {
                upload_key: "K-1".into()
            }
        );

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /wedrive/file_upload_init?access_token=AT "));
        assert!(request.contains(r#""spaceid":"space-1""#));
        assert!(request.contains(r#""fatherid":"space-1""#));
        assert!(request.contains(r#""block_sha":["a9993e364706816aba3e25717850c26c9cd0d89d"]"#));
    }

    #[tokio::test]
    async fn upload_init_reports_existing_file() {
        let (url, handle) =
            mock_server(200, r#"{"errcode":0,"hit_exist":true,"fileid":"F-9"}"#).await;
        let outcome = client(url).upload_init("AT", &init_request()).await.unwrap();
        assert_eq!(
            outcome,
            InitOutcome::Exists {
                file_id: "F-9".into()
            }
        );
        handle.abort();
    }

    #[tokio::test]
    async fn upload_init_expired_token_is_auth_failure() {
        let (url, handle) =
            mock_server(200, r#"{"errcode":42001,"errmsg":"access_token expired"}"#).await;
        let err = client(url).upload_init("AT", &init_request()).await.unwrap_err();
        assert!(err.is_auth_failure());
        assert!(!err.is_transient());
        handle.abort();
    }

    #[tokio::test]
    async fn upload_part_posts_index_and_content() {
        let (url, handle) = mock_server(200, r#"{"errcode":0,"errmsg":"ok"}"#).await;
        let part = UploadPartRequest {
            upload_key: "K-1".into(),
            index: 2,
            file_base64_content: "YWJj".into(),
        };
        client(url).upload_part("AT", &part).await.unwrap();

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /wedrive/file_upload_part?"));
        assert!(request.contains(r#""index":2"#));
        assert!(request.contains(r#""file_base64_content":"YWJj""#));
    }

    #[tokio::test]
    async fn upload_part_busy_is_transient() {
        let (url, handle) = mock_server(200, r#"{"errcode":-1,"errmsg":"system busy"}"#).await;
        let part = UploadPartRequest {
            upload_key: "K-1".into(),
            index: 1,
            file_base64_content: String::new(),
        };
        let err = client(url).upload_part("AT", &part).await.unwrap_err();
        assert!(err.is_transient());
        handle.abort();
    }

    #[tokio::test]
    async fn upload_finish_returns_file_id() {
        let (url, handle) = mock_server(200, r#"{"errcode":0,"fileid":"F-1"}"#).await;
        let file_id = client(url).upload_finish("AT", "K-1").await.unwrap();
        assert_eq!(file_id, "F-1");

        let request = handle.await.unwrap();
        assert!(request.contains(r#"{"upload_key":"K-1"}"#));
    }

    #[tokio::test]
    async fn server_error_status_is_transient() {
        let (url, handle) = mock_server(502, "bad gateway").await;
        let err = client(url).upload_finish("AT", "K-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 502, .. }));
        assert!(err.is_transient());
        handle.abort();
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client(format!("http://127.0.0.1:{port}"))
            .upload_finish("AT", "K-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Http(_)));
        assert!(err.is_transient());
        assert!(!err.to_string().contains("access_token"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = client("http://localhost:1/cgi-bin/".into());
        assert_eq!(c.base_url(), "http://localhost:1/cgi-bin");
    }
}
