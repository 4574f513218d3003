use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Url};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

use crate::config::{MolePaths, ServerConfig};

use super::{RemoteEntry, RemoteError, RemoteStore};

const NOT_REGISTERED: &str = "empty response from server - are you registered?";

/// Certificate and key handed out by the server for a registration token.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Registration {
    pub cert: String,
    pub key: String,
}
#[derive(Deserialize, Debug)]
struct TokenResponse {
    token: String,
}

/// Client of the mole server, authenticated with the client certificate
/// obtained on registration.
pub(crate) struct HttpsRemote {
    base: Url,
    client: Client,
}

impl HttpsRemote {
    pub fn new(
        server: &ServerConfig,
        paths: &MolePaths,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut builder = Client::builder().use_rustls_tls().timeout(timeout);
        if paths.has_identity() {
            let mut pem = read_pem(&paths.cert_file)?;
            pem.extend(read_pem(&paths.key_file)?);
            let identity =
                Identity::from_pem(&pem).map_err(|e| RemoteError::Identity(e.to_string()))?;
            builder = builder.identity(identity);
        } else {
            debug!("no client certificate in {}", paths.root.display());
        }
        if let Some(ca_cert) = &server.ca_cert {
            let certificate = Certificate::from_pem(&read_pem(ca_cert)?)
                .map_err(|e| RemoteError::Identity(e.to_string()))?;
            builder = builder.add_root_certificate(certificate);
        }
        if server.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let base = Url::parse(&format!("https://{}:{}", server.host, server.port))
            .map_err(|e| RemoteError::Transport(format!("invalid server address: {e}")))?;
        Ok(HttpsRemote::from_parts(base, client))
    }
    pub fn from_parts(base: Url, client: Client) -> Self {
        HttpsRemote { base, client }
    }
    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Transport(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
    async fn send(&self, request: RequestBuilder) -> Result<String, RemoteError> {
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(RemoteError::Status(status.as_u16(), body));
        }
        Ok(body)
    }
    /// Structured endpoints answer with an empty body to clients they do not know.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        empty_message: &str,
    ) -> Result<T, RemoteError> {
        let body = self.send(request).await?;
        if body.trim().is_empty() {
            return Err(RemoteError::NotRegistered(empty_message.to_string()));
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::Protocol(e.to_string()))
    }
    pub async fn register(&self, token: &str) -> Result<Registration, RemoteError> {
        debug!("requesting registration from {}", self.base);
        let url = self.url(&["register", token])?;
        self.send_json(
            self.client.get(url),
            "empty response from server - verify that the token is correct and not already used",
        )
        .await
    }
    pub async fn new_token(&self) -> Result<String, RemoteError> {
        let url = self.url(&["newtoken"])?;
        let response: TokenResponse = self
            .send_json(self.client.post(url), NOT_REGISTERED)
            .await?;
        Ok(response.token)
    }
    pub async fn new_user(&self, name: &str) -> Result<String, RemoteError> {
        let url = self.url(&["users", name])?;
        let response: TokenResponse = self
            .send_json(
                self.client.post(url),
                "empty response from server - are you a registered admin?",
            )
            .await?;
        Ok(response.token)
    }
    pub async fn delete(&self, name: &str) -> Result<(), RemoteError> {
        let url = self.url(&["store", name])?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpsRemote {
    async fn list(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = self.url(&["store"])?;
        self.send_json(self.client.get(url), NOT_REGISTERED).await
    }
    async fn fetch(&self, name: &str) -> Result<String, RemoteError> {
        let url = self.url(&["store", name])?;
        self.send(self.client.get(url)).await
    }
    async fn store(&self, name: &str, content: &str) -> Result<(), RemoteError> {
        let url = self.url(&["store", name])?;
        self.send(self.client.put(url).body(content.to_string()))
            .await?;
        Ok(())
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, RemoteError> {
    std::fs::read(path).map_err(|e| RemoteError::Identity(format!("{}: {e}", path.display())))
}

fn request_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Answers one connection per canned response and hands back what was
    /// asked: the request line and the body.
    async fn serve(responses: Vec<(&'static str, &'static str)>) -> (Url, JoinHandle<Vec<(String, String)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = vec![];
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buffer = vec![];
                let mut chunk = [0u8; 1024];
                let head_end = loop {
                    let read = socket.read(&mut chunk).await.unwrap();
                    buffer.extend_from_slice(&chunk[..read]);
                    if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                while buffer.len() < head_end + length {
                    let read = socket.read(&mut chunk).await.unwrap();
                    buffer.extend_from_slice(&chunk[..read]);
                }
                let request_line = head.lines().next().unwrap().to_string();
                let request_body = String::from_utf8_lossy(&buffer[head_end..]).to_string();
                seen.push((request_line, request_body));
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            seen
        });
        (base, handle)
    }

    fn remote(base: Url) -> HttpsRemote {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpsRemote::from_parts(base, client)
    }

    #[tokio::test]
    async fn list_fetch_store() {
        let (base, server) = serve(vec![
            ("200 OK", r#"[{"name":"office.ini","mtime":1000}]"#),
            ("200 OK", "[general]\ndescription = office\n"),
            ("200 OK", ""),
        ])
        .await;
        let remote = remote(base);

        let listing = remote.list().await.unwrap();
        assert_eq!(listing, vec![RemoteEntry::new("office.ini", 1000)]);
        let content = remote.fetch("office.ini").await.unwrap();
        assert_eq!(content, "[general]\ndescription = office\n");
        remote.store("lab.ini", "[general]\n").await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0].0, "GET /store HTTP/1.1");
        assert_eq!(seen[1].0, "GET /store/office.ini HTTP/1.1");
        assert_eq!(seen[2].0, "PUT /store/lab.ini HTTP/1.1");
        assert_eq!(seen[2].1, "[general]\n");
    }

    #[tokio::test]
    async fn empty_listing_body_means_not_registered() {
        let (base, _server) = serve(vec![("200 OK", "")]).await;
        assert!(matches!(
            remote(base).list().await,
            Err(RemoteError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn garbage_listing_is_a_protocol_violation() {
        let (base, _server) = serve(vec![("200 OK", "<html>")]).await;
        assert!(matches!(
            remote(base).list().await,
            Err(RemoteError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (base, _server) = serve(vec![("403 Forbidden", "nope")]).await;
        match remote(base).fetch("office.ini").await {
            Err(RemoteError::Status(code, body)) => {
                assert_eq!(code, 403);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_endpoints() {
        let (base, server) = serve(vec![
            ("200 OK", r#"{"cert":"CERT","key":"KEY"}"#),
            ("200 OK", r#"{"token":"80721953-b4f2"}"#),
            ("200 OK", r#"{"token":"a1b2"}"#),
            ("200 OK", ""),
        ])
        .await;
        let remote = remote(base);
        assert_eq!(
            remote.register("80721953").await.unwrap(),
            Registration {
                cert: String::from("CERT"),
                key: String::from("KEY"),
            }
        );
        assert_eq!(remote.new_token().await.unwrap(), "80721953-b4f2");
        assert_eq!(remote.new_user("jb").await.unwrap(), "a1b2");
        remote.delete("office.ini").await.unwrap();

        let seen = server.await.unwrap();
        let lines: Vec<&str> = seen.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "GET /register/80721953 HTTP/1.1",
                "POST /newtoken HTTP/1.1",
                "POST /users/jb HTTP/1.1",
                "DELETE /store/office.ini HTTP/1.1",
            ]
        );
    }

    #[tokio::test]
    async fn used_token_is_not_registered() {
        let (base, _server) = serve(vec![("200 OK", "")]).await;
        assert!(matches!(
            remote(base).register("used").await,
            Err(RemoteError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        drop(listener);
        assert!(matches!(
            remote(base).list().await,
            Err(RemoteError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });
        let client = Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let remote = HttpsRemote::from_parts(base, client);
        assert!(matches!(remote.list().await, Err(RemoteError::Timeout)));
    }

    #[test]
    fn missing_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MolePaths::new(dir.path());
        let server = ServerConfig {
            ca_cert: Some(dir.path().join("ca.pem")),
            ..Default::default()
        };
        let result = HttpsRemote::new(&server, &paths, Duration::from_secs(1));
        assert!(matches!(result, Err(RemoteError::Identity(_))));
    }

    #[test]
    fn server_address() {
        let server = ServerConfig {
            host: String::from("mole.example.com"),
            port: 9443,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let remote =
            HttpsRemote::new(&server, &MolePaths::new(dir.path()), Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            remote.url(&["store", "office.ini"]).unwrap().as_str(),
            "https://mole.example.com:9443/store/office.ini"
        );
    }
}
