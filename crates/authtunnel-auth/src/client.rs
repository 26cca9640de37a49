//! Obtaining a JWT from the proxy

use crate::callback::CallbackServer;
use crate::AuthError;
use async_trait::async_trait;
use authtunnel_transport::{http_get, ProxyTarget, TlsOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const LOGIN_PATH: &str = "/.pomerium/api/v1/login";
const LOGIN_URL_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback receiving the login URL before a browser is opened
pub type OnOpenBrowser<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Mints a fresh JWT for a proxy
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a token for `server_url`.
    ///
    /// `on_open_browser` is called with the login URL before a browser is
    /// opened; it is not called when no interactive login is needed.
    async fn get_jwt(
        &self,
        cancel: &CancellationToken,
        server_url: &str,
        on_open_browser: &OnOpenBrowser<'_>,
    ) -> Result<String, AuthError>;
}

/// Login client for the proxy's login API
#[derive(Debug, Clone, Default)]
pub struct AuthClient {
    service_account: Option<String>,
    service_account_file: Option<PathBuf>,
    browser_command: Option<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl AuthClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed service-account token instead of logging in
    pub fn with_service_account(mut self, token: impl Into<String>) -> Self {
        self.service_account = Some(token.into()).filter(|t: &String| !t.is_empty());
        self
    }

    /// Read the service-account token from a file on every login
    pub fn with_service_account_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.service_account_file = Some(path.into()).filter(|p| !p.as_os_str().is_empty());
        self
    }

    /// Open login URLs with this command instead of the platform opener
    pub fn with_browser_command(mut self, command: impl Into<String>) -> Self {
        self.browser_command = Some(command.into()).filter(|c: &String| !c.is_empty());
        self
    }

    /// TLS settings used to reach an https proxy
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    async fn browser_login(
        &self,
        cancel: &CancellationToken,
        server_url: &str,
        on_open_browser: &OnOpenBrowser<'_>,
    ) -> Result<String, AuthError> {
        let target = self.login_target(server_url)?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(AuthError::Listener)?;
        let callback_addr = listener.local_addr().map_err(AuthError::Listener)?;
        let (jwt_tx, mut jwt_rx) = mpsc::channel(1);
        let _server = CallbackServer::spawn(listener, jwt_tx);

        let login_url = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            login_url = fetch_login_url(&target, callback_addr) => login_url?,
        };

        on_open_browser(&login_url);
        self.open_browser(cancel, &login_url).await?;
        eprintln!("Your browser has been opened to visit:\n\n{}\n", login_url);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            jwt = jwt_rx.recv() => {
                jwt.ok_or_else(|| AuthError::Callback("callback server stopped".to_string()))
            }
        }
    }

    /// Dialing target for the login API of `server_url`
    fn login_target(&self, server_url: &str) -> Result<ProxyTarget, AuthError> {
        let url = Url::parse(server_url)
            .map_err(|e| AuthError::InvalidServerUrl(format!("{}: {}", server_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::InvalidServerUrl(format!("{}: missing host", server_url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AuthError::InvalidServerUrl(format!("{}: missing port", server_url)))?;

        let tls = match url.scheme() {
            "https" => Some(match &self.tls {
                Some(tls) => tls.clone(),
                None => TlsOptions::default()
                    .build_client_config()
                    .map_err(|e| AuthError::LoginUrl(e.to_string()))?,
            }),
            "http" => None,
            other => {
                return Err(AuthError::InvalidServerUrl(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(ProxyTarget::new(
            "",
            authtunnel_proto::join_host_port(host, port),
            tls,
        ))
    }

    /// Run the browser command; a cancel kills it
    async fn open_browser(&self, cancel: &CancellationToken, url: &str) -> Result<(), AuthError> {
        let mut command = match &self.browser_command {
            Some(program) => tokio::process::Command::new(program),
            None => platform_opener(),
        };
        command.arg(url).kill_on_drop(true);
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            status = command.status() => status.map_err(|e| AuthError::Browser(e.to_string()))?,
        };
        if !status.success() {
            return Err(AuthError::Browser(format!("browser command exited with {}", status)));
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn platform_opener() -> tokio::process::Command {
    tokio::process::Command::new("open")
}

#[cfg(target_os = "windows")]
fn platform_opener() -> tokio::process::Command {
    let mut command = tokio::process::Command::new("cmd");
    command.args(["/C", "start", ""]);
    command
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_opener() -> tokio::process::Command {
    tokio::process::Command::new("xdg-open")
}

/// Ask the proxy for a login URL that redirects back to `callback_addr`
async fn fetch_login_url(
    target: &ProxyTarget,
    callback_addr: SocketAddr,
) -> Result<String, AuthError> {
    let path_and_query = login_path(callback_addr);
    debug!("Requesting login URL from {}{}", target.authority(), path_and_query);

    let response = http_get(target, &path_and_query, LOGIN_URL_TIMEOUT)
        .await
        .map_err(|e| AuthError::LoginUrl(e.to_string()))?;
    if !response.status.is_success() {
        return Err(AuthError::LoginUrl(response.status.to_string()));
    }

    let login_url = String::from_utf8_lossy(&response.body).trim().to_string();
    if login_url.is_empty() {
        return Err(AuthError::LoginUrl("empty response".to_string()));
    }
    Ok(login_url)
}

fn login_path(callback_addr: SocketAddr) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("pomerium_redirect_uri", &format!("http://{}", callback_addr))
        .finish();
    format!("{}?{}", LOGIN_PATH, query)
}

#[async_trait]
impl Authenticator for AuthClient {
    async fn get_jwt(
        &self,
        cancel: &CancellationToken,
        server_url: &str,
        on_open_browser: &OnOpenBrowser<'_>,
    ) -> Result<String, AuthError> {
        if let Some(token) = &self.service_account {
            return Ok(token.clone());
        }

        if let Some(path) = &self.service_account_file {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| AuthError::ServiceAccountFile {
                    path: path.clone(),
                    source,
                })?;
            return Ok(raw.trim().to_string());
        }

        info!("Starting browser login for {}", server_url);
        self.browser_login(cancel, server_url, on_open_browser).await
    }
}
