//! One-shot HTTP server receiving the JWT after a browser login

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const JWT_PARAM: &str = "pomerium_jwt";
const MAX_FORM_SIZE: usize = 64 * 1024;

/// Callback server task, stopped on drop
pub(crate) struct CallbackServer(JoinHandle<()>);

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CallbackServer {
    /// Serve `listener`, sending every received token to `jwt_tx`
    pub fn spawn(listener: TcpListener, jwt_tx: mpsc::Sender<String>) -> Self {
        Self(tokio::spawn(serve(listener, jwt_tx)))
    }
}

async fn serve(listener: TcpListener, jwt_tx: mpsc::Sender<String>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Login callback listener failed: {}", e);
                return;
            }
        };
        debug!("Login callback connection from {}", peer);

        let jwt_tx = jwt_tx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, jwt_tx.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Login callback connection error: {}", e);
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    jwt_tx: mpsc::Sender<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let Some(jwt) = request_jwt(req).await else {
        return Ok(text_response(StatusCode::NOT_FOUND, "not found"));
    };
    let _ = jwt_tx.send(jwt).await;
    Ok(text_response(
        StatusCode::OK,
        "login complete, you may close this page",
    ))
}

/// Token from a form body, falling back to the query string
async fn request_jwt(req: Request<Incoming>) -> Option<String> {
    let query_jwt = req.uri().query().and_then(form_value);

    let is_form = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if req.method() != Method::POST || !is_form {
        return query_jwt;
    }

    let body = Limited::new(req.into_body(), MAX_FORM_SIZE)
        .collect()
        .await
        .ok()?
        .to_bytes();
    std::str::from_utf8(&body)
        .ok()
        .and_then(form_value)
        .or(query_jwt)
}

fn form_value(encoded: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .find(|(name, _)| name == JWT_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
