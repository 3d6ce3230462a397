use std::{
    convert::Infallible,
    env,
    error::Error as StdError,
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderName, HeaderValue},
    http::uri::Authority,
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_rustls::TlsAcceptor;

use crate::{
    ca::{self, LeafCertGenerator},
    throttle::{Throttle, ThrottleSettings, ThrottledBody},
};

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;
pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

pub const PORT_ENV: &str = "PORT";

const PROXY_ERROR_REASON: &[u8] = b"Proxy Error";

/// Key used to correlate a recorded request with the one being replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentifier {
    /// Lowercased request method.
    pub method: String,
    /// `scheme://host[:port]/path?query` as the client addressed it.
    pub url: String,
}

impl RequestIdentifier {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_lowercase(),
            url: url.into(),
        }
    }

    /// Builds the identifier from the `Host` header (falling back to the URI
    /// authority) and the path and query of the request target.
    pub fn for_request<B>(req: &Request<B>) -> Self {
        let uri = req.uri();
        let scheme = uri.scheme_str().unwrap_or("http");
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .or_else(|| uri.authority().map(|authority| authority.as_str().to_owned()))
            .unwrap_or_default();
        let path_and_query = uri
            .path_and_query()
            .map(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("/");
        Self::new(
            req.method().as_str(),
            format!("{scheme}://{host}{path_and_query}"),
        )
    }
}

/// Behavior plugged into a [`ProxySession`].
///
/// `setup` runs once before the listener accepts connections, `handle` answers
/// every intercepted request (plain HTTP and HTTPS from inside a CONNECT
/// tunnel alike) and `shutdown` runs once after the listener is closed.
pub trait ProxyHandler: Send + Sync + 'static {
    fn setup(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn handle(
        &self,
        identifier: RequestIdentifier,
        req: Request<Incoming>,
    ) -> impl Future<Output = Response<ProxyBody>> + Send;

    fn shutdown(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Listen port. `None` falls back to `PORT`, then to an OS-assigned port.
    pub port: Option<u16>,
    /// Interception CA directory. `None` resolves through [`ca::resolve_ca_dir`].
    pub ca_dir: Option<PathBuf>,
    pub throttling: Option<ThrottleSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy session is not started")]
    NotStarted,
}

struct RunningProxy {
    listen_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct SessionState<H> {
    handler: Arc<H>,
    leaf_generator: LeafCertGenerator,
    throttle: Option<(Arc<Throttle>, Duration)>,
    shutdown_rx: watch::Receiver<bool>,
    request_seq: AtomicU64,
}

/// Intercepting proxy listening on loopback, delegating every request to a
/// [`ProxyHandler`].
pub struct ProxySession<H> {
    handler: Arc<H>,
    options: ProxyOptions,
    throttle: Option<Arc<Throttle>>,
    running: Option<RunningProxy>,
}

impl<H: ProxyHandler> ProxySession<H> {
    pub fn new(handler: H, options: ProxyOptions) -> Self {
        let throttle = options.throttling.map(|settings| {
            Arc::new(Throttle::from_mbps(settings.mbps, settings.flush_interval))
        });
        Self {
            handler: Arc::new(handler),
            options,
            throttle,
            running: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle on the handler that outlives borrows of the session, for use
    /// inside [`with_proxy`] callbacks.
    pub fn shared_handler(&self) -> Arc<H> {
        Arc::clone(&self.handler)
    }

    pub fn throttle(&self) -> Option<&Arc<Throttle>> {
        self.throttle.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.running
            .as_ref()
            .map(|running| running.listen_addr)
            .ok_or(ProxyError::NotStarted)
    }

    pub fn port(&self) -> Result<u16, ProxyError> {
        self.listen_addr().map(|addr| addr.port())
    }

    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if self.running.is_some() {
            anyhow::bail!("proxy session is already started");
        }
        ensure_rustls_crypto_provider()?;

        let port = resolve_port(self.options.port)?;
        let ca_dir = ca::resolve_ca_dir(self.options.ca_dir.as_deref())?;
        let leaf_generator = tokio::task::spawn_blocking(move || {
            ca::ensure_ca(&ca_dir)?;
            LeafCertGenerator::from_ca_dir(&ca_dir)
        })
        .await
        .map_err(|err| anyhow::anyhow!("join CA preparation task: {err}"))??;

        self.handler.setup().await?;

        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| anyhow::anyhow!("bind {bind_addr}: {err}"))?;
        let listen_addr = listener
            .local_addr()
            .map_err(|err| anyhow::anyhow!("get local_addr: {err}"))?;

        let throttle = match (self.throttle.as_ref(), self.options.throttling) {
            (Some(throttle), Some(settings)) => {
                throttle.start();
                Some((Arc::clone(throttle), settings.retry_interval))
            }
            _ => None,
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(SessionState {
            handler: Arc::clone(&self.handler),
            leaf_generator,
            throttle,
            shutdown_rx: shutdown_rx.clone(),
            request_seq: AtomicU64::new(0),
        });

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
                    accept = listener.accept() => {
                        let Ok((stream, _peer)) = accept else { continue };
                        let io = TokioIo::new(stream);
                        let state = Arc::clone(&state);
                        spawn_until_shutdown(state.shutdown_rx.clone(), async move {
                            let service = service_fn(move |req| {
                                route_request(req, Arc::clone(&state))
                            });
                            let builder = ConnectionBuilder::new(TokioExecutor::new());
                            if let Err(err) = builder
                                .serve_connection_with_upgrades(io, service)
                                .await
                            {
                                tracing::debug!("connection error: {err}");
                            }
                        });
                    }
                }
            }
        });

        tracing::info!(listen_addr = %listen_addr, "proxy session started");
        self.running = Some(RunningProxy {
            listen_addr,
            shutdown_tx,
            join,
        });
        Ok(listen_addr)
    }

    /// Closes the listener, cancels in-flight connections, then runs the
    /// handler's `shutdown`.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(running) = self.running.take() else {
            return Err(ProxyError::NotStarted.into());
        };
        let _ = running.shutdown_tx.send(true);
        let _ = running.join.await;
        tracing::info!(listen_addr = %running.listen_addr, "proxy session stopped");

        let result = self.handler.shutdown().await;
        if let Some(throttle) = self.throttle.as_ref() {
            throttle.stop();
        }
        result
    }
}

/// Starts the session, runs `f` with the listening port and stops the session
/// whether or not `f` succeeded.
pub async fn with_proxy<H, F, Fut, T>(session: &mut ProxySession<H>, f: F) -> anyhow::Result<T>
where
    H: ProxyHandler,
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let listen_addr = match session.start().await {
        Ok(listen_addr) => listen_addr,
        Err(err) => {
            tracing::error!("failed to start proxy session: {err:#}");
            return Err(err);
        }
    };
    let result = f(listen_addr.port()).await;
    let stopped = session.stop().await;
    let value = result?;
    stopped?;
    Ok(value)
}

fn resolve_port(port: Option<u16>) -> anyhow::Result<u16> {
    if let Some(port) = port {
        return Ok(port);
    }
    match env::var(PORT_ENV) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("parse {PORT_ENV}=`{value}`: {err}")),
        _ => Ok(0),
    }
}

fn spawn_until_shutdown<F>(mut shutdown_rx: watch::Receiver<bool>, work: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {}
            () = work => {}
        }
    })
}

pub(crate) fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

pub(crate) fn build_http_client() -> anyhow::Result<HttpClient> {
    ensure_rustls_crypto_provider()?;
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

async fn route_request<H: ProxyHandler>(
    mut req: Request<Incoming>,
    state: Arc<SessionState<H>>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() != Method::CONNECT {
        return Ok(respond(req, state).await);
    }

    let Some(connect_authority) = req.uri().authority().cloned() else {
        return Ok(proxy_simple_response(
            StatusCode::BAD_REQUEST,
            "CONNECT request target must include authority",
        ));
    };
    let on_upgrade = hyper::upgrade::on(&mut req);
    let shutdown_rx = state.shutdown_rx.clone();
    spawn_until_shutdown(shutdown_rx, async move {
        if let Err(err) = mitm_upgraded_connection(on_upgrade, connect_authority, state).await {
            tracing::debug!("CONNECT MITM session finished: {err}");
        }
    });
    Ok(Response::new(boxed_full(Bytes::new())))
}

async fn respond<H: ProxyHandler>(
    req: Request<Incoming>,
    state: Arc<SessionState<H>>,
) -> Response<ProxyBody> {
    let request_no = state.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let identifier = RequestIdentifier::for_request(&req);
    tracing::debug!(
        request = request_no,
        method = %identifier.method,
        url = %identifier.url,
        "intercepted request"
    );

    // A handler may never answer; stopping the session must still release it.
    let mut shutdown_rx = state.shutdown_rx.clone();
    let response = tokio::select! {
        response = state.handler.handle(identifier, req) => response,
        _ = shutdown_rx.wait_for(|stopped| *stopped) => {
            return proxy_simple_response(StatusCode::SERVICE_UNAVAILABLE, "proxy session stopped");
        }
    };

    match state.throttle.as_ref() {
        Some((throttle, retry_interval)) => response.map(|body| {
            ThrottledBody::new(body, Arc::clone(throttle), *retry_interval).boxed()
        }),
        None => response,
    }
}

fn normalize_tunneled_https_request_uri(
    connect_authority: &Authority,
    request_uri: &Uri,
) -> anyhow::Result<Uri> {
    let has_scheme = request_uri.scheme().is_some();
    let has_authority = request_uri.authority().is_some();
    if has_scheme || has_authority {
        if !(has_scheme && has_authority) {
            anyhow::bail!(
                "tunneled request target must be origin-form or absolute-form URI with authority"
            );
        }
        if !matches!(request_uri.scheme_str(), Some("http" | "https")) {
            anyhow::bail!("tunneled request target scheme must be `http` or `https`");
        }
        return Ok(request_uri.clone());
    }

    if request_uri.path() == "*" {
        anyhow::bail!("tunneled request target `*` is not supported");
    }
    let path_and_query = request_uri
        .path_and_query()
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("/");
    let uri = format!("https://{}{path_and_query}", connect_authority.as_str());
    uri.parse()
        .map_err(|err| anyhow::anyhow!("construct tunneled HTTPS request URI: {err}"))
}

fn build_leaf_tls_acceptor(leaf: &ca::LeafCertMaterial) -> anyhow::Result<TlsAcceptor> {
    let cert_chain = vec![CertificateDer::from(leaf.cert_der.clone())];
    let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|err| anyhow::anyhow!("build TLS server certificate: {err}"))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn mitm_upgraded_connection<H: ProxyHandler>(
    on_upgrade: hyper::upgrade::OnUpgrade,
    connect_authority: Authority,
    state: Arc<SessionState<H>>,
) -> anyhow::Result<()> {
    let upgraded = on_upgrade
        .await
        .map_err(|err| anyhow::anyhow!("upgrade client CONNECT tunnel: {err}"))?;
    let leaf = state
        .leaf_generator
        .issue_for_host(connect_authority.host())
        .map_err(|err| {
            anyhow::anyhow!(
                "issue leaf certificate for CONNECT authority `{}`: {err}",
                connect_authority.host()
            )
        })?;
    let acceptor = build_leaf_tls_acceptor(&leaf)?;
    let tls_stream = acceptor.accept(TokioIo::new(upgraded)).await.map_err(|err| {
        anyhow::anyhow!(
            "TLS handshake for CONNECT authority `{connect_authority}` failed: {err}; ensure the client trusts the interception CA certificate"
        )
    })?;

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let connect_authority = connect_authority.clone();
        async move {
            let response = dispatch_tunneled_https_request(req, state, connect_authority).await;
            Ok::<_, Infallible>(response)
        }
    });
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("serve CONNECT tunneled HTTP session: {err}"))?;
    Ok(())
}

fn dispatch_tunneled_https_request<H: ProxyHandler>(
    mut req: Request<Incoming>,
    state: Arc<SessionState<H>>,
    connect_authority: Authority,
) -> Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>> {
    Box::pin(async move {
        match normalize_tunneled_https_request_uri(&connect_authority, req.uri()) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(err) => {
                tracing::debug!(
                    authority = %connect_authority,
                    "failed to normalize CONNECT tunneled request: {err}"
                );
                return proxy_simple_response(
                    StatusCode::BAD_REQUEST,
                    "invalid HTTPS request target inside CONNECT tunnel",
                );
            }
        }
        respond(req, state).await
    })
}

/// Removes connection-scoped headers before a message crosses the proxy.
pub fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const STANDARD: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in STANDARD {
        headers.remove(*header_name);
    }
    headers.remove("proxy-connection");
}

pub fn set_host_header(headers: &mut hyper::HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

pub fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> BoxError { Box::new(err) }).boxed()
}

pub fn proxy_simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

/// `504 Proxy Error` carrying `<kind>: <message>`, used for upstream transport
/// failures while recording and for replaying them later.
pub fn failed_response(kind: &str, message: &str) -> Response<ProxyBody> {
    let body = if kind.is_empty() {
        message.to_owned()
    } else {
        format!("{kind}: {message}")
    };
    let mut response = proxy_simple_response(StatusCode::GATEWAY_TIMEOUT, &body);
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(PROXY_ERROR_REASON));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use bytes::Bytes;
    use http_body_util::{BodyExt as _, Full};
    use hyper::{
        Request, Response, StatusCode, Uri,
        body::Incoming,
        header::{self, HeaderValue},
    };
    use hyper_util::{
        client::legacy::{Client, connect::HttpConnector},
        rt::{TokioExecutor, TokioIo},
    };
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpStream,
    };

    use super::{
        ProxyBody, ProxyError, ProxyHandler, ProxyOptions, ProxySession, RequestIdentifier,
        boxed_full, failed_response, normalize_tunneled_https_request_uri,
        strip_hop_by_hop_headers, with_proxy,
    };

    #[derive(Default)]
    struct EchoHandler {
        calls: Mutex<Vec<&'static str>>,
        hang: bool,
    }

    impl ProxyHandler for EchoHandler {
        async fn setup(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("setup");
            Ok(())
        }

        fn handle(
            &self,
            identifier: RequestIdentifier,
            _req: Request<Incoming>,
        ) -> impl Future<Output = Response<ProxyBody>> + Send {
            let hang = self.hang;
            async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                let body = format!("{} {}", identifier.method, identifier.url);
                Response::new(boxed_full(body))
            }
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("shutdown");
            Ok(())
        }
    }

    fn options_in(dir: &std::path::Path) -> ProxyOptions {
        ProxyOptions {
            port: Some(0),
            ca_dir: Some(dir.join("ca")),
            throttling: None,
        }
    }

    fn http_client() -> Client<HttpConnector, Full<Bytes>> {
        Client::builder(TokioExecutor::new()).build(HttpConnector::new())
    }

    #[test]
    fn identifier_prefers_host_header_and_lowercases_method() {
        let req = Request::builder()
            .method("GET")
            .uri("http://127.0.0.1:9/a/b?x=1")
            .header(header::HOST, "www.example.com")
            .body(())
            .unwrap();

        let identifier = RequestIdentifier::for_request(&req);
        assert_eq!(identifier.method, "get");
        assert_eq!(identifier.url, "http://www.example.com/a/b?x=1");
    }

    #[test]
    fn identifier_falls_back_to_uri_authority_and_root_path() {
        let req = Request::builder()
            .method("POST")
            .uri("https://www.example.com:8443")
            .body(())
            .unwrap();

        let identifier = RequestIdentifier::for_request(&req);
        assert_eq!(
            identifier,
            RequestIdentifier::new("post", "https://www.example.com:8443/")
        );
    }

    #[test]
    fn normalize_tunneled_https_request_uri_builds_absolute_uri_from_origin_form() {
        let connect_authority: hyper::http::uri::Authority =
            "www.example.com:443".parse().unwrap();
        let request_uri: Uri = "/assets/app.js?v=3".parse().unwrap();

        let normalized =
            normalize_tunneled_https_request_uri(&connect_authority, &request_uri).unwrap();
        assert_eq!(normalized, "https://www.example.com:443/assets/app.js?v=3");
    }

    #[test]
    fn normalize_tunneled_https_request_uri_rejects_asterisk_and_foreign_schemes() {
        let connect_authority: hyper::http::uri::Authority =
            "www.example.com:443".parse().unwrap();

        let err = normalize_tunneled_https_request_uri(&connect_authority, &"*".parse().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("`*`"), "unexpected error: {err}");

        let err = normalize_tunneled_https_request_uri(
            &connect_authority,
            &"ftp://www.example.com/file".parse().unwrap(),
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("scheme must be `http` or `https`"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn strip_hop_by_hop_headers_removes_connection_listed_names() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-hop"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-end", HeaderValue::from_static("kept"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-end").unwrap(), "kept");
    }

    #[tokio::test]
    async fn failed_response_is_gateway_timeout_with_kind_prefix() {
        let response = failed_response("ECONNREFUSED", "connect refused");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ECONNREFUSED: connect refused");
    }

    #[test]
    fn port_before_start_is_not_started() {
        let session = ProxySession::new(EchoHandler::default(), ProxyOptions::default());
        assert_eq!(session.port(), Err(ProxyError::NotStarted));
    }

    #[tokio::test]
    async fn session_runs_setup_serves_requests_and_shuts_down() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut session = ProxySession::new(EchoHandler::default(), options_in(temp_dir.path()));

        let listen_addr = session.start().await.expect("session should start");
        assert_eq!(session.port().unwrap(), listen_addr.port());
        assert!(temp_dir.path().join("ca").join(crate::ca::CA_CERT_FILE_NAME).exists());

        let req = Request::builder()
            .uri(format!("http://{listen_addr}/page?q=1"))
            .header(header::HOST, "www.example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = http_client().request(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"get http://www.example.com/page?q=1");

        session.stop().await.expect("session should stop");
        assert_eq!(
            *session.handler().calls.lock().unwrap(),
            vec!["setup", "shutdown"]
        );
        assert_eq!(session.port(), Err(ProxyError::NotStarted));
    }

    #[tokio::test]
    async fn stop_releases_requests_the_handler_never_answers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let handler = EchoHandler {
            hang: true,
            ..EchoHandler::default()
        };
        let mut session = ProxySession::new(handler, options_in(temp_dir.path()));
        let listen_addr = session.start().await.unwrap();

        let pending = tokio::spawn(async move {
            let req = Request::builder()
                .uri(format!("http://{listen_addr}/never"))
                .body(Full::new(Bytes::new()))
                .unwrap();
            http_client().request(req).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        tokio::time::timeout(Duration::from_secs(5), session.stop())
            .await
            .expect("stop should not wait for the hung request")
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("hung request should be released")
            .unwrap();
        if let Ok(res) = outcome {
            assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn with_proxy_reports_start_failure_without_running_closure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ca_dir = temp_dir.path().join("ca");
        std::fs::create_dir_all(&ca_dir).unwrap();
        std::fs::write(ca_dir.join(crate::ca::CA_CERT_FILE_NAME), "partial").unwrap();

        let mut session = ProxySession::new(EchoHandler::default(), options_in(temp_dir.path()));
        let ran = Arc::new(Mutex::new(false));
        let ran_in_closure = Arc::clone(&ran);
        let err = with_proxy(&mut session, |_port| async move {
            *ran_in_closure.lock().unwrap() = true;
            Ok(())
        })
        .await
        .expect_err("partial CA material should fail start");

        assert!(err.to_string().contains("is missing"), "unexpected error: {err}");
        assert!(!*ran.lock().unwrap());
        assert!(session.handler().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_tunnel_is_intercepted_with_leaf_certificate() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut session = ProxySession::new(EchoHandler::default(), options_in(temp_dir.path()));
        let listen_addr = session.start().await.unwrap();

        let mut stream = TcpStream::connect(listen_addr).await.unwrap();
        stream
            .write_all(
                b"CONNECT secure.example.test:443 HTTP/1.1\r\nHost: secure.example.test:443\r\n\r\n",
            )
            .await
            .unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200"), "unexpected CONNECT reply");

        let ca_pem =
            std::fs::read(temp_dir.path().join("ca").join(crate::ca::CA_CERT_FILE_NAME)).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&ca_pem).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(rustls::pki_types::CertificateDer::from(pem.contents))
            .unwrap();
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name =
            rustls::pki_types::ServerName::try_from("secure.example.test".to_owned()).unwrap();
        let tls_stream = connector.connect(server_name, stream).await.unwrap();

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
                .await
                .unwrap();
        tokio::spawn(connection);
        let req = Request::builder()
            .uri("/secure?x=1")
            .header(header::HOST, "secure.example.test")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = sender.send_request(req).await.unwrap();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"get https://secure.example.test/secure?x=1");

        session.stop().await.unwrap();
    }
}
