use std::future::Future;
use std::net::TcpListener;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use actix_files::NamedFile;
use actix_web::dev::ServerHandle;
use actix_web::error::{ErrorInternalServerError, ErrorNotFound};
use actix_web::http::{Method, header};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Result as ActixResult, web};
use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cli;
use crate::compiler::{CompilerEvent, CompilerHandle};
use crate::context::StartupContext;
use crate::live;
use crate::paths::ProjectPaths;
use crate::proxy::{self, ProxyDescriptor};
use crate::urls::ResolvedUrls;

/// Server configuration assembled from the negotiated port, the startup
/// context and the proxy descriptor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_root: PathBuf,
    pub public_url_prefix: String,
    pub proxy: Option<ProxyDescriptor>,
}

impl ServerConfig {
    pub fn assemble(
        ctx: &StartupContext,
        paths: &ProjectPaths,
        port: u16,
        proxy: Option<ProxyDescriptor>,
    ) -> Self {
        Self {
            host: ctx.host.clone(),
            port,
            static_root: paths.public_dir.clone(),
            public_url_prefix: ctx.public_url_prefix.clone(),
            proxy,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub static_root: PathBuf,
    pub public_url_prefix: String,
    pub broadcaster: broadcast::Sender<CompilerEvent>,
    pub proxy: Option<ProxyDescriptor>,
    pub http: Option<reqwest::Client>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Closing,
    Closed,
}

/// Makes the Closing transition single-fire: whichever shutdown trigger
/// swaps the flag first owns close and exit, later triggers are no-ops.
pub struct ShutdownGuard(AtomicBool);

impl ShutdownGuard {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

enum CloseReason {
    Signal,
    StdinClosed,
    ServerExit(Result<std::io::Result<()>, tokio::task::JoinError>),
}

/// Owns the single server instance of the process, the compiler handle and
/// the shutdown wiring. Phases only ever move forward; there is no restart.
pub struct DevServer {
    config: ServerConfig,
    compiler: CompilerHandle,
    listener: Option<TcpListener>,
    phase: Phase,
    shutdown: ShutdownGuard,
}

impl DevServer {
    pub fn new(config: ServerConfig, compiler: CompilerHandle, listener: TcpListener) -> Self {
        Self {
            config,
            compiler,
            listener: Some(listener),
            phase: Phase::Idle,
            shutdown: ShutdownGuard::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the server until a shutdown trigger fires: SIGINT, SIGTERM, the
    /// end of standard input (unless CI), or the server task failing.
    pub async fn run(
        mut self,
        ctx: &StartupContext,
        urls: &ResolvedUrls,
        open_browser: bool,
    ) -> anyhow::Result<()> {
        self.phase = Phase::Starting;

        let state = AppState {
            static_root: self.config.static_root.clone(),
            public_url_prefix: self.config.public_url_prefix.clone(),
            broadcaster: self.compiler.event_sender(),
            proxy: self.config.proxy.clone(),
            http: self.config.proxy.as_ref().map(|_| reqwest::Client::new()),
        };

        let listener = self
            .listener
            .take()
            .context("development server was already started")?;
        let server = build_http_server(listener, state)
            .with_context(|| format!("failed to start the server on {}", self.config.bind_address()))?;
        let handle = server.handle();
        let mut server_task: JoinHandle<std::io::Result<()>> = tokio::spawn(server);

        self.phase = Phase::Running;
        self.announce_running(ctx, urls, open_browser);

        let reason = select_close_reason(
            &mut server_task,
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
            terminate_signal(),
            stdin_closed(),
            ctx.ci,
        )
        .await;

        self.close(handle, server_task, reason).await
    }

    fn announce_running(&self, ctx: &StartupContext, urls: &ResolvedUrls, open_browser: bool) {
        if ctx.interactive {
            cli::clear_console();
        }
        if let Some(warning) = self.compiler.fast_refresh_advisory() {
            cli::warn(&warning);
        }
        cli::notice("Starting the development server...\n");
        self.compiler.announce_ready();
        if open_browser {
            cli::launch_browser(urls.local_url.clone());
        }
    }

    async fn close(
        &mut self,
        handle: ServerHandle,
        server_task: JoinHandle<std::io::Result<()>>,
        reason: CloseReason,
    ) -> anyhow::Result<()> {
        if !self.shutdown.begin() {
            return Ok(());
        }
        self.phase = Phase::Closing;
        self.compiler.close();

        match reason {
            CloseReason::ServerExit(result) => {
                self.phase = Phase::Closed;
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(anyhow::Error::from(error)
                        .context("the development server stopped unexpectedly")),
                    Err(join_error) => Err(anyhow::Error::from(join_error)
                        .context("the development server task failed")),
                }
            }
            CloseReason::Signal | CloseReason::StdinClosed => {
                handle.stop(true).await;
                let _ = server_task.await;
                self.phase = Phase::Closed;
                Ok(())
            }
        }
    }
}

/// Picks whichever shutdown trigger fires first. CI sessions never act on
/// the end of standard input; its arm is disabled entirely.
async fn select_close_reason(
    server_exit: impl Future<Output = Result<std::io::Result<()>, tokio::task::JoinError>>,
    interrupt: impl Future<Output = ()>,
    terminate: impl Future<Output = ()>,
    stdin_eof: impl Future<Output = ()>,
    ci: bool,
) -> CloseReason {
    tokio::select! {
        result = server_exit => CloseReason::ServerExit(result),
        _ = interrupt => CloseReason::Signal,
        _ = terminate => CloseReason::Signal,
        _ = stdin_eof, if !ci => CloseReason::StdinClosed,
    }
}

fn build_http_server(
    listener: TcpListener,
    state: AppState,
) -> std::io::Result<actix_web::dev::Server> {
    let shared_state = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(shared_state.clone())
            .service(live::build_scope())
            .default_service(web::to(handle_request))
    })
    .listen(listener)?
    .run();

    Ok(server)
}

async fn handle_request(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let path = req.uri().path().to_string();
    let accept = accept_header(&req);

    if matches!(*req.method(), Method::GET | Method::HEAD) {
        if let Some(relative) = strip_public_prefix(&path, &state.public_url_prefix) {
            if let Ok(target) = resolve_static_path(&state.static_root, relative).await {
                return serve_static(&req, &target).await;
            }
        }
    }

    if let (Some(descriptor), Some(client)) = (&state.proxy, &state.http) {
        if descriptor.should_proxy(&path, req.method().as_str(), accept) {
            return proxy::forward(client, descriptor, &req, body).await;
        }
    }

    // History API fallback: unmatched navigation requests get the app shell.
    if is_navigation(req.method().as_str(), accept) {
        let index = state.static_root.join("index.html");
        if fs::metadata(&index).await.is_ok() {
            return serve_static(&req, &index).await;
        }
    }

    Err(ErrorNotFound("Not Found"))
}

fn accept_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
}

fn is_navigation(method: &str, accept: Option<&str>) -> bool {
    method == "GET" && accept.is_some_and(|value| value.contains("text/html"))
}

/// Maps a URL path below the public prefix to a path relative to the static
/// root. `None` means the request is outside the served prefix.
fn strip_public_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some("/");
    }
    path.strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
}

async fn resolve_static_path(static_root: &Path, tail: &str) -> anyhow::Result<PathBuf> {
    let mut target = sanitize_path(static_root, tail)?;

    let metadata = fs::metadata(&target)
        .await
        .map_err(|_| anyhow::anyhow!("file not found"))?;
    if metadata.is_dir() {
        let index_html = target.join("index.html");
        if fs::metadata(&index_html).await.is_ok() {
            target = index_html;
        } else {
            anyhow::bail!("directory has no index.html");
        }
    }
    Ok(target)
}

fn sanitize_path(static_root: &Path, tail: &str) -> anyhow::Result<PathBuf> {
    let trimmed = tail.trim_start_matches('/');
    let mut target = PathBuf::from(static_root);

    if trimmed.is_empty() {
        target.push("index.html");
        return Ok(target);
    }

    let mut has_component = false;

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                has_component = true;
            }
            Component::CurDir => {}
            _ => anyhow::bail!("invalid path"),
        }
    }

    if !has_component && tail.ends_with('/') {
        target.push("index.html");
    }

    Ok(target)
}

async fn serve_static(req: &HttpRequest, target: &Path) -> ActixResult<HttpResponse> {
    if is_html(target) {
        let raw = fs::read_to_string(target)
            .await
            .map_err(ErrorInternalServerError)?;

        Ok(HttpResponse::Ok()
            .append_header(("Cache-Control", "no-cache, no-store, must-revalidate"))
            .content_type("text/html; charset=utf-8")
            .body(inject_live_client(&raw)))
    } else {
        let file = NamedFile::open_async(target)
            .await
            .map_err(|_| ErrorNotFound("Not Found"))?;

        Ok(file.into_response(req))
    }
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "html" | "htm"))
        .unwrap_or(false)
}

fn inject_live_client(original: &str) -> String {
    if original.contains("__devserve_client") {
        return original.to_string();
    }

    let snippet =
        r#"<script id="__devserve_client" defer src="/__devserve/client.js"></script>"#;

    if let Some(index) = original.rfind("</head>") {
        let mut result = String::with_capacity(original.len() + snippet.len() + 2);
        result.push_str(&original[..index]);
        result.push('\n');
        result.push_str(snippet);
        result.push('\n');
        result.push_str(&original[index..]);
        result
    } else {
        let mut result = original.to_string();
        if !result.ends_with('\n') {
            result.push('\n');
        }
        result.push_str(snippet);
        result
    }
}

async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buffer = [0u8; 256];
    loop {
        match stdin.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_guard_fires_exactly_once() {
        let guard = ShutdownGuard::new();
        assert!(guard.begin());
        assert!(!guard.begin());
        assert!(!guard.begin());
    }

    fn server_never_exits()
    -> std::future::Pending<Result<std::io::Result<()>, tokio::task::JoinError>> {
        std::future::pending()
    }

    #[tokio::test(start_paused = true)]
    async fn stdin_eof_does_not_shut_down_ci_sessions() {
        // With CI active and only the stdin arm completed, no trigger may
        // resolve; the selection must still be waiting when time runs out.
        let outcome = tokio::time::timeout(
            tokio::time::Duration::from_secs(5),
            select_close_reason(
                server_never_exits(),
                std::future::pending::<()>(),
                std::future::pending::<()>(),
                std::future::ready(()),
                true,
            ),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn stdin_eof_shuts_down_outside_ci() {
        let reason = select_close_reason(
            server_never_exits(),
            std::future::pending::<()>(),
            std::future::pending::<()>(),
            std::future::ready(()),
            false,
        )
        .await;
        assert!(matches!(reason, CloseReason::StdinClosed));
    }

    #[tokio::test]
    async fn interrupt_signal_selects_a_single_signal_close() {
        let reason = select_close_reason(
            server_never_exits(),
            std::future::ready(()),
            std::future::pending::<()>(),
            std::future::pending::<()>(),
            false,
        )
        .await;
        assert!(matches!(reason, CloseReason::Signal));
    }

    #[tokio::test]
    async fn terminate_signal_also_selects_a_signal_close() {
        let reason = select_close_reason(
            server_never_exits(),
            std::future::pending::<()>(),
            std::future::ready(()),
            std::future::pending::<()>(),
            true,
        )
        .await;
        assert!(matches!(reason, CloseReason::Signal));
    }

    #[tokio::test]
    async fn server_exit_is_reported_as_its_own_reason() {
        let reason = select_close_reason(
            std::future::ready(Ok(Ok(()))),
            std::future::pending::<()>(),
            std::future::pending::<()>(),
            std::future::pending::<()>(),
            false,
        )
        .await;
        assert!(matches!(reason, CloseReason::ServerExit(Ok(Ok(())))));
    }

    #[test]
    fn root_path_serves_the_index() {
        let target = sanitize_path(Path::new("/srv/public"), "/").unwrap();
        assert_eq!(target, Path::new("/srv/public/index.html"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert!(sanitize_path(Path::new("/srv/public"), "/../etc/passwd").is_err());
        assert!(sanitize_path(Path::new("/srv/public"), "a/../../b").is_err());
    }

    #[test]
    fn normal_components_are_joined() {
        let target = sanitize_path(Path::new("/srv/public"), "/assets/app.css").unwrap();
        assert_eq!(target, Path::new("/srv/public/assets/app.css"));
    }

    #[test]
    fn public_prefix_is_stripped_from_request_paths() {
        assert_eq!(strip_public_prefix("/index.html", ""), Some("/index.html"));
        assert_eq!(strip_public_prefix("/app", "/app"), Some("/"));
        assert_eq!(strip_public_prefix("/app/main.js", "/app"), Some("/main.js"));
        assert_eq!(strip_public_prefix("/other/main.js", "/app"), None);
        assert_eq!(strip_public_prefix("/application", "/app"), None);
    }

    #[test]
    fn navigation_requires_get_and_html_accept() {
        assert!(is_navigation("GET", Some("text/html,application/xhtml+xml")));
        assert!(!is_navigation("POST", Some("text/html")));
        assert!(!is_navigation("GET", Some("application/json")));
        assert!(!is_navigation("GET", None));
    }

    #[test]
    fn live_client_is_injected_before_head_close() {
        let html = "<html><head><title>x</title></head><body></body></html>";
        let injected = inject_live_client(html);
        let script_at = injected.find("__devserve_client").unwrap();
        let head_close_at = injected.find("</head>").unwrap();
        assert!(script_at < head_close_at);
    }

    #[test]
    fn injection_is_idempotent() {
        let html = "<html><head></head><body></body></html>";
        let once = inject_live_client(html);
        let twice = inject_live_client(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn headless_documents_get_the_client_appended() {
        let injected = inject_live_client("<p>partial</p>");
        assert!(injected.ends_with(
            r#"<script id="__devserve_client" defer src="/__devserve/client.js"></script>"#
        ));
    }

    #[test]
    fn html_detection_checks_the_extension() {
        assert!(is_html(Path::new("/a/index.html")));
        assert!(is_html(Path::new("/a/INDEX.HTM")));
        assert!(!is_html(Path::new("/a/app.css")));
        assert!(!is_html(Path::new("/a/htm")));
    }

    #[tokio::test]
    async fn new_server_starts_idle() {
        let dir = std::env::temp_dir().join(format!("devserve_server_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("package.json"), r#"{ "name": "app" }"#).unwrap();
        let paths = ProjectPaths::resolve(dir.to_str().unwrap()).unwrap();
        let ctx = StartupContext::resolve(&paths).unwrap();

        let build = crate::compiler::build_config(
            crate::compiler::Mode::Development,
            &paths,
            ctx.fast_refresh,
            &ctx.public_url_prefix,
        );
        let urls = ResolvedUrls::resolve(ctx.protocol, &ctx.host, 0, &ctx.public_url_prefix);
        let compiler = CompilerHandle::create(
            &ctx.package.name,
            build,
            &urls,
            ctx.package_manager,
            ctx.uses_typescript,
        )
        .unwrap();

        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ServerConfig::assemble(&ctx, &paths, port, None);
        let server = DevServer::new(config, compiler, listener);

        assert_eq!(server.phase(), Phase::Idle);
        assert_eq!(server.config.static_root, paths.public_dir);
        assert_eq!(server.config.port, port);
    }
}
