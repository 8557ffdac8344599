//! Process shell around the session driver.
//!
//! Four linked tasks share one broadcast shutdown channel, and whichever
//! ends first takes the others down: the auto-sync ticker, the
//! `targets.yaml` watcher, the control socket server and the ctrl-c
//! listener.

use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use pimsync_core::config::CONFIG_FILE;

use crate::error::{io_err, DaemonError};
use crate::paths::{
    data_dir, pimsync_root, run_dir, socket_path, AUTO_SYNC_FIRST_DELAY, AUTO_SYNC_PERIOD,
    DEBOUNCE_WINDOW,
};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::session::{SessionDeps, SessionDriver};

type TaskResult = Result<(), DaemonError>;

/// Build a multi-threaded runtime and run the daemon on it until shutdown.
pub fn start_blocking(home: &Path, user: Option<String>, deps: SessionDeps) -> TaskResult {
    init_tracing();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio runtime", e))?
        .block_on(run(home.to_path_buf(), user, deps))
}

/// Run the daemon until `stop`, ctrl-c, or the first task failure.
pub async fn run(home: PathBuf, user: Option<String>, deps: SessionDeps) -> TaskResult {
    for dir in [pimsync_root(&home), data_dir(&home), run_dir(&home)] {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }

    let session = Arc::new(SessionDriver::new(&home, deps)?);
    session.on_login_changed(user);
    let started_at = Utc::now();
    info!(home = %home.display(), "pimsync daemon started");

    let (shutdown, _) = broadcast::channel::<()>(8);

    let ticker = spawn_linked(&shutdown, {
        let session = session.clone();
        move |rx| auto_sync_task(session, rx)
    });
    let watcher = spawn_linked(&shutdown, {
        let session = session.clone();
        let root = pimsync_root(&home);
        move |rx| config_watcher_task(root, session, rx)
    });
    let server = spawn_linked(&shutdown, {
        let ctx = ClientContext {
            home: home.clone(),
            session: session.clone(),
            shutdown: shutdown.clone(),
            started_at,
        };
        move |rx| socket_server_task(ctx, rx)
    });
    let signals = spawn_linked(&shutdown, {
        let shutdown = shutdown.clone();
        move |rx| ctrl_c_task(shutdown, rx)
    });

    let (ticker, watcher, server, signals) = tokio::join!(ticker, watcher, server, signals);

    info!("pimsync daemon stopping");
    let saved = session.shutdown();
    joined("auto_sync", ticker)
        .and(joined("config_watcher", watcher))
        .and(joined("socket_server", server))
        .and(joined("signals", signals))
        .and(saved)
}

/// Spawn `task` with its own shutdown receiver; its completion, successful
/// or not, broadcasts shutdown to every sibling.
fn spawn_linked<F, Fut>(shutdown: &broadcast::Sender<()>, task: F) -> JoinHandle<TaskResult>
where
    F: FnOnce(broadcast::Receiver<()>) -> Fut,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    let work = task(shutdown.subscribe());
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = work.await;
        let _ = shutdown.send(());
        result
    })
}

fn joined(task: &str, result: Result<TaskResult, JoinError>) -> TaskResult {
    result.map_err(|err| DaemonError::Protocol(format!("{task} task panicked or was aborted: {err}")))?
}

async fn ctrl_c_task(shutdown: broadcast::Sender<()>, mut stop: broadcast::Receiver<()>) -> TaskResult {
    tokio::select! {
        _ = stop.recv() => Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            info!("ctrl-c received");
            let _ = shutdown.send(());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Auto-sync
// ---------------------------------------------------------------------------

async fn auto_sync_task(session: Arc<SessionDriver>, mut stop: broadcast::Receiver<()>) -> TaskResult {
    let mut ticks =
        tokio::time::interval_at(Instant::now() + AUTO_SYNC_FIRST_DELAY, AUTO_SYNC_PERIOD);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.recv() => return Ok(()),
            _ = ticks.tick() => {}
        }
        if !session.auto_sync_enabled() || session.current_user().is_none() {
            continue;
        }
        if session.status().is_running() {
            debug!("pass still running, tick skipped");
            continue;
        }
        run_pass(&session, false, false).await;
    }
}

/// One pass, followed by sign-out if the server rejected the credentials.
async fn run_pass(session: &SessionDriver, manual: bool, all_dates: bool) -> bool {
    let started = session.run_synchronization(manual, all_dates).await;
    if session.status().snapshot().signed_out && session.current_user().is_some() {
        warn!("credentials rejected during pass, signing out");
        session.on_login_changed(None);
    }
    started
}

// ---------------------------------------------------------------------------
// Config watcher
// ---------------------------------------------------------------------------

/// Leading-edge gate: the first event of a burst reloads, the rest of the
/// burst within `window` is dropped.
#[derive(Debug)]
struct ReloadGate {
    window: Duration,
    last: Option<Instant>,
}

impl ReloadGate {
    fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn admit(&mut self, now: Instant) -> bool {
        if self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) < self.window)
        {
            return false;
        }
        self.last = Some(now);
        true
    }
}

async fn config_watcher_task(
    root: PathBuf,
    session: Arc<SessionDriver>,
    mut stop: broadcast::Receiver<()>,
) -> TaskResult {
    let (tx, mut events) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    debug!(dir = %root.display(), "watching target configuration");

    let mut gate = ReloadGate::new(DEBOUNCE_WINDOW);
    loop {
        let event = tokio::select! {
            _ = stop.recv() => return Ok(()),
            event = events.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
        };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "config watcher error");
                continue;
            }
        };
        if !touches_target_config(&event) || !gate.admit(Instant::now()) {
            continue;
        }
        if let Err(err) = session.reload_config() {
            error!(error = %err, "target configuration reload failed");
        }
    }
}

fn touches_target_config(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|path| is_target_config(path))
}

fn is_target_config(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()) == Some(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ClientContext {
    home: PathBuf,
    session: Arc<SessionDriver>,
    shutdown: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
}

async fn socket_server_task(ctx: ClientContext, mut stop: broadcast::Receiver<()>) -> TaskResult {
    let socket = socket_path(&ctx.home);
    clear_stale_socket(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    restrict_to_owner(&socket)?;
    debug!(socket = %socket.display(), "control socket listening");

    let outcome = loop {
        let stream = tokio::select! {
            _ = stop.recv() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => break Err(io_err(&socket, err)),
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(stream, ctx).await {
                warn!(error = %err, "control client failed");
            }
        });
    };

    let _ = std::fs::remove_file(&socket);
    outcome
}

async fn serve_client(stream: UnixStream, ctx: ClientContext) -> TaskResult {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket", e))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (response, stopping) = match serde_json::from_str::<DaemonRequest>(line) {
            Ok(request) => (dispatch(&ctx, &request).await, request.cmd == "stop"),
            Err(err) => (DaemonResponse::error(format!("malformed request: {err}")), false),
        };
        send_line(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }
    Ok(())
}

async fn dispatch(ctx: &ClientContext, request: &DaemonRequest) -> DaemonResponse {
    let session = &ctx.session;
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(status_payload(ctx)),
        "sync" => {
            if session.current_user().is_none() {
                return DaemonResponse::error(DaemonError::NotSignedIn.to_string());
            }
            let started = run_pass(
                session,
                request.manual.unwrap_or(true),
                request.all_dates.unwrap_or(false),
            )
            .await;
            DaemonResponse::ok(json!({ "started": started }))
        }
        "login" => match request.user.as_deref().filter(|user| !user.is_empty()) {
            Some(user) => {
                session.on_login_changed(Some(user.to_string()));
                DaemonResponse::ok(json!({ "user": user }))
            }
            None => DaemonResponse::error("login requires a user"),
        },
        "logout" => {
            session.on_login_changed(None);
            DaemonResponse::ok(json!({ "signed_out": true }))
        }
        "stop" => {
            let _ = ctx.shutdown.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unsupported command: {other}")),
    }
}

fn status_payload(ctx: &ClientContext) -> Value {
    let session = &ctx.session;
    json!({
        "started_at": ctx.started_at,
        "user": session.current_user(),
        "auto_sync": session.auto_sync_enabled(),
        "pass": session.status().snapshot(),
        "targets": session.target_summaries(),
        "failed_entities": session.failed().len(),
        "pending_invites": session.invites().len(),
        "data_dir": data_dir(&ctx.home),
    })
}

async fn send_line(writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> TaskResult {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| io_err("control socket", e))
}

/// A socket file nobody answers on is left over from a crashed daemon.
fn clear_stale_socket(socket: &Path) -> TaskResult {
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "another daemon is listening on {}",
            socket.display()
        )));
    }
    match std::fs::remove_file(socket) {
        Ok(()) => {
            warn!(socket = %socket.display(), "removed stale control socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn restrict_to_owner(socket: &Path) -> TaskResult {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(socket, e))
}

/// `RUST_LOG` filters (default `info`); `PIMSYNC_LOG_FORMAT=json` switches
/// to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PIMSYNC_LOG_FORMAT").is_ok_and(|format| format == "json");
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use pimsync_core::{DiscoveredCollection, FolderRef, Target, TargetKind};
    use pimsync_sync::{
        ChangeSender, EngineContext, EngineFactory, FolderAllocator, Subscription, SyncEngine,
        SyncError, TargetDiscovery,
    };
    use tempfile::TempDir;
    use tokio::time::advance;

    struct NoEngines;

    impl EngineFactory for NoEngines {
        fn create_engine(
            &self,
            _target: &Target,
            _ctx: EngineContext,
        ) -> Result<Arc<dyn SyncEngine>, SyncError> {
            Err(SyncError::MissingIdentifier("engine".into()))
        }

        fn subscribe(
            &self,
            _target: &Target,
            _sender: ChangeSender,
        ) -> Result<Option<Box<dyn Subscription>>, SyncError> {
            Ok(None)
        }
    }

    struct NothingDiscovered;

    #[async_trait]
    impl TargetDiscovery for NothingDiscovered {
        async fn discover(&self) -> Result<Vec<DiscoveredCollection>, SyncError> {
            Ok(Vec::new())
        }
    }

    struct NoFolders;

    impl FolderAllocator for NoFolders {
        fn default_folder(&self, _kind: TargetKind) -> Option<FolderRef> {
            None
        }

        fn create_folder(&self, _kind: TargetKind, _name: &str) -> Result<FolderRef, SyncError> {
            Err(SyncError::MissingIdentifier("folder".into()))
        }
    }

    fn context(home: &Path) -> (ClientContext, broadcast::Receiver<()>) {
        let session = SessionDriver::new(
            home,
            SessionDeps {
                factory: Arc::new(NoEngines),
                discovery: Arc::new(NothingDiscovered),
                folders: Arc::new(NoFolders),
            },
        )
        .expect("session");
        let (shutdown, rx) = broadcast::channel(1);
        let ctx = ClientContext {
            home: home.to_path_buf(),
            session: Arc::new(session),
            shutdown,
            started_at: Utc::now(),
        };
        (ctx, rx)
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn reload_gate_admits_one_event_per_burst() {
        let mut gate = ReloadGate::new(Duration::from_millis(100));
        let mut reloads = 0;

        for _ in 0..5 {
            reloads += usize::from(gate.admit(Instant::now()));
            advance(Duration::from_millis(10)).await;
        }
        advance(Duration::from_millis(150)).await;
        reloads += usize::from(gate.admit(Instant::now()));

        assert_eq!(reloads, 2);
    }

    #[test]
    fn only_targets_yaml_events_matter() {
        assert!(is_target_config(Path::new("/h/.pimsync/targets.yaml")));
        assert!(!is_target_config(Path::new("/h/.pimsync/targets.yaml.tmp")));
        assert!(!is_target_config(Path::new("/h/.pimsync/daemon.sock")));
    }

    #[tokio::test]
    async fn commands_drive_the_session() {
        let home = TempDir::new().expect("home");
        let (ctx, mut stopped) = context(home.path());

        let sync = DaemonRequest::new("sync");
        assert!(!dispatch(&ctx, &sync).await.ok, "sync needs a signed-in user");

        let login = DaemonRequest {
            user: Some("alice".into()),
            ..DaemonRequest::new("login")
        };
        assert!(dispatch(&ctx, &login).await.ok);

        let status = dispatch(&ctx, &DaemonRequest::new("status")).await;
        let data = status.data.expect("status data");
        assert_eq!(data["user"], json!("alice"));
        assert_eq!(data["pass"]["state"], json!("unknown"));
        assert_eq!(data["failed_entities"], json!(0));

        let synced = dispatch(&ctx, &sync).await;
        assert!(synced.ok);
        assert_eq!(synced.data.expect("sync data")["started"], json!(false));

        assert!(dispatch(&ctx, &DaemonRequest::new("logout")).await.ok);
        assert!(ctx.session.current_user().is_none());

        assert!(dispatch(&ctx, &DaemonRequest::new("stop")).await.ok);
        stopped.recv().await.expect("shutdown broadcast");
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let home = TempDir::new().expect("home");
        let (ctx, _rx) = context(home.path());
        let response = dispatch(&ctx, &DaemonRequest::new("dance")).await;
        assert_eq!(response.error.as_deref(), Some("unsupported command: dance"));
    }

    #[test]
    fn missing_socket_needs_no_cleanup() {
        let home = TempDir::new().expect("home");
        assert!(clear_stale_socket(&home.path().join("daemon.sock")).is_ok());
    }
}
