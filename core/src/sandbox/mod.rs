//! Sandbox providers and the session that owns them.
//!
//! Three backends implement one contract; the factory is the only
//! construction path and fails fast when the configured backend cannot run
//! on this host. A [`SandboxSession`] wraps the provider behind a mutex that
//! doubles as the executor lock, so captured output streams of concurrent
//! callers never interleave.

mod appcontainer;
mod bubblewrap;
pub mod capabilities;
mod container;
mod exec;
#[cfg(windows)]
mod windows_acl;

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_protocol::CommandResult;
use warden_protocol::SandboxKind;

pub use appcontainer::delete_profile;

use crate::config::Config;
use crate::error::Result;
use crate::error::WardenErr;
use crate::path_utils::canonicalize_best_effort;

/// Contract every isolation backend fulfils.
///
/// `initialize` is idempotent; `execute*` fails fast before any child
/// process exists when called out of the `Ready` state; timeouts degrade to
/// the uniform timed-out [`CommandResult`] after the child's whole process
/// tree has been terminated.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> SandboxKind;

    fn is_initialized(&self) -> bool;

    async fn initialize(&mut self, allowed_dirs: &[PathBuf]) -> Result<()>;

    async fn execute(
        &self,
        exe: &str,
        args: &[String],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult>;

    async fn execute_shell(
        &self,
        command: &str,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult>;

    async fn dispose(&mut self) -> Result<()>;
}

/// Host directory bound into the sandbox and the path it appears at inside.
/// For backends without a separate mount namespace the two sides coincide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirMapping {
    pub(crate) host: PathBuf,
    pub(crate) sandbox: PathBuf,
}

/// Map each allowed host directory to `/workspace/<basename>`, failing fast
/// on directories that do not exist (bind targets must) and disambiguating
/// duplicate basenames with a numeric suffix.
pub(crate) fn workspace_mappings(dirs: &[PathBuf]) -> Result<Vec<DirMapping>> {
    let mut mappings: Vec<DirMapping> = Vec::with_capacity(dirs.len());

    for dir in dirs {
        if !dir.is_dir() {
            return Err(WardenErr::Configuration(format!(
                "allowed directory '{}' does not exist",
                dir.display()
            )));
        }
        let host = canonicalize_best_effort(dir);
        let base = host
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let mut sandbox = PathBuf::from("/workspace").join(&base);
        let mut suffix = 2;
        while mappings.iter().any(|m| m.sandbox == sandbox) {
            sandbox = PathBuf::from("/workspace").join(format!("{base}-{suffix}"));
            suffix += 1;
        }

        mappings.push(DirMapping { host, sandbox });
    }

    Ok(mappings)
}

/// The only construction path for providers. Backend/platform mismatches
/// are configuration errors, caught before any OS resource is touched.
pub fn create_provider(config: &Config) -> Result<Box<dyn SandboxProvider>> {
    let kind = config.sandbox.kind;
    if !kind.supported_on_this_platform() {
        return Err(WardenErr::Configuration(format!(
            "sandbox kind '{kind}' is not supported on this platform"
        )));
    }

    let provider: Box<dyn SandboxProvider> = match kind {
        SandboxKind::AppContainer => Box::new(appcontainer::AppContainerProvider::new(config)?),
        SandboxKind::Bubblewrap => Box::new(bubblewrap::BubblewrapProvider::new(config)),
        SandboxKind::Container => Box::new(container::ContainerProvider::new(config)),
    };
    Ok(provider)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Ready,
    Disposed,
}

struct SessionInner {
    state: SessionState,
    provider: Box<dyn SandboxProvider>,
}

/// A live sandbox bound to one backend and one set of allowed directories.
///
/// State machine: `New --initialize--> Ready --execute*--> Ready`,
/// `--dispose--> Disposed` (terminal). Executions are serialized by the
/// session mutex; errors and timeouts leave the session in `Ready`.
pub struct SandboxSession {
    kind: SandboxKind,
    inner: tokio::sync::Mutex<SessionInner>,
}

impl SandboxSession {
    pub fn new(config: &Config) -> Result<Self> {
        let provider = create_provider(config)?;
        Ok(Self::from_provider(provider))
    }

    fn from_provider(provider: Box<dyn SandboxProvider>) -> Self {
        Self {
            kind: provider.kind(),
            inner: tokio::sync::Mutex::new(SessionInner {
                state: SessionState::New,
                provider,
            }),
        }
    }

    pub fn kind(&self) -> SandboxKind {
        self.kind
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.lock().await.state == SessionState::Ready
    }

    /// Bring the backend up with the given allowed directories. Idempotent:
    /// a second call on a ready session is a no-op. A failed attempt leaves
    /// the session in `New` with every partial allocation released by the
    /// provider before it returns.
    pub async fn initialize(&self, allowed_dirs: &[PathBuf]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Disposed => Err(WardenErr::State(
                "session has been disposed".to_string(),
            )),
            SessionState::Ready => Ok(()),
            SessionState::New => {
                inner.provider.initialize(allowed_dirs).await?;
                inner.state = SessionState::Ready;
                debug!("sandbox session ready, backend = {}", self.kind);
                Ok(())
            }
        }
    }

    pub async fn execute(
        &self,
        exe: &str,
        args: &[String],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let inner = self.lock_ready().await?;
        inner.provider.execute(exe, args, cwd, cancel).await
    }

    pub async fn execute_shell(
        &self,
        command: &str,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let inner = self.lock_ready().await?;
        inner.provider.execute_shell(command, cwd, cancel).await
    }

    /// Tear the backend down. Terminal and idempotent; a never-initialized
    /// session disposes without touching the provider.
    pub async fn dispose(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Disposed => Ok(()),
            SessionState::New => {
                inner.state = SessionState::Disposed;
                Ok(())
            }
            SessionState::Ready => {
                let result = inner.provider.dispose().await;
                inner.state = SessionState::Disposed;
                result
            }
        }
    }

    async fn lock_ready(&self) -> Result<tokio::sync::MutexGuard<'_, SessionInner>> {
        let inner = self.inner.lock().await;
        match inner.state {
            SessionState::Ready => Ok(inner),
            SessionState::New => Err(WardenErr::State(
                "execute called before initialize".to_string(),
            )),
            SessionState::Disposed => Err(WardenErr::State(
                "execute called after dispose".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct StubProvider {
        fail_initialize: bool,
        init_calls: Arc<AtomicUsize>,
        dispose_calls: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let init_calls = Arc::new(AtomicUsize::new(0));
            let dispose_calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    fail_initialize: false,
                    init_calls: init_calls.clone(),
                    dispose_calls: dispose_calls.clone(),
                },
                init_calls,
                dispose_calls,
            )
        }
    }

    #[async_trait]
    impl SandboxProvider for StubProvider {
        fn kind(&self) -> SandboxKind {
            SandboxKind::Container
        }

        fn is_initialized(&self) -> bool {
            self.init_calls.load(Ordering::SeqCst) > 0
        }

        async fn initialize(&mut self, _allowed_dirs: &[PathBuf]) -> Result<()> {
            if self.fail_initialize {
                return Err(WardenErr::Sandbox("init failed".to_string()));
            }
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            _exe: &str,
            _args: &[String],
            _cwd: Option<&Path>,
            _cancel: &CancellationToken,
        ) -> Result<CommandResult> {
            Ok(CommandResult {
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
            })
        }

        async fn execute_shell(
            &self,
            command: &str,
            cwd: Option<&Path>,
            cancel: &CancellationToken,
        ) -> Result<CommandResult> {
            self.execute(command, &[], cwd, cancel).await
        }

        async fn dispose(&mut self) -> Result<()> {
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn execute_before_initialize_is_a_state_error() {
        let (stub, _, _) = StubProvider::new();
        let session = SandboxSession::from_provider(Box::new(stub));

        let err = session
            .execute("true", &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenErr::State(_)));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (stub, init_calls, _) = StubProvider::new();
        let session = SandboxSession::from_provider(Box::new(stub));

        session.initialize(&[]).await.unwrap();
        session.initialize(&[]).await.unwrap();
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
        assert!(session.is_initialized().await);
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let (stub, _, dispose_calls) = StubProvider::new();
        let session = SandboxSession::from_provider(Box::new(stub));

        session.initialize(&[]).await.unwrap();
        session.dispose().await.unwrap();
        session.dispose().await.unwrap();
        assert_eq!(dispose_calls.load(Ordering::SeqCst), 1);

        let err = session
            .execute_shell("echo hi", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenErr::State(_)));

        let err = session.initialize(&[]).await.unwrap_err();
        assert!(matches!(err, WardenErr::State(_)));
    }

    #[tokio::test]
    async fn failed_initialize_leaves_the_session_new() {
        let (mut stub, _, _) = StubProvider::new();
        stub.fail_initialize = true;
        let session = SandboxSession::from_provider(Box::new(stub));

        assert!(session.initialize(&[]).await.is_err());
        assert!(!session.is_initialized().await);

        // Still rejects executions rather than limping along half-built.
        let err = session
            .execute("true", &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WardenErr::State(_)));
    }

    #[tokio::test]
    async fn execute_flows_through_the_provider() {
        let (stub, _, _) = StubProvider::new();
        let session = SandboxSession::from_provider(Box::new(stub));
        session.initialize(&[]).await.unwrap();

        let result = session
            .execute("true", &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "ok");
    }

    #[test]
    fn workspace_mappings_disambiguate_duplicate_basenames() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let a_proj = a.path().join("proj");
        let b_proj = b.path().join("proj");
        std::fs::create_dir(&a_proj).unwrap();
        std::fs::create_dir(&b_proj).unwrap();

        let mappings = workspace_mappings(&[a_proj, b_proj]).unwrap();
        assert_eq!(mappings[0].sandbox, PathBuf::from("/workspace/proj"));
        assert_eq!(mappings[1].sandbox, PathBuf::from("/workspace/proj-2"));
    }

    #[test]
    fn workspace_mappings_require_existing_directories() {
        let err = workspace_mappings(&[PathBuf::from("/no/such/dir")]).unwrap_err();
        assert!(matches!(err, WardenErr::Configuration(_)));
    }

    #[test]
    fn factory_rejects_platform_mismatches() {
        let mut config = Config::default();
        config.sandbox.kind = if cfg!(windows) {
            SandboxKind::Bubblewrap
        } else {
            SandboxKind::AppContainer
        };

        let result = create_provider(&config);
        assert!(matches!(result, Err(WardenErr::Configuration(_))));
    }

    #[test]
    fn factory_builds_the_container_backend_anywhere() {
        let mut config = Config::default();
        config.sandbox.kind = SandboxKind::Container;
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.kind(), SandboxKind::Container);
        assert!(!provider.is_initialized());
    }
}
