use std::{
    ffi::OsString,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    core::{
        configuration::{self, BootstrapConfig},
        error::{BootstrapError, Result},
    },
    dependencies::{self, FileCheck, FsCheck},
    environment::ProcessEnv,
    hosting::{HostableWebCore, HostingEngine},
    identity::{Credentials, IdentityContext},
    templates::RenderedConfigSet,
};

/// boot up the application kernel
/// ``` rust
/// let krn = kernel::boot(std::env::args_os()).await?;
/// ```
/// Returns `None` when the arguments only asked for help or version output.
pub async fn boot<I, T>(args: I) -> Result<Option<Kernel>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Some(cli) = configuration::parse_args(args)? else {
        return Ok(None);
    };
    let cwd = std::env::current_dir()?;
    let config = configuration::load_options(cli, &ProcessEnv, &cwd).await?;

    Ok(Some(Kernel::new(config, Arc::new(HostableWebCore::new()))))
}

/// Where a bootstrap run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Validated,
    ConfigWritten,
    Activated,
    Running,
    ShuttingDown,
    Terminated,
}

/// Bounded retries for removing the temp directory
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Best-effort teardown run once `Kernel::run` leaves its main sequence.
///
/// Only the first call does work. It is owned by the kernel, outside callers
/// request a stop through the kernel's token instead.
struct Shutdown {
    engine: Arc<dyn HostingEngine>,
    temp_directory: PathBuf,
    retry: RetryPolicy,
    activated: AtomicBool,
    completed: AtomicBool,
}

impl Shutdown {
    fn new(engine: Arc<dyn HostingEngine>, temp_directory: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            engine,
            temp_directory,
            retry,
            activated: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    fn mark_activated(&self) {
        self.activated.store(true, Ordering::SeqCst);
    }

    async fn run(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            debug!("shutdown already performed");
            return;
        }

        if self.activated.load(Ordering::SeqCst) {
            let engine = self.engine.clone();
            match tokio::task::spawn_blocking(move || engine.shutdown(true)).await {
                Ok(Ok(())) => info!("hostable web core stopped"),
                Ok(Err(err)) => error!(error = ?err, "hostable web core didn't shut down cleanly"),
                Err(err) => error!(error = %err, "hostable web core shutdown task failed"),
            }
        }

        remove_dir_with_retry(&self.temp_directory, self.retry).await;
    }
}

/// Removes `path` recursively, retrying while it stays locked.
///
/// A directory that is already gone counts as removed.
pub async fn remove_dir_with_retry(path: &Path, policy: RetryPolicy) -> bool {
    for attempt in 1..=policy.max_attempts {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), attempt, "temp directory removed");
                return true;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
            Err(err) => {
                warn!(path = %path.display(), attempt, error = %err, "temp directory still locked");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    warn!(path = %path.display(), "giving up on removing temp directory");
    false
}

/// The application kernel, responsible for managing the application's lifecycle
/// and providing access to its core components.
pub struct Kernel {
    configuration: BootstrapConfig,
    engine: Arc<dyn HostingEngine>,
    files: Box<dyn FileCheck + Send + Sync>,
    stop: CancellationToken,
    shutdown: Arc<Shutdown>,
    operator_input: bool,
    state: LifecycleState,
}

impl Kernel {
    pub fn new(configuration: BootstrapConfig, engine: Arc<dyn HostingEngine>) -> Self {
        let shutdown = Arc::new(Shutdown::new(
            engine.clone(),
            configuration.temp_directory.clone(),
            RetryPolicy::default(),
        ));
        Self {
            configuration,
            engine,
            files: Box::new(FsCheck),
            stop: CancellationToken::new(),
            shutdown,
            operator_input: false,
            state: LifecycleState::Initializing,
        }
    }

    pub fn with_file_check(mut self, files: impl FileCheck + Send + Sync + 'static) -> Self {
        self.files = Box::new(files);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.shutdown = Arc::new(Shutdown::new(
            self.engine.clone(),
            self.configuration.temp_directory.clone(),
            retry,
        ));
        self
    }

    /// Waits for Enter on stdin while running, in addition to stop signals.
    pub fn with_operator_input(mut self, enabled: bool) -> Self {
        self.operator_input = enabled;
        self
    }

    /// Token that requests shutdown when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!(from = ?self.state, to = ?next, "lifecycle transition");
        self.state = next;
    }

    /// Runs the bootstrap to completion. Shutdown runs on every path.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.start().await;
        if let Err(err) = &result {
            debug!(error = ?err, state = ?self.state, "bootstrap aborted");
        }

        self.transition(LifecycleState::ShuttingDown);
        self.shutdown.run().await;
        self.transition(LifecycleState::Terminated);
        result
    }

    async fn start(&mut self) -> Result<()> {
        let config = self.configuration.clone();
        info!(
            instance_id = %config.application_instance_id,
            port = config.port,
            root = %config.root_path.display(),
            "bootstrapping hostable web core"
        );

        let rendered = RenderedConfigSet::render(&config);
        dependencies::validate_required_dll_dependencies(
            &rendered.application_host,
            &ProcessEnv,
            self.files.as_ref(),
        )?;
        self.transition(LifecycleState::Validated);
        if self.stop_requested() {
            return Ok(());
        }

        rendered.write_to(&config)?;
        self.transition(LifecycleState::ConfigWritten);
        if self.stop_requested() {
            return Ok(());
        }

        self.activate(&config).await?;
        self.transition(LifecycleState::Activated);

        println!("Server ID {} started", config.application_instance_id);
        if self.operator_input {
            println!("PRESS Enter to shutdown");
            spawn_operator_input(self.stop.clone());
        }

        self.transition(LifecycleState::Running);
        self.stop.cancelled().await;
        info!("stop requested");
        Ok(())
    }

    async fn activate(&self, config: &BootstrapConfig) -> Result<()> {
        let engine = self.engine.clone();
        let credentials = Credentials::parse(config.user.as_deref(), config.password.as_deref());
        let app_host = config.application_host_config_path.clone();
        let web = config.web_config_path.clone();
        let instance_id = config.application_instance_id.clone();

        // impersonation is per thread, so enter, activate and revert on one
        let activation = tokio::task::spawn_blocking(move || {
            let identity = IdentityContext::enter(credentials.as_ref())?;
            debug!(impersonated = identity.is_impersonated(), "activating hostable web core");
            engine.activate(&app_host, &web, &instance_id)
        })
        .await
        .map_err(|e| BootstrapError::Activation(format!("activation task failed: {e}")))?;

        match activation {
            Ok(()) => {
                self.shutdown.mark_activated();
                Ok(())
            }
            Err(err @ BootstrapError::Authorization(_)) => {
                error!("Access denied starting hostable web core");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn stop_requested(&self) -> bool {
        let requested = self.stop.is_cancelled();
        if requested {
            info!(state = ?self.state, "stop requested before activation");
        }
        requested
    }
}

/// Maps a run result to the process exit code.
pub fn exit_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Cancels `stop` on Enter. End of input is not treated as a stop request.
fn spawn_operator_input(stop: CancellationToken) {
    // a detached thread, a blocked stdin read must not hold up process exit
    std::thread::spawn(move || {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => debug!("stdin closed, waiting for a termination signal"),
            Ok(_) => stop.cancel(),
            Err(err) => warn!(error = %err, "unable to read operator input"),
        }
    });
}

/// Cancels `stop` when the process receives a termination signal.
pub fn spawn_signal_listener(stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            received = termination_signal() => match received {
                Ok(()) => {
                    info!("termination signal received");
                    stop.cancel();
                }
                Err(err) => error!(error = %err, "unable to listen for termination signals"),
            },
            _ = stop.cancelled() => {}
        }
    })
}

#[cfg(windows)]
async fn termination_signal() -> io::Result<()> {
    use tokio::signal::windows;

    let mut ctrl_break = windows::ctrl_break()?;
    let mut ctrl_close = windows::ctrl_close()?;
    let mut ctrl_shutdown = windows::ctrl_shutdown()?;
    let mut ctrl_logoff = windows::ctrl_logoff()?;

    tokio::select! {
        received = tokio::signal::ctrl_c() => received?,
        _ = ctrl_break.recv() => {}
        _ = ctrl_close.recv() => {}
        _ = ctrl_shutdown.recv() => {}
        _ = ctrl_logoff.recv() => {}
    }
    Ok(())
}

#[cfg(unix)]
async fn termination_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        received = tokio::signal::ctrl_c() => received?,
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::core::configuration::{load_options, parse_args};
    use assertables::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEngine {
        activations: Mutex<Vec<(PathBuf, PathBuf, String)>>,
        shutdowns: Mutex<Vec<bool>>,
        deny: bool,
        activation_delay: Duration,
    }

    impl HostingEngine for FakeEngine {
        fn activate(&self, app_host: &Path, web: &Path, instance_id: &str) -> Result<()> {
            std::thread::sleep(self.activation_delay);
            if self.deny {
                return Err(BootstrapError::Authorization("HRESULT 0x80070005".into()));
            }
            self.activations.lock().unwrap().push((
                app_host.to_path_buf(),
                web.to_path_buf(),
                instance_id.to_string(),
            ));
            Ok(())
        }

        fn shutdown(&self, immediate: bool) -> Result<()> {
            self.shutdowns.lock().unwrap().push(immediate);
            Err(BootstrapError::Activation("already stopped".into()))
        }
    }

    struct AllPresent;

    impl FileCheck for AllPresent {
        fn exists(&self, _: &Path) -> bool {
            true
        }
    }

    struct NonePresent;

    impl FileCheck for NonePresent {
        fn exists(&self, _: &Path) -> bool {
            false
        }
    }

    const FAST_RETRY: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(10),
    };

    async fn config_for(site: &Path, profile: &Path, args: &[&str]) -> BootstrapConfig {
        let env = HashMap::from([("HOME".to_string(), profile.to_str().unwrap().to_string())]);
        let argv = std::iter::once("hwc-bootstrap").chain(args.iter().copied());
        let cli = parse_args(argv).unwrap().unwrap();
        load_options(cli, &env, site).await.unwrap()
    }

    async fn wait_for_activation(engine: &FakeEngine) {
        for _ in 0..500 {
            if !engine.activations.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine was never activated");
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let args = ["--appRootPath", ".", "--port", "5000"];
        let config = config_for(site.path(), profile.path(), &args).await;

        let engine = Arc::new(FakeEngine::default());
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);
        let stop = kernel.stop_token();
        let running = tokio::spawn(async move {
            let result = kernel.run().await;
            (kernel, result)
        });

        wait_for_activation(&engine).await;
        assert_eq!(std::fs::read_dir(&config.config_directory).unwrap().count(), 3);
        let app_host = std::fs::read_to_string(&config.application_host_config_path).unwrap();
        assert_contains!(app_host, "5000");
        {
            let activations = engine.activations.lock().unwrap();
            assert_eq!(
                activations[0],
                (
                    config.application_host_config_path.clone(),
                    config.web_config_path.clone(),
                    config.application_instance_id.clone(),
                )
            );
        }

        stop.cancel();
        let (kernel, result) = running.await.unwrap();

        assert_eq!(exit_code(&result), 0);
        assert_eq!(kernel.state(), LifecycleState::Terminated);
        assert!(!config.temp_directory.exists());
        assert_eq!(*engine.shutdowns.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_missing_modules_abort_before_activation() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &[]).await;

        let engine = Arc::new(FakeEngine::default());
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(NonePresent)
            .with_retry_policy(FAST_RETRY);

        let result = kernel.run().await;

        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, BootstrapError::Validation(_)));
        assert_starts_with!(err.to_string(), "Missing required dlls:");
        assert_eq!(exit_code(&result), 1);
        assert!(engine.activations.lock().unwrap().is_empty());
        assert!(engine.shutdowns.lock().unwrap().is_empty());
        assert!(!config.temp_directory.exists());
        assert_eq!(kernel.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_access_denied_is_authorization_error() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &[]).await;

        let engine = Arc::new(FakeEngine {
            deny: true,
            ..FakeEngine::default()
        });
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);

        let result = kernel.run().await;

        assert!(matches!(result, Err(BootstrapError::Authorization(_))));
        assert_eq!(exit_code(&result), 1);
        assert!(engine.shutdowns.lock().unwrap().is_empty());
        assert!(!config.temp_directory.exists());
    }

    #[tokio::test]
    async fn test_stop_before_activation() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &[]).await;

        let engine = Arc::new(FakeEngine::default());
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);
        kernel.stop_token().cancel();

        let result = kernel.run().await;

        assert_eq!(exit_code(&result), 0);
        assert!(engine.activations.lock().unwrap().is_empty());
        assert!(!config.temp_directory.exists());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_impersonation_failure_is_fatal() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &["--user", "CORP\\alice"]).await;

        let engine = Arc::new(FakeEngine::default());
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);

        let result = kernel.run().await;

        assert!(matches!(result, Err(BootstrapError::Unsupported(_))));
        assert!(engine.activations.lock().unwrap().is_empty());
        assert!(!config.temp_directory.exists());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp-instance");
        std::fs::create_dir_all(temp.join("config")).unwrap();

        let engine = Arc::new(FakeEngine::default());
        let shutdown = Shutdown::new(engine.clone(), temp.clone(), FAST_RETRY);
        shutdown.mark_activated();

        shutdown.run().await;
        shutdown.run().await;

        assert!(!temp.exists());
        assert_eq!(*engine.shutdowns.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_stop_during_activation_still_stops_engine() {
        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &[]).await;

        let engine = Arc::new(FakeEngine {
            activation_delay: Duration::from_millis(200),
            ..FakeEngine::default()
        });
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);
        let stop = kernel.stop_token();
        let running = tokio::spawn(async move { kernel.run().await });

        // the config tree is written right before the slow activation starts
        for _ in 0..100 {
            if config.application_host_config_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.activations.lock().unwrap().is_empty());
        stop.cancel();

        assert_ok!(running.await.unwrap());
        assert_eq!(engine.activations.lock().unwrap().len(), 1);
        assert_eq!(*engine.shutdowns.lock().unwrap(), vec![true]);
        assert!(!config.temp_directory.exists());
    }

    #[tokio::test]
    async fn test_shutdown_skips_engine_when_never_activated() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("tmp-instance");
        std::fs::create_dir_all(&temp).unwrap();

        let engine = Arc::new(FakeEngine::default());
        let shutdown = Shutdown::new(engine.clone(), temp.clone(), FAST_RETRY);
        shutdown.run().await;

        assert!(engine.shutdowns.lock().unwrap().is_empty());
        assert!(!temp.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_shuts_down_running_kernel() {
        use tokio::signal::unix::{SignalKind, signal};

        // keeps SIGTERM from reaching the default handler while the listener starts
        let _terminate = signal(SignalKind::terminate()).unwrap();

        let site = tempfile::tempdir().unwrap();
        let profile = tempfile::tempdir().unwrap();
        let config = config_for(site.path(), profile.path(), &[]).await;

        let engine = Arc::new(FakeEngine::default());
        let mut kernel = Kernel::new(config.clone(), engine.clone())
            .with_file_check(AllPresent)
            .with_retry_policy(FAST_RETRY);
        let stop = kernel.stop_token();
        let listener = spawn_signal_listener(stop.clone());
        let running = tokio::spawn(async move {
            let result = kernel.run().await;
            (kernel, result)
        });

        wait_for_activation(&engine).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), stop.cancelled())
            .await
            .unwrap();
        assert_ok!(listener.await);

        let (kernel, result) = running.await.unwrap();
        assert_eq!(exit_code(&result), 0);
        assert_eq!(kernel.state(), LifecycleState::Terminated);
        assert_eq!(*engine.shutdowns.lock().unwrap(), vec![true]);
        assert!(!config.temp_directory.exists());
    }

    #[tokio::test]
    async fn test_remove_dir_with_retry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tree");
        std::fs::create_dir_all(target.join("a/b")).unwrap();
        std::fs::write(target.join("a/b/file.txt"), "x").unwrap();

        assert!(remove_dir_with_retry(&target, FAST_RETRY).await);
        assert!(!target.exists());
        assert!(remove_dir_with_retry(&target, FAST_RETRY).await);
    }

    #[tokio::test]
    async fn test_signal_listener_stops_with_token() {
        let stop = CancellationToken::new();
        let listener = spawn_signal_listener(stop.clone());
        stop.cancel();
        assert_ok!(listener.await);
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }
}
