//! Jobs: a single executable unit of a tree.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::dependency::ExecDependency;
use crate::error::ExecError;
use crate::resource::ExecResource;
use crate::state::{JobState, StateLatches};
use crate::tree::{ExecTree, TreeConfig};

/// Sentinel jobpath marking a job as undefined (a no-op placeholder).
pub const UNDEF_JOB: &str = "-";

const DEFAULT_TCOLOR: &str = "lavender";

/// The executable body of a job.
///
/// A job has exactly one body; the setters enforce the exclusion and the
/// tree's validation reports a missing body.
#[derive(Clone, Default)]
pub enum JobBody {
    /// No body yet; fails validation.
    #[default]
    Unset,
    /// Path to an executable file, or the [`UNDEF_JOB`] sentinel.
    Path(PathBuf),
    /// An embedded tree, run (and possibly iterated) in place of a process.
    Subtree(Arc<ExecTree>),
}

impl fmt::Debug for JobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobBody::Unset => write!(f, "Unset"),
            JobBody::Path(path) => write!(f, "Path({})", path.display()),
            JobBody::Subtree(tree) => write!(f, "Subtree({})", tree.name()),
        }
    }
}

/// A single executable unit of a tree.
///
/// Runtime state (state machine, latches, counters) lives behind interior
/// mutability and is written only by the job's own task or by tree-level
/// cancel/reset; configuration setters are checked against the state machine
/// where required.
pub struct ExecJob {
    name: String,
    uuid: Uuid,
    tree: OnceLock<Weak<ExecTree>>,
    body: Mutex<JobBody>,
    arguments: Mutex<Vec<String>>,
    logfile: Mutex<Option<PathBuf>>,
    resources: Mutex<Vec<Arc<ExecResource>>>,
    mustcomplete: AtomicBool,
    overridden: AtomicBool,
    tcolor: Mutex<String>,
    href: Mutex<String>,
    state: Mutex<JobState>,
    latches: StateLatches,
    progress: AtomicI32,
    execcount: AtomicU32,
    failcount: AtomicU32,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl ExecJob {
    /// Creates a job that runs the executable at `jobpath`.
    ///
    /// A jobpath of [`UNDEF_JOB`] creates an undefined placeholder job.
    pub fn new(name: impl Into<String>, jobpath: impl Into<PathBuf>) -> Arc<Self> {
        let job = Self::bare(name.into(), Uuid::new_v4());
        job.install_jobpath(jobpath.into());
        job
    }

    /// Creates a job whose body is the given subtree.
    pub fn with_subtree(name: impl Into<String>, subtree: Arc<ExecTree>) -> Arc<Self> {
        let job = Self::bare(name.into(), Uuid::new_v4());
        *job.body.lock().unwrap() = JobBody::Subtree(subtree);
        job
    }

    pub(crate) fn from_parts(name: String, uuid: Uuid) -> Arc<Self> {
        Self::bare(name, uuid)
    }

    fn bare(name: String, uuid: Uuid) -> Arc<Self> {
        let job = Arc::new(Self {
            name,
            uuid,
            tree: OnceLock::new(),
            body: Mutex::new(JobBody::Unset),
            arguments: Mutex::new(Vec::new()),
            logfile: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            mustcomplete: AtomicBool::new(true),
            overridden: AtomicBool::new(false),
            tcolor: Mutex::new(DEFAULT_TCOLOR.to_string()),
            href: Mutex::new(String::new()),
            state: Mutex::new(JobState::Idle),
            latches: StateLatches::new(),
            progress: AtomicI32::new(-1),
            execcount: AtomicU32::new(0),
            failcount: AtomicU32::new(0),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        });
        job.latches.set(JobState::Idle);
        job
    }

    fn install_jobpath(&self, path: PathBuf) {
        let undef = path.as_os_str() == UNDEF_JOB;
        *self.body.lock().unwrap() = JobBody::Path(path);
        if undef && self.state() == JobState::Idle {
            self.set_state(JobState::Undef);
        }
    }

    /// Job name, unique within its tree.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identity used by serialized documents.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The owning tree, once the job has been added to one.
    pub fn tree(&self) -> Option<Arc<ExecTree>> {
        self.tree.get().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_tree(&self, tree: &Arc<ExecTree>) -> Result<(), ExecError> {
        self.tree
            .set(Arc::downgrade(tree))
            .map_err(|_| ExecError::TreeDefined)
    }

    /// A copy of the job body.
    pub fn body(&self) -> JobBody {
        self.body.lock().unwrap().clone()
    }

    /// The executable path, when the body is a path.
    pub fn jobpath(&self) -> Option<PathBuf> {
        match &*self.body.lock().unwrap() {
            JobBody::Path(path) => Some(path.clone()),
            _ => None,
        }
    }

    /// The embedded subtree, when the body is a subtree.
    pub fn subtree(&self) -> Option<Arc<ExecTree>> {
        match &*self.body.lock().unwrap() {
            JobBody::Subtree(tree) => Some(Arc::clone(tree)),
            _ => None,
        }
    }

    /// Replaces the body with an executable path.
    ///
    /// Fails when a subtree body is set, or once the job has started
    /// (state outside PRE-START).
    pub fn set_jobpath(&self, jobpath: impl Into<PathBuf>) -> Result<(), ExecError> {
        if matches!(&*self.body.lock().unwrap(), JobBody::Subtree(_)) {
            return Err(ExecError::Job(format!(
                "jobpath of {} cannot be set while a subtree body is set",
                self.name
            )));
        }
        if !self.state().is_prestart() {
            return Err(ExecError::Job(format!(
                "jobpath of {} cannot be modified after the job has been started",
                self.name
            )));
        }
        self.install_jobpath(jobpath.into());
        Ok(())
    }

    /// Replaces the body with an embedded subtree.
    ///
    /// Fails when a jobpath body is set, or once the job has started.
    pub fn set_subtree(&self, subtree: Arc<ExecTree>) -> Result<(), ExecError> {
        if matches!(&*self.body.lock().unwrap(), JobBody::Path(_)) {
            return Err(ExecError::Job(format!(
                "subtree of {} cannot be set while a jobpath is set",
                self.name
            )));
        }
        if !self.state().is_prestart() {
            return Err(ExecError::Job(format!(
                "subtree of {} cannot be modified after the job has been started",
                self.name
            )));
        }
        *self.body.lock().unwrap() = JobBody::Subtree(subtree);
        Ok(())
    }

    /// Removes the body (the job no longer validates until one is set).
    pub fn clear_body(&self) -> Result<(), ExecError> {
        if !self.state().is_prestart() {
            return Err(ExecError::Job(format!(
                "body of {} cannot be modified after the job has been started",
                self.name
            )));
        }
        *self.body.lock().unwrap() = JobBody::Unset;
        Ok(())
    }

    /// Ordered extra arguments passed to the executable.
    pub fn arguments(&self) -> Vec<String> {
        self.arguments.lock().unwrap().clone()
    }

    /// Appends one argument.
    pub fn push_argument(&self, argument: impl Into<String>) {
        self.arguments.lock().unwrap().push(argument.into());
    }

    /// Appends several arguments.
    pub fn extend_arguments(&self, arguments: &[String]) {
        self.arguments
            .lock()
            .unwrap()
            .extend(arguments.iter().cloned());
    }

    /// The logfile stdout/stderr are appended to, if any.
    pub fn logfile(&self) -> Option<PathBuf> {
        self.logfile.lock().unwrap().clone()
    }

    /// Sets the logfile path.
    pub fn set_logfile(&self, path: impl Into<PathBuf>) {
        *self.logfile.lock().unwrap() = Some(path.into());
    }

    /// Resources that must all be held while the job runs.
    pub fn resources(&self) -> Vec<Arc<ExecResource>> {
        self.resources.lock().unwrap().clone()
    }

    /// Declares a resource requirement.
    pub fn add_resource(&self, resource: Arc<ExecResource>) {
        self.resources.lock().unwrap().push(resource);
    }

    /// Whether tree completion waits on this job.
    pub fn mustcomplete(&self) -> bool {
        self.mustcomplete.load(Ordering::SeqCst)
    }

    /// Sets the mandatory flag.
    pub fn set_mustcomplete(&self, mustcomplete: bool) {
        self.mustcomplete.store(mustcomplete, Ordering::SeqCst);
    }

    /// True once the job was completed by a manual override.
    pub fn is_overridden(&self) -> bool {
        self.overridden.load(Ordering::SeqCst)
    }

    /// Node outline color used by the renderer.
    pub fn tcolor(&self) -> String {
        self.tcolor.lock().unwrap().clone()
    }

    /// Sets the node outline color.
    pub fn set_tcolor(&self, tcolor: impl Into<String>) {
        *self.tcolor.lock().unwrap() = tcolor.into();
    }

    /// Hyperlink attached to the rendered node.
    pub fn href(&self) -> String {
        self.href.lock().unwrap().clone()
    }

    /// Sets the hyperlink.
    pub fn set_href(&self, href: impl Into<String>) {
        *self.href.lock().unwrap() = href.into();
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    /// Applies a state decided under the state lock; returns the new state
    /// when a transition happened.
    fn transition(
        &self,
        decide: impl FnOnce(JobState) -> Option<JobState>,
    ) -> Option<JobState> {
        let applied = {
            let mut state = self.state.lock().unwrap();
            match decide(*state) {
                Some(next) if next != *state => {
                    *state = next;
                    Some(next)
                }
                _ => None,
            }
        };
        if let Some(next) = applied {
            tracing::debug!(job = %self.name, state = ?next, "state change");
            self.latches.set(next);
            self.latches.bump();
            if let Some(tree) = self.tree() {
                tree.on_job_event();
            }
        }
        applied
    }

    pub(crate) fn set_state(&self, value: JobState) {
        self.transition(|_| Some(value));
    }

    /// Subscribes to the latch for `state`; the receiver reads `true` while
    /// the latch is set.
    pub fn event(&self, state: JobState) -> watch::Receiver<bool> {
        self.latches.subscribe(state)
    }

    /// Waits until the latch for `state` is set.
    pub async fn wait_state(&self, state: JobState) {
        let mut latch = self.latches.subscribe(state);
        let _ = latch.wait_for(|set| *set).await;
    }

    /// A counter bumped on every state change.
    pub fn state_changes(&self) -> watch::Receiver<u64> {
        self.latches.changes()
    }

    /// True in a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// True in a success-like state (SUCCESS or UNDEF).
    pub fn is_success(&self) -> bool {
        self.state().is_success_like()
    }

    /// True when the job failed.
    pub fn is_failed(&self) -> bool {
        self.state() == JobState::Failed
    }

    /// True when the job was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == JobState::Cancelled
    }

    /// True for jobs with a real body (not UNDEF).
    pub fn is_defined(&self) -> bool {
        self.state() != JobState::Undef
    }

    /// Reported completion percentage in `[0, 100]`; `-1` means unknown.
    pub fn progress(&self) -> i32 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Sets the progress value; out-of-range values are ignored.
    ///
    /// Returns `true` when the value was accepted. Progress is for external
    /// observers only and does not gate scheduling.
    pub fn set_progress(&self, value: i32) -> bool {
        if (0..=100).contains(&value) {
            self.progress.store(value, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Number of completed executions.
    pub fn execcount(&self) -> u32 {
        self.execcount.load(Ordering::SeqCst)
    }

    /// Number of failed executions.
    pub fn failcount(&self) -> u32 {
        self.failcount.load(Ordering::SeqCst)
    }

    /// Wall-clock start of the most recent execution.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    /// Wall-clock end of the most recent execution.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap()
    }

    /// Dependencies this job waits on.
    pub fn parent_deps(&self) -> Vec<Arc<ExecDependency>> {
        self.tree()
            .map(|tree| tree.deps_of_child(self.uuid))
            .unwrap_or_default()
    }

    /// Dependencies this job releases.
    pub fn child_deps(&self) -> Vec<Arc<ExecDependency>> {
        self.tree()
            .map(|tree| tree.deps_of_parent(self.uuid))
            .unwrap_or_default()
    }

    /// Jobs this job depends on.
    pub fn parents(&self) -> Vec<Arc<ExecJob>> {
        self.parent_deps()
            .iter()
            .map(|dep| Arc::clone(dep.parent()))
            .collect()
    }

    /// Jobs depending on this job.
    pub fn children(&self) -> Vec<Arc<ExecJob>> {
        self.child_deps()
            .iter()
            .map(|dep| Arc::clone(dep.child()))
            .collect()
    }

    pub(crate) fn has_defined_ancestors(&self) -> bool {
        fn walk(job: &ExecJob, seen: &mut HashSet<Uuid>) -> bool {
            for parent in job.parents() {
                if !seen.insert(parent.uuid()) {
                    continue;
                }
                if parent.is_defined() || walk(&parent, seen) {
                    return true;
                }
            }
            false
        }
        walk(self, &mut HashSet::new())
    }

    pub(crate) fn validate_body(&self) -> Vec<String> {
        match self.body() {
            JobBody::Unset => vec![format!("subtree or jobpath of {} must be set.", self.name)],
            JobBody::Path(path) => {
                if path.as_os_str() == UNDEF_JOB {
                    // No-op jobs are allowed to exist.
                    return Vec::new();
                }
                match std::fs::metadata(&path) {
                    Err(_) => vec![format!(
                        "File {} needed by job {} does not exist.",
                        path.display(),
                        self.name
                    )],
                    Ok(meta) => {
                        use std::os::unix::fs::PermissionsExt;
                        if meta.permissions().mode() & 0o111 == 0 {
                            vec![format!(
                                "File {} needed by job {} is not executable.",
                                path.display(),
                                self.name
                            )]
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
            JobBody::Subtree(_) => Vec::new(),
        }
    }

    /// Returns up to the last `size` bytes of the job's logfile.
    pub fn read_log(&self, size: u64) -> String {
        let Some(path) = self.logfile() else {
            return String::new();
        };
        match read_tail(&path, size) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(job = %self.name, error = %err, "failed to read log file");
                String::new()
            }
        }
    }

    /// Returns a done job to a startable state, clearing every latch.
    ///
    /// No-op (returns `false`) unless the job is in a done state.
    pub fn reset(&self) -> bool {
        if !self.is_done() {
            return false;
        }
        self.latches.clear_all();
        self.set_state(JobState::Reset);
        tracing::debug!(job = %self.name, "job reset");
        true
    }

    /// Cancels a job that has not started running.
    ///
    /// Returns `false` for a running job (it is left to finish naturally),
    /// `true` when the job is already done or was just cancelled.
    pub fn cancel(&self) -> bool {
        let mut cancellable = true;
        self.transition(|state| match state {
            JobState::Running => {
                cancellable = false;
                None
            }
            state if state.is_done() => None,
            _ => Some(JobState::Cancelled),
        });
        cancellable
    }

    /// Marks the job successful without executing it (operator recovery).
    ///
    /// Clears the latches as if the job were reset and immediately
    /// succeeded. Fails while the job is running.
    pub fn manual_override(&self) -> bool {
        if self.state() == JobState::Running {
            return false;
        }
        self.overridden.store(true, Ordering::SeqCst);
        self.latches.clear_all();
        self.set_state(JobState::Success);
        true
    }

    /// Starts the job's task. Must be called within a tokio runtime.
    ///
    /// An undefined job never runs a body: a waiter task sets the SUCCESS
    /// latch once every parent dependency is satisfied, leaving the state
    /// UNDEF. Returns `false` when the job is already successful or running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.state() == JobState::Undef {
            if !self.latches.is_set(JobState::Success) {
                let job = Arc::clone(self);
                tokio::spawn(async move {
                    for dep in job.parent_deps() {
                        dep.wait().await;
                    }
                    tracing::debug!(job = %job.name, "undefined job short-circuits");
                    job.latches.set(JobState::Success);
                    if let Some(tree) = job.tree() {
                        tree.on_job_event();
                    }
                });
            }
            return true;
        }
        if self.is_success() || self.state() == JobState::Running {
            return false;
        }
        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.run_task().await;
        });
        true
    }

    async fn run_task(self: Arc<Self>) {
        tracing::debug!(job = %self.name, state = ?self.state(), "waiting on parent dependencies");
        self.wait_parents().await;
        if self.is_done() {
            return;
        }
        let Some(tree) = self.tree() else {
            tracing::error!(job = %self.name, "job started without a tree");
            return;
        };
        let config = tree.config();

        let claim = match self.acquire_resources(&config).await {
            Some(claim) => claim,
            None => {
                tracing::warn!(
                    job = %self.name,
                    "resource deadlock prevention exceeded max attempts"
                );
                self.transition(|state| {
                    if state.is_done() {
                        None
                    } else {
                        Some(JobState::Failed)
                    }
                });
                return;
            }
        };
        // A cancel may have landed while acquiring; never overwrite it.
        if self
            .transition(|state| {
                if state.is_done() {
                    None
                } else {
                    Some(JobState::Running)
                }
            })
            .is_none()
        {
            return;
        }

        *self.started_at.lock().unwrap() = Some(Utc::now());
        let succeeded = self.execute_body(&tree).await;
        drop(claim);
        *self.finished_at.lock().unwrap() = Some(Utc::now());

        self.execcount.fetch_add(1, Ordering::SeqCst);
        if succeeded {
            self.set_state(JobState::Success);
        } else {
            self.failcount.fetch_add(1, Ordering::SeqCst);
            self.set_state(JobState::Failed);
        }
    }

    async fn wait_parents(&self) {
        for dep in self.parent_deps() {
            tokio::select! {
                _ = dep.wait() => {}
                _ = self.wait_done() => return,
            }
        }
    }

    /// Resolves once this job enters a done state (e.g. cancelled while
    /// parked on a parent).
    async fn wait_done(&self) {
        let mut changes = self.latches.changes();
        while !self.is_done() {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Atomic-by-backoff multi-resource acquisition.
    ///
    /// Reserves the declared resources in order; on any single failure all
    /// partial reservations are released and the job sleeps
    /// `len(resources) * timeout + rand(0, timeout)` before retrying, up to
    /// `max_acquire_attempts`.
    async fn acquire_resources(&self, config: &TreeConfig) -> Option<ResourceClaim> {
        let resources = self.resources();
        if resources.is_empty() {
            return Some(ResourceClaim::default());
        }
        if self
            .transition(|state| {
                if state.is_done() {
                    None
                } else {
                    Some(JobState::Blocked)
                }
            })
            .is_none()
        {
            return None;
        }
        let timeout = config.acquire_timeout;
        let backoff = timeout * resources.len() as u32;
        let mut attempts = 0u32;
        loop {
            if self.is_done() {
                return None;
            }
            let mut claim = ResourceClaim::default();
            let mut acquired = true;
            for resource in &resources {
                if resource.reserve(true, timeout).await {
                    claim.held.push(Arc::clone(resource));
                } else {
                    acquired = false;
                    break;
                }
            }
            if acquired {
                self.transition(|state| {
                    if state.is_done() {
                        None
                    } else {
                        Some(JobState::Idle)
                    }
                });
                return Some(claim);
            }
            drop(claim);
            attempts += 1;
            // One failed attempt is observable as a transient return to idle.
            self.transition(|state| {
                if state.is_done() {
                    None
                } else {
                    Some(JobState::Idle)
                }
            });
            if config.max_acquire_attempts > 0 && attempts >= config.max_acquire_attempts {
                return None;
            }
            tokio::time::sleep(backoff + jitter(timeout)).await;
            self.transition(|state| {
                if state.is_done() {
                    None
                } else {
                    Some(JobState::Blocked)
                }
            });
        }
    }

    async fn execute_body(&self, tree: &Arc<ExecTree>) -> bool {
        match self.body() {
            JobBody::Unset => {
                tracing::error!(job = %self.name, "job has no body");
                false
            }
            JobBody::Path(path) => {
                if path.as_os_str() == UNDEF_JOB {
                    return true;
                }
                self.run_process(tree, &path).await
            }
            JobBody::Subtree(subtree) => {
                tracing::debug!(job = %self.name, subtree = %subtree.name(), "running subtree");
                subtree.iterrun().await
            }
        }
    }

    async fn run_process(&self, tree: &Arc<ExecTree>, path: &Path) -> bool {
        let mut args = self.arguments();
        if let Some(argument) = tree.iter_argument() {
            args.push(argument);
        }
        tracing::debug!(job = %self.name, path = %path.display(), ?args, "starting process");

        let mut command = tokio::process::Command::new(path);
        command
            .args(&args)
            .current_dir(tree.cwd())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match self.logfile() {
            Some(logpath) => {
                let log = match std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&logpath)
                {
                    Ok(file) => file,
                    Err(err) => {
                        tracing::warn!(
                            job = %self.name,
                            logfile = %logpath.display(),
                            error = %err,
                            "failed to open logfile"
                        );
                        return false;
                    }
                };
                let stderr = match log.try_clone() {
                    Ok(file) => file,
                    Err(err) => {
                        tracing::warn!(job = %self.name, error = %err, "failed to clone logfile handle");
                        return false;
                    }
                };
                command.stdout(log).stderr(stderr);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let status = match command.status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(job = %self.name, error = %err, "failed to spawn process");
                return false;
            }
        };
        tracing::debug!(job = %self.name, code = ?status.code(), "process finished");
        status.success()
    }
}

impl fmt::Debug for ExecJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ExecJob {} {:?}>", self.name, self.state())
    }
}

/// Resources held by a running job; released on drop, even on panic.
#[derive(Default)]
struct ResourceClaim {
    held: Vec<Arc<ExecResource>>,
}

impl Drop for ResourceClaim {
    fn drop(&mut self) {
        for resource in &self.held {
            tracing::debug!(resource = %resource.name(), "releasing");
            resource.release();
        }
    }
}

fn jitter(limit: Duration) -> Duration {
    use rand::Rng as _;
    rand::thread_rng().gen_range(Duration::ZERO..=limit)
}

fn read_tail(path: &Path, size: u64) -> std::io::Result<String> {
    use std::io::{Read as _, Seek as _, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(size)))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
}
