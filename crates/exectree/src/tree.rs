//! Trees: ownership, validation, and DAG execution.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::dependency::ExecDependency;
use crate::error::ExecError;
use crate::iter::ExecIter;
use crate::job::{ExecJob, JobBody};
use crate::resource::ExecResource;
use crate::state::JobState;
use crate::status::JobStatus;

/// How an iterated subtree folds per-iteration results into its host job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IterationPolicy {
    /// The host succeeds once the iterator is exhausted, regardless of
    /// per-iteration job failures.
    #[default]
    ContinueOnFailure,
    /// The first iteration that is not fully successful fails the host.
    FailFast,
}

/// Tunables for tree execution.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Per-resource reservation timeout during multi-resource acquisition.
    pub acquire_timeout: Duration,
    /// Acquisition attempts before a job gives up and fails; 0 = unlimited.
    pub max_acquire_attempts: u32,
    /// Brief sleep before a blocking run starts waiting on completion.
    pub stabilize_delay: Duration,
    /// Failure aggregation for iterated subtree runs.
    pub iteration_policy: IterationPolicy,
}

impl TreeConfig {
    /// Default per-resource reservation timeout.
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default bound on acquisition attempts.
    pub const DEFAULT_MAX_ACQUIRE_ATTEMPTS: u32 = 1000;
    /// Default stabilization sleep.
    pub const DEFAULT_STABILIZE_DELAY: Duration = Duration::from_millis(100);
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            max_acquire_attempts: Self::DEFAULT_MAX_ACQUIRE_ATTEMPTS,
            stabilize_delay: Self::DEFAULT_STABILIZE_DELAY,
            iteration_policy: IterationPolicy::default(),
        }
    }
}

/// A DAG of jobs with dependencies, shared resources, and embedded subtrees.
///
/// The tree exclusively owns its jobs, dependencies, resources, and nested
/// subtrees; jobs refer back to their tree through a weak handle. The
/// containers are frozen once [`ExecTree::run`] has started.
pub struct ExecTree {
    uuid: Uuid,
    name: Mutex<String>,
    href: Mutex<String>,
    cwd: Mutex<PathBuf>,
    jobs: Mutex<Vec<Arc<ExecJob>>>,
    deps: Mutex<Vec<Arc<ExecDependency>>>,
    resources: Mutex<Vec<Arc<ExecResource>>>,
    subtrees: Mutex<Vec<Arc<ExecTree>>>,
    iterator: Mutex<Option<ExecIter>>,
    legend: Mutex<BTreeMap<String, String>>,
    config: Mutex<TreeConfig>,
    waitsuccess: AtomicBool,
    cancelled: AtomicBool,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl ExecTree {
    /// Creates an empty tree.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_uuid(name.into(), Uuid::new_v4())
    }

    pub(crate) fn with_uuid(name: String, uuid: Uuid) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            name: Mutex::new(name),
            href: Mutex::new(String::new()),
            cwd: Mutex::new(PathBuf::from("/")),
            jobs: Mutex::new(Vec::new()),
            deps: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            subtrees: Mutex::new(Vec::new()),
            iterator: Mutex::new(None),
            legend: Mutex::new(BTreeMap::new()),
            config: Mutex::new(TreeConfig::default()),
            waitsuccess: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            done: watch::channel(false).0,
        })
    }

    /// Tree name.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Renames the tree.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    /// Stable identity used by serialized documents.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Hyperlink attached to the tree.
    pub fn href(&self) -> String {
        self.href.lock().unwrap().clone()
    }

    /// Sets the hyperlink.
    pub fn set_href(&self, href: impl Into<String>) {
        *self.href.lock().unwrap() = href.into();
    }

    /// Working directory for every job process of this tree.
    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().unwrap().clone()
    }

    /// Sets the working directory.
    pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
        *self.cwd.lock().unwrap() = cwd.into();
    }

    /// Execution tunables.
    pub fn config(&self) -> TreeConfig {
        self.config.lock().unwrap().clone()
    }

    /// Replaces the execution tunables.
    pub fn set_config(&self, config: TreeConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// When set, the tree does not report done while a mandatory job is
    /// failed; the operator is expected to reschedule it out-of-band.
    pub fn set_waitsuccess(&self, waitsuccess: bool) {
        self.waitsuccess.store(waitsuccess, Ordering::SeqCst);
    }

    /// Current waitsuccess flag.
    pub fn waitsuccess(&self) -> bool {
        self.waitsuccess.load(Ordering::SeqCst)
    }

    /// The jobs of this tree, in insertion order.
    pub fn jobs(&self) -> Vec<Arc<ExecJob>> {
        self.jobs.lock().unwrap().clone()
    }

    /// The dependency edges of this tree, in insertion order.
    pub fn deps(&self) -> Vec<Arc<ExecDependency>> {
        self.deps.lock().unwrap().clone()
    }

    /// The resources registered with this tree.
    pub fn resources(&self) -> Vec<Arc<ExecResource>> {
        self.resources.lock().unwrap().clone()
    }

    /// The nested subtrees of this tree.
    pub fn subtrees(&self) -> Vec<Arc<ExecTree>> {
        self.subtrees.lock().unwrap().clone()
    }

    /// All jobs, including jobs of subtree bodies, depth-first.
    pub fn rjobs(&self) -> Vec<Arc<ExecJob>> {
        let mut all = Vec::new();
        for job in self.jobs() {
            all.push(Arc::clone(&job));
            if let JobBody::Subtree(subtree) = job.body() {
                all.extend(subtree.rjobs());
            }
        }
        all
    }

    /// Legend entries rendered alongside the graph.
    pub fn legend(&self) -> BTreeMap<String, String> {
        self.legend.lock().unwrap().clone()
    }

    /// Adds a legend entry.
    pub fn add_legend(&self, name: impl Into<String>, value: impl Into<String>) {
        self.legend.lock().unwrap().insert(name.into(), value.into());
    }

    /// Attaches an argument iterator (meaningful when the tree is used as a
    /// subtree body).
    pub fn set_iterator(&self, iterator: ExecIter) {
        *self.iterator.lock().unwrap() = Some(iterator);
    }

    /// A copy of the current iterator state.
    pub fn iterator(&self) -> Option<ExecIter> {
        self.iterator.lock().unwrap().clone()
    }

    /// The current iterator argument appended to every job's argv, when an
    /// iterator is attached.
    pub(crate) fn iter_argument(&self) -> Option<String> {
        self.iterator
            .lock()
            .unwrap()
            .as_ref()
            .map(|iterator| iterator.argument().to_string())
    }

    fn iterator_exhausted(&self) -> bool {
        self.iterator
            .lock()
            .unwrap()
            .as_ref()
            .map(|iterator| iterator.is_exhausted())
            .unwrap_or(true)
    }

    pub(crate) fn register_resource(&self, resource: Arc<ExecResource>) {
        self.resources.lock().unwrap().push(resource);
    }

    pub(crate) fn register_subtree(&self, subtree: Arc<ExecTree>) {
        let mut subtrees = self.subtrees.lock().unwrap();
        if !subtrees.iter().any(|tree| tree.uuid() == subtree.uuid()) {
            subtrees.push(subtree);
        }
    }

    /// Finds a job by name or uuid hex.
    pub fn find_job(&self, needle: &str) -> Option<Arc<ExecJob>> {
        self.jobs()
            .into_iter()
            .find(|job| job.name() == needle || job.uuid().simple().to_string() == needle)
    }

    pub(crate) fn find_job_by_uuid(&self, uuid: Uuid) -> Option<Arc<ExecJob>> {
        self.jobs().into_iter().find(|job| job.uuid() == uuid)
    }

    /// Finds a resource by uuid hex or name.
    pub fn find_resource(&self, needle: &str) -> Option<Arc<ExecResource>> {
        self.resources()
            .into_iter()
            .find(|resource| {
                resource.uuid().simple().to_string() == needle || resource.name() == needle
            })
    }

    /// Finds a nested subtree by uuid.
    pub fn find_subtree(&self, uuid: Uuid) -> Option<Arc<ExecTree>> {
        self.subtrees()
            .into_iter()
            .find(|subtree| subtree.uuid() == uuid)
    }

    /// Adds a job to the tree.
    ///
    /// Fails when a job with the same name is present or the job already
    /// belongs to a tree. A subtree body is registered automatically.
    pub fn add_job(self: &Arc<Self>, job: &Arc<ExecJob>) -> Result<(), ExecError> {
        if self.find_job(job.name()).is_some() {
            return Err(ExecError::JobDefined(job.name().to_string()));
        }
        job.attach_tree(self)?;
        if let JobBody::Subtree(subtree) = job.body() {
            self.register_subtree(subtree);
        }
        self.jobs.lock().unwrap().push(Arc::clone(job));
        Ok(())
    }

    /// Adds a success-typed dependency edge.
    pub fn add_dep(
        &self,
        parent: &Arc<ExecJob>,
        child: &Arc<ExecJob>,
    ) -> Result<Option<Arc<ExecDependency>>, ExecError> {
        self.add_dep_with_state(parent, child, JobState::Success)
    }

    /// Adds a dependency released when `parent` reaches `state`.
    ///
    /// Rejects cross-tree edges and self-loops. An exact duplicate edge is
    /// logged and dropped, returning `Ok(None)`.
    pub fn add_dep_with_state(
        &self,
        parent: &Arc<ExecJob>,
        child: &Arc<ExecJob>,
        state: JobState,
    ) -> Result<Option<Arc<ExecDependency>>, ExecError> {
        self.insert_dep(parent, child, state, None)
    }

    /// Resolves `parent` and `child` by name or uuid hex, then adds the edge.
    pub fn add_dep_by_name(
        &self,
        parent: &str,
        child: &str,
        state: JobState,
    ) -> Result<Option<Arc<ExecDependency>>, ExecError> {
        let parent = self.find_job(parent).ok_or_else(|| ExecError::JobUndefined {
            job: parent.to_string(),
            tree: self.name(),
        })?;
        let child = self.find_job(child).ok_or_else(|| ExecError::JobUndefined {
            job: child.to_string(),
            tree: self.name(),
        })?;
        self.insert_dep(&parent, &child, state, None)
    }

    pub(crate) fn insert_dep(
        &self,
        parent: &Arc<ExecJob>,
        child: &Arc<ExecJob>,
        state: JobState,
        colors: Option<(String, String)>,
    ) -> Result<Option<Arc<ExecDependency>>, ExecError> {
        for job in [parent, child] {
            if self.find_job_by_uuid(job.uuid()).is_none() {
                return Err(ExecError::JobUndefined {
                    job: job.name().to_string(),
                    tree: self.name(),
                });
            }
        }
        if parent.uuid() == child.uuid() {
            return Err(ExecError::Dependency(format!(
                "child cannot be its own parent ({})",
                parent.name()
            )));
        }
        let mut deps = self.deps.lock().unwrap();
        if deps
            .iter()
            .any(|dep| dep.parent().uuid() == parent.uuid() && dep.child().uuid() == child.uuid())
        {
            tracing::warn!(
                parent = %parent.name(),
                child = %child.name(),
                "duplicate dependency dropped"
            );
            return Ok(None);
        }
        let dep = Arc::new(match colors {
            Some((dcolor, ucolor)) => ExecDependency::with_colors(
                Arc::clone(parent),
                Arc::clone(child),
                state,
                dcolor,
                ucolor,
            ),
            None => ExecDependency::new(Arc::clone(parent), Arc::clone(child), state),
        });
        deps.push(Arc::clone(&dep));
        Ok(Some(dep))
    }

    pub(crate) fn deps_of_child(&self, child: Uuid) -> Vec<Arc<ExecDependency>> {
        self.deps
            .lock()
            .unwrap()
            .iter()
            .filter(|dep| dep.child().uuid() == child)
            .cloned()
            .collect()
    }

    pub(crate) fn deps_of_parent(&self, parent: Uuid) -> Vec<Arc<ExecDependency>> {
        self.deps
            .lock()
            .unwrap()
            .iter()
            .filter(|dep| dep.parent().uuid() == parent)
            .cloned()
            .collect()
    }

    /// Defined jobs with no defined ancestor; a runnable tree has exactly
    /// one.
    pub fn stems(&self) -> Vec<Arc<ExecJob>> {
        self.jobs()
            .into_iter()
            .filter(|job| job.is_defined() && !job.has_defined_ancestors())
            .collect()
    }

    /// Jobs with at least one outgoing dependency; the renderer attaches
    /// subtree-boundary edges here.
    pub fn leaves(&self) -> Vec<Arc<ExecJob>> {
        self.jobs()
            .into_iter()
            .filter(|job| !self.deps_of_parent(job.uuid()).is_empty())
            .collect()
    }

    /// Checks the structural invariants; returns human-readable errors.
    ///
    /// An empty list means the tree is runnable: exactly one stem, no
    /// cycles, every defined job reachable from the stem, and every body
    /// present and executable. Dangling resource references are logged and
    /// ignored, not errors.
    pub fn validate(&self) -> Vec<String> {
        self.validate_scoped(&mut Vec::new())
    }

    fn validate_scoped(&self, ancestor_resources: &mut Vec<Vec<Arc<ExecResource>>>) -> Vec<String> {
        let mut errors = Vec::new();
        let stems = self.stems();
        match stems.len() {
            0 => errors.push(format!("Tree {} is empty, has 0 stems.", self.name())),
            1 => {}
            _ => errors.push(format!(
                "Tree {} has multiple stems ({}).",
                self.name(),
                stems
                    .iter()
                    .map(|stem| stem.name().to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            )),
        }

        for stem in &stems {
            let mut visited = HashSet::new();
            if !self.no_cycles(stem, &mut visited, &mut Vec::new()) {
                errors.push(format!("Tree {} has cycles.", self.name()));
            }
            let unconnected: Vec<String> = self
                .jobs()
                .iter()
                .filter(|job| job.is_defined() && !visited.contains(&job.uuid()))
                .map(|job| job.name().to_string())
                .collect();
            if !unconnected.is_empty() {
                errors.push(format!(
                    "The jobs {:?} are not connected to {}.",
                    unconnected,
                    stem.name()
                ));
            }
        }

        ancestor_resources.push(self.resources());
        for job in self.jobs() {
            errors.extend(job.validate_body());
            if let JobBody::Subtree(subtree) = job.body() {
                errors.extend(subtree.validate_scoped(ancestor_resources));
            }
            for resource in job.resources() {
                let known = ancestor_resources
                    .iter()
                    .flatten()
                    .any(|known| known.uuid() == resource.uuid());
                if !known {
                    tracing::warn!(
                        job = %job.name(),
                        resource = %resource.name(),
                        "resource is not defined in the job's tree or any ancestor; ignoring"
                    );
                }
            }
        }
        ancestor_resources.pop();
        errors
    }

    fn no_cycles(
        &self,
        job: &Arc<ExecJob>,
        visited: &mut HashSet<Uuid>,
        path: &mut Vec<Uuid>,
    ) -> bool {
        if path.contains(&job.uuid()) {
            return false;
        }
        if !visited.insert(job.uuid()) {
            return true;
        }
        path.push(job.uuid());
        for child in job.children() {
            if !self.no_cycles(&child, visited, path) {
                return false;
            }
        }
        path.pop();
        true
    }

    /// True when every mandatory job is done (and, with waitsuccess, none of
    /// them is failed).
    pub fn is_done(&self) -> bool {
        let jobs = self.jobs();
        if self.waitsuccess.load(Ordering::SeqCst)
            && jobs.iter().any(|job| job.mustcomplete() && job.is_failed())
        {
            return false;
        }
        jobs.iter()
            .filter(|job| job.mustcomplete())
            .all(|job| job.is_done())
    }

    /// True when every job is in a success-like state.
    pub fn is_success(&self) -> bool {
        self.jobs().iter().all(|job| job.is_success())
    }

    /// True once the tree has been cancelled by an operator or a timeout.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-evaluates tree completion; called on every job latch event.
    pub(crate) fn on_job_event(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        if !self.is_done() {
            return;
        }
        let newly_done = !self.done.send_replace(true);
        if newly_done {
            tracing::debug!(tree = %self.name(), "tree done; sweeping unfinished jobs");
            for job in self.jobs() {
                job.cancel();
            }
        }
    }

    /// Cancels the tree: marks it cancelled, cancels every job not yet
    /// running, and propagates into subtrees. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(tree = %self.name(), "cancelling tree");
        for job in self.jobs() {
            job.cancel();
        }
        for subtree in self.subtrees() {
            subtree.cancel();
        }
    }

    /// Starts every job and, when `blocking`, waits for completion.
    ///
    /// The optional wall-clock `timeout` bounds a blocking run; on expiry
    /// the tree is cancelled and `run` returns normally.
    pub async fn run(&self, blocking: bool, timeout: Option<Duration>) {
        tracing::debug!(tree = %self.name(), "starting jobs");
        self.started.store(true, Ordering::SeqCst);
        for job in self.jobs() {
            job.start();
        }
        self.on_job_event();
        if !blocking {
            return;
        }
        let stabilize = self.config().stabilize_delay;
        let wait = async {
            tokio::time::sleep(stabilize).await;
            self.join().await;
        };
        match timeout {
            None => wait.await,
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    tracing::warn!(
                        tree = %self.name(),
                        limit = ?limit,
                        "execution exceeded time limit"
                    );
                    self.cancel();
                }
            }
        }
    }

    /// Waits until the tree reports done.
    pub async fn join(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Clears the done latch, advances the iterator, and resets every
    /// non-UNDEF job so the next iteration starts clean.
    pub fn advance(&self) {
        tracing::debug!(tree = %self.name(), "advancing");
        self.done.send_replace(false);
        let more = {
            let mut iterator = self.iterator.lock().unwrap();
            match iterator.as_mut() {
                Some(iterator) => iterator.increment(),
                None => true,
            }
        };
        if more {
            for job in self.jobs() {
                if job.state() != JobState::Undef {
                    job.reset();
                }
            }
        }
    }

    /// Runs the tree once per iterator argument, or once when no iterator is
    /// attached.
    ///
    /// Returns the aggregate outcome fed back into the hosting job. A
    /// cancelled tree always reports failure; otherwise the result follows
    /// the configured [`IterationPolicy`]. An exhausted (empty) iterator
    /// runs zero times and reports success.
    pub async fn iterrun(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let has_iterator = self.iterator.lock().unwrap().is_some();
        if !has_iterator {
            self.run(true, None).await;
            return self.iteration_outcome();
        }
        if self.iterator_exhausted() {
            tracing::debug!(tree = %self.name(), "iterator exhausted");
            return true;
        }
        loop {
            self.run(true, None).await;
            if self.is_cancelled() {
                return false;
            }
            if self.config().iteration_policy == IterationPolicy::FailFast && !self.is_success() {
                return false;
            }
            self.advance();
            if self.iterator_exhausted() {
                break;
            }
        }
        true
    }

    fn iteration_outcome(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.config().iteration_policy {
            IterationPolicy::ContinueOnFailure => true,
            IterationPolicy::FailFast => self.is_success(),
        }
    }

    /// Appends `args` to every job's argument list, recursively including
    /// subtrees.
    pub fn extend_args(&self, args: &[String]) {
        for job in self.jobs() {
            job.extend_arguments(args);
        }
        for subtree in self.subtrees() {
            subtree.extend_args(args);
        }
    }

    /// Serializes the tree to its versioned XML document.
    pub fn to_xml_string(&self) -> Result<String, ExecError> {
        crate::xml::emit(self)
    }

    /// Parses a tree from its XML document (version "1.0" only).
    pub fn from_xml_str(input: &str) -> Result<Arc<Self>, ExecError> {
        crate::xml::parse(input)
    }

    /// Renders the tree as a Graphviz DOT digraph.
    ///
    /// With `arborescent`, edges whose parent is already a grand-ancestor of
    /// the child are elided to reduce transitive clutter.
    pub fn dot_graph(&self, arborescent: bool) -> String {
        crate::render::dot_graph(self, arborescent)
    }

    /// Per-job status snapshot keyed by job name, subtree jobs included.
    pub fn status(&self) -> BTreeMap<String, JobStatus> {
        crate::status::status_map(self)
    }

    /// The status snapshot as a JSON document.
    pub fn json_status(&self) -> serde_json::Result<String> {
        crate::status::status_json(self)
    }
}

impl fmt::Debug for ExecTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ExecTree {}>", self.name())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::job::UNDEF_JOB;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("exectree=debug")),
            )
            .with_test_writer()
            .try_init();
    }

    fn fast_config() -> TreeConfig {
        TreeConfig {
            stabilize_delay: Duration::from_millis(10),
            ..TreeConfig::default()
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(format!("{name}.sh"));
        let content = format!(
            "#!/bin/sh\necho \"MYARGS_WERE: $2\"\necho \"hello my name is {name}\"\n{body}\n"
        );
        std::fs::write(&path, content).unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    fn new_job(dir: &TempDir, tree: &Arc<ExecTree>, name: &str, body: &str) -> Arc<ExecJob> {
        let path = script(dir, name, body);
        let job = ExecJob::new(name, path);
        job.push_argument(name);
        tree.add_job(&job).unwrap();
        job
    }

    struct Fixture {
        dir: TempDir,
        tree: Arc<ExecTree>,
        foo: Arc<ExecJob>,
        bar: Arc<ExecJob>,
        baz: Arc<ExecJob>,
    }

    fn fixture() -> Fixture {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let tree = ExecTree::new("base");
        tree.set_config(fast_config());
        let foo = new_job(&dir, &tree, "foo", "");
        let bar = new_job(&dir, &tree, "bar", "");
        let baz = new_job(&dir, &tree, "baz", "");
        tree.add_dep(&foo, &bar).unwrap();
        tree.add_dep(&foo, &baz).unwrap();
        Fixture {
            dir,
            tree,
            foo,
            bar,
            baz,
        }
    }

    struct IteratedFixture {
        base: Fixture,
        ltree: Arc<ExecTree>,
        sal: Arc<ExecJob>,
        sov: Arc<ExecJob>,
        sym: Arc<ExecJob>,
        soi: Arc<ExecJob>,
        arguments: Vec<String>,
    }

    fn iterated_fixture(sal_body: &str) -> IteratedFixture {
        let base = fixture();
        let ltree = ExecTree::new("local tree");
        ltree.set_config(fast_config());
        let sal = new_job(&base.dir, &ltree, "sal", sal_body);
        sal.set_logfile(base.dir.path().join("sal.log"));
        let sov = new_job(&base.dir, &ltree, "sov", "");
        ltree.add_dep(&sal, &sov).unwrap();

        let arguments: Vec<String> = ["qwe", "asd", "zxc"].map(String::from).to_vec();
        ltree.set_iterator(ExecIter::new("test", arguments.clone()));

        let sym = ExecJob::with_subtree("sym", Arc::clone(&ltree));
        base.tree.add_job(&sym).unwrap();
        base.tree.add_dep(&base.baz, &sym).unwrap();

        let soi = new_job(&base.dir, &base.tree, "soi", "");
        base.tree.add_dep(&sym, &soi).unwrap();

        IteratedFixture {
            base,
            ltree,
            sal,
            sov,
            sym,
            soi,
            arguments,
        }
    }

    #[test]
    fn validates_a_clean_tree() {
        let f = fixture();
        assert_eq!(f.tree.validate(), Vec::<String>::new());
    }

    #[test]
    fn detects_multiple_stems() {
        let f = fixture();
        let fiz = new_job(&f.dir, &f.tree, "fiz", "");
        let buz = new_job(&f.dir, &f.tree, "buz", "");
        let fez = new_job(&f.dir, &f.tree, "fez", "");
        f.tree.add_dep(&fiz, &buz).unwrap();

        let stems = f.tree.stems();
        assert_eq!(stems.len(), 3);
        assert!(stems.iter().any(|stem| stem.uuid() == fiz.uuid()));
        assert!(stems.iter().any(|stem| stem.uuid() == fez.uuid()));
        assert!(!stems.iter().any(|stem| stem.uuid() == buz.uuid()));
        assert!(!f.tree.validate().is_empty());
    }

    #[test]
    fn rejects_self_dependency() {
        let f = fixture();
        assert!(matches!(
            f.tree.add_dep(&f.foo, &f.foo),
            Err(ExecError::Dependency(_))
        ));
    }

    #[test]
    fn detects_cycles() {
        let f = fixture();
        f.tree.add_dep(&f.bar, &f.baz).unwrap();
        f.tree.add_dep(&f.baz, &f.bar).unwrap();
        let errors = f.tree.validate();
        assert!(
            errors.iter().any(|error| error.contains("cycles")),
            "{errors:?}"
        );
    }

    #[test]
    fn detects_unconnected_jobs() {
        let f = fixture();
        assert!(f.tree.validate().is_empty());
        let fiz = new_job(&f.dir, &f.tree, "fiz", "");
        let buz = new_job(&f.dir, &f.tree, "buz", "");
        f.tree.add_dep(&fiz, &buz).unwrap();
        f.tree.add_dep(&buz, &fiz).unwrap();
        assert!(!f.tree.validate().is_empty());
    }

    #[test]
    fn drops_duplicate_dependencies() {
        let f = fixture();
        let before = f.tree.deps().len();
        assert!(f.tree.add_dep(&f.foo, &f.bar).unwrap().is_none());
        assert_eq!(f.tree.deps().len(), before);
    }

    #[test]
    fn rejects_cross_tree_dependencies() {
        let f = fixture();
        let other = ExecTree::new("other");
        let lop = new_job(&f.dir, &other, "lop", "");
        assert!(matches!(
            f.tree.add_dep(&f.baz, &lop),
            Err(ExecError::JobUndefined { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_job_names() {
        let f = fixture();
        let dup = ExecJob::new("foo", "/bin/true");
        assert!(matches!(
            f.tree.add_job(&dup),
            Err(ExecError::JobDefined(_))
        ));
    }

    #[test]
    fn rejects_reattaching_a_job() {
        let f = fixture();
        let second = ExecTree::new("second");
        assert!(matches!(
            second.add_job(&f.foo),
            Err(ExecError::TreeDefined)
        ));
    }

    #[test]
    fn validates_missing_job_file() {
        let f = fixture();
        let ghost = ExecJob::new("yut", f.dir.path().join("noexist_wh9oddaklj"));
        f.tree.add_job(&ghost).unwrap();
        f.tree.add_dep(&f.baz, &ghost).unwrap();
        assert!(
            f.tree
                .validate()
                .iter()
                .any(|error| error.contains("does not exist"))
        );
    }

    #[test]
    fn validates_unexecutable_job_file() {
        let f = fixture();
        let path = script(&f.dir, "fet", "");
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o644);
        std::fs::set_permissions(&path, permissions).unwrap();
        let fet = ExecJob::new("fet", path);
        f.tree.add_job(&fet).unwrap();
        f.tree.add_dep(&f.baz, &fet).unwrap();
        assert!(
            f.tree
                .validate()
                .iter()
                .any(|error| error.contains("not executable"))
        );
    }

    #[tokio::test]
    async fn runs_a_tree_to_completion() {
        let f = fixture();
        f.tree.run(true, Some(Duration::from_secs(10))).await;
        assert!(f.tree.is_done());
        assert!(f.tree.is_success());
        for job in f.tree.jobs() {
            assert_eq!(job.execcount(), 1, "{job:?}");
        }
    }

    #[tokio::test]
    async fn linear_chain_orders_executions() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let tree = ExecTree::new("chain");
        tree.set_config(fast_config());
        let a = new_job(&dir, &tree, "a", "");
        let b = new_job(&dir, &tree, "b", "");
        let c = new_job(&dir, &tree, "c", "");
        tree.add_dep(&a, &b).unwrap();
        tree.add_dep(&b, &c).unwrap();
        let log = dir.path().join("chain.log");
        for job in [&a, &b, &c] {
            job.set_logfile(&log);
        }

        tree.run(false, None).await;
        tokio::time::timeout(Duration::from_secs(5), b.wait_state(JobState::Running))
            .await
            .unwrap();
        assert!(a.is_success());
        tokio::time::timeout(Duration::from_secs(5), c.wait_state(JobState::Running))
            .await
            .unwrap();
        assert!(b.is_success());
        tokio::time::timeout(Duration::from_secs(5), tree.join())
            .await
            .unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        let at = content.find("hello my name is a").unwrap();
        let bt = content.find("hello my name is b").unwrap();
        let ct = content.find("hello my name is c").unwrap();
        assert!(at < bt && bt < ct, "{content}");
    }

    #[tokio::test]
    async fn failed_optional_job_triggers_failure_branch() {
        let f = fixture();
        let war = new_job(&f.dir, &f.tree, "war", "exit 1");
        war.set_mustcomplete(false);
        let wex = new_job(&f.dir, &f.tree, "wex", "");
        wex.set_mustcomplete(false);
        let wop = new_job(&f.dir, &f.tree, "wop", "");
        f.tree.add_dep(&f.foo, &war).unwrap();
        f.tree.add_dep(&war, &wex).unwrap();
        f.tree
            .add_dep_with_state(&war, &wop, JobState::Failed)
            .unwrap();

        f.tree.run(true, Some(Duration::from_secs(10))).await;

        assert!(war.is_done());
        assert!(!war.is_success());
        assert_eq!(war.failcount(), 1);
        assert!(wex.is_cancelled());
        assert!(wop.is_success());
        assert!(f.tree.is_done());
        assert!(!f.tree.is_success());
    }

    #[tokio::test]
    async fn undefined_job_participates_in_dependencies() {
        let f = fixture();
        let jum = ExecJob::new("jum", UNDEF_JOB);
        f.tree.add_job(&jum).unwrap();
        f.tree.add_dep(&f.baz, &jum).unwrap();
        let iom = new_job(&f.dir, &f.tree, "iom", "");
        f.tree.add_dep(&jum, &iom).unwrap();

        assert_eq!(f.tree.validate(), Vec::<String>::new());
        f.tree.run(true, Some(Duration::from_secs(10))).await;

        assert_eq!(jum.state(), JobState::Undef);
        assert!(*jum.event(JobState::Success).borrow());
        assert!(iom.is_success());
        assert!(f.tree.is_done());
    }

    #[tokio::test]
    async fn undefined_job_waits_for_its_parent() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let tree = ExecTree::new("undef-order");
        tree.set_config(fast_config());
        let slow = new_job(&dir, &tree, "slow", "sleep 0.3");
        let noop = ExecJob::new("noop", UNDEF_JOB);
        tree.add_job(&noop).unwrap();
        tree.add_dep(&slow, &noop).unwrap();

        tree.run(false, None).await;
        tokio::time::timeout(Duration::from_secs(5), slow.wait_state(JobState::Running))
            .await
            .unwrap();
        assert!(
            !*noop.event(JobState::Success).borrow(),
            "undefined job short-circuited before its parent finished"
        );
        tokio::time::timeout(Duration::from_secs(5), noop.wait_state(JobState::Success))
            .await
            .unwrap();
        assert!(slow.is_success());
        tokio::time::timeout(Duration::from_secs(5), tree.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn runs_a_plain_subtree() {
        let f = fixture();
        let ltree = ExecTree::new("local tree");
        ltree.set_config(fast_config());
        let yup = new_job(&f.dir, &ltree, "yup", "");
        let yak = new_job(&f.dir, &ltree, "yak", "");
        ltree.add_dep(&yup, &yak).unwrap();

        let rez = ExecJob::with_subtree("rez", Arc::clone(&ltree));
        f.tree.add_job(&rez).unwrap();
        f.tree.add_dep(&f.baz, &rez).unwrap();

        assert_eq!(f.tree.validate(), Vec::<String>::new());
        f.tree.run(true, Some(Duration::from_secs(10))).await;

        assert!(ltree.is_done());
        assert!(f.tree.is_done());
        assert!(rez.is_success());
        assert!(yup.is_success() && yak.is_success());
    }

    #[tokio::test]
    async fn iterated_subtree_runs_once_per_argument() {
        let f = iterated_fixture("");
        f.base.tree.run(true, Some(Duration::from_secs(30))).await;

        assert_eq!(f.sal.execcount(), 3);
        assert_eq!(f.sov.execcount(), 3);
        assert!(f.ltree.is_done());
        assert!(f.base.tree.is_done());
        assert!(f.sym.is_success());
        assert!(f.soi.is_success());

        let content = std::fs::read_to_string(f.sal.logfile().unwrap()).unwrap();
        let mut last = 0;
        for argument in &f.arguments {
            let marker = format!("MYARGS_WERE: {argument}");
            let found = content[last..].find(&marker);
            assert!(found.is_some(), "missing {marker} in order: {content}");
            last += found.unwrap();
        }
    }

    #[tokio::test]
    async fn cancelling_mid_iteration_fails_the_host() {
        let f = iterated_fixture("sleep 0.3");
        let canceller = Arc::clone(&f.base.tree);
        let sal = Arc::clone(&f.sal);
        tokio::spawn(async move {
            sal.wait_state(JobState::Running).await;
            canceller.cancel();
        });

        f.base.tree.run(true, Some(Duration::from_secs(30))).await;

        assert!(f.sal.is_success());
        assert!(f.sov.is_cancelled());
        assert!(f.sym.is_failed());
        assert!(f.soi.is_cancelled());
        assert!(f.base.baz.is_success());
        assert!(f.ltree.is_cancelled());
        assert!(f.base.tree.is_done());
    }

    #[tokio::test]
    async fn undefined_job_is_not_reactivated_across_iterations() {
        let f = iterated_fixture("");
        let sot = ExecJob::new("sot", UNDEF_JOB);
        f.ltree.add_job(&sot).unwrap();
        f.ltree.add_dep(&f.sov, &sot).unwrap();

        f.base.tree.run(true, Some(Duration::from_secs(30))).await;

        assert_eq!(sot.state(), JobState::Undef);
        assert!(f.base.tree.is_done());
        assert_eq!(f.sal.execcount(), 3);
    }

    #[tokio::test]
    async fn empty_iterator_runs_zero_times_and_succeeds() {
        let f = fixture();
        let ltree = ExecTree::new("local tree");
        ltree.set_config(fast_config());
        let sal = new_job(&f.dir, &ltree, "sal", "");
        ltree.set_iterator(ExecIter::new("empty", Vec::new()));

        let sym = ExecJob::with_subtree("sym", Arc::clone(&ltree));
        f.tree.add_job(&sym).unwrap();
        f.tree.add_dep(&f.baz, &sym).unwrap();

        f.tree.run(true, Some(Duration::from_secs(10))).await;

        assert!(sym.is_success());
        assert_eq!(sal.execcount(), 0);
        assert_eq!(sal.state(), JobState::Idle);
        assert!(f.tree.is_done());
    }

    #[tokio::test]
    async fn resource_serializes_contending_jobs() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let tree = ExecTree::new("resources");
        tree.set_config(fast_config());
        let resource = ExecResource::new(&tree, "r3", 1);
        let shared = dir.path().join("intervals.log");

        let stem = new_job(&dir, &tree, "stem", "");
        let mut contenders = Vec::new();
        for index in 0..5 {
            let name = format!("pol{index}");
            let body = format!(
                "echo \"S {name}\" >> {shared}\nsleep 0.1\necho \"E {name}\" >> {shared}",
                shared = shared.display()
            );
            let job = new_job(&dir, &tree, &name, &body);
            job.add_resource(Arc::clone(&resource));
            tree.add_dep(&stem, &job).unwrap();
            contenders.push(job);
        }

        assert_eq!(tree.validate(), Vec::<String>::new());
        tree.run(true, Some(Duration::from_secs(30))).await;
        assert!(tree.is_done());
        assert!(tree.is_success());
        assert_eq!(resource.used(), 0);

        // Holding r3 (avail 1) makes the critical sections strictly
        // alternate: S, E, S, E, ...
        let content = std::fs::read_to_string(&shared).unwrap();
        let markers: Vec<&str> = content
            .lines()
            .map(|line| line.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(markers.len(), 10, "{content}");
        for (index, marker) in markers.iter().enumerate() {
            let expected = if index % 2 == 0 { "S" } else { "E" };
            assert_eq!(*marker, expected, "overlapping critical sections: {content}");
        }
    }

    #[tokio::test]
    async fn rescheduling_a_failed_job_reruns_it() {
        let f = fixture();
        let marker = f.dir.path().join("fail-marker");
        std::fs::write(&marker, "").unwrap();
        let body = format!("if [ -e {} ]; then exit 1; fi", marker.display());
        let qor = new_job(&f.dir, &f.tree, "qor", &body);
        let qam = new_job(&f.dir, &f.tree, "qam", "");
        f.tree.add_dep(&f.baz, &qor).unwrap();
        f.tree.add_dep(&qor, &qam).unwrap();

        f.tree.run(false, None).await;
        tokio::time::timeout(Duration::from_secs(10), qor.wait_state(JobState::Failed))
            .await
            .unwrap();
        std::fs::remove_file(&marker).unwrap();
        assert!(qor.reset());
        assert!(qor.start());
        tokio::time::timeout(Duration::from_secs(10), f.tree.join())
            .await
            .unwrap();

        assert_eq!(qor.execcount(), 2);
        assert_eq!(qor.failcount(), 1);
        assert!(qor.is_success());
        assert!(qam.is_success());
        assert!(f.tree.is_done());
    }

    #[tokio::test]
    async fn failed_mandatory_job_does_not_block_without_waitsuccess() {
        let f = fixture();
        let qor = new_job(&f.dir, &f.tree, "qor", "exit 1");
        f.tree.add_dep(&f.baz, &qor).unwrap();
        f.tree.add_dep(&f.bar, &qor).unwrap();

        let started = std::time::Instant::now();
        f.tree.run(true, Some(Duration::from_secs(15))).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(f.tree.is_done());
        assert!(!f.tree.is_success());
    }

    #[tokio::test]
    async fn waitsuccess_keeps_the_tree_open_on_failure() {
        let f = fixture();
        f.tree.set_waitsuccess(true);
        let qor = new_job(&f.dir, &f.tree, "qor", "exit 1");
        f.tree.add_dep(&f.baz, &qor).unwrap();

        let started = std::time::Instant::now();
        f.tree.run(true, Some(Duration::from_secs(1))).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(!f.tree.is_done());
        assert!(!f.tree.is_success());
        assert!(f.tree.is_cancelled());
    }

    #[tokio::test]
    async fn manual_override_releases_waiting_children() {
        let f = fixture();
        f.tree.set_waitsuccess(true);
        let mid = new_job(&f.dir, &f.tree, "mid", "exit 1");
        let tail = new_job(&f.dir, &f.tree, "tail", "");
        f.tree.add_dep(&f.baz, &mid).unwrap();
        f.tree.add_dep(&mid, &tail).unwrap();

        f.tree.run(false, None).await;
        tokio::time::timeout(Duration::from_secs(10), mid.wait_state(JobState::Failed))
            .await
            .unwrap();
        assert!(mid.manual_override());
        tokio::time::timeout(Duration::from_secs(10), f.tree.join())
            .await
            .unwrap();

        assert!(mid.is_success());
        assert!(mid.is_overridden());
        assert!(tail.is_success());
        assert!(f.tree.is_done());
    }

    #[tokio::test]
    async fn run_timeout_cancels_waiting_jobs() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let tree = ExecTree::new("slowpoke");
        tree.set_config(fast_config());
        let slow = new_job(&dir, &tree, "slow", "sleep 1");
        let waiting = new_job(&dir, &tree, "waiting", "");
        tree.add_dep(&slow, &waiting).unwrap();

        tree.run(true, Some(Duration::from_millis(200))).await;

        assert!(tree.is_cancelled());
        assert!(!tree.is_done());
        assert_eq!(slow.state(), JobState::Running);
        assert!(waiting.is_cancelled());
    }

    #[tokio::test]
    async fn extend_args_reaches_subtree_jobs() {
        let f = iterated_fixture("");
        f.base.tree.extend_args(&["extra".to_string()]);
        assert!(f.base.foo.arguments().ends_with(&["extra".to_string()]));
        assert!(f.sal.arguments().ends_with(&["extra".to_string()]));
    }

    #[test]
    fn rjobs_includes_subtree_jobs() {
        let f = iterated_fixture("");
        let names: Vec<String> = f
            .base
            .tree
            .rjobs()
            .iter()
            .map(|job| job.name().to_string())
            .collect();
        assert!(names.contains(&"sal".to_string()));
        assert!(names.contains(&"sym".to_string()));
        assert!(names.contains(&"foo".to_string()));
    }
}
