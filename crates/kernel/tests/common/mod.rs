//! Shared fixture for the integration suites: a kernel on a temp
//! workspace, the standard scripted tool set (recording invocations), and
//! a scripted LLM behind the default agent.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orchard_domain::config::Config;
use orchard_domain::task::TaskStatus;
use orchard_kernel::testing::{Recorder, ScriptedLlm, ScriptedTool};
use orchard_kernel::{CreateTaskParams, DefaultAgent, Kernel, NoSkills};
use orchard_tools::Tool;

pub struct Fixture {
    pub kernel: Arc<Kernel>,
    pub llm: Arc<ScriptedLlm>,
    pub recorder: Arc<Recorder>,
    _dir: tempfile::TempDir,
}

/// Safe tools get a small delay so concurrency is observable.
pub fn standard_tools(recorder: &Arc<Recorder>) -> Vec<Arc<dyn Tool>> {
    use orchard_domain::tool::RiskLevel::{Risky, Safe};
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for name in ["readFile", "glob", "grep"] {
        tools.push(Arc::new(
            ScriptedTool::new(name, Safe)
                .delay(Duration::from_millis(25))
                .recording(recorder.clone()),
        ));
    }
    for name in ["runCommand", "editFile"] {
        tools.push(Arc::new(
            ScriptedTool::new(name, Risky).recording(recorder.clone()),
        ));
    }
    tools
}

/// Kernel + default agent `main`, started. The LLM starts with an empty
/// script; push turns before creating tasks.
pub fn fixture() -> Fixture {
    let f = fixture_unstarted(|_| {});
    f.kernel.start();
    f
}

pub fn fixture_with(configure: impl FnOnce(&mut Config)) -> Fixture {
    let f = fixture_unstarted(configure);
    f.kernel.start();
    f
}

/// Same wiring, but the runtime fan-out is not started yet — for tests
/// that preload state before "boot".
pub fn fixture_unstarted(configure: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.workspace.data_dir = dir.path().join("data");
    configure(&mut config);

    let kernel = Kernel::open(config).expect("open kernel");
    let recorder = Arc::new(Recorder::default());
    for tool in standard_tools(&recorder) {
        kernel.registry.register(tool).expect("register tool");
    }

    let llm = Arc::new(ScriptedLlm::new(vec![]));
    kernel
        .manager
        .register_agent(
            Arc::new(DefaultAgent::new("main")),
            llm.clone(),
            Arc::new(NoSkills),
        )
        .expect("register agent");

    Fixture {
        kernel,
        llm,
        recorder,
        _dir: dir,
    }
}

pub fn create_task(kernel: &Kernel, title: &str) -> String {
    create_task_for(kernel, title, "main", None)
}

pub fn create_task_for(
    kernel: &Kernel,
    title: &str,
    agent_id: &str,
    parent_task_id: Option<String>,
) -> String {
    kernel
        .service
        .create_task(CreateTaskParams {
            title: title.into(),
            intent: None,
            priority: Default::default(),
            agent_id: agent_id.into(),
            parent_task_id,
            author_actor_id: "test".into(),
        })
        .expect("create task")
}

/// Poll the projection until the task reaches the wanted status.
pub async fn wait_for_status(kernel: &Kernel, task_id: &str, status: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if kernel.projection.status(task_id) == Some(status) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "task {task_id} never reached {status:?}; currently {:?}",
                kernel.projection.status(task_id)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
