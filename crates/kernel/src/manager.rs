//! Runtime manager — registry of agents and their runtimes. One fan-out
//! loop subscribes to the event log, folds each event into the projection
//! (idempotently), and routes it to the runtime whose agent owns the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use orchard_domain::llm::LlmClient;
use orchard_domain::{Error, Result};

use crate::agent::{Agent, SkillCatalog};
use crate::runtime::{AgentRuntime, RuntimeDeps};

pub struct RuntimeManager {
    deps: Arc<RuntimeDeps>,
    runtimes: RwLock<HashMap<String, Arc<AgentRuntime>>>,
    running: AtomicBool,
    fan_out: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RuntimeManager {
    pub fn new(deps: Arc<RuntimeDeps>) -> Self {
        Self {
            deps,
            runtimes: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            fan_out: Mutex::new(None),
        }
    }

    /// Register an agent with the LLM and skill catalog its contexts will
    /// carry. Replacing a registered agent id is rejected.
    pub fn register_agent(
        &self,
        agent: Arc<dyn Agent>,
        llm: Arc<dyn LlmClient>,
        skills: Arc<dyn SkillCatalog>,
    ) -> Result<()> {
        let mut runtimes = self.runtimes.write();
        let id = agent.id().to_owned();
        if runtimes.contains_key(&id) {
            return Err(Error::Other(format!("agent '{id}' already registered")));
        }
        tracing::info!(agent_id = %id, name = %agent.display_name(), "registered agent");
        runtimes.insert(
            id,
            Arc::new(AgentRuntime::new(agent, llm, skills, self.deps.clone())),
        );
        Ok(())
    }

    /// Start the fan-out loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self.deps.events.subscribe();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Fold before routing so runtimes read projected state that
                // already contains this event.
                manager.deps.projection.apply(&event);

                let Some(task) = manager.deps.projection.get_task(&event.stream_id) else {
                    continue;
                };
                let runtime = manager.runtimes.read().get(&task.agent_id).cloned();
                match runtime {
                    Some(runtime) => runtime.on_event(&event),
                    None => {
                        tracing::warn!(
                            task_id = %event.stream_id,
                            agent_id = %task.agent_id,
                            "event for unregistered agent"
                        );
                    }
                }
            }
        });
        *self.fan_out.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.fan_out.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.runtimes.read().contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runtimes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route a task to its agent's runtime and start a loop for it (used by
    /// adapters that want to poke a task without appending an event).
    pub fn execute_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .deps
            .projection
            .get_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        let runtime = self
            .runtimes
            .read()
            .get(&task.agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {}", task.agent_id)))?;
        runtime.spawn_execute(task_id.to_owned());
        Ok(())
    }
}
