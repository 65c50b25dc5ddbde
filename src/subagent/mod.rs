//! Subagent supervisor — spawns isolated child agents, propagates
//! cancellation, optionally detaches runs to the background task registry,
//! and keeps recursion impossible by stripping the `Task` tool from every
//! child's allow-list.
//!
//! Each instance owns an isolated [`Ledger`]; its change events are
//! forwarded upward tagged with the subagent id, so the parent UI observes
//! children without any back-references (the supervisor routes by id).

pub mod config;

pub use config::{load_configs, ModelChoice, SubagentConfig, AGENTS_DIR};

use crate::cancel::AbortScope;
use crate::drive::{DriveConfig, DriveError, LoopDriver, ToolRegistry};
use crate::ledger::{Ledger, LedgerEvent};
use crate::tasks::{BackgroundTasks, StopFn};
use crate::types::{Message, MessageSource, SubagentStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Tool-result text when the child finished without emitting any text.
pub const NO_TEXT_RESPONSE: &str = "Task completed with no text response";

#[derive(Debug, thiserror::Error)]
pub enum SubagentError {
    #[error("unknown subagent: {0}")]
    UnknownAgent(String),
    #[error("unknown subagent instance: {0}")]
    UnknownInstance(String),
    #[error("invalid subagent definition {}: {detail}", path.display())]
    InvalidDefinition { path: PathBuf, detail: String },
    #[error("subagent produced no response")]
    NoResponse,
    #[error("subagent aborted")]
    Aborted,
    #[error("subagent loop failed: {0}")]
    Loop(String),
}

/// A child-ledger event routed upward with its owner's id.
#[derive(Debug, Clone)]
pub struct SubagentEvent {
    pub subagent_id: String,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone)]
pub enum SubagentOutcome {
    /// Foreground run finished; `result` is the final text.
    Completed { result: String },
    /// Run was detached; inspect it through the task registry.
    Detached { task_id: String },
}

struct Instance {
    config: SubagentConfig,
    /// Definition name this instance was created from. Fixed at creation;
    /// stays meaningful even if the definition on disk changes afterwards.
    subagent_type: String,
    ledger: Arc<Mutex<Ledger>>,
    status: SubagentStatus,
    /// Instance-owned token driving the AI loop. Abort paths cancel this,
    /// never the parent's token.
    cancel: CancellationToken,
    background_task_id: Option<String>,
}

type Instances = Arc<Mutex<HashMap<String, Instance>>>;

pub struct SubagentManager {
    workdir: PathBuf,
    agent_model: String,
    fast_model: String,
    driver: Arc<dyn LoopDriver>,
    tools: Arc<ToolRegistry>,
    tasks: BackgroundTasks,
    configs: Mutex<Option<Vec<SubagentConfig>>>,
    instances: Instances,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SubagentEvent>>>>,
}

impl SubagentManager {
    pub fn new(
        workdir: impl Into<PathBuf>,
        driver: Arc<dyn LoopDriver>,
        tools: Arc<ToolRegistry>,
        tasks: BackgroundTasks,
        agent_model: impl Into<String>,
        fast_model: impl Into<String>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            agent_model: agent_model.into(),
            fast_model: fast_model.into(),
            driver,
            tools,
            tasks,
            configs: Mutex::new(None),
            instances: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to forwarded child-ledger events across all instances.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SubagentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    // -- Configurations --

    /// Definitions under `<workdir>/.wave/agents`, loaded on first use and
    /// cached.
    pub fn configurations(&self) -> Result<Vec<SubagentConfig>, SubagentError> {
        let mut cache = self.configs.lock().unwrap();
        if cache.is_none() {
            *cache = Some(config::load_configs(&self.workdir)?);
        }
        Ok(cache.as_ref().unwrap().clone())
    }

    /// Drop the cache so the next access re-reads from disk.
    pub fn reload_configurations(&self) {
        *self.configs.lock().unwrap() = None;
    }

    // -- Instance lifecycle --

    /// Create an instance of a named definition.
    pub fn create_instance(&self, name: &str) -> Result<String, SubagentError> {
        let config = self
            .configurations()?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SubagentError::UnknownAgent(name.to_string()))?;
        Ok(self.create_instance_with(config))
    }

    /// Create an instance from an explicit configuration. Allocates a UUID,
    /// builds the isolated ledger, and starts the event forwarder.
    pub fn create_instance_with(&self, config: SubagentConfig) -> String {
        let id = Uuid::new_v4().to_string();
        let mut ledger = Ledger::new(&self.workdir);
        let mut events = ledger.subscribe();

        let subscribers = Arc::clone(&self.subscribers);
        let subagent_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let event = SubagentEvent {
                    subagent_id: subagent_id.clone(),
                    event,
                };
                subscribers
                    .lock()
                    .unwrap()
                    .retain(|tx| tx.send(event.clone()).is_ok());
            }
        });

        debug!(subagent = %id, subagent_type = %config.name, "subagent instance created");
        self.instances.lock().unwrap().insert(
            id.clone(),
            Instance {
                subagent_type: config.name.clone(),
                config,
                ledger: Arc::new(Mutex::new(ledger)),
                status: SubagentStatus::Initializing,
                cancel: CancellationToken::new(),
                background_task_id: None,
            },
        );
        id
    }

    pub fn status(&self, instance_id: &str) -> Option<SubagentStatus> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|i| i.status)
    }

    /// Definition name the instance was created from.
    pub fn subagent_type(&self, instance_id: &str) -> Option<String> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|i| i.subagent_type.clone())
    }

    /// Snapshot of the instance's isolated transcript.
    pub fn instance_messages(&self, instance_id: &str) -> Option<Vec<Message>> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|i| i.ledger.lock().unwrap().messages().to_vec())
    }

    pub fn background_task_id(&self, instance_id: &str) -> Option<String> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .and_then(|i| i.background_task_id.clone())
    }

    /// Remove instances that reached a terminal state.
    pub fn cleanup_finished(&self) {
        self.instances
            .lock()
            .unwrap()
            .retain(|_, i| !i.status.is_terminal());
    }

    // -- Execution --

    /// Run the instance's loop on `prompt`.
    ///
    /// Foreground runs hold a single consolidated listener on
    /// `parent_cancel`, detached in every exit path; aborting marks the
    /// instance and cancels its loop. With `run_in_background` the run is
    /// registered as a background task, deliberately decoupled from the
    /// parent token, and the task id is returned immediately.
    pub async fn execute_task(
        &self,
        instance_id: &str,
        prompt: &str,
        run_in_background: bool,
        parent_cancel: &CancellationToken,
    ) -> Result<SubagentOutcome, SubagentError> {
        let (ledger, cancel, config) = self.activate(instance_id)?;
        let drive_config = DriveConfig {
            system_prompt: config.system_prompt.clone(),
            model: config.model.resolve(&self.agent_model, &self.fast_model),
            tools: self.tools.subagent_tools(config.tools.as_deref()),
        };
        ledger
            .lock()
            .unwrap()
            .add_user_message(prompt, None, MessageSource::User);

        if run_in_background {
            let task_id = self.spawn_detached(instance_id, ledger, cancel, drive_config, &config.name);
            return Ok(SubagentOutcome::Detached { task_id });
        }

        let scope = AbortScope::new(parent_cancel);
        {
            let instances = Arc::clone(&self.instances);
            let id = instance_id.to_string();
            let cancel = cancel.clone();
            scope.on_abort(move || {
                {
                    let mut map = instances.lock().unwrap();
                    let Some(instance) = map.get_mut(&id) else { return };
                    // An instance detached mid-flight is no longer linked to
                    // the parent token.
                    if instance.background_task_id.is_some() {
                        return;
                    }
                    if !instance.status.is_terminal() {
                        instance.status = SubagentStatus::Aborted;
                    }
                }
                cancel.cancel();
            });
        }

        let result = self
            .driver
            .run(Arc::clone(&ledger), drive_config, cancel.clone())
            .await;
        scope.detach();

        conclude(&self.instances, &self.tasks, instance_id, &ledger, result)
            .map(|result| SubagentOutcome::Completed { result })
    }

    /// Detach an already-running instance to the background. The in-flight
    /// execution continues and writes its outcome into the task record.
    pub fn background_instance(&self, instance_id: &str) -> Result<String, SubagentError> {
        let mut map = self.instances.lock().unwrap();
        let instance = map
            .get_mut(instance_id)
            .ok_or_else(|| SubagentError::UnknownInstance(instance_id.to_string()))?;
        if let Some(existing) = &instance.background_task_id {
            return Ok(existing.clone());
        }
        let task_id = self.tasks.start_subagent(
            format!("subagent {}", instance.subagent_type),
            stop_fn(&self.instances, instance_id, &instance.cancel),
        );
        instance.background_task_id = Some(task_id.clone());
        Ok(task_id)
    }

    fn spawn_detached(
        &self,
        instance_id: &str,
        ledger: Arc<Mutex<Ledger>>,
        cancel: CancellationToken,
        drive_config: DriveConfig,
        name: &str,
    ) -> String {
        let task_id = self
            .tasks
            .start_subagent(format!("subagent {name}"), stop_fn(&self.instances, instance_id, &cancel));
        if let Some(instance) = self.instances.lock().unwrap().get_mut(instance_id) {
            instance.background_task_id = Some(task_id.clone());
        }

        let driver = Arc::clone(&self.driver);
        let instances = Arc::clone(&self.instances);
        let tasks = self.tasks.clone();
        let id = instance_id.to_string();
        tokio::spawn(async move {
            let result = driver.run(Arc::clone(&ledger), drive_config, cancel).await;
            let _ = conclude(&instances, &tasks, &id, &ledger, result);
        });
        task_id
    }

    fn activate(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<Mutex<Ledger>>, CancellationToken, SubagentConfig), SubagentError> {
        let mut map = self.instances.lock().unwrap();
        let instance = map
            .get_mut(instance_id)
            .ok_or_else(|| SubagentError::UnknownInstance(instance_id.to_string()))?;
        if !instance.status.is_terminal() {
            instance.status = SubagentStatus::Active;
        }
        Ok((
            Arc::clone(&instance.ledger),
            instance.cancel.clone(),
            instance.config.clone(),
        ))
    }
}

/// Cooperative stop for a detached run: mark the instance aborted and cancel
/// its loop. Never touches the parent token.
fn stop_fn(instances: &Instances, instance_id: &str, cancel: &CancellationToken) -> StopFn {
    let instances = Arc::clone(instances);
    let id = instance_id.to_string();
    let cancel = cancel.clone();
    Arc::new(move || {
        set_status(&instances, &id, SubagentStatus::Aborted);
        cancel.cancel();
    })
}

fn set_status(instances: &Instances, instance_id: &str, status: SubagentStatus) {
    if let Some(instance) = instances.lock().unwrap().get_mut(instance_id) {
        if !instance.status.is_terminal() {
            instance.status = status;
        }
    }
}

/// Shared conclusion for foreground and detached runs: derive the final
/// status and result text, and mirror the outcome into the background task
/// record when one is linked.
fn conclude(
    instances: &Instances,
    tasks: &BackgroundTasks,
    instance_id: &str,
    ledger: &Arc<Mutex<Ledger>>,
    result: Result<(), DriveError>,
) -> Result<String, SubagentError> {
    let task_id = instances
        .lock()
        .unwrap()
        .get(instance_id)
        .and_then(|i| i.background_task_id.clone());
    let mut finish_task = |success: bool, stdout: &str, stderr: &str| {
        if let Some(task_id) = &task_id {
            tasks.finish_subagent(task_id, success, stdout, stderr);
        }
    };

    match result {
        Err(DriveError::Cancelled) => {
            set_status(instances, instance_id, SubagentStatus::Aborted);
            finish_task(false, "", "aborted\n");
            Err(SubagentError::Aborted)
        }
        Err(DriveError::Failed(message)) => {
            set_status(instances, instance_id, SubagentStatus::Error);
            finish_task(false, "", &format!("{message}\n"));
            Err(SubagentError::Loop(message))
        }
        Ok(()) => {
            // A cancel observed between the loop returning and this point
            // already moved the instance to `aborted`; terminal states win.
            if instances
                .lock()
                .unwrap()
                .get(instance_id)
                .is_some_and(|i| i.status == SubagentStatus::Aborted)
            {
                finish_task(false, "", "aborted\n");
                return Err(SubagentError::Aborted);
            }
            let last_assistant = {
                let ledger = ledger.lock().unwrap();
                ledger
                    .messages()
                    .iter()
                    .rfind(|m| m.is_assistant())
                    .cloned()
            };
            match last_assistant {
                None => {
                    set_status(instances, instance_id, SubagentStatus::Error);
                    finish_task(false, "", "no assistant message produced\n");
                    Err(SubagentError::NoResponse)
                }
                Some(message) => {
                    let text = message.text();
                    let result = if text.is_empty() {
                        NO_TEXT_RESPONSE.to_string()
                    } else {
                        text
                    };
                    set_status(instances, instance_id, SubagentStatus::Completed);
                    finish_task(true, &result, "");
                    Ok(result)
                }
            }
        }
    }
}
