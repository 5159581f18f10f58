//! Background task registry for one session.
//!
//! Every task gets a child of the session token; cancelling is only observed
//! at the task's sleep boundary, so `cancel` waits for the task to finish its
//! current step.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pollers;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskName {
    ContainerState,
    PlayerNames,
    Registry,
    DacMonitor,
}

impl TaskName {
    pub const ALL: [TaskName; 4] = [
        TaskName::ContainerState,
        TaskName::PlayerNames,
        TaskName::Registry,
        TaskName::DacMonitor,
    ];
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskName::ContainerState => "container-state",
            TaskName::PlayerNames => "player-names",
            TaskName::Registry => "registry",
            TaskName::DacMonitor => "dac-monitor",
        };
        f.write_str(name)
    }
}

struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TaskSupervisor {
    session: CancellationToken,
    tasks: BTreeMap<TaskName, BackgroundTask>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            session: CancellationToken::new(),
            tasks: BTreeMap::new(),
        }
    }

    /// Launch every task that is not already running.
    pub fn start(&mut self, session: &Session) {
        for name in TaskName::ALL {
            if !self.tasks.contains_key(&name) {
                self.spawn(name, session);
            }
        }
    }

    fn spawn(&mut self, name: TaskName, session: &Session) {
        let cancel = self.session.child_token();
        let handle = tokio::spawn(pollers::run(name, session.clone(), cancel.clone()));
        debug!("supervisor: started {}", name);
        self.tasks.insert(name, BackgroundTask { cancel, handle });
    }

    pub fn running(&self) -> Vec<TaskName> {
        self.tasks.keys().copied().collect()
    }

    /// Cancel one task and wait for it. Returns false when it was not running.
    pub async fn cancel(&mut self, name: TaskName) -> bool {
        match self.tasks.remove(&name) {
            Some(task) => {
                task.cancel.cancel();
                if let Err(e) = task.handle.await {
                    warn!("supervisor: {} ended abnormally: {}", name, e);
                }
                debug!("supervisor: cancelled {}", name);
                true
            }
            None => false,
        }
    }

    /// Cancel every task and wait for all of them. Returns how many were
    /// running.
    pub async fn cancel_all(&mut self) -> usize {
        let tasks = std::mem::take(&mut self.tasks);
        for task in tasks.values() {
            task.cancel.cancel();
        }
        let names: Vec<TaskName> = tasks.keys().copied().collect();
        let results = join_all(tasks.into_values().map(|t| t.handle)).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!("supervisor: {} ended abnormally: {}", name, e);
            }
        }
        debug!("supervisor: cancelled {} tasks", names.len());
        names.len()
    }

    /// Cancel one task and start it afresh.
    pub async fn restart(&mut self, name: TaskName, session: &Session) {
        self.cancel(name).await;
        self.spawn(name, session);
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        // Tasks never outlive the session that owns them.
        self.session.cancel();
    }
}
