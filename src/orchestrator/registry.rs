//! Task registry: the fixed task-type to launch-spec mapping.
//!
//! Built once from [`GlobalConfig`] and shared read-only by every
//! front-end. Unknown task types are rejected here, before any process
//! or file is touched.

use std::collections::BTreeMap;

use crate::config::GlobalConfig;
use crate::models::task::{LaunchSpec, TaskType};
use crate::{AppError, Result};

/// Registry entry: resolved launch command plus its description.
#[derive(Debug, Clone)]
struct Entry {
    spec: LaunchSpec,
    description: Option<String>,
}

/// Immutable mapping from [`TaskType`] to [`LaunchSpec`].
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    entries: BTreeMap<TaskType, Entry>,
}

impl TaskRegistry {
    /// Build the registry from configuration.
    ///
    /// Global `env` overrides are merged under per-task overrides, and the
    /// workspace placeholder is expanded in every value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a configured task name is invalid.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (name, task) in &config.tasks {
            let task_type = TaskType::parse(name)
                .map_err(|err| AppError::Config(format!("invalid task name '{name}': {err}")))?;

            let env = config
                .env
                .iter()
                .chain(task.env.iter())
                .map(|(key, value)| (key.clone(), config.expand(value)))
                .collect();

            let spec = LaunchSpec {
                program: task.program.clone(),
                args: task.args.clone(),
                env,
                working_dir: config.workspace_root.clone(),
                inherit_env: config.inherit_env,
            };

            entries.insert(
                task_type,
                Entry {
                    spec,
                    description: task.description.clone(),
                },
            );
        }

        Ok(Self { entries })
    }

    /// Resolve a task name to its canonical type and launch spec.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownTask` naming the available task types.
    pub fn resolve(&self, name: &str) -> Result<(&TaskType, &LaunchSpec)> {
        self.entries
            .get_key_value(name)
            .map(|(task_type, entry)| (task_type, &entry.spec))
            .ok_or_else(|| {
                AppError::UnknownTask(format!(
                    "'{name}' is not a configured task (available: {})",
                    self.names().join(", ")
                ))
            })
    }

    /// Whether `name` is a configured task.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All configured task types in sorted order.
    pub fn task_types(&self) -> impl Iterator<Item = &TaskType> {
        self.entries.keys()
    }

    /// Task names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(TaskType::as_str).collect()
    }

    /// Task names paired with their descriptions, for help output.
    #[must_use]
    pub fn describe(&self) -> Vec<(&TaskType, Option<&str>)> {
        self.entries
            .iter()
            .map(|(task_type, entry)| (task_type, entry.description.as_deref()))
            .collect()
    }
}
