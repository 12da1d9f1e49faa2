// Schedule table: the immutable set of recurring task definitions
//
// Built once at startup and validated fail-fast; changing schedules requires
// a restart. Args and properties are either static values or deferred
// computations resolved at dispatch time.

use crate::cron::CronExpression;
use crate::errors::TableError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Positional arguments handed to the job class
pub type Args = Vec<Value>;

/// Additional execution properties (e.g. a priority override)
pub type Properties = Map<String, Value>;

/// A value that is either fixed at load time or computed at dispatch time
///
/// Deferred computations are re-evaluated fresh on every dispatch, never
/// cached.
#[derive(Clone)]
pub enum ValueSpec<T> {
    Static(T),
    Deferred(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> ValueSpec<T> {
    pub fn resolve(&self) -> T {
        match self {
            ValueSpec::Static(value) => value.clone(),
            ValueSpec::Deferred(compute) => compute(),
        }
    }
}

impl<T: Default> Default for ValueSpec<T> {
    fn default() -> Self {
        ValueSpec::Static(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for ValueSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSpec::Static(value) => f.debug_tuple("Static").field(value).finish(),
            ValueSpec::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// One recurring task definition
///
/// `job_class` is an opaque identifier resolved by the external execution
/// engine; its existence is not verified here. Priority follows the global
/// smaller-is-higher convention, default 0.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub key: String,
    pub cron: CronExpression,
    pub job_class: String,
    pub args: ValueSpec<Args>,
    pub priority: i32,
    pub properties: ValueSpec<Properties>,
    pub description: Option<String>,
}

impl TaskDefinition {
    /// Create a definition with an already-validated cron expression
    ///
    /// Parsing happens here so a malformed expression can never reach
    /// fire-time evaluation.
    pub fn new(
        key: impl Into<String>,
        cron_expression: &str,
        job_class: impl Into<String>,
    ) -> Result<Self, TableError> {
        let key = key.into();
        let cron = cron_expression
            .parse::<CronExpression>()
            .map_err(|source| TableError::InvalidCronExpression {
                key: key.clone(),
                source,
            })?;

        Ok(Self {
            key,
            cron,
            job_class: job_class.into(),
            args: ValueSpec::default(),
            priority: 0,
            properties: ValueSpec::default(),
            description: None,
        })
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = ValueSpec::Static(args);
        self
    }

    /// Deferred positional arguments, computed fresh at every dispatch
    pub fn with_args_fn(mut self, compute: impl Fn() -> Args + Send + Sync + 'static) -> Self {
        self.args = ValueSpec::Deferred(Arc::new(compute));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = ValueSpec::Static(properties);
        self
    }

    /// Deferred execution properties, computed fresh at every dispatch
    pub fn with_properties_fn(
        mut self,
        compute: impl Fn() -> Properties + Send + Sync + 'static,
    ) -> Self {
        self.properties = ValueSpec::Deferred(Arc::new(compute));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Config-file form of a task definition
///
/// The key is the enclosing map key, injected when the table is built.
/// File-declared definitions carry static args and properties only; deferred
/// computations come in through the code-level `TaskDefinition` API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTaskDefinition {
    pub cron: String,
    pub job_class: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub description: Option<String>,
}

/// The validated, immutable schedule table
///
/// Keys iterate in sorted order so ticks evaluate definitions
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    tasks: BTreeMap<String, TaskDefinition>,
}

impl ScheduleTable {
    /// Validate and build the table, failing fast on the first defect
    pub fn load(definitions: Vec<TaskDefinition>) -> Result<Self, TableError> {
        let mut tasks = BTreeMap::new();

        for definition in definitions {
            if definition.key.trim().is_empty() {
                return Err(TableError::EmptyKey);
            }
            if definition.job_class.trim().is_empty() {
                return Err(TableError::EmptyJobClass {
                    key: definition.key,
                });
            }
            validate_static_priority_override(&definition)?;

            if tasks.contains_key(&definition.key) {
                return Err(TableError::DuplicateKey(definition.key));
            }
            tasks.insert(definition.key.clone(), definition);
        }

        Ok(Self { tasks })
    }

    /// Build the table from config-file entries, injecting map keys
    pub fn from_raw(raw: &BTreeMap<String, RawTaskDefinition>) -> Result<Self, TableError> {
        let mut definitions = Vec::with_capacity(raw.len());

        for (key, entry) in raw {
            let mut definition =
                TaskDefinition::new(key.as_str(), &entry.cron, entry.job_class.as_str())?
                .with_args(entry.args.clone())
                .with_properties(entry.properties.clone());

            if let Some(priority) = entry.priority {
                definition.priority =
                    i32::try_from(priority).map_err(|_| TableError::InvalidPriority {
                        key: key.clone(),
                        reason: format!("{priority} does not fit a 32-bit integer"),
                    })?;
            }
            definition.description = entry.description.clone();

            definitions.push(definition);
        }

        Self::load(definitions)
    }

    pub fn get(&self, key: &str) -> Option<&TaskDefinition> {
        self.tasks.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A static `properties.priority` override must be an integer; deferred
/// properties can only be checked at dispatch time.
fn validate_static_priority_override(definition: &TaskDefinition) -> Result<(), TableError> {
    if let ValueSpec::Static(properties) = &definition.properties {
        if let Some(value) = properties.get("priority") {
            let fits = value.as_i64().is_some_and(|p| i32::try_from(p).is_ok());
            if !fits {
                return Err(TableError::InvalidPriority {
                    key: definition.key.clone(),
                    reason: format!("properties.priority override '{value}' is not an integer"),
                });
            }
        }
    }
    Ok(())
}
