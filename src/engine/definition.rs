//! Declarative workflow definitions, as submitted by callers.
//!
//! A [`WorkflowSpec`] deserializes from JSON such as
//!
//! ```json
//! {
//!   "name": "signup",
//!   "root": {
//!     "type": "chain",
//!     "steps": [
//!       { "type": "task", "kind": "validate_user", "input": "User123" },
//!       { "type": "task", "kind": "write_to_database", "commit": true }
//!     ]
//!   }
//! }
//! ```
//!
//! or can be assembled in code with the [`Step`] constructors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::task::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub root: Step,
    /// Named steps that `use` steps expand to.
    #[serde(default)]
    pub fragments: BTreeMap<String, Step>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, root: Step) -> Self {
        Self {
            name: name.into(),
            root,
            fragments: BTreeMap::new(),
        }
    }

    pub fn with_fragment(mut self, name: impl Into<String>, step: Step) -> Self {
        self.fragments.insert(name.into(), step);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Task(TaskStep),
    Chain(CompositeStep),
    Group(CompositeStep),
    Chord(ChordStep),
    Use(FragmentStep),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub input: Value,
    /// Overrides the registered policy of `kind`.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub best_effort: bool,
    /// Fire only once every earlier step of the enclosing chains succeeded.
    #[serde(default)]
    pub commit: bool,
    /// Extra node ids that must have succeeded before this step fires.
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeStep {
    #[serde(default)]
    pub id: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub best_effort: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordStep {
    #[serde(default)]
    pub id: Option<String>,
    pub group: Vec<Step>,
    pub callback: Box<Step>,
    /// Number of group results the callback expects.
    #[serde(default)]
    pub expects: Option<usize>,
    #[serde(default)]
    pub best_effort: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentStep {
    #[serde(default)]
    pub id: Option<String>,
    pub fragment: String,
    #[serde(default)]
    pub best_effort: bool,
}

impl Step {
    pub fn task(kind: impl Into<String>) -> Self {
        Step::Task(TaskStep {
            kind: kind.into(),
            ..TaskStep::default()
        })
    }

    pub fn chain(steps: Vec<Step>) -> Self {
        Step::Chain(CompositeStep {
            steps,
            ..CompositeStep::default()
        })
    }

    pub fn group(steps: Vec<Step>) -> Self {
        Step::Group(CompositeStep {
            steps,
            ..CompositeStep::default()
        })
    }

    pub fn chord(group: Vec<Step>, callback: Step) -> Self {
        Step::Chord(ChordStep {
            id: None,
            group,
            callback: Box::new(callback),
            expects: None,
            best_effort: false,
        })
    }

    pub fn fragment(name: impl Into<String>) -> Self {
        Step::Use(FragmentStep {
            fragment: name.into(),
            ..FragmentStep::default()
        })
    }

    pub fn with_id(mut self, value: impl Into<String>) -> Self {
        let value = Some(value.into());
        match &mut self {
            Step::Task(s) => s.id = value,
            Step::Chain(s) | Step::Group(s) => s.id = value,
            Step::Chord(s) => s.id = value,
            Step::Use(s) => s.id = value,
        }
        self
    }

    pub fn best_effort(mut self) -> Self {
        match &mut self {
            Step::Task(s) => s.best_effort = true,
            Step::Chain(s) | Step::Group(s) => s.best_effort = true,
            Step::Chord(s) => s.best_effort = true,
            Step::Use(s) => s.best_effort = true,
        }
        self
    }

    // The modifiers below only apply to task steps.

    pub fn with_input(mut self, value: Value) -> Self {
        if let Step::Task(s) = &mut self {
            s.input = value;
        }
        self
    }

    pub fn with_retry(mut self, value: RetryPolicy) -> Self {
        if let Step::Task(s) = &mut self {
            s.retry = Some(value);
        }
        self
    }

    pub fn with_idempotency_key(mut self, value: impl Into<String>) -> Self {
        if let Step::Task(s) = &mut self {
            s.idempotency_key = Some(value.into());
        }
        self
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        if let Step::Task(s) = &mut self {
            s.timeout = Some(value);
        }
        self
    }

    pub fn commit(mut self) -> Self {
        if let Step::Task(s) = &mut self {
            s.commit = true;
        }
        self
    }

    pub fn requires<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Step::Task(s) = &mut self {
            s.requires.extend(ids.into_iter().map(Into::into));
        }
        self
    }

    /// Declare how many group results a chord's callback consumes.
    pub fn expecting(mut self, arity: usize) -> Self {
        if let Step::Chord(s) = &mut self {
            s.expects = Some(arity);
        }
        self
    }
}
