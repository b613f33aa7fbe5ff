//! # Registry
//!
//! Name-keyed constructors for personas, sinks and workflows. A registry is
//! an ordinary value: build it at startup, register what the run needs,
//! then share it behind an `Arc`. Nothing is looked up from global state.
//!
//! ```text
//!   Registry::with_builtins()
//!       .register_workflow("checkout", || build_checkout())
//!   persona(plan)        ─► Box<dyn Persona>   (by plan.options.persona)
//!   sink(&SinkConfig)    ─► Box<dyn Sink>      (by config.kind)
//!   workflow("checkout") ─► Workflow           (distributed mode)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use surge_core::{PersonaKind, SurgeError};

use crate::persona::{build_persona, Persona, PersonaFactory, PersonaPlan};
use crate::sink::{ConsoleSink, JsonFileSink, PrometheusSink, Sink, SinkConfig, SinkError};
use crate::workflow::Workflow;

pub type SinkFactory =
    Arc<dyn Fn(&SinkConfig) -> Result<Box<dyn Sink>, SinkError> + Send + Sync>;

pub type WorkflowFactory = Arc<dyn Fn() -> Result<Workflow, SurgeError> + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    personas: HashMap<String, PersonaFactory>,
    sinks: HashMap<String, SinkFactory>,
    workflows: HashMap<String, WorkflowFactory>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in persona plus the console, json-file and prometheus sinks
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in PersonaKind::ALL {
            registry.register_persona(kind.as_str(), build_persona);
        }
        registry.register_sink("console", |_| Ok(Box::new(ConsoleSink::stdout())));
        registry.register_sink("json-file", |config| {
            let path = config.path.clone().ok_or_else(|| SinkError::Rejected {
                sink: "json-file".into(),
                reason: "a path is required".into(),
            })?;
            Ok(Box::new(JsonFileSink::new(path, config.include_results)))
        });
        registry.register_sink("prometheus", |config| {
            let sink = PrometheusSink::new(&config.namespace, config.path.clone())?;
            Ok(Box::new(sink))
        });
        registry
    }

    // === Personas ===

    pub fn register_persona(&mut self, name: impl Into<String>, factory: PersonaFactory) {
        self.personas.insert(name.into(), factory);
    }

    /// Persona for `plan.options.persona`
    pub fn persona(&self, plan: &PersonaPlan) -> Result<Box<dyn Persona>, SurgeError> {
        let name = plan.options.persona.as_str();
        let factory = self
            .personas
            .get(name)
            .ok_or_else(|| SurgeError::UnknownPersona(name.to_string()))?;
        factory(plan)
    }

    pub fn persona_names(&self) -> Vec<&str> {
        sorted(self.personas.keys())
    }

    // === Sinks ===

    pub fn register_sink<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&SinkConfig) -> Result<Box<dyn Sink>, SinkError> + Send + Sync + 'static,
    {
        self.sinks.insert(kind.into(), Arc::new(factory));
    }

    pub fn sink(&self, config: &SinkConfig) -> Result<Box<dyn Sink>, SinkError> {
        let factory = self
            .sinks
            .get(&config.kind)
            .ok_or_else(|| SinkError::UnknownKind(config.kind.clone()))?;
        factory(config)
    }

    /// Build every configured sink, failing on the first bad one
    pub fn sinks(&self, configs: &[SinkConfig]) -> Result<Vec<Box<dyn Sink>>, SinkError> {
        configs.iter().map(|config| self.sink(config)).collect()
    }

    pub fn sink_kinds(&self) -> Vec<&str> {
        sorted(self.sinks.keys())
    }

    // === Workflows ===

    pub fn register_workflow<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Workflow, SurgeError> + Send + Sync + 'static,
    {
        self.workflows.insert(name.into(), Arc::new(factory));
    }

    /// Construct the workflow registered under `name`
    pub fn workflow(&self, name: &str) -> Result<Workflow, SurgeError> {
        let factory = self
            .workflows
            .get(name)
            .ok_or_else(|| SurgeError::InvalidOption {
                option: "workflow".into(),
                reason: format!("no workflow named `{name}` is registered"),
            })?;
        factory()
    }

    pub fn workflow_names(&self) -> Vec<&str> {
        sorted(self.workflows.keys())
    }
}

fn sorted<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut names: Vec<&str> = keys.map(String::as_str).collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::{Batch, Feedback, Pace};
    use crate::worker::Scope;
    use crate::workflow::Step;
    use std::time::Duration;
    use surge_core::{ErrorKind, ProtocolKind, Request, WorkflowOptions};

    fn plan(persona: PersonaKind) -> PersonaPlan {
        PersonaPlan {
            options: WorkflowOptions {
                persona,
                ..WorkflowOptions::default()
            },
            layers: 1,
            order: vec![surge_core::StepIndex(0)],
            weights: vec![1],
            arrival: None,
            seed: Some(1),
        }
    }

    struct Idle;

    impl Persona for Idle {
        fn kind(&self) -> PersonaKind {
            PersonaKind::Default
        }

        fn next_batch(&mut self, _: &Feedback) -> Batch {
            Batch {
                scopes: vec![Scope::Graph],
                pace: Pace::AwaitAll,
                pause: Duration::from_secs(1),
            }
        }
    }

    fn idle(_: &PersonaPlan) -> Result<Box<dyn Persona>, SurgeError> {
        Ok(Box::new(Idle))
    }

    #[test]
    fn test_builtins_cover_every_persona() {
        let registry = Registry::with_builtins();
        for kind in PersonaKind::ALL {
            let persona = registry.persona(&plan(kind)).unwrap();
            assert_eq!(persona.kind(), kind);
        }
        assert_eq!(registry.sink_kinds(), vec!["console", "json-file", "prometheus"]);
    }

    #[test]
    fn test_missing_persona_is_invalid_workflow() {
        let registry = Registry::new();
        let err = registry.persona(&plan(PersonaKind::Weighted)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidWorkflow);
    }

    #[test]
    fn test_persona_override() {
        let mut registry = Registry::with_builtins();
        registry.register_persona("default", idle);
        let mut persona = registry.persona(&plan(PersonaKind::Default)).unwrap();
        let batch = persona.next_batch(&Feedback::default());
        assert_eq!(batch.pause, Duration::from_secs(1));
    }

    #[test]
    fn test_sink_lookup() {
        let registry = Registry::with_builtins();
        assert!(registry.sink(&SinkConfig::new("console")).is_ok());
        assert!(matches!(
            registry.sink(&SinkConfig::new("json-file")),
            Err(SinkError::Rejected { .. })
        ));
        assert!(matches!(
            registry.sink(&SinkConfig::new("kafka")),
            Err(SinkError::UnknownKind(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        let configs = [
            SinkConfig::new("json-file").path(dir.path().join("a.jsonl")),
            SinkConfig::new("prometheus"),
        ];
        let sinks = registry.sinks(&configs).unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[1].name(), "prometheus");
    }

    #[test]
    fn test_workflow_factories() {
        let mut registry = Registry::new();
        registry.register_workflow("health", || {
            Workflow::builder("health")
                .step(Step::request(
                    "get",
                    ProtocolKind::Http1,
                    Request::get("http://127.0.0.1:1/health")?,
                ))
                .build()
        });
        assert_eq!(registry.workflow("health").unwrap().len(), 1);
        assert_eq!(registry.workflow_names(), vec!["health"]);
        let err = registry.workflow("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidWorkflow);
    }
}
