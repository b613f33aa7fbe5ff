//! Built-in workflows registered by the binary.
//!
//! - `get` - one HTTP/1.1 GET of the target per iteration
//! - `get-h2` - the same over HTTP/2
//! - `mixed` - index page, then health and stats pages in parallel
//! - `idle` - a 10ms task, for exercising personas and clusters offline

use serde_json::Value;
use std::time::Duration;

use surge_core::{ProtocolKind, Request, SurgeError, TaskKind, Url};
use surge_engine::{Registry, Step, Workflow};

/// Registry with the built-in personas, sinks and demo workflows
pub fn registry(target: &str) -> Result<Registry, SurgeError> {
    let base = Url::parse(target)?;
    let index = base.to_string();
    let health = base.join("health")?.to_string();
    let stats = base.join("stats")?.to_string();

    let mut registry = Registry::with_builtins();

    let url = index.clone();
    registry.register_workflow("get", move || {
        Workflow::builder("get")
            .step(Step::request("get", ProtocolKind::Http1, Request::get(&url)?))
            .build()
    });

    let url = index.clone();
    registry.register_workflow("get-h2", move || {
        Workflow::builder("get-h2")
            .step(Step::request("get", ProtocolKind::Http2, Request::get(&url)?))
            .build()
    });

    registry.register_workflow("mixed", move || {
        Workflow::builder("mixed")
            .step(Step::request("index", ProtocolKind::Http1, Request::get(&index)?))
            .step(
                Step::request("health", ProtocolKind::Http1, Request::get(&health)?)
                    .after(&["index"]),
            )
            .step(
                Step::request("stats", ProtocolKind::Http1, Request::get(&stats)?)
                    .after(&["index"])
                    .timeout(Duration::from_secs(5)),
            )
            .build()
    });

    registry.register_workflow("idle", || {
        Workflow::builder("idle")
            .step(Step::task("pause", TaskKind::Transform, |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::Null)
            }))
            .build()
    });

    Ok(registry)
}
