//! Command dispatch with context and locator fallback.
//!
//! A command is unaware of which execution context holds the surface, so it
//! is attempted in each known context in turn (up to a cap) and stops at
//! the first success. Clicks additionally walk the locator strategies from
//! most to least precise. Every command is executed at most once per
//! request; nothing is retried after a success.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use mirror_relay_core::command::{
    AppState, ChatFeedback, ClickRequest, Command, CommandResult, CommandState,
};
use mirror_relay_core::config::HostConfig;
use mirror_relay_core::error::{RelayError, Result};
use mirror_relay_core::types::Issuer;

use crate::link::ScriptHost;
use crate::resolve::{self, Locator};
use crate::scripts;

/// Outcome shape every command script returns.
#[derive(Debug, Default, Deserialize)]
struct ScriptOutcome {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Result of trying one script across contexts.
#[derive(Debug)]
struct Attempt {
    state: CommandState,
    method: Option<String>,
    error: Option<String>,
}

impl Attempt {
    fn into_result(self) -> CommandResult {
        match self.state {
            CommandState::Succeeded => CommandResult {
                ok: true,
                method: self.method,
                error: None,
            },
            _ => CommandResult::failure(
                self.error
                    .unwrap_or_else(|| format!("command {}", self.state)),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    surface: String,
    max_contexts: usize,
}

impl Dispatcher {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            surface: config.surface_selector.clone(),
            max_contexts: config.max_contexts_per_command.max(1),
        }
    }

    /// Execute `command` in the host. Never fails; problems are reported in
    /// the returned result.
    pub async fn dispatch(
        &self,
        host: &dyn ScriptHost,
        command: &Command,
        issuer: &Issuer,
    ) -> CommandResult {
        let kind = command.kind();
        debug!(kind, %issuer, state = %CommandState::Issued, "Command issued");

        let attempt = match command {
            Command::Click { data } => self.click(host, data).await,
            other => match scripts::command(other, &self.surface) {
                Some(script) => self.run(host, &script).await,
                None => Attempt {
                    state: CommandState::Failed,
                    method: None,
                    error: Some(format!("no script for {kind}")),
                },
            },
        };

        match attempt.state {
            CommandState::Succeeded => info!(
                kind,
                %issuer,
                method = attempt.method.as_deref().unwrap_or(""),
                state = %attempt.state,
                "Command completed"
            ),
            state => warn!(
                kind,
                %issuer,
                error = attempt.error.as_deref().unwrap_or(""),
                %state,
                "Command did not complete"
            ),
        }
        attempt.into_result()
    }

    async fn click(&self, host: &dyn ScriptHost, req: &ClickRequest) -> Attempt {
        let locators = resolve::candidates(req);
        if locators.is_empty() {
            return Attempt {
                state: CommandState::Failed,
                method: None,
                error: Some(
                    RelayError::CommandResolutionFailed("click carries no usable locator".into())
                        .to_string(),
                ),
            };
        }

        let mut last: Option<Attempt> = None;
        for (name, locator) in locators {
            let attempt = self.run(host, &scripts::click(&locator, &self.surface)).await;
            if attempt.state == CommandState::Succeeded {
                return Attempt {
                    method: Some(name.to_string()),
                    ..attempt
                };
            }
            debug!(strategy = name, locator = %describe(&locator), "Locator did not match");
            last = Some(attempt);
        }
        last.unwrap_or(Attempt {
            state: CommandState::Failed,
            method: None,
            error: None,
        })
    }

    /// Run `script` in each context until one reports success.
    async fn run(&self, host: &dyn ScriptHost, script: &str) -> Attempt {
        let contexts = host.contexts().await;
        if contexts.is_empty() {
            return Attempt {
                state: CommandState::Failed,
                method: None,
                error: Some("no execution contexts available".into()),
            };
        }

        let mut last_error: Option<String> = None;
        let mut timeouts = 0usize;
        let mut tried = 0usize;

        for ctx in contexts.iter().take(self.max_contexts) {
            tried += 1;
            debug!(context = ctx.id, state = %CommandState::Dispatched, "Dispatching");
            match host.evaluate(ctx.id, script).await {
                Ok(value) => {
                    let outcome = parse_outcome(value);
                    if outcome.ok {
                        return Attempt {
                            state: CommandState::Succeeded,
                            method: outcome.method,
                            error: None,
                        };
                    }
                    last_error = outcome.error.or(last_error);
                }
                Err(RelayError::CallTimeout { method, timeout_ms }) => {
                    timeouts += 1;
                    last_error = Some(format!("{method} timed out after {timeout_ms}ms"));
                }
                Err(RelayError::LinkLost) => {
                    return Attempt {
                        state: CommandState::Failed,
                        method: None,
                        error: Some(RelayError::LinkLost.to_string()),
                    };
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        let state = if timeouts == tried {
            CommandState::TimedOut
        } else {
            CommandState::Failed
        };
        Attempt {
            state,
            method: None,
            error: Some(
                RelayError::CommandResolutionFailed(
                    last_error.unwrap_or_else(|| format!("{tried} contexts tried")),
                )
                .to_string(),
            ),
        }
    }

    /// Current mode and model, from the first context that reports them.
    pub async fn app_state(&self, host: &dyn ScriptHost) -> Result<AppState> {
        let value = self.query(host, &scripts::app_state(&self.surface)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn chat_feedback(&self, host: &dyn ScriptHost) -> Result<ChatFeedback> {
        let value = self
            .query(host, &scripts::chat_feedback(&self.surface))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn query(&self, host: &dyn ScriptHost, script: &str) -> Result<Value> {
        let mut last_error = None;
        for ctx in host.contexts().await.iter().take(self.max_contexts) {
            match host.evaluate(ctx.id, script).await {
                Ok(Value::Null) => {}
                Ok(value) => return Ok(value),
                Err(RelayError::LinkLost) => return Err(RelayError::LinkLost),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(RelayError::NotReady))
    }
}

fn parse_outcome(value: Value) -> ScriptOutcome {
    match value {
        Value::Bool(ok) => ScriptOutcome {
            ok,
            ..Default::default()
        },
        Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
        _ => ScriptOutcome::default(),
    }
}

fn describe(locator: &Locator) -> String {
    match locator {
        Locator::Structural { relay_id } => format!("id={relay_id}"),
        Locator::Point { x_ratio, y_ratio, .. } => format!("({x_ratio:.3}, {y_ratio:.3})"),
        Locator::Text { text, index, .. } => format!("{text:?}#{index}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::link::ExecutionContext;

    /// Answers each evaluation through `respond(context, script)` and
    /// records the calls it saw.
    struct FakeHost<F> {
        contexts: Vec<i64>,
        respond: F,
        calls: Mutex<Vec<(i64, String)>>,
    }

    impl<F> FakeHost<F>
    where
        F: Fn(i64, &str) -> Result<Value> + Send + Sync,
    {
        fn new(contexts: Vec<i64>, respond: F) -> Self {
            Self {
                contexts,
                respond,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(i64, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F> ScriptHost for FakeHost<F>
    where
        F: Fn(i64, &str) -> Result<Value> + Send + Sync,
    {
        async fn contexts(&self) -> Vec<ExecutionContext> {
            self.contexts
                .iter()
                .map(|&id| ExecutionContext {
                    id,
                    name: String::new(),
                    origin: String::new(),
                })
                .collect()
        }

        async fn evaluate(&self, context_id: i64, expression: &str) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((context_id, expression.to_string()));
            (self.respond)(context_id, expression)
        }
    }

    fn dispatcher(max_contexts: usize) -> Dispatcher {
        Dispatcher::new(&HostConfig {
            max_contexts_per_command: max_contexts,
            ..HostConfig::default()
        })
    }

    fn accept_click() -> Command {
        Command::Click {
            data: ClickRequest {
                selector: Some("button".into()),
                index: 0,
                text_content: Some("Accept".into()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_stops_at_first_accepting_context() {
        let host = FakeHost::new(vec![1, 2, 3], |ctx, _| {
            if ctx == 2 {
                Ok(json!({ "ok": true, "method": "enter_key" }))
            } else {
                Ok(json!({ "ok": false, "error": "input not found" }))
            }
        });
        let cmd = Command::SendMessage {
            message: "hello".into(),
        };
        let result = dispatcher(8).dispatch(&host, &cmd, &Issuer::Http).await;
        assert!(result.ok);
        assert_eq!(result.method.as_deref(), Some("enter_key"));
        assert!(result.error.is_none());

        let contexts: Vec<i64> = host.calls().iter().map(|(c, _)| *c).collect();
        assert_eq!(contexts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_click_text_match_reports_method() {
        // Only the text strategy applies; context 1 throws, context 2 accepts.
        let host = FakeHost::new(vec![1, 2], |ctx, script| {
            assert!(script.contains(r#""by":"text""#));
            if ctx == 1 {
                Err(RelayError::Remote("ReferenceError".into()))
            } else {
                Ok(json!({ "ok": true, "method": "text" }))
            }
        });
        let result = dispatcher(8)
            .dispatch(&host, &accept_click(), &Issuer::Socket("c1".into()))
            .await;
        assert_eq!(
            result,
            CommandResult {
                ok: true,
                method: Some("text_match".into()),
                error: None,
            }
        );
        assert_eq!(host.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_click_falls_back_through_strategies() {
        let host = FakeHost::new(vec![1], |_, script| {
            if script.contains(r#""by":"structural""#) {
                Ok(json!({ "ok": false, "error": "element not found" }))
            } else {
                Ok(json!({ "ok": true }))
            }
        });
        let cmd = Command::Click {
            data: ClickRequest {
                relay_id: Some("r1".into()),
                x_ratio: Some(0.2),
                y_ratio: Some(0.8),
                ..Default::default()
            },
        };
        let result = dispatcher(8).dispatch(&host, &cmd, &Issuer::Http).await;
        assert!(result.ok);
        assert_eq!(result.method.as_deref(), Some("coordinates"));
        assert_eq!(host.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_relay_id_falls_back_to_text_match() {
        let host = FakeHost::new(vec![1, 2], |ctx, script| {
            if script.contains(r#""by":"structural""#) {
                Ok(json!({ "ok": false, "error": "element not found" }))
            } else if ctx == 1 {
                Ok(json!({ "ok": false, "error": "surface not found" }))
            } else {
                assert!(script.contains(r#""text":"Accept""#));
                Ok(json!({ "ok": true, "method": "text" }))
            }
        });
        let cmd = Command::Click {
            data: ClickRequest {
                relay_id: Some("r-stale".into()),
                selector: Some("button".into()),
                text_content: Some("Accept".into()),
                ..Default::default()
            },
        };
        let result = dispatcher(8).dispatch(&host, &cmd, &Issuer::Http).await;
        assert_eq!(
            result,
            CommandResult {
                ok: true,
                method: Some("text_match".into()),
                error: None,
            }
        );
        let order: Vec<i64> = host.calls().iter().map(|(c, _)| *c).collect();
        assert_eq!(order, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_failure_everywhere_is_reported() {
        let host = FakeHost::new(vec![1, 2], |_, _| {
            Ok(json!({ "ok": false, "error": "element not found" }))
        });
        let result = dispatcher(8)
            .dispatch(&host, &accept_click(), &Issuer::Http)
            .await;
        assert!(!result.ok);
        assert!(result.method.is_none());
        assert!(result.error.unwrap().contains("element not found"));
    }

    #[tokio::test]
    async fn test_context_cap() {
        let host = FakeHost::new((1..=20).collect(), |_, _| Ok(json!({ "ok": false })));
        let result = dispatcher(3).dispatch(&host, &Command::Stop, &Issuer::Http).await;
        assert!(!result.ok);
        assert_eq!(host.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_no_contexts() {
        let host = FakeHost::new(vec![], |_, _| Ok(json!({ "ok": true })));
        let result = dispatcher(8).dispatch(&host, &Command::NewChat, &Issuer::Http).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("no execution contexts"));
    }

    #[tokio::test]
    async fn test_all_timeouts_reported_as_timeout() {
        let host = FakeHost::new(vec![1, 2], |_, _| {
            Err(RelayError::CallTimeout {
                method: "Runtime.evaluate".into(),
                timeout_ms: 30000,
            })
        });
        let result = dispatcher(8).dispatch(&host, &Command::Stop, &Issuer::Http).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_link_lost_stops_early() {
        let host = FakeHost::new(vec![1, 2, 3], |_, _| Err(RelayError::LinkLost));
        let result = dispatcher(8).dispatch(&host, &Command::Stop, &Issuer::Http).await;
        assert!(!result.ok);
        assert_eq!(host.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_click_without_locator_does_not_touch_host() {
        let host = FakeHost::new(vec![1], |_, _| Ok(json!({ "ok": true })));
        let cmd = Command::Click {
            data: ClickRequest::default(),
        };
        let result = dispatcher(8).dispatch(&host, &cmd, &Issuer::Http).await;
        assert!(!result.ok);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_queries_skip_empty_contexts() {
        let host = FakeHost::new(vec![1, 2], |ctx, _| {
            if ctx == 1 {
                Ok(Value::Null)
            } else {
                Ok(json!({ "is_generating": true, "recent_text": "Done.", "buttons": [
                    { "index": 0, "label": "Accept", "relay_id": "r4" }
                ]}))
            }
        });
        let feedback = dispatcher(8).chat_feedback(&host).await.unwrap();
        assert!(feedback.is_generating);
        assert_eq!(feedback.buttons[0].label, "Accept");

        let none = FakeHost::new(vec![1], |_, _| Ok(Value::Null));
        assert!(matches!(
            dispatcher(8).app_state(&none).await,
            Err(RelayError::NotReady)
        ));
    }
}
