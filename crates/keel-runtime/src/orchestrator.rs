use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use keel_core::{ChatMessage, Event, Result, StateSnapshot};
use keel_kernel::{EventBus, HandlerContext, SubscriptionId, APP_PROJECTION};
use keel_llm::{ChatRequest, LlmClient, ToolDef};
use keel_plugin::AgentDescriptor;

use crate::requests::RequestProjection;

const SUBSCRIBER_LABEL: &str = "orchestrator";

/// Drives a user request from arrival to exactly one `RequestCompleted`:
/// route it to an agent, register every tool call the agent asks for
/// before executing any of them, and finalize once the pending set
/// drains.
///
/// Finalization is guarded by an in-process claim rather than the
/// projection, so replaying the log never re-runs completions, and two
/// racing resolution handlers can't both publish a terminal event.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    agents: Vec<AgentDescriptor>,
    model: String,
    finalized: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, agents: Vec<AgentDescriptor>, model: &str) -> Arc<Self> {
        Arc::new(Self {
            llm,
            agents,
            model: model.to_string(),
            finalized: Mutex::new(HashSet::new()),
        })
    }

    /// Wire this orchestrator onto the bus. Returns the subscription
    /// tokens in case the caller wants to detach it later.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();

        let orch = Arc::clone(self);
        ids.push(bus.subscribe(
            SUBSCRIBER_LABEL,
            "user_request_received",
            Arc::new(move |event, ctx| {
                let orch = Arc::clone(&orch);
                Box::pin(async move { orch.on_request_received(event, ctx).await })
            }),
        ));

        let orch = Arc::clone(self);
        ids.push(bus.subscribe(
            SUBSCRIBER_LABEL,
            "agent_call_decided",
            Arc::new(move |event, ctx| {
                let orch = Arc::clone(&orch);
                Box::pin(async move { orch.on_agent_decided(event, ctx).await })
            }),
        ));

        for kind in ["tool_call_completed", "tool_call_failed"] {
            let orch = Arc::clone(self);
            ids.push(bus.subscribe(
                SUBSCRIBER_LABEL,
                kind,
                Arc::new(move |event, ctx| {
                    let orch = Arc::clone(&orch);
                    Box::pin(async move { orch.on_tool_resolved(event, ctx).await })
                }),
            ));
        }

        ids
    }

    // ── Routing ────────────────────────────────────────────────

    async fn on_request_received(&self, event: Event, ctx: HandlerContext) -> Result<Vec<Event>> {
        let Event::UserRequestReceived { request_id, text } = event else {
            return Ok(vec![]);
        };

        let request = ChatRequest {
            model: self.model.clone(),
            messages: self.conversation(&ctx.snapshot, &text),
            tools: self.delegation_tools(),
            system: Some(self.router_prompt()),
            request_id: request_id.clone(),
        };

        match self.llm.chat(&request).await {
            Ok(outcome) if outcome.has_tool_calls() => {
                // One delegation per chosen agent.
                let decided = outcome
                    .tool_calls
                    .iter()
                    .map(|call| {
                        let task = call
                            .arguments
                            .get("task")
                            .and_then(Value::as_str)
                            .unwrap_or(&text)
                            .to_string();
                        info!(%request_id, agent = %call.name, "delegating request");
                        Event::AgentCallDecided {
                            request_id: request_id.clone(),
                            agent: call.name.clone(),
                            task,
                        }
                    })
                    .collect();
                Ok(decided)
            }
            Ok(outcome) => {
                // The router answered directly; no agent needed.
                Ok(self.finalize(&request_id, outcome.content, false))
            }
            Err(e) => {
                warn!(%request_id, error = %e, "routing turn failed");
                Ok(self.finalize(&request_id, format!("request failed: {e}"), true))
            }
        }
    }

    /// The routing turn sees the whole exchange so far, not just the new
    /// text. Events are applied before dispatch, so the snapshot's
    /// history normally already ends with the request being routed; the
    /// fallback covers a bus wired without the app projection.
    fn conversation(&self, snapshot: &StateSnapshot, text: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = snapshot
            .get(APP_PROJECTION)
            .and_then(|app| app.get("history"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let role = entry.get("role")?.as_str()?;
                        let content = entry.get("text")?.as_str()?;
                        Some(match role {
                            "assistant" => ChatMessage::assistant(content),
                            _ => ChatMessage::user(content),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if messages.last().map(|m| m.content.as_str()) != Some(text) {
            messages.push(ChatMessage::user(text));
        }
        messages
    }

    fn delegation_tools(&self) -> Vec<ToolDef> {
        self.agents
            .iter()
            .map(|agent| ToolDef {
                name: agent.name.clone(),
                description: agent.description.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "task": {
                            "type": "string",
                            "description": "What the agent should accomplish",
                        }
                    },
                    "required": ["task"],
                }),
            })
            .collect()
    }

    fn router_prompt(&self) -> String {
        let mut prompt = String::from(
            "You route user requests. Call the agent best suited for the \
             request, or answer directly if no agent is needed.\n\nAgents:\n",
        );
        for agent in &self.agents {
            prompt.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }
        prompt
    }

    // ── Agent execution ────────────────────────────────────────

    async fn on_agent_decided(&self, event: Event, ctx: HandlerContext) -> Result<Vec<Event>> {
        let Event::AgentCallDecided {
            request_id,
            agent,
            task,
        } = event
        else {
            return Ok(vec![]);
        };

        let Some(descriptor) = self.agents.iter().find(|a| a.name == agent) else {
            warn!(%request_id, %agent, "delegation to unknown agent");
            return Ok(self.finalize(
                &request_id,
                format!("no agent named '{agent}' is loaded"),
                true,
            ));
        };

        let tools: Vec<ToolDef> = descriptor
            .command_names
            .iter()
            .filter_map(|name| ctx.commands.get(name))
            .map(|entry| ToolDef {
                name: entry.spec.name.clone(),
                description: entry.spec.description.clone(),
                parameters: entry.spec.schema.to_json_schema(),
            })
            .collect();

        let request = ChatRequest {
            model: descriptor.profile.model.clone(),
            messages: vec![ChatMessage::user(&task)],
            tools,
            system: Some(descriptor.profile.system_prompt.clone()),
            request_id: request_id.clone(),
        };

        let outcome = match self.llm.chat(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%request_id, %agent, error = %e, "agent turn failed");
                return Ok(self.finalize(&request_id, format!("agent '{agent}' failed: {e}"), true));
            }
        };

        if !outcome.has_tool_calls() {
            return Ok(self.finalize(&request_id, outcome.content, false));
        }

        // Register every placement before executing any call. With the
        // whole batch applied up front, the pending set cannot drain to
        // empty until the final call resolves.
        let placements: Vec<(String, String, Value)> = outcome
            .tool_calls
            .iter()
            .map(|invocation| {
                let call_id = if invocation.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4())
                } else {
                    invocation.id.clone()
                };
                (call_id, invocation.name.clone(), invocation.arguments.clone())
            })
            .collect();

        let placed: Vec<Event> = placements
            .iter()
            .map(|(call_id, command, arguments)| Event::ToolCallRequestPlaced {
                request_id: request_id.clone(),
                call_id: call_id.clone(),
                command: command.clone(),
                arguments: arguments.clone(),
            })
            .collect();
        ctx.publisher.publish(&placed)?;

        for (call_id, command, arguments) in placements {
            let resolution = self.execute_tool(&ctx, &request_id, &call_id, &command, arguments)?;
            ctx.publisher.publish(std::slice::from_ref(&resolution))?;
        }
        Ok(vec![])
    }

    fn execute_tool(
        &self,
        ctx: &HandlerContext,
        request_id: &str,
        call_id: &str,
        command: &str,
        arguments: Value,
    ) -> Result<Event> {
        let Some(entry) = ctx.commands.get(command) else {
            return Ok(Event::ToolCallFailed {
                request_id: request_id.to_string(),
                call_id: call_id.to_string(),
                error: format!("no plugin found for command {command}"),
            });
        };

        if let Err(reason) = entry.spec.schema.validate(&arguments) {
            return Ok(Event::ToolCallFailed {
                request_id: request_id.to_string(),
                call_id: call_id.to_string(),
                error: format!("invalid arguments for {command}: {reason}"),
            });
        }

        debug!(%request_id, %call_id, %command, "executing tool call");
        match (entry.spec.handler)(arguments, &ctx.snapshot) {
            Ok(outcome) => {
                if !outcome.events.is_empty() {
                    ctx.publisher.publish(&outcome.events)?;
                }
                Ok(Event::ToolCallCompleted {
                    request_id: request_id.to_string(),
                    call_id: call_id.to_string(),
                    output: outcome.output,
                })
            }
            Err(e) => Ok(Event::ToolCallFailed {
                request_id: request_id.to_string(),
                call_id: call_id.to_string(),
                error: e.to_string(),
            }),
        }
    }

    // ── Finalization ───────────────────────────────────────────

    async fn on_tool_resolved(&self, event: Event, ctx: HandlerContext) -> Result<Vec<Event>> {
        let Some(request_id) = event.request_id().map(str::to_string) else {
            return Ok(vec![]);
        };
        let Some(state) = RequestProjection::state_of(&ctx.snapshot, &request_id) else {
            return Ok(vec![]);
        };

        if state.status.is_terminal() || !state.pending.is_empty() {
            return Ok(vec![]);
        }
        if !self.try_claim(&request_id) {
            debug!(%request_id, "completion already claimed");
            return Ok(vec![]);
        }

        if state.has_failures() {
            // Degraded completion: terminate the saga with the errors
            // spelled out instead of hanging or retrying.
            let mut lines = Vec::new();
            for (call_id, record) in &state.results {
                if let Some(error) = &record.error {
                    lines.push(format!("- {} ({call_id}): {error}", record.command));
                }
            }
            return Ok(vec![Event::RequestCompleted {
                request_id,
                text: format!("Some tool calls failed:\n{}", lines.join("\n")),
                is_error: true,
            }]);
        }

        // Every call succeeded; run the summary turn over the outputs.
        let mut messages = vec![ChatMessage::user(&state.text)];
        for record in state.results.values() {
            let output = record
                .output
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            messages.push(ChatMessage::tool(format!("{}: {output}", record.command)));
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: vec![],
            system: Some(
                "Summarize the tool results into a direct answer to the user's request."
                    .to_string(),
            ),
            request_id: request_id.clone(),
        };

        match self.llm.chat(&request).await {
            Ok(outcome) => Ok(vec![Event::RequestCompleted {
                request_id,
                text: outcome.content,
                is_error: false,
            }]),
            Err(e) => Ok(vec![Event::RequestCompleted {
                request_id,
                text: format!("tool calls succeeded but the final summary failed: {e}"),
                is_error: true,
            }]),
        }
    }

    fn finalize(&self, request_id: &str, text: String, is_error: bool) -> Vec<Event> {
        if !self.try_claim(request_id) {
            debug!(request_id, "completion already claimed");
            return vec![];
        }
        vec![Event::RequestCompleted {
            request_id: request_id.to_string(),
            text,
            is_error,
        }]
    }

    fn try_claim(&self, request_id: &str) -> bool {
        self.finalized.lock().insert(request_id.to_string())
    }
}
