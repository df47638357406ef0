//! Agent loop: screening, provider rounds, metering and tool execution.

use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use switchyard_core::config::{Config, GuardrailMode, ModelConfig};
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::protocol::{MessageAssembler, StreamEvent};
use switchyard_core::types::{
    ContentBlock, Message, Role, StopReason, TokenUsage, ToolResultStatus,
};
use switchyard_guardrails::GuardrailPolicy;
use switchyard_metering::{Charge, UsageMeter};
use switchyard_providers::registry::ProviderRegistry;
use switchyard_providers::{ConverseInput, ConverseProvider, InferenceConfig};
use switchyard_tools::notes::{FileNotesStore, NotesTool};
use switchyard_tools::{ToolContext, ToolOutput, ToolRegistry};

use crate::cache::{apply_plan, plan_cache};
use crate::normalize::normalize_history;
use crate::{AgentEvent, TurnOutcome, TurnRequest};

/// Per-turn settings resolved from the request, catalog and defaults.
struct TurnPlan {
    turn_id: String,
    user_id: String,
    conversation_id: String,
    model: ModelConfig,
    provider: Arc<dyn ConverseProvider>,
    system: Option<String>,
    inference: InferenceConfig,
    stream: bool,
}

/// What one provider round produced.
struct RoundResult {
    message: Message,
    stop_reason: StopReason,
    usage: TokenUsage,
    charge: Charge,
}

/// Runs turns against the configured backends.
pub struct Orchestrator {
    config: Arc<Config>,
    providers: ProviderRegistry,
    tools: ToolRegistry,
    meter: UsageMeter,
    guardrail: Option<Arc<dyn GuardrailPolicy>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderRegistry,
        tools: ToolRegistry,
        meter: UsageMeter,
    ) -> Self {
        Self {
            config,
            providers,
            tools,
            meter,
            guardrail: None,
        }
    }

    pub fn with_guardrail(mut self, policy: Arc<dyn GuardrailPolicy>) -> Self {
        self.guardrail = Some(policy);
        self
    }

    /// Build everything from config: backends, usage store, guardrail and the
    /// built-in notes tool.
    pub async fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let (warnings, errors) = config.validate();
        for warning in &warnings {
            warn!("Config: {warning}");
        }
        if !errors.is_empty() {
            anyhow::bail!("invalid configuration: {}", errors.join("; "));
        }

        let providers = ProviderRegistry::from_config(&config)?;
        let store = switchyard_metering::store_from_config(&config).await?;

        let mut tools = ToolRegistry::new();
        let notes = Arc::new(FileNotesStore::new(config.notes_dir()));
        tools.register(Arc::new(NotesTool::new(notes)));

        let mut orchestrator = Self::new(config.clone(), providers, tools, UsageMeter::new(store));
        if let Some(guardrail) = &config.guardrail {
            orchestrator = orchestrator.with_guardrail(switchyard_guardrails::from_config(guardrail)?);
        }
        info!(
            providers = ?orchestrator.providers.ids(),
            tools = ?orchestrator.tools.list(),
            guardrail = ?orchestrator.guardrail.as_ref().map(|g| g.mode()),
            "Orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Run one turn to completion.
    ///
    /// Events are sent on `events` as the turn progresses. A failure is also
    /// reported as a final [`AgentEvent::Error`]. Firing `cancel` stops the
    /// turn at the next await point; a closed `events` channel fires it.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let result = self.drive(request, &events, &cancel).await;
        if let Err(e) = &result {
            match e {
                SwitchyardError::Cancelled => info!("Turn cancelled"),
                SwitchyardError::QuotaExceeded { .. } | SwitchyardError::GuardrailBlocked { .. } => {
                    info!(kind = %e.kind(), "Turn rejected")
                }
                _ => error!(kind = %e.kind(), error = %e, "Turn failed"),
            }
            let _ = events.send(AgentEvent::Error {
                kind: e.kind(),
                message: e.public_message(),
            });
        }
        result
    }

    fn resolve(&self, request: &TurnRequest) -> Result<TurnPlan> {
        if request.user_id.trim().is_empty() {
            return Err(SwitchyardError::Authorization("Missing user identity".into()));
        }
        match request.messages.last() {
            None => return Err(SwitchyardError::Validation("No messages provided".into())),
            Some(last) if last.role != Role::User => {
                return Err(SwitchyardError::Validation(
                    "The last message must come from the user".into(),
                ));
            }
            Some(_) => {}
        }

        let model_id = request
            .model
            .clone()
            .or_else(|| self.config.default_model())
            .ok_or_else(|| SwitchyardError::Validation("No model selected".into()))?;
        let model = self
            .config
            .model(&model_id)
            .cloned()
            .ok_or_else(|| SwitchyardError::Validation(format!("Unknown model '{model_id}'")))?;
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            SwitchyardError::Config(format!(
                "Model '{}' names unknown provider '{}'",
                model.id, model.provider
            ))
        })?;

        let mut max_tokens = request.max_tokens.unwrap_or_else(|| self.config.max_tokens());
        if let Some(cap) = model.max_output_tokens {
            max_tokens = max_tokens.min(cap);
        }
        let thinking_budget_tokens = request
            .thinking_budget_tokens
            .or_else(|| self.config.thinking_budget_tokens())
            .map(|b| model.max_reasoning_tokens.map_or(b, |cap| b.min(cap)));

        Ok(TurnPlan {
            turn_id: request
                .turn_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: request.user_id.clone(),
            conversation_id: request.conversation_id.clone(),
            provider,
            system: request
                .system
                .clone()
                .or_else(|| self.config.system_prompt().map(String::from)),
            inference: InferenceConfig {
                max_tokens,
                temperature: request.temperature.or_else(|| self.config.temperature()),
                thinking_budget_tokens,
            },
            stream: request.stream.unwrap_or_else(|| self.config.stream()),
            model,
        })
    }

    async fn drive(
        &self,
        request: TurnRequest,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let plan = self.resolve(&request)?;
        info!(
            turn = %plan.turn_id,
            user = %plan.user_id,
            model = %plan.model.id,
            stream = plan.stream,
            "Turn started"
        );
        let _ = events.send(AgentEvent::TurnStart {
            turn_id: plan.turn_id.clone(),
        });

        let mut history = request.messages;
        let mut new_messages = Vec::new();
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut remaining = None;

        if let Some(charge) = self.screen(&plan, &history, events, cancel).await? {
            cost += charge.record.cost;
            remaining = charge.budget.remaining;
        }

        let cache_settings = self.config.cache();
        let specs = self.tools.specs();
        let inline_guardrail = self
            .guardrail
            .as_ref()
            .and_then(|g| g.inline_config(plan.stream));
        let context = ToolContext {
            user_id: plan.user_id.clone(),
            conversation_id: plan.conversation_id.clone(),
        };

        let mut round: u32 = 0;
        let mut tool_calls: u32 = 0;
        let stop_reason = loop {
            round += 1;
            self.meter.ensure_budget(&plan.user_id).await?;

            normalize_history(&mut history);
            let cache_plan = plan_cache(
                &history,
                &plan.model.id,
                plan.model.tier,
                plan.model.supports_cache,
                &cache_settings,
            );
            let mut messages = history.clone();
            apply_plan(&mut messages, &cache_plan);
            let input = ConverseInput {
                model_id: plan.model.backend_model_id().to_string(),
                messages,
                system: plan.system.clone(),
                cache_system: cache_plan.cache_system && plan.system.is_some(),
                tools: specs.clone(),
                cache_tools: cache_plan.cache_tools && !specs.is_empty(),
                inference: plan.inference.clone(),
                guardrail: inline_guardrail.clone(),
            };

            debug!(round, marks = ?cache_plan.message_marks, "Round starting");
            let _ = events.send(AgentEvent::RoundStart { round });

            let result = if plan.stream {
                self.stream_round(&plan, &input, events, cancel).await?
            } else {
                self.buffered_round(&plan, &input, events, cancel).await?
            };

            usage.accumulate(&result.usage);
            cost += result.charge.record.cost;
            remaining = result.charge.budget.remaining;

            let _ = events.send(AgentEvent::Message {
                message: result.message.clone(),
            });
            let calls: Vec<(String, String, Value)> = result
                .message
                .tool_uses()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            history.push(result.message.clone());
            new_messages.push(result.message);

            if result.stop_reason != StopReason::ToolUse || calls.is_empty() {
                break result.stop_reason;
            }
            if self.config.max_rounds().is_some_and(|max| round >= max) {
                warn!(round, "Round limit reached with tool calls pending");
                break result.stop_reason;
            }

            tool_calls += calls.len() as u32;
            let results = self.execute_tools(&calls, &context, events, cancel).await?;
            let message = Message {
                role: Role::User,
                content: results,
            };
            history.push(message.clone());
            new_messages.push(message);
        };

        info!(
            turn = %plan.turn_id,
            rounds = round,
            tool_calls,
            cost,
            stop_reason = ?stop_reason,
            "Turn complete"
        );
        let _ = events.send(AgentEvent::Done {
            turn_id: plan.turn_id.clone(),
            stop_reason,
            rounds: round,
            usage,
            cost,
            remaining,
        });

        Ok(TurnOutcome {
            turn_id: plan.turn_id,
            messages: new_messages,
            stop_reason,
            rounds: round,
            tool_calls,
            usage,
            cost,
            remaining,
        })
    }

    /// Standalone pre-flight screening of the latest user text.
    ///
    /// Every screening pass is charged as its own record. A block ends the
    /// turn before any model call.
    async fn screen(
        &self,
        plan: &TurnPlan,
        history: &[Message],
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<Charge>> {
        let Some(policy) = self.guardrail.as_ref() else {
            return Ok(None);
        };
        if policy.mode() == GuardrailMode::Inline {
            return Ok(None);
        }

        self.meter.ensure_budget(&plan.user_id).await?;
        let text = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default();

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
            verdict = policy.check(&text) => verdict?,
        };

        let charge = self
            .meter
            .record_guardrail(&plan.user_id, Some(&plan.model.id), verdict.cost)
            .await?;
        let _ = events.send(AgentEvent::Usage {
            usage: TokenUsage::default(),
            cost: charge.record.cost,
            remaining: charge.budget.remaining,
        });

        if verdict.blocked {
            info!(
                user = %plan.user_id,
                details = ?verdict.details,
                cost = verdict.cost,
                "Input blocked by guardrail"
            );
            return Err(SwitchyardError::GuardrailBlocked {
                origin: policy.origin(),
                details: verdict.details,
            });
        }
        Ok(Some(charge))
    }

    /// Charge a completed provider call and report it.
    async fn record_round(
        &self,
        plan: &TurnPlan,
        usage: &TokenUsage,
        trace: Option<&Value>,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<Charge> {
        let guardrail_cost = self
            .guardrail
            .as_ref()
            .map_or(0.0, |g| g.cost_from_response(trace));
        let charge = self
            .meter
            .record_inference(
                &plan.user_id,
                &plan.model.id,
                usage,
                &plan.model.pricing,
                guardrail_cost,
            )
            .await?;
        let _ = events.send(AgentEvent::Usage {
            usage: *usage,
            cost: charge.record.cost,
            remaining: charge.budget.remaining,
        });
        Ok(charge)
    }

    async fn stream_round(
        &self,
        plan: &TurnPlan,
        input: &ConverseInput,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<RoundResult> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
            stream = plan.provider.converse_stream(input) => stream?,
        };

        let mut assembler = MessageAssembler::new();
        let mut charge = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            let event = event?;

            if let Err(e) = assembler.apply(&event) {
                warn!(%e, "Skipping stream event");
                continue;
            }
            if let StreamEvent::Metadata { usage, trace, .. } = &event {
                if charge.is_none() {
                    charge = Some(self.record_round(plan, usage, trace.as_ref(), events).await?);
                }
            }
            if events.send(AgentEvent::Stream { event }).is_err() {
                debug!("Event consumer gone, cancelling turn");
                cancel.cancel();
            }
        }

        let usage = assembler.usage().copied().unwrap_or_default();
        let assembled = assembler.finish();
        let stop_reason = assembled.stop_reason.ok_or_else(|| {
            SwitchyardError::Protocol("stream ended before messageStop".into())
        })?;
        let charge = match charge {
            Some(charge) => charge,
            None => {
                warn!("Stream ended without metadata, charging zero tokens");
                self.record_round(plan, &usage, None, events).await?
            }
        };

        Ok(RoundResult {
            message: assembled.message,
            stop_reason,
            usage,
            charge,
        })
    }

    async fn buffered_round(
        &self,
        plan: &TurnPlan,
        input: &ConverseInput,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<RoundResult> {
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
            output = plan.provider.converse(input) => output?,
        };
        let charge = self
            .record_round(plan, &output.usage, output.trace.as_ref(), events)
            .await?;
        Ok(RoundResult {
            message: output.message,
            stop_reason: output.stop_reason,
            usage: output.usage,
            charge,
        })
    }

    /// Invoke every tool call of a round concurrently.
    ///
    /// Results come back in call order. A failing tool yields an error result
    /// for the model instead of failing the turn.
    async fn execute_tools(
        &self,
        calls: &[(String, String, Value)],
        context: &ToolContext,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>> {
        for (id, name, input) in calls {
            info!(tool = %name, tool_use_id = %id, "Executing tool");
            let _ = events.send(AgentEvent::ToolCall {
                tool_use_id: id.clone(),
                tool: name.clone(),
                input: input.clone(),
            });
        }

        let invocations = calls.iter().map(|(id, name, input)| async move {
            let output = match self.tools.invoke(name, input.clone(), context).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %name, %e, "Tool failed");
                    ToolOutput::error(format!("Tool '{name}' failed: {e}"))
                }
            };
            (id, name, output)
        });
        let outputs = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchyardError::Cancelled),
            outputs = join_all(invocations) => outputs,
        };

        Ok(outputs
            .into_iter()
            .map(|(id, name, output)| {
                let _ = events.send(AgentEvent::ToolResult {
                    tool_use_id: id.clone(),
                    tool: name.clone(),
                    content: output.content.clone(),
                    is_error: output.is_error,
                });
                ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: output.content,
                    status: if output.is_error {
                        ToolResultStatus::Error
                    } else {
                        ToolResultStatus::Success
                    },
                }
            })
            .collect())
    }
}
