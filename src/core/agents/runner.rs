//! Executes one agent task: memory-aware prompt assembly, the model call,
//! consult-directive detection, bounded recursive delegation with cycle
//! refusal, and consolidation of child answers into the final text.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::agents::{AgentRecord, AgentRegistry, MULTI_AGENT};
use crate::core::compact;
use crate::core::memory::{MemoryLog, to_chat_messages};
use crate::core::model::{ChatMessage, CompletionRequest, ModelClient};
use crate::core::orchestrator::types::{Task, TaskState};
use crate::core::signal::{CancelSignal, Deadline, now_epoch};
use crate::core::signing::{issue_internal_bearer, verify_internal_bearer};
use crate::core::store::{Role, Store};
use crate::error::{EngineError, Result};

static CONSULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<consult\s+agent\s*=\s*["']([A-Za-z_]+)["']\s*>([\s\S]*?)</consult>"#)
        .expect("consult pattern compiles")
});

/// Strip consult tags from untrusted text before it re-enters a prompt.
/// Child outputs and webhook payloads must never be able to smuggle a
/// directive into the next model call.
pub fn sanitize_consult_tags(text: &str) -> String {
    CONSULT_RE
        .replace_all(text, "[consult directive removed]")
        .to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunOutcome {
    pub text: String,
    /// Child task ids, in execution order.
    pub delegations: Vec<String>,
    pub used_model: String,
}

struct Directive {
    callee: String,
    sub_prompt: String,
}

pub struct AgentRunner {
    registry: Arc<AgentRegistry>,
    model: Arc<ModelClient>,
    memory: Arc<MemoryLog>,
    store: Arc<dyn Store>,
    settings: Settings,
}

impl AgentRunner {
    pub fn new(
        registry: Arc<AgentRegistry>,
        model: Arc<ModelClient>,
        memory: Arc<MemoryLog>,
        store: Arc<dyn Store>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            model,
            memory,
            store,
            settings,
        }
    }

    /// Worker entry point. Reconstructs the delegation stack from the
    /// parent chain so depth and cycle checks survive requeues.
    pub async fn run_task(
        &self,
        task: &Task,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<RunOutcome> {
        let stack = self.call_stack_for(task).await?;
        self.run(task, stack.len(), &stack, cancel, deadline).await
    }

    async fn call_stack_for(&self, task: &Task) -> Result<Vec<String>> {
        let mut stack = Vec::new();
        let mut current = task.parent_id.clone();
        while let Some(parent_id) = current {
            if stack.len() > self.settings.max_depth + 1 {
                break;
            }
            let parent = self.store.get_task(&parent_id).await?;
            stack.push(parent.agent_id.clone());
            current = parent.parent_id;
        }
        stack.reverse();
        Ok(stack)
    }

    async fn run(
        &self,
        task: &Task,
        depth: usize,
        stack: &[String],
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<RunOutcome> {
        cancel.check()?;
        deadline.check()?;

        let agent = self.registry.get(&task.agent_id)?.clone();
        info!(task = %task.id, agent = %agent.id, depth, "agent run starting");

        // Delegated calls carry a short-lived bearer addressed to the
        // callee; reject envelopes that were tampered with or replayed
        // late.
        if let Some(token) = task.inputs.get("bearer").and_then(|t| t.as_str()) {
            verify_internal_bearer(&self.settings.internal_bearer_key, token, &agent.id)?;
        }

        if agent.id == MULTI_AGENT {
            return self.run_multi(task, &agent, depth, stack, cancel, deadline).await;
        }

        // Conversation context is assembled before the new prompt lands in
        // the log, then the prompt is appended so the next turn sees it.
        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(conversation) = &task.conversation_id {
            let view = self
                .memory
                .summarise_if_over(
                    conversation,
                    &self.model,
                    self.settings.model_for("assistant"),
                    cancel,
                    deadline,
                )
                .await?;
            messages.extend(to_chat_messages(&view));
        }

        let prompt_text = prompt_from_inputs(&task.inputs)?;
        if let Some(context) = task.inputs.get("context").filter(|c| c.is_object()) {
            messages.push(ChatMessage::new(
                "system",
                format!("Context:\n{}", compact::encode(context)?),
            ));
        }
        messages.push(ChatMessage::new("user", prompt_text.clone()));

        if let Some(conversation) = &task.conversation_id {
            self.memory
                .append(conversation, Role::User, None, &prompt_text)
                .await?;
        }

        let delegation_open = agent.can_delegate && depth < self.settings.max_depth;
        let completion = self
            .model
            .complete(
                &task.requester_id,
                &CompletionRequest {
                    agent_id: agent.id.clone(),
                    model: self.settings.model_for(&agent.id).to_string(),
                    system: self.registry.system_prompt(&agent, delegation_open),
                    messages,
                    temperature: agent.temperature,
                    max_tokens: agent.max_tokens,
                    timeout: self.settings.model_timeout_for(agent.extended_timeout),
                },
                cancel,
                deadline,
            )
            .await?;

        let directives = parse_directives(&completion.text);
        let mut caller_text = strip_directives(&completion.text);
        let mut notes: Vec<String> = Vec::new();
        let mut accepted: Vec<Directive> = Vec::new();

        if !directives.is_empty() && !delegation_open {
            warn!(task = %task.id, "delegation closed at depth {depth}, directives ignored");
            caller_text.push_str(&format!(
                "\n\n[delegation limit reached: {} consult request(s) were not executed]",
                directives.len()
            ));
        } else {
            for directive in directives {
                if !self.registry.contains(&directive.callee) {
                    notes.push(format!(
                        "Consult dropped: no agent named {}.",
                        directive.callee
                    ));
                } else if !agent.peers.contains(&directive.callee) {
                    notes.push(format!(
                        "Consult dropped: {} is not on {}'s consult list.",
                        directive.callee, agent.display_name
                    ));
                } else if stack.contains(&directive.callee) || directive.callee == agent.id {
                    // Cycle: the callee is already answering this request.
                    notes.push(format!(
                        "Delegation refused: {} is already part of this request chain.",
                        directive.callee
                    ));
                } else {
                    accepted.push(directive);
                }
            }
        }

        let mut delegations = Vec::new();
        let mut child_sections = Vec::new();
        if !accepted.is_empty() {
            let awaiting = self
                .store
                .cas_task_state(&task.id, TaskState::Running, TaskState::AwaitingChild, None)
                .await?;

            let mut child_stack = stack.to_vec();
            child_stack.push(agent.id.clone());

            for directive in &accepted {
                cancel.check()?;
                let section = self
                    .run_child(task, &agent, directive, depth + 1, &child_stack, cancel, deadline)
                    .await?;
                if let Some((child_id, label, text)) = section {
                    delegations.push(child_id);
                    child_sections.push((label, text));
                }
            }

            if awaiting {
                self.store
                    .cas_task_state(&task.id, TaskState::AwaitingChild, TaskState::Running, None)
                    .await?;
            }
        }

        let final_text = if child_sections.is_empty() && notes.is_empty() {
            caller_text
        } else {
            self.consolidate(
                task,
                &agent,
                &prompt_text,
                &caller_text,
                &child_sections,
                &notes,
                cancel,
                deadline,
            )
            .await?
        };

        if let Some(conversation) = &task.conversation_id {
            self.memory
                .append(conversation, Role::Assistant, Some(&agent.id), &final_text)
                .await?;
        }

        info!(
            task = %task.id,
            agent = %agent.id,
            children = delegations.len(),
            "agent run complete"
        );
        Ok(RunOutcome {
            text: final_text,
            delegations,
            used_model: completion.model,
        })
    }

    /// Run one accepted consult as a child task. Returns the consolidation
    /// section, or the child's error text in its place; only a
    /// `require_children` agent escalates child failure.
    #[allow(clippy::too_many_arguments)]
    async fn run_child(
        &self,
        parent: &Task,
        agent: &AgentRecord,
        directive: &Directive,
        depth: usize,
        stack: &[String],
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<Option<(String, String, String)>> {
        let callee = self.registry.get(&directive.callee)?;
        let framed = format!(
            "[INTER-AGENT REQUEST]\nFrom: {} ({})\nTo: {} ({})\n\n{} is asking for your \
             input:\n{}\n\nAnswer with a clear, concise assessment from your own domain.",
            agent.display_name,
            agent.id,
            callee.display_name,
            callee.id,
            agent.display_name,
            directive.sub_prompt.trim(),
        );
        let bearer = issue_internal_bearer(
            &self.settings.internal_bearer_key,
            &agent.id,
            &directive.callee,
            60,
        );
        let child = Task::new(
            &parent.requester_id,
            &directive.callee,
            json!({ "prompt": framed, "bearer": bearer }),
        )
        .with_parent(&parent.id);
        self.store.insert_task(&child).await?;
        self.store
            .cas_task_state(&child.id, TaskState::Queued, TaskState::Running, None)
            .await?;

        let outcome = Box::pin(self.run(&child, depth, stack, cancel, deadline)).await;
        let label = format!("{} ({})", callee.display_name, callee.id);
        match outcome {
            Ok(result) => {
                self.store
                    .set_task_output(
                        &child.id,
                        Some(&serde_json::to_string(&result)?),
                        None,
                        Some(now_epoch()),
                    )
                    .await?;
                self.store
                    .cas_task_state(&child.id, TaskState::Running, TaskState::Completed, None)
                    .await?;
                Ok(Some((child.id, label, sanitize_consult_tags(&result.text))))
            }
            Err(EngineError::Cancelled) => {
                self.store
                    .set_task_output(
                        &child.id,
                        None,
                        Some(&error_record(&EngineError::Cancelled)),
                        Some(now_epoch()),
                    )
                    .await?;
                self.store
                    .cas_task_state(&child.id, TaskState::Running, TaskState::Cancelled, None)
                    .await?;
                Err(EngineError::Cancelled)
            }
            Err(e) => {
                warn!(child = %child.id, callee = %directive.callee, "child task failed: {e}");
                self.store
                    .set_task_output(
                        &child.id,
                        None,
                        Some(&error_record(&e)),
                        Some(now_epoch()),
                    )
                    .await?;
                self.store
                    .cas_task_state(&child.id, TaskState::Running, TaskState::Failed, None)
                    .await?;
                if agent.require_children {
                    return Err(e);
                }
                Ok(Some((
                    child.id,
                    label,
                    format!("[consult failed] {e}"),
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consolidate(
        &self,
        task: &Task,
        agent: &AgentRecord,
        original_prompt: &str,
        caller_text: &str,
        child_sections: &[(String, String)],
        notes: &[String],
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<String> {
        let mut body = format!(
            "The user asked:\n{original_prompt}\n\nYour draft response:\n{caller_text}\n"
        );
        for (label, text) in child_sections {
            body.push_str(&format!("\nInput from {label}:\n{text}\n"));
        }
        for note in notes {
            body.push_str(&format!("\nSystem note: {note}\n"));
        }
        body.push_str(
            "\nProduce your final response, folding the teammate input into your own \
             assessment.",
        );

        let system = format!(
            "You are {}, consolidating teammate input into your final answer. Merge your \
             draft and the teammate sections into one coherent response in your own voice. \
             Keep every concrete number, caveat, and commitment. Do not describe the \
             consultation mechanics.",
            agent.display_name
        );
        let completion = self
            .model
            .complete(
                &task.requester_id,
                &CompletionRequest {
                    agent_id: agent.id.clone(),
                    model: self.settings.model_for(&agent.id).to_string(),
                    system,
                    messages: vec![ChatMessage::new("user", body)],
                    temperature: agent.temperature,
                    max_tokens: agent.max_tokens,
                    timeout: self.settings.model_timeout_for(agent.extended_timeout),
                },
                cancel,
                deadline,
            )
            .await?;
        Ok(completion.text)
    }

    /// The multi-agent pseudo-agent: run every listed teammate in the
    /// given order, then consolidate. The single-mention case never gets
    /// here; the orchestrator routes it directly.
    async fn run_multi(
        &self,
        task: &Task,
        agent: &AgentRecord,
        depth: usize,
        stack: &[String],
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<RunOutcome> {
        let prompt_text = prompt_from_inputs(&task.inputs)?;
        let listed: Vec<String> = task
            .inputs
            .get("agents")
            .and_then(|a| a.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        if listed.is_empty() {
            return Err(EngineError::BadRequest(
                "multi-agent request names no agents".into(),
            ));
        }

        let mut child_stack = stack.to_vec();
        child_stack.push(agent.id.clone());

        let mut delegations = Vec::new();
        let mut child_sections = Vec::new();
        let mut notes = Vec::new();
        for callee_id in &listed {
            cancel.check()?;
            if !agent.peers.contains(callee_id) {
                notes.push(format!("Consult dropped: {callee_id} is not available."));
                continue;
            }
            let directive = Directive {
                callee: callee_id.clone(),
                sub_prompt: prompt_text.clone(),
            };
            if let Some((child_id, label, text)) = self
                .run_child(task, agent, &directive, depth + 1, &child_stack, cancel, deadline)
                .await?
            {
                delegations.push(child_id);
                child_sections.push((label, text));
            }
        }
        if child_sections.is_empty() {
            return Err(EngineError::BadRequest(
                "multi-agent request matched no runnable agents".into(),
            ));
        }

        let final_text = self
            .consolidate(
                task,
                agent,
                &prompt_text,
                "(relaying teammate answers)",
                &child_sections,
                &notes,
                cancel,
                deadline,
            )
            .await?;

        if let Some(conversation) = &task.conversation_id {
            self.memory
                .append(conversation, Role::User, None, &prompt_text)
                .await?;
            self.memory
                .append(conversation, Role::Assistant, Some(&agent.id), &final_text)
                .await?;
        }

        Ok(RunOutcome {
            text: final_text,
            delegations,
            used_model: self.settings.model_for(MULTI_AGENT).to_string(),
        })
    }
}

fn prompt_from_inputs(inputs: &Value) -> Result<String> {
    match inputs.get("prompt").and_then(|p| p.as_str()) {
        Some(p) if !p.trim().is_empty() => Ok(p.to_string()),
        _ => compact::encode(inputs),
    }
}

/// Serialized error for the task record: kind tag plus message.
pub fn error_record(e: &EngineError) -> String {
    json!({ "kind": e.kind(), "message": e.to_string() }).to_string()
}

fn parse_directives(text: &str) -> Vec<Directive> {
    CONSULT_RE
        .captures_iter(text)
        .map(|cap| Directive {
            callee: cap[1].to_lowercase(),
            sub_prompt: cap[2].trim().to_string(),
        })
        .collect()
}

fn strip_directives(text: &str) -> String {
    CONSULT_RE.replace_all(text, "").trim().to_string()
}
