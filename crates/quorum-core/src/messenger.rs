//! Agent-facing messaging facade.
//!
//! Wraps the subsystem services with the agent id bound, so agent code
//! reads as intent (`messenger.ask(...)`) rather than plumbing. Creating a
//! messenger registers a heartbeat and subscribes the agent to `general`.

use std::time::Duration;

use serde_json::Value;

use crate::broker::{Message, MessageBroker, MessageKind, Submit};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::jobs::{JobBoard, Task, TaskStatus};
use crate::registry::{AgentHealth, AgentRegistry, AgentState};

/// Messaging interface bound to one agent.
pub struct AgentMessenger {
    agent_id: String,
    broker: MessageBroker,
    board: JobBoard,
    registry: AgentRegistry,
}

impl AgentMessenger {
    pub(crate) fn connect(coordinator: &Coordinator, agent_id: String) -> Result<Self> {
        let registry = coordinator.registry();
        registry.heartbeat(&agent_id, AgentState::Active, None)?;
        registry.subscribe(&agent_id, "general")?;

        Ok(Self {
            agent_id,
            broker: coordinator.broker(),
            board: coordinator.board(),
            registry,
        })
    }

    /// This messenger's agent id.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Sends a direct message (fire and forget). Returns the message id.
    pub fn send(&self, to: &str, kind: MessageKind, payload: Value) -> Result<String> {
        Ok(self.broker.submit(Submit::direct(self.agent_id.as_str(), to, kind, payload))?)
    }

    /// Broadcasts on a channel. Returns the message id.
    pub fn broadcast(&self, kind: MessageKind, payload: Value, channel: &str) -> Result<String> {
        Ok(self
            .broker
            .submit(Submit::broadcast(self.agent_id.as_str(), kind, payload).on_channel(channel))?)
    }

    /// Submits with full control over the envelope.
    pub fn submit(&self, submit: Submit) -> Result<String> {
        Ok(self.broker.submit(submit)?)
    }

    /// Returns pending messages on every subscribed channel.
    pub fn receive(&self, limit: usize) -> Result<Vec<Message>> {
        let channels = self.registry.channels(&self.agent_id)?;
        Ok(self.broker.peek(&self.agent_id, &channels, limit)?)
    }

    /// Like [`receive`](Self::receive), filtered by message kind.
    pub fn receive_kind(&self, kind: &MessageKind, limit: usize) -> Result<Vec<Message>> {
        let channels = self.registry.channels(&self.agent_id)?;
        Ok(self.broker.peek_filtered(&self.agent_id, &channels, limit, Some(kind))?)
    }

    /// Claims a message for processing.
    pub fn claim(&self, message_id: &str) -> Result<bool> {
        Ok(self.broker.claim(&self.agent_id, message_id)?)
    }

    /// Completes a claimed message; pass an error to mark it failed.
    pub fn complete(&self, message_id: &str, error: Option<&str>) -> Result<()> {
        Ok(self.broker.complete(message_id, error)?)
    }

    /// Dismisses a broadcast without processing it.
    pub fn dismiss(&self, message_id: &str) -> Result<bool> {
        Ok(self.broker.dismiss(&self.agent_id, message_id)?)
    }

    /// Sends a request and waits for the correlated response payload.
    pub fn ask(
        &self,
        to: &str,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        Ok(self.broker.ask(&self.agent_id, to, kind, payload, timeout)?)
    }

    /// Replies to a claimed request and completes it.
    pub fn reply(&self, inbound: &Message, payload: Value) -> Result<String> {
        Ok(self.broker.reply(inbound, payload)?)
    }

    /// Subscribes to a channel.
    pub fn subscribe(&self, channel: &str) -> Result<()> {
        Ok(self.registry.subscribe(&self.agent_id, channel)?)
    }

    /// Unsubscribes from a channel.
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        Ok(self.registry.unsubscribe(&self.agent_id, channel)?)
    }

    /// The channels this agent is subscribed to.
    pub fn channels(&self) -> Result<Vec<String>> {
        Ok(self.registry.channels(&self.agent_id)?)
    }

    /// Sends a heartbeat.
    pub fn heartbeat(&self, status: AgentState, current_task: Option<&str>) -> Result<()> {
        Ok(self.registry.heartbeat(&self.agent_id, status, current_task)?)
    }

    /// This agent's health row.
    pub fn health(&self) -> Result<AgentHealth> {
        Ok(self.registry.health(&self.agent_id)?)
    }

    /// Tasks currently available to this agent.
    pub fn available_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.board.available(Some(&self.agent_id))?)
    }

    /// Claims a task from the job board.
    pub fn claim_task(&self, task_id: &str) -> Result<()> {
        Ok(self.board.claim(&self.agent_id, task_id)?)
    }

    /// Moves a claimed task through its lifecycle.
    pub fn update_task(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        Ok(self.board.update(task_id, status, &self.agent_id)?)
    }

    /// Completes a task with a result summary.
    pub fn complete_task(&self, task_id: &str, result: &str) -> Result<()> {
        Ok(self.board.complete(task_id, result)?)
    }

    /// Fails a task with an error.
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        Ok(self.board.fail(task_id, error)?)
    }
}
