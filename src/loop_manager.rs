//! Per-agent AI loop index.
//!
//! Each agent gets its own loop bound to its own chat service, configured
//! with that agent's model and generation parameters. The service factory
//! is injectable so tests can run loops against a mock backend.

use crate::ai_loop::{AiLoop, AiLoopConfig, LoopHandle};
use crate::config::GenerationParams;
use crate::service::{AiServiceConfig, ChatService, OpenRouterService};
use crate::tools::ToolRegistry;
use crate::types::NotificationSender;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Per-agent overrides for model and generation parameters.
#[derive(Debug, Clone, Default)]
pub struct AgentAiConfig {
    pub model: Option<String>,
    pub params: Option<GenerationParams>,
}

pub type ServiceFactory =
    Box<dyn Fn(&str, &GenerationParams) -> Arc<dyn ChatService> + Send + Sync>;

struct LoopEntry {
    ai_loop: Arc<tokio::sync::Mutex<AiLoop>>,
    handle: LoopHandle,
    model: String,
}

pub struct AiLoopManager {
    defaults: AiServiceConfig,
    registry: Arc<ToolRegistry>,
    notifications: NotificationSender,
    max_iterations: usize,
    service_factory: ServiceFactory,
    loops: Mutex<HashMap<String, LoopEntry>>,
}

impl AiLoopManager {
    pub fn new(
        defaults: AiServiceConfig,
        registry: Arc<ToolRegistry>,
        notifications: NotificationSender,
        max_iterations: usize,
    ) -> Self {
        let factory_defaults = defaults.clone();
        Self {
            defaults,
            registry,
            notifications,
            max_iterations,
            service_factory: Box::new(move |model, params| {
                let mut config = factory_defaults.clone();
                config.model = model.to_string();
                config.params = params.clone();
                Arc::new(OpenRouterService::new(config))
            }),
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the backend factory (used by tests to run against mocks).
    pub fn with_service_factory(mut self, factory: ServiceFactory) -> Self {
        self.service_factory = factory;
        self
    }

    /// The loop for an agent, creating it on first use with the agent's own
    /// service.
    pub fn get_or_create(
        &self,
        agent_id: &str,
        agent_config: Option<&AgentAiConfig>,
    ) -> Arc<tokio::sync::Mutex<AiLoop>> {
        let mut loops = self.loops.lock().unwrap();
        if let Some(entry) = loops.get(agent_id) {
            return entry.ai_loop.clone();
        }

        let model = agent_config
            .and_then(|c| c.model.clone())
            .unwrap_or_else(|| self.defaults.model.clone());
        let params = agent_config
            .and_then(|c| c.params.clone())
            .unwrap_or_else(|| self.defaults.params.clone());

        debug!(agent_id, model = %model, "creating AI loop");
        let service = (self.service_factory)(&model, &params);
        let mut loop_config = AiLoopConfig::new(agent_id);
        loop_config.max_iterations = self.max_iterations;
        let ai_loop = AiLoop::new(
            loop_config,
            service,
            self.registry.clone(),
            self.notifications.clone(),
        );
        let handle = ai_loop.handle();
        let ai_loop = Arc::new(tokio::sync::Mutex::new(ai_loop));
        loops.insert(
            agent_id.to_string(),
            LoopEntry {
                ai_loop: ai_loop.clone(),
                handle,
                model,
            },
        );
        ai_loop
    }

    /// Control handle for a live loop, usable while the loop is busy.
    pub fn handle(&self, agent_id: &str) -> Option<LoopHandle> {
        self.loops
            .lock()
            .unwrap()
            .get(agent_id)
            .map(|entry| entry.handle.clone())
    }

    /// agent id → model, derived from the live index.
    pub fn active_models(&self) -> HashMap<String, String> {
        self.loops
            .lock()
            .unwrap()
            .iter()
            .map(|(agent_id, entry)| (agent_id.clone(), entry.model.clone()))
            .collect()
    }

    /// Drop an agent's loop, shutting it down first.
    pub fn remove(&self, agent_id: &str) {
        if let Some(entry) = self.loops.lock().unwrap().remove(agent_id) {
            entry.handle.shutdown();
        }
    }
}
