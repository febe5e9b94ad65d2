//! Tool contract and registry.
//!
//! Tools are polymorphic capability objects behind a narrow interface:
//! schema, metadata, and an `execute` operation returning a structured
//! result. The registry holds a manifest and constructs tools lazily on
//! first use; enumeration never instantiates. Dispatch converts every
//! failure into an `{"error", "kind"}` result map so a bad tool call can
//! never abort a turn.

pub mod file;
pub mod list;
pub mod mail;
pub mod sleep;

pub use file::{ReadFileTool, WriteFileTool};
pub use list::ListDirectoryTool;
pub use mail::{CheckMailTool, ReplyMailTool, SendMailTool};
pub use sleep::{AgentSleepTool, AgentWakeTool};

use crate::mailbox::Mailbox;
use crate::path_guard::PathGuard;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid-arguments",
            Self::NotFound(_) => "tool-not-found",
            Self::PathEscape(_) => "path-escape",
            Self::Execution(_) => "tool-execution",
        }
    }

    /// The structured `{error, kind}` result map the model observes.
    pub fn to_result_value(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        })
    }
}

impl From<crate::path_guard::PathGuardError> for ToolError {
    fn from(err: crate::path_guard::PathGuardError) -> Self {
        match err {
            crate::path_guard::PathGuardError::Escape(path) => Self::PathEscape(path),
            other => Self::Execution(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool contract
// ---------------------------------------------------------------------------

/// Per-invocation context handed to tools. The session interface is
/// injected, never a back-pointer to the manager that owns the agent.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub agent_id: String,
    pub session: Option<Arc<dyn SessionOps>>,
}

impl ToolContext {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: Arc<dyn SessionOps>) -> Self {
        self.session = Some(session);
        self
    }
}

/// Narrow session interface exposed to tools (sleep/wake). Implemented by
/// the session manager.
#[async_trait]
pub trait SessionOps: Send + Sync {
    async fn sleep_agent(
        &self,
        agent_id: &str,
        duration_secs: Option<u64>,
        wake_events: Option<HashSet<String>>,
    ) -> Result<(), String>;

    async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<(), String>;
}

/// A callable exposed to the model by JSON schema. Implementations must be
/// reentrant; instances are shared through the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn category(&self) -> &str;
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }
    /// JSON Schema for `execute` arguments.
    fn parameters_schema(&self) -> serde_json::Value;
    /// Usage documentation embedded into agent prompts.
    fn prompt_instructions(&self) -> String {
        format!("{}: {}", self.name(), self.description())
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Check arguments against a schema's `required` list. Tools call this
/// before touching their parameters.
pub fn validate_required(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), ToolError> {
    let map = arguments
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments("arguments must be an object".into()))?;
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !map.contains_key(key) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required parameter '{key}'"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared construction dependencies for builtin tools.
#[derive(Clone)]
pub struct ToolDeps {
    pub path_guard: Arc<PathGuard>,
    pub mailbox: Arc<Mailbox>,
}

type ToolCtor = Box<dyn Fn(&ToolDeps) -> Arc<dyn Tool> + Send + Sync>;

/// Manifest entry: everything needed to describe a tool without building it.
pub struct ToolSpec {
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
    pub description: String,
    ctor: ToolCtor,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        tags: &[&str],
        description: impl Into<String>,
        ctor: impl Fn(&ToolDeps) -> Arc<dyn Tool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: description.into(),
            ctor: Box::new(ctor),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolMetadata {
    pub name: String,
    pub category: String,
    pub tags: Vec<String>,
    pub description: String,
}

/// Enumeration filter; empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub category: Option<String>,
    pub tag: Option<String>,
}

/// Tools always exposed to external clients regardless of custom selection.
pub const CORE_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "list_directory",
    "send_mail",
    "check_mail",
];

pub struct ToolRegistry {
    deps: ToolDeps,
    specs: Vec<ToolSpec>,
    cache: Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new(deps: ToolDeps) -> Self {
        Self {
            deps,
            specs: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the builtin tool manifest.
    pub fn with_builtin_tools(deps: ToolDeps) -> Self {
        let mut registry = Self::new(deps);
        for spec in builtin_specs() {
            registry.register(spec);
        }
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        debug!(tool = %spec.name, "registered tool spec");
        self.specs.push(spec);
    }

    /// Instantiate (or fetch the cached instance of) a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(tool) = cache.get(name) {
                return Some(tool.clone());
            }
        }
        let spec = self.specs.iter().find(|s| s.name == name)?;
        let tool = (spec.ctor)(&self.deps);
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), tool.clone());
        Some(tool)
    }

    /// Metadata for matching tools, without instantiating any of them.
    pub fn enumerate(&self, filter: &ToolFilter) -> Vec<ToolMetadata> {
        self.specs
            .iter()
            .filter(|spec| {
                filter
                    .category
                    .as_ref()
                    .map(|c| &spec.category == c)
                    .unwrap_or(true)
                    && filter
                        .tag
                        .as_ref()
                        .map(|t| spec.tags.contains(t))
                        .unwrap_or(true)
            })
            .map(|spec| ToolMetadata {
                name: spec.name.clone(),
                category: spec.category.clone(),
                tags: spec.tags.clone(),
                description: spec.description.clone(),
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Model-facing definitions for every registered tool. With `strict`,
    /// `additionalProperties:false` and `function.strict` are injected.
    pub fn openrouter_definitions(&self, strict: bool) -> Vec<serde_json::Value> {
        self.specs
            .iter()
            .filter_map(|spec| self.get(&spec.name))
            .map(|tool| tool_definition(tool.as_ref(), strict))
            .collect()
    }

    /// Definitions filtered for an external client. Internal agents always
    /// see all tools; this filter is advisory only.
    pub fn external_definitions(
        &self,
        settings: &ToolExposureSettings,
        strict: bool,
    ) -> Vec<serde_json::Value> {
        if settings.all_tools_enabled {
            return self.openrouter_definitions(strict);
        }
        let allowed: HashSet<&str> = CORE_TOOLS
            .iter()
            .copied()
            .chain(settings.custom_tools.iter().map(String::as_str))
            .collect();
        self.specs
            .iter()
            .filter(|spec| allowed.contains(spec.name.as_str()))
            .filter_map(|spec| self.get(&spec.name))
            .map(|tool| tool_definition(tool.as_ref(), strict))
            .collect()
    }

    /// Execute a tool by name, validating arguments and converting every
    /// failure into a structured `{error}` result.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> serde_json::Value {
        let Some(tool) = self.get(name) else {
            return ToolError::NotFound(name.to_string()).to_result_value();
        };
        if let Err(err) = validate_required(&tool.parameters_schema(), &arguments) {
            return err.to_result_value();
        }
        match tool.execute(arguments, ctx).await {
            Ok(result) => result,
            Err(err) => {
                warn!(tool = name, error = %err, "tool execution failed");
                err.to_result_value()
            }
        }
    }
}

fn tool_definition(tool: &dyn Tool, strict: bool) -> serde_json::Value {
    let mut parameters = tool.parameters_schema();
    if strict {
        if let Some(obj) = parameters.as_object_mut() {
            obj.insert("additionalProperties".to_string(), serde_json::json!(false));
        }
    }
    let mut function = serde_json::json!({
        "name": tool.name(),
        "description": tool.description(),
        "parameters": parameters,
    });
    if strict {
        function["strict"] = serde_json::json!(true);
    }
    serde_json::json!({
        "type": "function",
        "function": function,
    })
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "read_file",
            "file",
            &["filesystem"],
            "Read a file's contents from the workspace",
            |deps| Arc::new(ReadFileTool::new(deps.path_guard.clone())),
        ),
        ToolSpec::new(
            "write_file",
            "file",
            &["filesystem"],
            "Write content to a workspace file",
            |deps| Arc::new(WriteFileTool::new(deps.path_guard.clone())),
        ),
        ToolSpec::new(
            "list_directory",
            "file",
            &["filesystem"],
            "List directory contents within the workspace",
            |deps| Arc::new(ListDirectoryTool::new(deps.path_guard.clone())),
        ),
        ToolSpec::new(
            "send_mail",
            "communication",
            &["mailbox"],
            "Send a mail message to another agent or the user",
            |deps| Arc::new(SendMailTool::new(deps.mailbox.clone())),
        ),
        ToolSpec::new(
            "check_mail",
            "communication",
            &["mailbox"],
            "Check your mailbox for unread messages",
            |deps| Arc::new(CheckMailTool::new(deps.mailbox.clone())),
        ),
        ToolSpec::new(
            "reply_mail",
            "communication",
            &["mailbox"],
            "Reply to a mail message",
            |deps| Arc::new(ReplyMailTool::new(deps.mailbox.clone())),
        ),
        ToolSpec::new(
            "agent_sleep",
            "session",
            &["lifecycle"],
            "Put yourself to sleep until a timer expires or a wake event fires",
            |_| Arc::new(AgentSleepTool::new()),
        ),
        ToolSpec::new(
            "agent_wake",
            "session",
            &["lifecycle"],
            "Wake a sleeping agent",
            |_| Arc::new(AgentWakeTool::new()),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Exposure settings for external clients
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub action: String,
    pub detail: String,
}

/// Persisted per-client tool exposure. When `all_tools_enabled` is false,
/// external clients see the union of the core set and `custom_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExposureSettings {
    pub all_tools_enabled: bool,
    #[serde(default)]
    pub custom_tools: Vec<String>,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
}

impl Default for ToolExposureSettings {
    fn default() -> Self {
        Self {
            all_tools_enabled: false,
            custom_tools: Vec::new(),
            audit_trail: Vec::new(),
        }
    }
}

impl ToolExposureSettings {
    /// Default on-disk location: `~/.aiwhisperer/claude_tools_settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".aiwhisperer").join("claude_tools_settings.json"))
    }

    pub fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "invalid tool settings file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, serialized)
    }

    pub fn set_all_tools_enabled(&mut self, enabled: bool, detail: impl Into<String>) {
        self.all_tools_enabled = enabled;
        self.audit(
            if enabled { "enable_all_tools" } else { "disable_all_tools" },
            detail,
        );
    }

    pub fn set_custom_tools(&mut self, tools: Vec<String>, detail: impl Into<String>) {
        self.custom_tools = tools;
        self.audit("set_custom_tools", detail);
    }

    fn audit(&mut self, action: &str, detail: impl Into<String>) {
        self.audit_trail.push(AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            detail: detail.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let deps = ToolDeps {
            path_guard: Arc::new(PathGuard::new(dir.path()).unwrap()),
            mailbox: Arc::new(Mailbox::new()),
        };
        (dir, ToolRegistry::with_builtin_tools(deps))
    }

    #[test]
    fn enumerate_does_not_instantiate() {
        let (_dir, registry) = registry();
        let all = registry.enumerate(&ToolFilter::default());
        assert!(all.iter().any(|m| m.name == "read_file"));
        assert!(registry.cache.lock().unwrap().is_empty());
    }

    #[test]
    fn get_caches_instances() {
        let (_dir, registry) = registry();
        let first = registry.get("read_file").unwrap();
        let second = registry.get("read_file").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get("no_such_tool").is_none());
    }

    #[test]
    fn enumerate_filters_by_category_and_tag() {
        let (_dir, registry) = registry();
        let files = registry.enumerate(&ToolFilter {
            category: Some("file".into()),
            tag: None,
        });
        assert!(files.iter().all(|m| m.category == "file"));
        let mailbox_tools = registry.enumerate(&ToolFilter {
            category: None,
            tag: Some("mailbox".into()),
        });
        assert_eq!(mailbox_tools.len(), 3);
    }

    #[test]
    fn strict_definitions_close_schemas() {
        let (_dir, registry) = registry();
        let defs = registry.openrouter_definitions(true);
        for def in &defs {
            assert_eq!(def["type"], "function");
            assert_eq!(def["function"]["strict"], true);
            assert_eq!(def["function"]["parameters"]["additionalProperties"], false);
        }
        let relaxed = registry.openrouter_definitions(false);
        assert!(relaxed[0]["function"].get("strict").is_none());
    }

    #[test]
    fn external_filter_unions_core_and_custom() {
        let (_dir, registry) = registry();
        let settings = ToolExposureSettings {
            all_tools_enabled: false,
            custom_tools: vec!["agent_sleep".into()],
            audit_trail: Vec::new(),
        };
        let defs = registry.external_definitions(&settings, false);
        let names: Vec<&str> = defs
            .iter()
            .map(|d| d["function"]["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"agent_sleep"));
        assert!(!names.contains(&"agent_wake"));

        let all = ToolExposureSettings {
            all_tools_enabled: true,
            ..Default::default()
        };
        assert_eq!(
            registry.external_definitions(&all, false).len(),
            registry.tool_names().len()
        );
    }

    #[test]
    fn exposure_changes_append_audit_entries() {
        let mut settings = ToolExposureSettings::default();
        settings.set_all_tools_enabled(true, "operator request");
        settings.set_custom_tools(vec!["read_file".into()], "narrowed");
        assert_eq!(settings.audit_trail.len(), 2);
        assert_eq!(settings.audit_trail[0].action, "enable_all_tools");
    }

    #[test]
    fn exposure_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/settings.json");
        let mut settings = ToolExposureSettings::default();
        settings.set_custom_tools(vec!["write_file".into()], "test");
        settings.save(&path).unwrap();

        let loaded = ToolExposureSettings::load(&path);
        assert_eq!(loaded.custom_tools, vec!["write_file".to_string()]);
        assert_eq!(loaded.audit_trail.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_returns_error_map() {
        let (_dir, registry) = registry();
        let result = registry
            .dispatch("bogus", serde_json::json!({}), &ToolContext::for_agent("a"))
            .await;
        assert_eq!(result["kind"], "tool-not-found");
    }

    #[tokio::test]
    async fn dispatch_validates_required_parameters() {
        let (_dir, registry) = registry();
        let result = registry
            .dispatch("read_file", serde_json::json!({}), &ToolContext::for_agent("a"))
            .await;
        assert_eq!(result["kind"], "invalid-arguments");
    }
}
