//! Host-supplied handlers: in-process tools, lifecycle hooks, and the
//! permission callback.
//!
//! A [`HandlerRegistry`] is assembled once with a [`HandlerRegistryBuilder`]
//! and then shared read-only by `Arc` for the lifetime of a session.  Hook
//! callbacks receive wire ids (`hook_0`, `hook_1`, …) in registration order;
//! those ids are advertised to the agent during `initialize` and come back in
//! `hook_callback` requests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::models::hook::{HookContext, HookEvent, HookOutput};
use crate::models::permission::{PermissionContext, PermissionDecision, PermissionRequest};
use crate::models::tool::{ToolContext, ToolOutput};
use crate::{AppError, Result};

/// Error type host handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by every handler trait.
pub type HandlerFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, BoxError>> + Send + 'a>>;

// ── Handler traits ───────────────────────────────────────────────────────────

/// Executes one in-process tool.
pub trait ToolHandler: Send + Sync {
    /// Run the tool with the agent-supplied `input`.
    ///
    /// # Errors
    ///
    /// Any error becomes an error control response for this call only.
    fn call(&self, input: Value, ctx: ToolContext) -> HandlerFuture<'_, ToolOutput>;
}

/// Reacts to a lifecycle event.
pub trait HookHandler: Send + Sync {
    /// Inspect the event `input` and optionally return a directive.
    ///
    /// # Errors
    ///
    /// A failing hook is logged and treated as returning no directive.
    fn call(
        &self,
        input: Value,
        tool_use_id: Option<String>,
        ctx: HookContext,
    ) -> HandlerFuture<'_, HookOutput>;
}

/// Decides whether the agent may run a tool.
pub trait PermissionHandler: Send + Sync {
    /// Decide on the proposed tool use.
    ///
    /// # Errors
    ///
    /// Any error becomes an error control response for this check.
    fn check(
        &self,
        request: PermissionRequest,
        ctx: PermissionContext,
    ) -> HandlerFuture<'_, PermissionDecision>;
}

// ── Closure adapters ─────────────────────────────────────────────────────────

struct FnTool<F>(F);

impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<ToolOutput, BoxError>> + Send + 'static,
{
    fn call(&self, input: Value, ctx: ToolContext) -> HandlerFuture<'_, ToolOutput> {
        Box::pin((self.0)(input, ctx))
    }
}

struct FnHook<F>(F);

impl<F, Fut> HookHandler for FnHook<F>
where
    F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<HookOutput, BoxError>> + Send + 'static,
{
    fn call(
        &self,
        input: Value,
        tool_use_id: Option<String>,
        ctx: HookContext,
    ) -> HandlerFuture<'_, HookOutput> {
        Box::pin((self.0)(input, tool_use_id, ctx))
    }
}

struct FnPermission<F>(F);

impl<F, Fut> PermissionHandler for FnPermission<F>
where
    F: Fn(PermissionRequest, PermissionContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<PermissionDecision, BoxError>> + Send + 'static,
{
    fn check(
        &self,
        request: PermissionRequest,
        ctx: PermissionContext,
    ) -> HandlerFuture<'_, PermissionDecision> {
        Box::pin((self.0)(request, ctx))
    }
}

/// Wrap an async closure as a [`ToolHandler`].
#[must_use]
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<ToolOutput, BoxError>> + Send + 'static,
{
    Arc::new(FnTool(f))
}

/// Wrap an async closure as a [`HookHandler`].
#[must_use]
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<HookOutput, BoxError>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

/// Wrap an async closure as a [`PermissionHandler`].
#[must_use]
pub fn permission_fn<F, Fut>(f: F) -> Arc<dyn PermissionHandler>
where
    F: Fn(PermissionRequest, PermissionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<PermissionDecision, BoxError>> + Send + 'static,
{
    Arc::new(FnPermission(f))
}

/// Run a handler future on its own task so a panic is contained.
///
/// Dropping the returned future aborts the handler task.
///
/// # Errors
///
/// Returns [`AppError::HandlerFailure`] when the handler fails, panics, or
/// is aborted.
pub(crate) async fn run_guarded<T, Fut>(what: &str, fut: Fut) -> Result<T>
where
    T: Send + 'static,
    Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
{
    struct AbortOnDrop(tokio::task::AbortHandle);

    impl Drop for AbortOnDrop {
        fn drop(&mut self) {
            self.0.abort();
        }
    }

    let handle = tokio::spawn(fut);
    let _abort = AbortOnDrop(handle.abort_handle());

    match handle.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(AppError::HandlerFailure(format!("{what} failed: {err}"))),
        Err(join) if join.is_panic() => Err(AppError::HandlerFailure(format!("{what} panicked"))),
        Err(_) => Err(AppError::HandlerFailure(format!("{what} was aborted"))),
    }
}

// ── Tools ────────────────────────────────────────────────────────────────────

/// One in-process tool.
#[derive(Clone)]
pub struct Tool {
    /// Name the agent calls the tool by.
    pub name: String,
    /// Human-readable description advertised in `tools/list`.
    pub description: String,
    /// JSON schema of the tool input.
    pub input_schema: Value,
    /// Implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    /// Create a tool.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }

    /// The `tools/list` entry for this tool.
    #[must_use]
    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A named group of tools, exposed to the agent as one in-process MCP server.
#[derive(Debug, Clone)]
pub struct ToolServer {
    /// Server name.
    pub name: String,
    /// Server version reported by `initialize`.
    pub version: String,
    /// Tools in declaration order.
    pub tools: Vec<Tool>,
}

impl ToolServer {
    /// Create an empty server.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: Vec::new(),
        }
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }
}

// ── Hooks ────────────────────────────────────────────────────────────────────

/// Selects which tool names a hook registration applies to.
#[derive(Debug, Clone)]
pub enum HookMatcher {
    /// Every tool, and every non-tool event.
    Any,
    /// One tool, by exact name.
    Exact(String),
    /// Tool names matching a regular expression.
    Pattern(Regex),
}

impl HookMatcher {
    /// Compile a pattern matcher.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if `pattern` is not a valid regex.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| AppError::Config(format!("invalid hook matcher '{pattern}': {e}")))
    }

    /// Whether the matcher accepts `tool_name`.
    ///
    /// Events without a tool name match every matcher.
    #[must_use]
    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        let Some(name) = tool_name else {
            return true;
        };
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == name,
            Self::Pattern(re) => re.is_match(name),
        }
    }

    /// The `matcher` value advertised during `initialize`.
    #[must_use]
    pub fn wire_value(&self) -> Value {
        match self {
            Self::Any => Value::Null,
            Self::Exact(name) => Value::String(name.clone()),
            Self::Pattern(re) => Value::String(re.as_str().to_owned()),
        }
    }
}

/// A hook registration: one event, one matcher, ordered callbacks.
#[derive(Clone)]
pub struct HookRegistration {
    /// Event the callbacks run on.
    pub event: HookEvent,
    /// Tool-name filter.
    pub matcher: HookMatcher,
    /// Callbacks in invocation order.
    pub callbacks: Vec<Arc<dyn HookHandler>>,
    /// Per-callback time limit, also advertised to the agent.
    pub timeout: Option<Duration>,
}

impl HookRegistration {
    /// Create a registration without callbacks.
    #[must_use]
    pub fn new(event: HookEvent, matcher: HookMatcher) -> Self {
        Self {
            event,
            matcher,
            callbacks: Vec::new(),
            timeout: None,
        }
    }

    /// Append a callback.
    #[must_use]
    pub fn callback(mut self, handler: Arc<dyn HookHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }

    /// Set the per-callback time limit.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("event", &self.event)
            .field("matcher", &self.matcher)
            .field("callbacks", &self.callbacks.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A hook callback resolved from the registry.
#[derive(Clone)]
pub struct HookCallback {
    /// Wire id, `hook_<n>`.
    pub id: String,
    /// Event of the owning registration.
    pub event: HookEvent,
    /// Time limit of the owning registration.
    pub timeout: Option<Duration>,
    /// Implementation.
    pub handler: Arc<dyn HookHandler>,
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookCallback")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct RegisteredHook {
    event: HookEvent,
    matcher: HookMatcher,
    timeout: Option<Duration>,
    callback_ids: Vec<String>,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Immutable set of host handlers for one session.
#[derive(Default)]
pub struct HandlerRegistry {
    servers: BTreeMap<String, ToolServer>,
    hooks: Vec<RegisteredHook>,
    callbacks: HashMap<String, HookCallback>,
    permission: Option<Arc<dyn PermissionHandler>>,
}

impl HandlerRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// A registry with no handlers.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up a tool server by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&ToolServer> {
        self.servers.get(name)
    }

    /// Look up a tool, optionally scoped to one server.
    ///
    /// Unscoped lookups search servers in name order.
    #[must_use]
    pub fn find_tool(&self, tool_name: &str, server_name: Option<&str>) -> Option<&Tool> {
        match server_name {
            Some(server) => self.servers.get(server)?.find(tool_name),
            None => self.servers.values().find_map(|s| s.find(tool_name)),
        }
    }

    /// Resolve a callback by wire id.
    #[must_use]
    pub fn callback(&self, id: &str) -> Option<&HookCallback> {
        self.callbacks.get(id)
    }

    /// Callbacks that apply to `event` and `tool_name`, in registration order.
    #[must_use]
    pub fn matching_hooks(&self, event: &HookEvent, tool_name: Option<&str>) -> Vec<HookCallback> {
        let tool_name = if event.is_tool_event() { tool_name } else { None };
        self.hooks
            .iter()
            .filter(|h| &h.event == event && h.matcher.matches(tool_name))
            .flat_map(|h| h.callback_ids.iter())
            .filter_map(|id| self.callbacks.get(id).cloned())
            .collect()
    }

    /// The permission handler, if one was registered.
    #[must_use]
    pub fn permission_handler(&self) -> Option<&Arc<dyn PermissionHandler>> {
        self.permission.as_ref()
    }

    /// Whether any hook callback is registered.
    #[must_use]
    pub fn has_hooks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Whether any tool server is registered.
    #[must_use]
    pub fn has_tools(&self) -> bool {
        !self.servers.is_empty()
    }

    /// The `hooks` field of the `initialize` request; `None` without hooks.
    ///
    /// ```json
    /// {"PreToolUse": [{"matcher": "Bash", "hookCallbackIds": ["hook_0"], "timeout": 30}]}
    /// ```
    #[must_use]
    pub fn hooks_config(&self) -> Option<Value> {
        if self.hooks.is_empty() {
            return None;
        }
        let mut config: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for hook in &self.hooks {
            let mut entry = Map::new();
            entry.insert("matcher".into(), hook.matcher.wire_value());
            entry.insert("hookCallbackIds".into(), json!(hook.callback_ids));
            if let Some(timeout) = hook.timeout {
                entry.insert("timeout".into(), json!(timeout.as_secs()));
            }
            config
                .entry(hook.event.as_str().to_owned())
                .or_default()
                .push(Value::Object(entry));
        }
        Some(json!(config))
    }

    /// Descriptors of the in-process tool servers, keyed by server name.
    #[must_use]
    pub fn sdk_mcp_servers(&self) -> Value {
        let servers: Map<String, Value> = self
            .servers
            .keys()
            .map(|name| (name.clone(), json!({ "type": "sdk", "name": name })))
            .collect();
        Value::Object(servers)
    }

    /// Arguments advertising the tool servers to the agent under `flag`:
    /// `[flag, {"mcpServers": …}]`, or nothing without tool servers.
    #[must_use]
    pub fn mcp_config_args(&self, flag: &str) -> Vec<String> {
        if self.servers.is_empty() {
            return Vec::new();
        }
        let config = json!({ "mcpServers": self.sdk_mcp_servers() });
        vec![flag.to_owned(), config.to_string()]
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .field("permission", &self.permission.is_some())
            .finish()
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    servers: Vec<ToolServer>,
    hooks: Vec<HookRegistration>,
    permission: Option<Arc<dyn PermissionHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register a tool server.
    #[must_use]
    pub fn tool_server(mut self, server: ToolServer) -> Self {
        self.servers.push(server);
        self
    }

    /// Register a hook.
    #[must_use]
    pub fn hook(mut self, registration: HookRegistration) -> Self {
        self.hooks.push(registration);
        self
    }

    /// Register the permission handler, replacing any earlier one.
    #[must_use]
    pub fn permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission = Some(handler);
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] on duplicate server names or duplicate
    /// tool names within one server.
    pub fn build(self) -> Result<Arc<HandlerRegistry>> {
        let mut servers = BTreeMap::new();
        for server in self.servers {
            let mut seen = std::collections::HashSet::new();
            if let Some(dup) = server.tools.iter().find(|t| !seen.insert(t.name.as_str())) {
                return Err(AppError::Config(format!(
                    "tool '{}' registered twice on server '{}'",
                    dup.name, server.name
                )));
            }
            if servers.contains_key(&server.name) {
                return Err(AppError::Config(format!(
                    "tool server '{}' registered twice",
                    server.name
                )));
            }
            servers.insert(server.name.clone(), server);
        }

        let mut hooks = Vec::with_capacity(self.hooks.len());
        let mut callbacks = HashMap::new();
        let mut next_id = 0_usize;
        for registration in self.hooks {
            let mut callback_ids = Vec::with_capacity(registration.callbacks.len());
            for handler in registration.callbacks {
                let id = format!("hook_{next_id}");
                next_id += 1;
                callbacks.insert(
                    id.clone(),
                    HookCallback {
                        id: id.clone(),
                        event: registration.event.clone(),
                        timeout: registration.timeout,
                        handler,
                    },
                );
                callback_ids.push(id);
            }
            hooks.push(RegisteredHook {
                event: registration.event,
                matcher: registration.matcher,
                timeout: registration.timeout,
                callback_ids,
            });
        }

        Ok(Arc::new(HandlerRegistry {
            servers,
            hooks,
            callbacks,
            permission: self.permission,
        }))
    }
}
