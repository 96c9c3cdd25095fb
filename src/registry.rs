//! Tool registry - the fixed table of MCP tools and the upstream operation
//! each one maps to.
//!
//! The table is built once at startup and checked for consistency: names are
//! unique, every `{placeholder}` in a path template has a matching path
//! parameter, and every path parameter appears in the template.

use std::collections::{HashMap, HashSet};

use reqwest::Method;
use serde_json::{Map, Value, json};

use crate::protocol::{Tool, ToolAnnotations};
use crate::{Error, Result};

/// Use cases accepted by `start_new_sandbox`
pub const USECASES: &[&str] = &[
    "blank-sandbox",
    "bloom",
    "citations",
    "contact-tracing",
    "cybersecurity",
    "entity-resolution",
    "fincen",
    "fraud-detection",
    "graph-data-science",
    "graph-data-science-blank-sandbox",
    "healthcare-analytics",
    "icij-offshoreleaks",
    "icij-paradise-papers",
    "legis-graph",
    "movies",
    "network-management",
    "openstreetmap",
    "pole",
    "recommendations",
    "twitch",
    "twitter-trolls",
    "wwc2019",
    "yelp",
    "twitter-v2",
];

/// Cypher statement behind `get_schema`
pub const SCHEMA_STATEMENT: &str = "call apoc.meta.data() yield label, property, type, other, unique, index, elementType \
where elementType = 'node' and not label starts with '_' \
with label, collect(case when type <> 'RELATIONSHIP' \
then [property, type + case when unique then ' unique' else '' end + \
case when index then ' indexed' else '' end] end) as attributes, \
collect(case when type = 'RELATIONSHIP' then [property, head(other)] end) as relationships \
return label, apoc.map.fromPairs(attributes) as attributes, \
apoc.map.fromPairs(relationships) as relationships";

/// Where an argument goes in the upstream request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    /// Substituted into the path template
    Path,
    /// Appended as a query string parameter
    Query,
    /// Added as a field of the JSON body
    Body,
}

/// JSON type an argument must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// JSON string
    String,
    /// JSON boolean
    Boolean,
    /// JSON object
    Object,
}

impl ParamType {
    fn schema_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

/// How long the upstream may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Ordinary management calls
    Standard,
    /// Query execution
    Query,
}

/// One tool argument
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Argument name as the MCP client sees it
    pub name: &'static str,
    /// Where the value goes upstream
    pub location: ParamLocation,
    /// Field or query name upstream
    pub upstream_name: &'static str,
    /// Whether the caller must supply it
    pub required: bool,
    /// Expected JSON type
    pub kind: ParamType,
    /// Description shown in the input schema
    pub description: &'static str,
    /// Value sent when the caller omits the argument
    pub default: Option<Value>,
    /// Allowed values for string arguments
    pub allowed: Option<&'static [&'static str]>,
    /// JSON schema `format` hint
    pub format: Option<&'static str>,
}

impl ParamSpec {
    fn new(
        name: &'static str,
        location: ParamLocation,
        kind: ParamType,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            location,
            upstream_name: name,
            required: true,
            kind,
            description,
            default: None,
            allowed: None,
            format: None,
        }
    }

    fn path(name: &'static str, description: &'static str) -> Self {
        Self::new(name, ParamLocation::Path, ParamType::String, description)
    }

    fn query(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self::new(name, ParamLocation::Query, kind, description)
    }

    fn body(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self::new(name, ParamLocation::Body, kind, description)
    }

    fn upstream(mut self, upstream_name: &'static str) -> Self {
        self.upstream_name = upstream_name;
        self
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    fn default_value(mut self, value: Value) -> Self {
        self.required = false;
        self.default = Some(value);
        self
    }

    fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn format(mut self, format: &'static str) -> Self {
        self.format = Some(format);
        self
    }

    fn schema(&self) -> Value {
        let mut schema = json!({
            "type": self.kind.schema_name(),
            "description": self.description,
        });
        if let Some(default) = &self.default
            && !default.is_null()
        {
            schema["default"] = default.clone();
        }
        if let Some(allowed) = self.allowed {
            schema["enum"] = json!(allowed);
        }
        if let Some(format) = self.format {
            schema["format"] = json!(format);
        }
        schema
    }
}

/// Static description of one tool
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// MCP tool name
    pub name: &'static str,
    /// Human-readable title
    pub title: &'static str,
    /// Description for the model
    pub description: &'static str,
    /// Upstream HTTP method
    pub method: Method,
    /// Upstream path template with `{param}` placeholders
    pub path: &'static str,
    /// Arguments
    pub params: Vec<ParamSpec>,
    /// Body fields sent on every call
    pub fixed_body: Map<String, Value>,
    /// Whether callers must authenticate
    pub requires_auth: bool,
    /// Whether a connection-level failure may be retried
    pub idempotent: bool,
    /// Timeout class
    pub timeout_class: TimeoutClass,
    /// MCP behaviour hints
    pub annotations: ToolAnnotations,
}

impl ToolDescriptor {
    fn new(
        name: &'static str,
        title: &'static str,
        method: Method,
        path: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            title,
            description,
            method,
            path,
            params: Vec::new(),
            fixed_body: Map::new(),
            requires_auth: true,
            idempotent: false,
            timeout_class: TimeoutClass::Standard,
            annotations: ToolAnnotations::default(),
        }
    }

    fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    fn fixed(mut self, field: &str, value: Value) -> Self {
        self.fixed_body.insert(field.to_string(), value);
        self
    }

    fn query_timeout(mut self) -> Self {
        self.timeout_class = TimeoutClass::Query;
        self
    }

    /// Read-only and safe to retry
    fn read_only(mut self) -> Self {
        self.idempotent = true;
        self.annotations = hints(true, false, true);
        self
    }

    /// Changes state; never retried
    fn mutating(mut self, destructive: bool) -> Self {
        self.idempotent = false;
        self.annotations = hints(false, destructive, false);
        self
    }

    /// Whether the upstream request carries a JSON body
    #[must_use]
    pub fn has_body(&self) -> bool {
        !self.fixed_body.is_empty()
            || self.params.iter().any(|p| p.location == ParamLocation::Body)
    }

    /// Names of `{placeholders}` in the path template
    #[must_use]
    pub fn path_placeholders(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut rest = self.path;
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else { break };
            out.push(&after[..end]);
            rest = &after[end + 1..];
        }
        out
    }

    /// JSON schema for the tool's arguments
    #[must_use]
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// MCP tool definition
    #[must_use]
    pub fn to_mcp_tool(&self) -> Tool {
        let mut annotations = self.annotations.clone();
        annotations.title = Some(self.title.to_string());
        Tool {
            name: self.name.to_string(),
            title: Some(self.title.to_string()),
            description: Some(self.description.to_string()),
            input_schema: self.input_schema(),
            annotations: Some(annotations),
        }
    }

    /// Check call arguments against the parameter specs
    ///
    /// # Errors
    ///
    /// Returns a message naming the first offending argument.
    pub fn validate_arguments(&self, arguments: &Value) -> std::result::Result<(), String> {
        let empty = Map::new();
        let args = match arguments {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err("arguments must be a JSON object".to_string()),
        };

        if let Some(unknown) = args
            .keys()
            .find(|k| !self.params.iter().any(|p| p.name == k.as_str()))
        {
            return Err(format!("unknown argument '{unknown}'"));
        }

        for spec in &self.params {
            match args.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(format!(
                            "argument '{}' must be a {}",
                            spec.name,
                            spec.kind.schema_name()
                        ));
                    }
                    if spec.location == ParamLocation::Path
                        && let Some(s) = value.as_str()
                    {
                        if s.trim().is_empty() {
                            return Err(format!("argument '{}' must not be empty", spec.name));
                        }
                        if is_dot_segment(s) {
                            return Err(format!("argument '{}' must not be '.' or '..'", spec.name));
                        }
                    }
                    if let (Some(allowed), Some(s)) = (spec.allowed, value.as_str())
                        && !allowed.contains(&s)
                    {
                        return Err(format!(
                            "argument '{}' must be one of: {}",
                            spec.name,
                            allowed.join(", ")
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `.` and `..` are resolved by URL path handling instead of being encoded
pub(crate) fn is_dot_segment(value: &str) -> bool {
    matches!(value, "." | "..")
}

fn hints(read_only: bool, destructive: bool, idempotent: bool) -> ToolAnnotations {
    ToolAnnotations {
        title: None,
        read_only_hint: Some(read_only),
        destructive_hint: Some(destructive),
        idempotent_hint: Some(idempotent),
        open_world_hint: Some(true),
    }
}

/// Immutable tool table
#[derive(Debug, Clone)]
pub struct Registry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<&'static str, usize>,
}

impl Registry {
    /// Build a registry from descriptors, checking consistency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] on duplicate names or path/parameter
    /// mismatches.
    pub fn new(tools: Vec<ToolDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tools.len());
        for (i, tool) in tools.iter().enumerate() {
            if index.insert(tool.name, i).is_some() {
                return Err(Error::Registry(format!("duplicate tool name '{}'", tool.name)));
            }
            check_descriptor(tool)?;
        }
        Ok(Self { tools, index })
    }

    /// The sandbox API tool set
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the table is inconsistent.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_tools())
    }

    /// Look up a tool
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// All tools in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    /// Number of tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// MCP definitions for `tools/list`
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools.iter().map(ToolDescriptor::to_mcp_tool).collect()
    }
}

fn check_descriptor(tool: &ToolDescriptor) -> Result<()> {
    let fail = |msg: String| Err(Error::Registry(format!("tool '{}': {msg}", tool.name)));

    if !tool.path.starts_with('/') {
        return fail(format!("path '{}' must start with '/'", tool.path));
    }

    let mut names = HashSet::new();
    for p in &tool.params {
        if !names.insert(p.name) {
            return fail(format!("duplicate parameter '{}'", p.name));
        }
    }

    let placeholders = tool.path_placeholders();
    for ph in &placeholders {
        let matching = tool
            .params
            .iter()
            .find(|p| p.name == *ph && p.location == ParamLocation::Path);
        match matching {
            None => return fail(format!("placeholder '{{{ph}}}' has no path parameter")),
            Some(p) if !p.required || p.kind != ParamType::String => {
                return fail(format!("path parameter '{ph}' must be a required string"));
            }
            Some(_) => {}
        }
    }
    for p in tool.params.iter().filter(|p| p.location == ParamLocation::Path) {
        if !placeholders.contains(&p.name) {
            return fail(format!("path parameter '{}' is not in the path", p.name));
        }
    }

    for p in tool.params.iter().filter(|p| p.location == ParamLocation::Body) {
        if tool.fixed_body.contains_key(p.upstream_name) {
            return fail(format!("body field '{}' is also fixed", p.upstream_name));
        }
    }

    if tool.method == Method::GET && tool.has_body() {
        return fail("GET operations cannot carry a body".to_string());
    }

    Ok(())
}

const HASH_KEY_DESC: &str = "The unique hash key identifying the sandbox.";

#[allow(clippy::too_many_lines)]
fn builtin_tools() -> Vec<ToolDescriptor> {
    use ParamType::{Boolean, Object, String as Str};

    vec![
        ToolDescriptor::new(
            "list_sandboxes_for_user",
            "List sandboxes",
            Method::GET,
            "/SandboxGetRunningInstancesForUser",
            "List all running sandbox instances for the authenticated user.",
        )
        .param(
            ParamSpec::query(
                "timezone",
                Str,
                "User's timezone for accurate expiration calculation (e.g. 'America/New_York').",
            )
            .optional(),
        )
        .read_only(),
        ToolDescriptor::new(
            "start_new_sandbox",
            "Start sandbox",
            Method::POST,
            "/SandboxRunInstance",
            "Starts a new sandbox instance for a specified use case.",
        )
        .param(
            ParamSpec::body("usecase", Str, "The name of the use case for the sandbox.")
                .one_of(USECASES),
        )
        .param(
            ParamSpec::body(
                "allow_duplicates",
                Boolean,
                "Start a new instance even if one for this use case is already running.",
            )
            .upstream("allowDuplicates")
            .optional(),
        )
        .mutating(false),
        ToolDescriptor::new(
            "terminate_sandbox",
            "Terminate sandbox",
            Method::POST,
            "/SandboxStopInstance",
            "Stops/terminates a specific sandbox instance.",
        )
        .param(ParamSpec::body("sandbox_hash_key", Str, HASH_KEY_DESC).upstream("sandboxHashKey"))
        .mutating(true),
        ToolDescriptor::new(
            "extend_sandbox_lifetime",
            "Extend sandbox lifetime",
            Method::POST,
            "/SandboxExtend",
            "Extends the lifetime of a sandbox, or of all the user's sandboxes when no hash key is given. \
             User profile details can be submitted with this request.",
        )
        .param(
            ParamSpec::body(
                "sandbox_hash_key",
                Str,
                "Specific sandbox to extend. If omitted, all user's sandboxes are extended.",
            )
            .upstream("sandboxHashKey")
            .optional(),
        )
        .param(
            ParamSpec::body("profile", Object, "Optional user profile details.").optional(),
        )
        .mutating(false),
        ToolDescriptor::new(
            "get_sandbox_connection_details",
            "Get sandbox connection details",
            Method::GET,
            "/SandboxAuthdGetInstanceByHashKey",
            "Gets connection details for a specific sandbox.",
        )
        .param(ParamSpec::query("sandbox_hash_key", Str, HASH_KEY_DESC).upstream("sandboxHashKey"))
        .param(
            ParamSpec::query(
                "verify_connect",
                Boolean,
                "If true, verifies connection to the sandbox.",
            )
            .upstream("verifyConnect")
            .default_value(json!(false)),
        )
        .read_only(),
        ToolDescriptor::new(
            "invite_sandbox_collaborator",
            "Invite collaborator",
            Method::POST,
            "/SandboxInviteCollaborator",
            "Invites a collaborator by email to a specific sandbox.",
        )
        .param(ParamSpec::body("sandbox_hash_key", Str, HASH_KEY_DESC).upstream("sandboxHashKey"))
        .param(ParamSpec::body("email", Str, "Email address of the collaborator.").format("email"))
        .param(ParamSpec::body("message", Str, "Message included in the invitation."))
        .mutating(false),
        ToolDescriptor::new(
            "get_user_info",
            "Get user info",
            Method::GET,
            "/SandboxGetUserInfo",
            "Returns the profile of the authenticated user.",
        )
        .read_only(),
        ToolDescriptor::new(
            "request_sandbox_backup",
            "Request backup",
            Method::POST,
            "/SandboxBackup/request/{sandbox_hash_key}",
            "Requests a backup for a specific sandbox.",
        )
        .param(ParamSpec::path("sandbox_hash_key", HASH_KEY_DESC))
        .mutating(false),
        ToolDescriptor::new(
            "list_sandbox_backups",
            "List backups",
            Method::GET,
            "/SandboxBackup/{sandbox_hash_key}",
            "Lists available backups for a specific sandbox.",
        )
        .param(ParamSpec::path("sandbox_hash_key", HASH_KEY_DESC))
        .read_only(),
        ToolDescriptor::new(
            "get_backup_result",
            "Get backup result",
            Method::GET,
            "/SandboxBackup/result/{result_id}",
            "Retrieves the result of a specific backup task.",
        )
        .param(ParamSpec::path("result_id", "The ID of the backup task result."))
        .read_only(),
        ToolDescriptor::new(
            "get_sandbox_backup_download_url",
            "Get backup download URL",
            Method::POST,
            "/SandboxBackup/{sandbox_hash_key}",
            "Gets a pre-signed download URL for a specific sandbox backup file.",
        )
        .param(ParamSpec::path("sandbox_hash_key", HASH_KEY_DESC))
        .param(ParamSpec::body("key", Str, "The S3 key of the backup file to download."))
        .read_only(),
        ToolDescriptor::new(
            "upload_sandbox_to_aura",
            "Upload to Aura",
            Method::POST,
            "/SandboxAuraUpload/request/{sandbox_hash_key}",
            "Uploads a sandbox backup to an Aura instance.",
        )
        .param(ParamSpec::path(
            "sandbox_hash_key",
            "The unique hash key identifying the sandbox backup to upload.",
        ))
        .param(ParamSpec::body(
            "aura_uri",
            Str,
            "The Aura instance URI (e.g., neo4j+s://xxxx.databases.neo4j.io).",
        ))
        .param(ParamSpec::body("aura_password", Str, "Password for the Aura instance."))
        .param(
            ParamSpec::body("aura_username", Str, "Username for the Aura instance.")
                .default_value(json!("neo4j")),
        )
        .mutating(false),
        ToolDescriptor::new(
            "get_aura_upload_result",
            "Get Aura upload result",
            Method::GET,
            "/SandboxAuraUpload/result/{result_id}",
            "Retrieves the result of a specific Aura upload task.",
        )
        .param(ParamSpec::path("result_id", "The ID of the Aura upload task result."))
        .read_only(),
        ToolDescriptor::new(
            "get_schema",
            "Get graph schema",
            Method::POST,
            "/SandboxRunQuery",
            "Retrieves the node labels, properties and relationships of the sandbox database.",
        )
        .param(ParamSpec::body("hash_key", Str, "The hash key of the sandbox to query."))
        .fixed("statement", json!(SCHEMA_STATEMENT))
        .fixed("params", Value::Null)
        .fixed("accessMode", json!("Read"))
        .query_timeout()
        .read_only(),
        ToolDescriptor::new(
            "read_query",
            "Run read query",
            Method::POST,
            "/SandboxRunQuery",
            "Executes a read-only Cypher query against the sandbox database.",
        )
        .param(ParamSpec::body("hash_key", Str, "The hash key of the sandbox to query."))
        .param(
            ParamSpec::body("query", Str, "The Read Cypher query to execute.").upstream("statement"),
        )
        .param(
            ParamSpec::body("params", Object, "Optional parameters to pass to the Cypher query.")
                .default_value(Value::Null),
        )
        .fixed("accessMode", json!("Read"))
        .query_timeout()
        .read_only(),
        ToolDescriptor::new(
            "write_query",
            "Run write query",
            Method::POST,
            "/SandboxRunQuery",
            "Executes a Cypher query that may modify the sandbox database.",
        )
        .param(ParamSpec::body("hash_key", Str, "The hash key of the sandbox to query."))
        .param(
            ParamSpec::body("query", Str, "The Write Cypher query to execute.").upstream("statement"),
        )
        .param(
            ParamSpec::body("params", Object, "Optional parameters to pass to the Cypher query.")
                .default_value(Value::Null),
        )
        .query_timeout()
        .mutating(true),
    ]
}
