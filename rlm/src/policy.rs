use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::error::RlmError;

/// Sandbox trust posture.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Any import; dangerous builtins blocked.
    #[default]
    Permissive,
    /// Allowlisted imports only; dangerous builtins blocked.
    Restrictive,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Permissive => "permissive",
            SecurityMode::Restrictive => "restrictive",
        }
    }

    /// Import capabilities granted by this mode.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            SecurityMode::Permissive => &[Capability::AllowlistedImports, Capability::AnyImport],
            SecurityMode::Restrictive => &[Capability::AllowlistedImports],
        }
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityMode {
    type Err = RlmError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "permissive" => Ok(Self::Permissive),
            "restrictive" => Ok(Self::Restrictive),
            other => Err(RlmError::config(
                "sandbox.security_mode",
                format!("expected `permissive` or `restrictive`, got `{other}`"),
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Modules named in the allowlist.
    AllowlistedImports,
    /// Every importable module.
    AnyImport,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AllowlistedImports => "allowlisted_imports",
            Capability::AnyImport => "any_import",
        }
    }
}

/// Builtins the sandbox can take away from executed code.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockedBuiltin {
    Open,
    Exec,
    Eval,
    Compile,
    DynamicImport,
    Input,
    Breakpoint,
    Exit,
    Quit,
    Getattr,
    Setattr,
    Delattr,
    Vars,
    Globals,
    Locals,
}

impl BlockedBuiltin {
    /// Always blocked, whatever the configuration says.
    pub const REQUIRED: [BlockedBuiltin; 9] = [
        BlockedBuiltin::Open,
        BlockedBuiltin::Exec,
        BlockedBuiltin::Eval,
        BlockedBuiltin::Compile,
        BlockedBuiltin::DynamicImport,
        BlockedBuiltin::Input,
        BlockedBuiltin::Breakpoint,
        BlockedBuiltin::Exit,
        BlockedBuiltin::Quit,
    ];

    /// Name used in configuration files.
    pub fn config_name(&self) -> &'static str {
        match self {
            BlockedBuiltin::DynamicImport => "dynamic-import",
            other => other.python_name(),
        }
    }

    /// Name of the builtin as Python code sees it.
    pub fn python_name(&self) -> &'static str {
        match self {
            BlockedBuiltin::Open => "open",
            BlockedBuiltin::Exec => "exec",
            BlockedBuiltin::Eval => "eval",
            BlockedBuiltin::Compile => "compile",
            BlockedBuiltin::DynamicImport => "__import__",
            BlockedBuiltin::Input => "input",
            BlockedBuiltin::Breakpoint => "breakpoint",
            BlockedBuiltin::Exit => "exit",
            BlockedBuiltin::Quit => "quit",
            BlockedBuiltin::Getattr => "getattr",
            BlockedBuiltin::Setattr => "setattr",
            BlockedBuiltin::Delattr => "delattr",
            BlockedBuiltin::Vars => "vars",
            BlockedBuiltin::Globals => "globals",
            BlockedBuiltin::Locals => "locals",
        }
    }

    const ALL: [BlockedBuiltin; 15] = [
        BlockedBuiltin::Open,
        BlockedBuiltin::Exec,
        BlockedBuiltin::Eval,
        BlockedBuiltin::Compile,
        BlockedBuiltin::DynamicImport,
        BlockedBuiltin::Input,
        BlockedBuiltin::Breakpoint,
        BlockedBuiltin::Exit,
        BlockedBuiltin::Quit,
        BlockedBuiltin::Getattr,
        BlockedBuiltin::Setattr,
        BlockedBuiltin::Delattr,
        BlockedBuiltin::Vars,
        BlockedBuiltin::Globals,
        BlockedBuiltin::Locals,
    ];

    /// Exact lookup by the name Python code uses.
    pub fn from_python_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.python_name() == name)
    }
}

impl std::fmt::Display for BlockedBuiltin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_name())
    }
}

impl std::str::FromStr for BlockedBuiltin {
    type Err = RlmError;

    /// Accepts the configuration name or the Python name, nothing else.
    fn from_str(value: &str) -> Result<Self> {
        BlockedBuiltin::ALL
            .into_iter()
            .find(|b| b.config_name() == value || b.python_name() == value)
            .ok_or_else(|| {
                RlmError::config(
                    "sandbox.blocked_builtins",
                    format!("unknown builtin `{value}`"),
                )
            })
    }
}

/// Modules importable in restrictive mode, matched on the top-level package.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleAllowlist {
    modules: BTreeSet<String>,
}

impl Default for ModuleAllowlist {
    fn default() -> Self {
        let modules = [
            "re",
            "json",
            "math",
            "collections",
            "itertools",
            "functools",
            "statistics",
            "string",
            "textwrap",
            "difflib",
            "heapq",
            "bisect",
            "typing",
            "dataclasses",
            "enum",
            "datetime",
            "decimal",
            "fractions",
            "operator",
            "copy",
        ];
        Self {
            modules: modules.into_iter().map(str::to_string).collect(),
        }
    }
}

impl ModuleAllowlist {
    pub fn new<I, S>(modules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for module in modules {
            let module = module.into();
            if !is_identifier(&module) {
                return Err(RlmError::config(
                    "sandbox.allowed_modules",
                    format!("`{module}` is not a top-level module name"),
                ));
            }
            set.insert(module);
        }
        Ok(Self { modules: set })
    }

    /// `os.path` is permitted only if `os` is.
    pub fn permits(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or_default();
        self.modules.contains(root)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Everything the sandbox needs to decide what executed code may do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub mode: SecurityMode,
    pub allowed_modules: ModuleAllowlist,
    blocked: BTreeSet<BlockedBuiltin>,
}

impl SandboxPolicy {
    /// Configured builtins extend the required set; they never shrink it.
    pub fn new(
        mode: SecurityMode,
        allowed_modules: ModuleAllowlist,
        extra_blocked: impl IntoIterator<Item = BlockedBuiltin>,
    ) -> Self {
        let mut blocked: BTreeSet<BlockedBuiltin> = BlockedBuiltin::REQUIRED.into_iter().collect();
        blocked.extend(extra_blocked);
        Self {
            mode,
            allowed_modules,
            blocked,
        }
    }

    pub fn blocked_builtins(&self) -> impl Iterator<Item = BlockedBuiltin> + '_ {
        self.blocked.iter().copied()
    }

    pub fn is_blocked(&self, builtin: BlockedBuiltin) -> bool {
        self.blocked.contains(&builtin)
    }

    pub fn check_import(&self, module: &str) -> std::result::Result<(), PolicyViolation> {
        if self.mode.grants(Capability::AnyImport) || self.allowed_modules.permits(module) {
            return Ok(());
        }
        Err(PolicyViolation {
            violation_type: PolicyViolationType::DisallowedImport,
            name: module.to_string(),
        })
    }

    pub fn check_builtin(&self, name: &str) -> std::result::Result<(), PolicyViolation> {
        match BlockedBuiltin::from_python_name(name) {
            Some(builtin) if self.is_blocked(builtin) => Err(PolicyViolation {
                violation_type: PolicyViolationType::DisallowedBuiltin,
                name: builtin.python_name().to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn summary(&self, code_timeout_seconds: u64, max_output_chars: usize) -> PolicySummary {
        PolicySummary {
            mode: self.mode,
            capabilities: self.mode.capabilities().to_vec(),
            allowed_modules: match self.mode {
                SecurityMode::Restrictive => self.allowed_modules.iter().map(str::to_string).collect(),
                SecurityMode::Permissive => Vec::new(),
            },
            blocked_builtins: self
                .blocked
                .iter()
                .map(|b| b.python_name().to_string())
                .collect(),
            code_timeout_seconds,
            max_output_chars,
        }
    }
}

/// What the model is told about the sandbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicySummary {
    pub mode: SecurityMode,
    pub capabilities: Vec<Capability>,
    pub allowed_modules: Vec<String>,
    pub blocked_builtins: Vec<String>,
    pub code_timeout_seconds: u64,
    pub max_output_chars: usize,
}

impl PolicySummary {
    pub fn render(&self) -> String {
        let mode = self.mode;
        let blocked = self.blocked_builtins.join(", ");
        let timeout = self.code_timeout_seconds;
        let output = self.max_output_chars;
        let imports = if self.allowed_modules.is_empty() {
            "any".to_string()
        } else {
            self.allowed_modules.join(", ")
        };
        format!(
            "mode={mode}; imports={imports}; blocked builtins={blocked}; timeout={timeout}s; output<={output} chars"
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyViolation {
    pub violation_type: PolicyViolationType,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyViolationType {
    DisallowedImport,
    DisallowedBuiltin,
}
