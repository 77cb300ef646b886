use crate::budget::BudgetLimits;
use crate::cost::TokenEstimator;
use crate::cost::TokenPricing;
use crate::cost::default_pricing;
use crate::cost::usd_to_micros;
use crate::error::ConfigWarning;
use crate::error::Result;
use crate::error::RlmError;
use crate::policy::BlockedBuiltin;
use crate::policy::ModuleAllowlist;
use crate::policy::SandboxPolicy;
use crate::policy::SecurityMode;
use crate::routing::RoutingThresholds;
use crate::routing::Tier;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_LOW_MODEL: &str = "qwen2.5-coder:7b";
pub const DEFAULT_MID_MODEL: &str = "qwen2.5-coder:32b";
pub const DEFAULT_HIGH_MODEL: &str = "gpt-4o";

/// Immutable configuration for one session.
///
/// Sections:
/// - `root`: model ids per tier, temperatures and output caps
/// - `budget`: hard caps, soft warning threshold, recursion bound
/// - `sandbox`: security posture, timeouts, output limit
/// - `pricing`: USD per million tokens per model
/// - `session`: wall-clock and turn bounds
/// - `token_estimate`: pre-call estimation ratio and margin
/// - `trace`: ledger and trace output
/// - `routing`: tier selection thresholds
/// - `gateway`: provider endpoints
/// - `prompt`: model prompt template
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub models: ModelConfig,
    pub budget: BudgetConfig,
    pub sandbox: SandboxConfig,
    pub pricing: HashMap<String, TokenPricing>,
    pub session: SessionLimits,
    pub token_estimate: TokenEstimator,
    pub trace: TraceConfig,
    pub routing: RoutingThresholds,
    pub gateway: GatewayConfig,
    pub prompt: PromptConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            models: ModelConfig::default(),
            budget: BudgetConfig::default(),
            sandbox: SandboxConfig::default(),
            pricing: default_pricing(),
            session: SessionLimits::default(),
            token_estimate: TokenEstimator::default(),
            trace: TraceConfig::default(),
            routing: RoutingThresholds::default(),
            gateway: GatewayConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

/// A validated configuration plus whatever was corrected on the way.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: SessionConfig,
    pub warnings: Vec<ConfigWarning>,
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> Result<LoadedConfig> {
        let file: SessionConfigFile = toml::from_str(content)
            .map_err(|err| RlmError::config("<document>", err.to_string()))?;
        Self::from_file(file)
    }

    pub fn load_from_path(path: &Path) -> Result<LoadedConfig> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            RlmError::config("<document>", format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_file(file: SessionConfigFile) -> Result<LoadedConfig> {
        let mut warnings = Vec::new();
        let mut config = Self::default();

        if let Some(root) = file.root {
            config.models = root.into();
        }
        if let Some(budget) = file.budget {
            config.budget = BudgetConfig::resolve(budget)?;
        }
        if let Some(sandbox) = file.sandbox {
            config.sandbox = SandboxConfig::resolve(sandbox, &mut warnings)?;
        }
        if let Some(pricing) = file.pricing {
            for (model, entry) in pricing {
                let parsed = TokenPricing::from_usd_per_million(&model, entry.input, entry.output)?;
                config.pricing.insert(model, parsed);
            }
        }
        if let Some(session) = file.session {
            config.session = SessionLimits::resolve(session, &mut warnings)?;
        }
        if let Some(estimate) = file.token_estimate {
            config.token_estimate = resolve_estimator(estimate)?;
        }
        if let Some(trace) = file.trace {
            config.trace = TraceConfig::resolve(trace, &mut warnings);
        }
        if let Some(routing) = file.routing {
            config.routing = routing.into();
        }
        if let Some(gateway) = file.gateway {
            config.gateway = gateway.into();
        }
        if let Some(prompt) = file.prompt {
            config.prompt = prompt.into();
        }

        config.check_pricing()?;
        for warning in &warnings {
            warn!(field = %warning.field, "{warning}");
        }
        Ok(LoadedConfig { config, warnings })
    }

    /// Override the hard cost cap (the CLI's `--budget`).
    pub fn with_budget_usd(mut self, usd: f64) -> Result<Self> {
        self.budget.set_max_session_budget_usd(usd)?;
        Ok(self)
    }

    /// Every model the session can call must have a pricing entry.
    pub fn check_pricing(&self) -> Result<()> {
        for (field, model) in self.models.referenced() {
            if !self.pricing.contains_key(model) {
                return Err(RlmError::config(
                    format!("pricing.{model}"),
                    format!("no pricing entry for `{model}` referenced by root.{field}"),
                ));
            }
        }
        Ok(())
    }

    pub fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_cost_micros: self.budget.max_session_budget_micros,
            max_tokens: self.budget.max_tokens_per_session,
            soft_limit_percentage: self.budget.soft_limit_percentage,
        }
    }
}

/// Loads a validated configuration from somewhere.
pub trait ConfigLoader {
    fn load(&self) -> Result<LoadedConfig>;
}

/// Reads one TOML document, or uses defaults when no path is given.
#[derive(Clone, Debug, Default)]
pub struct TomlConfigLoader {
    pub path: Option<PathBuf>,
    pub budget_override_usd: Option<f64>,
}

impl ConfigLoader for TomlConfigLoader {
    fn load(&self) -> Result<LoadedConfig> {
        let mut loaded = match &self.path {
            Some(path) => SessionConfig::load_from_path(path)?,
            None => SessionConfig::from_file(SessionConfigFile::default())?,
        };
        if let Some(usd) = self.budget_override_usd {
            loaded.config = loaded.config.with_budget_usd(usd)?;
        }
        Ok(loaded)
    }
}

/// Model ids, temperatures and output caps.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    /// Top-level calls on the low tier.
    pub root_model: String,
    /// Recursive calls on the low tier.
    pub sub_model: String,
    pub mid_model: String,
    pub high_model: String,
    pub root_temperature: f64,
    pub sub_temperature: f64,
    pub root_max_tokens: u32,
    pub sub_max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            root_model: DEFAULT_LOW_MODEL.to_string(),
            sub_model: DEFAULT_LOW_MODEL.to_string(),
            mid_model: DEFAULT_MID_MODEL.to_string(),
            high_model: DEFAULT_HIGH_MODEL.to_string(),
            root_temperature: 0.1,
            sub_temperature: 0.1,
            root_max_tokens: 4096,
            sub_max_tokens: 1024,
        }
    }
}

impl ModelConfig {
    /// Model serving `tier` for a frame at `depth`.
    pub fn model_for(&self, tier: Tier, depth: u32) -> &str {
        match tier {
            Tier::Low if depth == 0 => &self.root_model,
            Tier::Low => &self.sub_model,
            Tier::Mid => &self.mid_model,
            Tier::High => &self.high_model,
        }
    }

    pub fn temperature_for(&self, depth: u32) -> f64 {
        if depth == 0 {
            self.root_temperature
        } else {
            self.sub_temperature
        }
    }

    pub fn max_tokens_for(&self, depth: u32) -> u32 {
        if depth == 0 {
            self.root_max_tokens
        } else {
            self.sub_max_tokens
        }
    }

    fn referenced(&self) -> [(&'static str, &str); 4] {
        [
            ("root_model", self.root_model.as_str()),
            ("sub_model", self.sub_model.as_str()),
            ("mid_model", self.mid_model.as_str()),
            ("high_model", self.high_model.as_str()),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BudgetConfig {
    pub max_session_budget_usd: f64,
    pub max_session_budget_micros: u64,
    pub max_tokens_per_session: u64,
    pub soft_limit_percentage: f64,
    pub max_subcall_depth: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_session_budget_usd: 1.0,
            max_session_budget_micros: 1_000_000,
            max_tokens_per_session: 500_000,
            soft_limit_percentage: 0.80,
            max_subcall_depth: 5,
        }
    }
}

impl BudgetConfig {
    fn resolve(file: BudgetConfigFile) -> Result<Self> {
        let mut config = Self::default();
        if let Some(usd) = file.max_session_budget_usd {
            config.set_max_session_budget_usd(usd)?;
        }
        if let Some(tokens) = file.max_tokens_per_session {
            config.max_tokens_per_session = u64::try_from(tokens).map_err(|_| {
                RlmError::config(
                    "budget.max_tokens_per_session",
                    format!("must not be negative, got {tokens}"),
                )
            })?;
        }
        if let Some(pct) = file.soft_limit_percentage {
            if !(pct > 0.0 && pct <= 1.0) {
                return Err(RlmError::config(
                    "budget.soft_limit_percentage",
                    format!("must be in (0, 1], got {pct}"),
                ));
            }
            config.soft_limit_percentage = pct;
        }
        if let Some(depth) = file.max_subcall_depth {
            if depth == 0 {
                return Err(RlmError::config(
                    "budget.max_subcall_depth",
                    "must be at least 1",
                ));
            }
            config.max_subcall_depth = depth;
        }
        Ok(config)
    }

    fn set_max_session_budget_usd(&mut self, usd: f64) -> Result<()> {
        if !usd.is_finite() || usd < 0.0 {
            return Err(RlmError::config(
                "budget.max_session_budget_usd",
                format!("must be a non-negative number, got {usd}"),
            ));
        }
        self.max_session_budget_usd = usd;
        self.max_session_budget_micros = usd_to_micros(usd);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub policy: SandboxPolicy,
    pub code_timeout_seconds: u64,
    pub max_output_chars: usize,
    pub python_command: String,
}

const CODE_TIMEOUT_RANGE: std::ops::RangeInclusive<i64> = 1..=600;
const SESSION_TIMEOUT_RANGE: std::ops::RangeInclusive<i64> = 1..=86_400;
const PREVIEW_RANGE: std::ops::RangeInclusive<i64> = 1..=100_000;
const OUTPUT_RANGE: std::ops::RangeInclusive<i64> = 1..=1_000_000;

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            policy: SandboxPolicy::new(SecurityMode::Permissive, ModuleAllowlist::default(), []),
            code_timeout_seconds: 30,
            max_output_chars: 10_000,
            python_command: "python3".to_string(),
        }
    }
}

impl SandboxConfig {
    fn resolve(file: SandboxConfigFile, warnings: &mut Vec<ConfigWarning>) -> Result<Self> {
        let defaults = Self::default();
        let mode = match file.security_mode {
            Some(mode) => mode.parse::<SecurityMode>()?,
            None => defaults.policy.mode,
        };
        let allowed_modules = match file.allowed_modules {
            Some(modules) => ModuleAllowlist::new(modules)?,
            None => defaults.policy.allowed_modules.clone(),
        };
        let extra_blocked = file
            .blocked_builtins
            .unwrap_or_default()
            .iter()
            .map(|name| name.parse::<BlockedBuiltin>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            policy: SandboxPolicy::new(mode, allowed_modules, extra_blocked),
            code_timeout_seconds: in_range(
                "sandbox.code_timeout_seconds",
                file.code_timeout_seconds,
                CODE_TIMEOUT_RANGE,
                defaults.code_timeout_seconds,
                warnings,
            ),
            max_output_chars: in_range(
                "sandbox.max_output_chars",
                file.max_output_chars,
                OUTPUT_RANGE,
                defaults.max_output_chars,
                warnings,
            ),
            python_command: file.python_command.unwrap_or(defaults.python_command),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    pub session_timeout_seconds: u64,
    pub max_turns: u32,
    pub max_concurrent_subcalls: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            session_timeout_seconds: 300,
            max_turns: 20,
            max_concurrent_subcalls: 4,
        }
    }
}

impl SessionLimits {
    fn resolve(file: SessionConfigSection, warnings: &mut Vec<ConfigWarning>) -> Result<Self> {
        let defaults = Self::default();
        let max_turns = file.max_turns.unwrap_or(defaults.max_turns);
        if max_turns == 0 {
            return Err(RlmError::config("session.max_turns", "must be at least 1"));
        }
        let max_concurrent_subcalls = file
            .max_concurrent_subcalls
            .unwrap_or(defaults.max_concurrent_subcalls);
        if max_concurrent_subcalls == 0 {
            return Err(RlmError::config(
                "session.max_concurrent_subcalls",
                "must be at least 1",
            ));
        }
        Ok(Self {
            session_timeout_seconds: in_range(
                "session.session_timeout_seconds",
                file.session_timeout_seconds,
                SESSION_TIMEOUT_RANGE,
                defaults.session_timeout_seconds,
                warnings,
            ),
            max_turns,
            max_concurrent_subcalls,
        })
    }
}

fn resolve_estimator(file: TokenEstimateConfigFile) -> Result<TokenEstimator> {
    let mut estimator = TokenEstimator::default();
    if let Some(ratio) = file.chars_per_token {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(RlmError::config(
                "token_estimate.chars_per_token",
                format!("must be at least 1, got {ratio}"),
            ));
        }
        estimator.chars_per_token = ratio;
    }
    if let Some(multiplier) = file.token_safety_multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(RlmError::config(
                "token_estimate.token_safety_multiplier",
                format!("must be at least 1, got {multiplier}"),
            ));
        }
        estimator.safety_multiplier = multiplier;
    }
    Ok(estimator)
}

/// Ledger and trace output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub prompt_preview_chars: usize,
    pub response_preview_chars: usize,
    pub stdout_preview_chars: usize,
    pub ledger_path: PathBuf,
    /// Previews are only written when set.
    pub trace_path: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt_preview_chars: 200,
            response_preview_chars: 200,
            stdout_preview_chars: 2000,
            ledger_path: PathBuf::from("rlm_ledger.jsonl"),
            trace_path: None,
        }
    }
}

impl TraceConfig {
    fn resolve(file: TraceConfigFile, warnings: &mut Vec<ConfigWarning>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            prompt_preview_chars: in_range(
                "trace.prompt_preview_chars",
                file.prompt_preview_chars,
                PREVIEW_RANGE,
                defaults.prompt_preview_chars,
                warnings,
            ),
            response_preview_chars: in_range(
                "trace.response_preview_chars",
                file.response_preview_chars,
                PREVIEW_RANGE,
                defaults.response_preview_chars,
                warnings,
            ),
            stdout_preview_chars: in_range(
                "trace.stdout_preview_chars",
                file.stdout_preview_chars,
                PREVIEW_RANGE,
                defaults.stdout_preview_chars,
                warnings,
            ),
            ledger_path: file.ledger_path.unwrap_or(defaults.ledger_path),
            trace_path: file.trace_path,
        }
    }
}

fn in_range<T>(
    field: &str,
    value: Option<i64>,
    range: std::ops::RangeInclusive<i64>,
    default: T,
    warnings: &mut Vec<ConfigWarning>,
) -> T
where
    T: TryFrom<i64> + ToString,
{
    let Some(value) = value else {
        return default;
    };
    if range.contains(&value)
        && let Ok(converted) = T::try_from(value)
    {
        return converted;
    }
    warnings.push(ConfigWarning {
        field: field.to_string(),
        message: format!(
            "{value} is outside {}..={}",
            range.start(),
            range.end()
        ),
        applied_default: default.to_string(),
    });
    default
}

/// OpenAI-compatible endpoints. The high tier model goes to `remote_base_url`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub local_base_url: String,
    pub remote_base_url: String,
    /// Environment variable holding the remote API key.
    pub api_key_env: String,
    pub request_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            local_base_url: "http://localhost:11434/v1".to_string(),
            remote_base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptConfig {
    pub template: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template: [
                "You are a recursive language model working through a task step by step.",
                "Run Python by replying with a ```python block; you will see its output.",
                "Delegate a focused question with a line `SUBCALL: <question>`.",
                "Finish with `FINAL: <answer>` or a ```json block.",
                "Sandbox: {policy_summary}",
                "Budget: {budget_summary}",
                "Question: {query}",
                "Context:",
                "{context}",
            ]
            .join("\n"),
        }
    }
}

impl PromptConfig {
    pub fn render(
        &self,
        query: &str,
        context: &str,
        policy_summary: &str,
        budget_summary: &str,
    ) -> String {
        self.template
            .replace("{query}", query)
            .replace("{policy_summary}", policy_summary)
            .replace("{budget_summary}", budget_summary)
            .replace("{context}", context)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SessionConfigFile {
    pub root: Option<ModelConfigFile>,
    pub budget: Option<BudgetConfigFile>,
    pub sandbox: Option<SandboxConfigFile>,
    pub pricing: Option<HashMap<String, PricingEntryFile>>,
    pub session: Option<SessionConfigSection>,
    pub token_estimate: Option<TokenEstimateConfigFile>,
    pub trace: Option<TraceConfigFile>,
    pub routing: Option<RoutingThresholdsFile>,
    pub gateway: Option<GatewayConfigFile>,
    pub prompt: Option<PromptConfigFile>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelConfigFile {
    pub root_model: Option<String>,
    pub sub_model: Option<String>,
    pub mid_model: Option<String>,
    pub high_model: Option<String>,
    pub root_temperature: Option<f64>,
    pub sub_temperature: Option<f64>,
    pub root_max_tokens: Option<u32>,
    pub sub_max_tokens: Option<u32>,
}

impl From<ModelConfigFile> for ModelConfig {
    fn from(file: ModelConfigFile) -> Self {
        let mut config = ModelConfig::default();
        if let Some(root_model) = file.root_model {
            config.root_model = root_model;
        }
        if let Some(sub_model) = file.sub_model {
            config.sub_model = sub_model;
        }
        if let Some(mid_model) = file.mid_model {
            config.mid_model = mid_model;
        }
        if let Some(high_model) = file.high_model {
            config.high_model = high_model;
        }
        if let Some(root_temperature) = file.root_temperature {
            config.root_temperature = root_temperature;
        }
        if let Some(sub_temperature) = file.sub_temperature {
            config.sub_temperature = sub_temperature;
        }
        if let Some(root_max_tokens) = file.root_max_tokens {
            config.root_max_tokens = root_max_tokens;
        }
        if let Some(sub_max_tokens) = file.sub_max_tokens {
            config.sub_max_tokens = sub_max_tokens;
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BudgetConfigFile {
    pub max_session_budget_usd: Option<f64>,
    #[serde(alias = "max_session_tokens")]
    pub max_tokens_per_session: Option<i64>,
    pub soft_limit_percentage: Option<f64>,
    pub max_subcall_depth: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SandboxConfigFile {
    pub security_mode: Option<String>,
    pub code_timeout_seconds: Option<i64>,
    #[serde(alias = "max_print_chars")]
    pub max_output_chars: Option<i64>,
    pub blocked_builtins: Option<Vec<String>>,
    pub allowed_modules: Option<Vec<String>>,
    pub python_command: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PricingEntryFile {
    pub input: f64,
    pub output: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionConfigSection {
    pub session_timeout_seconds: Option<i64>,
    pub max_turns: Option<u32>,
    pub max_concurrent_subcalls: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenEstimateConfigFile {
    pub chars_per_token: Option<f64>,
    pub token_safety_multiplier: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TraceConfigFile {
    pub enabled: Option<bool>,
    pub prompt_preview_chars: Option<i64>,
    pub response_preview_chars: Option<i64>,
    pub stdout_preview_chars: Option<i64>,
    pub ledger_path: Option<PathBuf>,
    pub trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoutingThresholdsFile {
    pub pre_flight_token_limit: Option<u64>,
    pub node_limit: Option<u64>,
    pub depth_limit: Option<u32>,
    pub array_limit: Option<u64>,
    pub csv_column_limit: Option<u64>,
    pub low_line_limit: Option<u64>,
    pub nesting_limit: Option<u32>,
    pub weak_retrieval_score: Option<f64>,
}

impl From<RoutingThresholdsFile> for RoutingThresholds {
    fn from(file: RoutingThresholdsFile) -> Self {
        let mut config = RoutingThresholds::default();
        if let Some(pre_flight_token_limit) = file.pre_flight_token_limit {
            config.pre_flight_token_limit = pre_flight_token_limit;
        }
        if let Some(node_limit) = file.node_limit {
            config.node_limit = node_limit;
        }
        if let Some(depth_limit) = file.depth_limit {
            config.depth_limit = depth_limit;
        }
        if let Some(array_limit) = file.array_limit {
            config.array_limit = array_limit;
        }
        if let Some(csv_column_limit) = file.csv_column_limit {
            config.csv_column_limit = csv_column_limit;
        }
        if let Some(low_line_limit) = file.low_line_limit {
            config.low_line_limit = low_line_limit;
        }
        if let Some(nesting_limit) = file.nesting_limit {
            config.nesting_limit = nesting_limit;
        }
        if let Some(weak_retrieval_score) = file.weak_retrieval_score {
            config.weak_retrieval_score = weak_retrieval_score;
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayConfigFile {
    pub local_base_url: Option<String>,
    pub remote_base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub request_timeout_seconds: Option<u64>,
}

impl From<GatewayConfigFile> for GatewayConfig {
    fn from(file: GatewayConfigFile) -> Self {
        let mut config = GatewayConfig::default();
        if let Some(local_base_url) = file.local_base_url {
            config.local_base_url = local_base_url;
        }
        if let Some(remote_base_url) = file.remote_base_url {
            config.remote_base_url = remote_base_url;
        }
        if let Some(api_key_env) = file.api_key_env {
            config.api_key_env = api_key_env;
        }
        if let Some(request_timeout_seconds) = file.request_timeout_seconds {
            config.request_timeout_seconds = request_timeout_seconds;
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PromptConfigFile {
    pub template: Option<String>,
}

impl From<PromptConfigFile> for PromptConfig {
    fn from(file: PromptConfigFile) -> Self {
        let mut config = PromptConfig::default();
        if let Some(template) = file.template {
            config.template = template;
        }
        config
    }
}
