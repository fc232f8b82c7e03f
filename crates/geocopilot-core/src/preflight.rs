//! Static checks run before a script is dispatched.
//!
//! Two kinds of findings come out of here. Environment mismatches (the
//! interactive handle or a processing algorithm the host cannot provide) block
//! the run. Calls to methods the API manifest does not know are advisory and
//! carry close-match suggestions. So are imports of the host library, whose
//! classes are already in scope.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use geocopilot_types::{EnvironmentProfile, ErrorKind, StructuredError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::environment::AlgorithmRegistry;
use crate::screening::mask_line;

const BUILTIN_MANIFEST: &str = include_str!("../resources/api_manifest.json");
const SUGGESTION_CUTOFF: f64 = 0.72;
const MAX_SUGGESTIONS: usize = 3;

static ANNOTATED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\w+)\s*:\s*(\w+)\s*=").expect("static regex"));
static ASSIGN_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\w+)\s*=\s*((?:\w+\.)*\w+)\s*\(").expect("static regex")
});
static ATTRIBUTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\w+)\.(\w+)\b").expect("static regex"));
static HOST_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:from\s+qgis(?:\.\w+)*\s+import\b|import\s+qgis\b)").expect("static regex")
});
static IFACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\biface\b").expect("static regex"));
static IFACE_GUARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bif\s+(?:not\s+)?iface\b|\biface\s+is\s+(?:not\s+)?None\b|\biface\s+and\b")
        .expect("static regex")
});
static IFACE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)if\s+iface(?:\s+is\s+not\s+None)?\s*:\s*$").expect("static regex")
});
static PROCESSING_RUN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bprocessing\.run(?:AndLoadResults)?\s*\(\s*["']([^"']+)["']"#)
        .expect("static regex")
});

/// Known classes and their methods.
#[derive(Debug, Clone, Default)]
pub struct ApiManifest {
    classes: BTreeMap<String, BTreeSet<String>>,
}

impl ApiManifest {
    pub fn builtin() -> Self {
        match serde_json::from_str::<Value>(BUILTIN_MANIFEST) {
            Ok(value) => Self::from_value(&value),
            Err(err) => {
                tracing::warn!("bundled API manifest is unreadable: {err}");
                Self::default()
            }
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let value = serde_json::from_str::<Value>(&raw)?;
        let manifest = Self::from_value(&value);
        if manifest.classes.is_empty() {
            anyhow::bail!("manifest {} declares no classes", path.display());
        }
        Ok(manifest)
    }

    /// Accepts `{"modules": {mod: {Class: {"kind": "class", "attrs": {...}}}}}`
    /// or the flat `{"classes": {Class: ["method", ...]}}`.
    pub fn from_value(value: &Value) -> Self {
        let mut classes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        if let Some(modules) = value.get("modules").and_then(Value::as_object) {
            for items in modules.values().filter_map(Value::as_object) {
                for (class, entry) in items {
                    if entry.get("kind").and_then(Value::as_str) != Some("class") {
                        continue;
                    }
                    let methods = classes.entry(class.clone()).or_default();
                    if let Some(attrs) = entry.get("attrs").and_then(Value::as_object) {
                        methods.extend(attrs.keys().cloned());
                    }
                }
            }
        }
        if let Some(flat) = value.get("classes").and_then(Value::as_object) {
            for (class, methods) in flat {
                let entry = classes.entry(class.clone()).or_default();
                if let Some(list) = methods.as_array() {
                    entry.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                }
            }
        }
        Self { classes }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    pub fn has_method(&self, class: &str, method: &str) -> bool {
        self.classes
            .get(class)
            .is_some_and(|methods| methods.contains(method))
    }

    /// Closest `Class.method` names to `class.attr` across the manifest.
    pub fn suggest(&self, class: &str, attr: &str) -> Vec<String> {
        let qualified = self
            .classes
            .iter()
            .flat_map(|(c, methods)| methods.iter().map(move |m| format!("{c}.{m}")))
            .collect::<Vec<_>>();
        close_matches(
            &format!("{class}.{attr}"),
            &qualified,
            MAX_SUGGESTIONS,
            SUGGESTION_CUTOFF,
        )
    }
}

/// `2 * matches / total` over recursively found longest common blocks.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    2.0 * matched_chars(&a, &b) as f64 / (a.len() + b.len()) as f64
}

fn matched_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, k) = longest_block(a, b);
    if k == 0 {
        return 0;
    }
    k + matched_chars(&a[..i], &b[..j]) + matched_chars(&a[i + k..], &b[j + k..])
}

fn longest_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut row = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let k = prev[j] + 1;
                row[j + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        prev = row;
    }
    best
}

pub fn close_matches(word: &str, candidates: &[String], n: usize, cutoff: f64) -> Vec<String> {
    let mut scored = candidates
        .iter()
        .map(|c| (similarity(word, c), c))
        .filter(|(score, _)| *score >= cutoff)
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().take(n).map(|(_, c)| c.clone()).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub line: usize,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl Finding {
    pub fn render(&self) -> String {
        if self.suggestions.is_empty() {
            format!("line {}: {}", self.line, self.message)
        } else {
            format!(
                "line {}: {}. Did you mean: {}",
                self.line,
                self.message,
                self.suggestions.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub blocking: Option<StructuredError>,
    pub warnings: Vec<Finding>,
}

pub struct Preflight<'a> {
    manifest: &'a ApiManifest,
}

impl<'a> Preflight<'a> {
    pub fn new(manifest: &'a ApiManifest) -> Self {
        Self { manifest }
    }

    pub fn check(
        &self,
        script: &str,
        profile: &EnvironmentProfile,
        algorithms: Option<&dyn AlgorithmRegistry>,
    ) -> PreflightReport {
        let lines = script
            .lines()
            .map(|raw| (raw, mask_line(raw)))
            .collect::<Vec<_>>();
        let mut report = PreflightReport {
            blocking: self.environment_blocker(&lines, profile, algorithms),
            warnings: Vec::new(),
        };

        let types = self.infer_types(&lines);
        for (idx, (_, code)) in lines.iter().enumerate() {
            if HOST_IMPORT_RE.is_match(code) {
                report.warnings.push(Finding {
                    line: idx + 1,
                    message: "redundant host-library import; its classes are already in scope"
                        .to_string(),
                    suggestions: Vec::new(),
                });
                continue;
            }
            for caps in ATTRIBUTE_RE.captures_iter(code) {
                let (var, attr) = (&caps[1], &caps[2]);
                if attr.starts_with("__") {
                    continue;
                }
                let Some(class) = types.get(var) else { continue };
                if self.manifest.has_method(class, attr) {
                    continue;
                }
                report.warnings.push(Finding {
                    line: idx + 1,
                    message: format!("{class}.{attr} not found (via `{var}`)"),
                    suggestions: self.manifest.suggest(class, attr),
                });
            }
        }
        report
    }

    fn environment_blocker(
        &self,
        lines: &[(&str, String)],
        profile: &EnvironmentProfile,
        algorithms: Option<&dyn AlgorithmRegistry>,
    ) -> Option<StructuredError> {
        // indent of an open `if iface:` block
        let mut guard_indent: Option<usize> = None;
        for (idx, (raw, code)) in lines.iter().enumerate() {
            let line = idx + 1;
            let indent = code.len() - code.trim_start().len();
            if guard_indent.is_some_and(|g| !code.trim().is_empty() && indent <= g) {
                guard_indent = None;
            }
            if let Some(caps) = IFACE_BLOCK_RE.captures(code) {
                guard_indent.get_or_insert(caps[1].len());
            }
            let guarded = guard_indent.is_some() || IFACE_GUARD_RE.is_match(code);
            if !profile.has_interactive_handle && !guarded && IFACE_RE.is_match(code) {
                return Some(StructuredError::new(
                    ErrorKind::MissingInteractiveContext,
                    format!(
                        "line {line} uses the interactive handle `iface`, which is not available in this environment"
                    ),
                ));
            }
            if !code.contains("processing.run") {
                continue;
            }
            let Some(caps) = PROCESSING_RUN_RE.captures(raw) else {
                continue;
            };
            let algorithm = &caps[1];
            let registry = algorithms.filter(|_| profile.has_processing_registry);
            match registry {
                None => {
                    return Some(StructuredError::new(
                        ErrorKind::AlgorithmNotFound,
                        format!(
                            "line {line} runs `{algorithm}` but no processing registry is available"
                        ),
                    ))
                }
                Some(registry) if !registry.has_algorithm(algorithm) => {
                    let ids = registry.algorithm_ids();
                    let hints = close_matches(algorithm, &ids, MAX_SUGGESTIONS, 0.6);
                    let mut message = format!("line {line}: algorithm `{algorithm}` is not registered");
                    if !hints.is_empty() {
                        message.push_str(&format!(". Did you mean: {}", hints.join(", ")));
                    }
                    return Some(StructuredError::new(ErrorKind::AlgorithmNotFound, message));
                }
                Some(_) => {}
            }
        }
        None
    }

    fn infer_types(&self, lines: &[(&str, String)]) -> HashMap<String, String> {
        let mut types = HashMap::new();
        for (_, code) in lines {
            if let Some(caps) = ANNOTATED_RE.captures(code) {
                if self.manifest.has_class(&caps[2]) {
                    types.insert(caps[1].to_string(), caps[2].to_string());
                    continue;
                }
            }
            let Some(caps) = ASSIGN_CALL_RE.captures(code) else {
                continue;
            };
            let var = caps[1].to_string();
            let chain = caps[2].split('.').collect::<Vec<_>>();
            let last = chain.last().copied().unwrap_or_default();
            let class = if self.manifest.has_class(last) {
                Some(last)
            } else if last == "instance" && chain.len() >= 2 && self.manifest.has_class(chain[chain.len() - 2]) {
                Some(chain[chain.len() - 2])
            } else {
                None
            };
            match class {
                Some(class) => {
                    types.entry(var).or_insert_with(|| class.to_string());
                }
                None => {
                    // reassigned to something unknown; stop tracking
                    types.remove(&var);
                }
            }
        }
        types
    }
}
