use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::SafetyMode;

const STRICT_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "multiprocessing",
    "pty",
    "urllib",
    "http",
    "requests",
    "ftplib",
    "telnetlib",
    "smtplib",
    "importlib",
];

const RELAXED_MODULES: &[&str] = &["subprocess", "socket", "ctypes", "pty", "multiprocessing"];

const STRICT_BUILTINS: &[&str] = &[
    "exec",
    "eval",
    "__import__",
    "compile",
    "open",
    "file",
    "globals",
    "locals",
    "vars",
    "delattr",
    "setattr",
    "reload",
    "input",
    "raw_input",
];

const RELAXED_BUILTINS: &[&str] = &["exec", "eval", "__import__"];

// statement starts: line start, after `;`, or after a compound header's `:`
static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[;:])\s*import\s+([^;]+)").expect("static regex"));
static FROM_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[;:])\s*from\s+([\w\.]+)\s+import\b").expect("static regex")
});
static LOADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(__import__|__builtins__)\b").expect("static regex"));
static CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\w+)\s*\(").expect("static regex"));
static SPAWN_METHOD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.(system|popen|spawn[lv]p?e?|exec[lv]p?e?|fork)\s*\(").expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreeningViolation {
    pub line: usize,
    pub rule: String,
}

impl std::fmt::Display for ScreeningViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Disallowed operation: {} (line {})", self.rule, self.line)
    }
}

/// Names a sandboxed script may not import or call.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    mode: SafetyMode,
    modules: &'static [&'static str],
    builtins: &'static [&'static str],
}

impl SafetyPolicy {
    pub fn for_mode(mode: SafetyMode) -> Self {
        match mode {
            SafetyMode::Strict => Self {
                mode,
                modules: STRICT_MODULES,
                builtins: STRICT_BUILTINS,
            },
            SafetyMode::Relaxed => Self {
                mode,
                modules: RELAXED_MODULES,
                builtins: RELAXED_BUILTINS,
            },
        }
    }

    pub fn mode(&self) -> SafetyMode {
        self.mode
    }

    fn forbidden_module(&self, dotted: &str) -> Option<&'static str> {
        let top = dotted.trim().split('.').next().unwrap_or_default();
        self.modules.iter().copied().find(|m| *m == top)
    }

    /// First violation in source order, if any.
    pub fn screen(&self, script: &str) -> Result<(), ScreeningViolation> {
        for (idx, raw) in script.lines().enumerate() {
            let masked = mask_line(raw);
            let line = masked.as_str();
            if line.trim().is_empty() {
                continue;
            }
            let violation = |rule: String| ScreeningViolation {
                line: idx + 1,
                rule,
            };

            for caps in FROM_IMPORT_RE.captures_iter(line) {
                if let Some(module) = self.forbidden_module(&caps[1]) {
                    return Err(violation(format!("import of `{module}`")));
                }
            }
            for caps in IMPORT_RE.captures_iter(line) {
                for item in caps[1].split(',') {
                    let name = item.split_whitespace().next().unwrap_or_default();
                    if let Some(module) = self.forbidden_module(name) {
                        return Err(violation(format!("import of `{module}`")));
                    }
                }
            }

            // the loader is forbidden as a bare name, not only as a call
            if let Some(caps) = LOADER_RE.captures(line) {
                return Err(violation(format!("reference to `{}`", &caps[1])));
            }

            for caps in CALL_RE.captures_iter(line) {
                let Some(name) = caps.get(1) else { continue };
                if line[..name.start()].ends_with('.') {
                    continue;
                }
                let name = name.as_str();
                if self.builtins.contains(&name) {
                    return Err(violation(format!("call to `{name}()`")));
                }
            }

            if let Some(caps) = SPAWN_METHOD_RE.captures(line) {
                return Err(violation(format!("process call `.{}()`", &caps[1])));
            }
        }
        Ok(())
    }
}

/// Blanks string literal contents and drops a trailing `#` comment.
pub(crate) fn mask_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                    out.push(' ');
                } else if c == '\\' {
                    escaped = true;
                    out.push(' ');
                } else if c == q {
                    quote = None;
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
            None => match c {
                '#' => break,
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                _ => out.push(c),
            },
        }
    }
    out
}
