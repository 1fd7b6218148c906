//! Build profiles
//!
//! Per-language build and runtime settings live in a registry keyed by
//! language tag. Adding a language means registering a profile; the
//! orchestrator never branches on the language itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::domain::deploy::DecodedFile;
use crate::error::DeployError;

/// Finds the port an application listens on by looking at one source file
pub trait PortDetector: Send + Sync {
    fn detect(&self, source: &str) -> Option<u16>;
}

/// Regex detector: the first capture group is parsed as the port
pub struct RegexPortDetector {
    pattern: Regex,
}

impl RegexPortDetector {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl PortDetector for RegexPortDetector {
    fn detect(&self, source: &str) -> Option<u16> {
        self.pattern
            .captures_iter(source)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
            .find(|port| *port != 0)
    }
}

impl fmt::Debug for RegexPortDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegexPortDetector")
            .field(&self.pattern.as_str())
            .finish()
    }
}

/// Build and runtime settings for one language
pub struct BuildProfile {
    pub language: String,
    pub base_image: String,
    /// Shell step run after the sources are copied in
    pub install_step: Option<String>,
    pub default_start_command: String,
    /// Extensions (lowercase, no dot) scanned by the port detectors
    pub source_extensions: Vec<String>,
    /// Tried in order, first hit wins
    pub port_detectors: Vec<Arc<dyn PortDetector>>,
    pub default_port: u16,
}

impl BuildProfile {
    /// Port the uploaded application listens on
    ///
    /// Files are visited in upload order and detectors in profile order.
    pub fn detect_port(&self, files: &[DecodedFile]) -> u16 {
        files
            .iter()
            .filter(|file| {
                file.extension()
                    .map_or(false, |ext| self.source_extensions.iter().any(|e| *e == ext))
            })
            .filter_map(|file| file.text())
            .find_map(|text| self.port_detectors.iter().find_map(|d| d.detect(text)))
            .unwrap_or(self.default_port)
    }

    /// The override when it is non-blank, otherwise the default
    pub fn start_command(&self, run_command: Option<&str>) -> String {
        match run_command.map(str::trim) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => self.default_start_command.clone(),
        }
    }
}

impl fmt::Debug for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildProfile")
            .field("language", &self.language)
            .field("base_image", &self.base_image)
            .field("default_start_command", &self.default_start_command)
            .field("default_port", &self.default_port)
            .field("port_detectors", &self.port_detectors.len())
            .finish()
    }
}

/// Compiles detector patterns, dropping any that fail to compile
fn regex_detectors(patterns: &[&str]) -> Vec<Arc<dyn PortDetector>> {
    patterns
        .iter()
        .filter_map(|pattern| match RegexPortDetector::new(pattern) {
            Ok(detector) => Some(Arc::new(detector) as Arc<dyn PortDetector>),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Skipping invalid port detector");
                None
            }
        })
        .collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

const NODEJS_PORT_PATTERNS: &[&str] = &[
    r"process\.env\.PORT\s*(?:\|\||\?\?)\s*(\d{2,5})",
    r"\.listen\(\s*(\d{2,5})",
    r"\bPORT\s*=\s*(\d{2,5})",
];

const PYTHON_PORT_PATTERNS: &[&str] = &[
    r#"environ(?:\.get\(|\.setdefault\()\s*["']PORT["']\s*,\s*["']?(\d{2,5})"#,
    r"(?i)\bport\s*=\s*(\d{2,5})",
    r#"bind\s*=\s*["'][^"':]*:(\d{2,5})"#,
];

const GO_PORT_PATTERNS: &[&str] = &[
    r#"ListenAndServe(?:TLS)?\(\s*"[^":]*:(\d{2,5})""#,
    r#"\.Run\(\s*"[^":]*:(\d{2,5})""#,
    r#"":(\d{2,5})""#,
];

const RUBY_PORT_PATTERNS: &[&str] = &[
    r"set\s+:port\s*,\s*(\d{2,5})",
    r#"ENV\.fetch\(\s*["']PORT["']\s*,\s*["']?(\d{2,5})"#,
    r#"ENV\[\s*["']PORT["']\s*\]\s*\|\|\s*["']?(\d{2,5})"#,
];

const PHP_PORT_PATTERNS: &[&str] = &[r#"getenv\(\s*["']PORT["']\s*\)\s*\?:\s*["']?(\d{2,5})"#];

/// Language tag -> profile
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<BuildProfile>>,
    aliases: HashMap<String, String>,
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Registry with the built-in languages
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.register(BuildProfile {
            language: "nodejs".into(),
            base_image: "node:20-alpine".into(),
            install_step: Some(
                "if [ -f package.json ]; then npm install --omit=dev; fi".into(),
            ),
            default_start_command: "node server.js".into(),
            source_extensions: strings(&["js", "mjs", "cjs", "ts"]),
            port_detectors: regex_detectors(NODEJS_PORT_PATTERNS),
            default_port: 3000,
        });
        registry.register(BuildProfile {
            language: "python".into(),
            base_image: "python:3.12-slim".into(),
            install_step: Some(
                "if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi"
                    .into(),
            ),
            default_start_command: "python app.py".into(),
            source_extensions: strings(&["py"]),
            port_detectors: regex_detectors(PYTHON_PORT_PATTERNS),
            default_port: 8000,
        });
        registry.register(BuildProfile {
            language: "go".into(),
            base_image: "golang:1.22-alpine".into(),
            install_step: Some(
                "([ -f go.mod ] || go mod init app) && go mod tidy && go build -o /app/server ."
                    .into(),
            ),
            default_start_command: "/app/server".into(),
            source_extensions: strings(&["go"]),
            port_detectors: regex_detectors(GO_PORT_PATTERNS),
            default_port: 8080,
        });
        registry.register(BuildProfile {
            language: "ruby".into(),
            base_image: "ruby:3.3-slim".into(),
            install_step: Some("if [ -f Gemfile ]; then bundle install; fi".into()),
            default_start_command: "ruby app.rb".into(),
            source_extensions: strings(&["rb"]),
            port_detectors: regex_detectors(RUBY_PORT_PATTERNS),
            default_port: 4567,
        });
        registry.register(BuildProfile {
            language: "php".into(),
            base_image: "php:8.3-cli".into(),
            install_step: None,
            default_start_command: "php -S 0.0.0.0:$PORT -t /app".into(),
            source_extensions: strings(&["php"]),
            port_detectors: regex_detectors(PHP_PORT_PATTERNS),
            default_port: 8000,
        });

        registry.alias("node", "nodejs");
        registry.alias("javascript", "nodejs");
        registry.alias("py", "python");
        registry.alias("golang", "go");

        registry
    }

    pub fn register(&mut self, profile: BuildProfile) {
        self.profiles
            .insert(profile.language.to_ascii_lowercase(), Arc::new(profile));
    }

    pub fn alias(&mut self, alias: &str, language: &str) {
        self.aliases
            .insert(alias.to_ascii_lowercase(), language.to_ascii_lowercase());
    }

    /// Case-insensitive lookup, aliases included
    pub fn resolve(&self, language: &str) -> Result<Arc<BuildProfile>, DeployError> {
        let key = language.trim().to_ascii_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(key)
            .cloned()
            .ok_or_else(|| DeployError::UnsupportedLanguage(language.to_string()))
    }

    /// Canonical language tags, sorted
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.profiles.keys().cloned().collect();
        languages.sort();
        languages
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
