//! Pre-install package scoring

use super::integrity::{verify_checksum, verify_signature, IntegrityError};
use super::patterns::DYNAMIC_EVALUATION;
use super::SecurityValidator;
use crate::isolation::select_variant;
use crate::HOST_VERSION;
use sdk::manifest::{Manifest, PermissionKind};
use sdk::types::{PluginPackage, Severity, ValidationFinding, ValidationReport};
use std::collections::BTreeSet;

const OBFUSCATION_MIN_IDENTIFIERS: usize = 20;
const OBFUSCATION_MAX_AVG_IDENTIFIER: f64 = 3.0;
const MAX_STRING_LITERAL: usize = 1000;
const MAX_HEX_ESCAPES: usize = 10;
const MINIFIED_LINE_LENGTH: usize = 500;
const MIN_JUSTIFICATION: usize = 10;

/// Accumulates findings and the running score
struct Audit {
    score: i32,
    issues: Vec<ValidationFinding>,
    warnings: Vec<ValidationFinding>,
    recommendations: BTreeSet<String>,
}

impl Audit {
    fn new() -> Self {
        Self {
            score: 100,
            issues: Vec::new(),
            warnings: Vec::new(),
            recommendations: BTreeSet::new(),
        }
    }

    fn issue(&mut self, penalty: i32, code: &str, severity: Severity, message: String) {
        self.score -= penalty;
        self.issues.push(ValidationFinding {
            code: code.to_string(),
            severity,
            message,
        });
    }

    fn warning(&mut self, penalty: i32, code: &str, message: String) {
        self.score -= penalty;
        self.warnings.push(ValidationFinding {
            code: code.to_string(),
            severity: Severity::Low,
            message,
        });
    }

    fn recommend(&mut self, text: &str) {
        self.recommendations.insert(text.to_string());
    }

    fn finish(self, plugin_id: &str, min_score: u8) -> ValidationReport {
        let score = self.score.clamp(0, 100) as u8;
        let has_critical = self.issues.iter().any(|i| i.severity == Severity::Critical);
        ValidationReport {
            plugin_id: plugin_id.to_string(),
            valid: score >= min_score && !has_critical,
            score,
            issues: self.issues,
            warnings: self.warnings,
            recommendations: self.recommendations.into_iter().collect(),
        }
    }
}

impl SecurityValidator {
    /// Score a package and decide whether it may be installed
    ///
    /// A blocked id short-circuits to score 0 with a critical
    /// `blocked_plugin` issue. Otherwise the score starts at 100 and every
    /// finding deducts from it; the result is clamped to `[0, 100]`.
    pub async fn validate(&self, package: &PluginPackage) -> ValidationReport {
        let manifest = &package.manifest;

        if self.is_blocked(&manifest.id).await {
            let mut audit = Audit::new();
            audit.score = 0;
            audit.issue(
                0,
                "blocked_plugin",
                Severity::Critical,
                format!("Plugin '{}' is on the block list", manifest.id),
            );
            return audit.finish(&manifest.id, self.config.min_score);
        }

        let mut audit = Audit::new();
        self.audit_manifest(manifest, &mut audit);
        self.audit_permissions(manifest, &mut audit);
        self.audit_code(package, &mut audit);
        self.audit_integrity(package, &mut audit).await;
        self.audit_dependencies(package, &mut audit);
        self.audit_developer(manifest, &mut audit).await;
        self.audit_contents(package, &mut audit);

        let report = audit.finish(&manifest.id, self.config.min_score);
        tracing::info!(
            "Validated {} v{}: score {}, valid {}, {} issue(s), {} warning(s)",
            manifest.id,
            manifest.version,
            report.score,
            report.valid,
            report.issues.len(),
            report.warnings.len()
        );
        report
    }

    fn audit_manifest(&self, manifest: &Manifest, audit: &mut Audit) {
        let required = [
            ("id", &manifest.id),
            ("name", &manifest.name),
            ("version", &manifest.version),
            ("author", &manifest.author),
            ("description", &manifest.description),
            ("entry", &manifest.entry),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                audit.issue(
                    10,
                    "missing_field",
                    Severity::Medium,
                    format!("Manifest is missing required field '{}'", field),
                );
            }
        }
        if required.iter().any(|(_, v)| v.trim().is_empty()) {
            audit.recommend("Fill in every required manifest field");
        }

        if !manifest.id.is_empty() && !self.patterns.is_valid_id(&manifest.id) {
            audit.issue(
                15,
                "invalid_id",
                Severity::High,
                format!("Plugin id '{}' is not a lowercase slug", sdk::errors::truncate(&manifest.id)),
            );
        }

        if !manifest.version.is_empty() && semver::Version::parse(&manifest.version).is_err() {
            audit.issue(
                10,
                "invalid_version",
                Severity::Medium,
                format!("Version '{}' is not semantic", sdk::errors::truncate(&manifest.version)),
            );
        }

        if let Some(min_host) = &manifest.min_host_version {
            match semver::Version::parse(min_host) {
                Err(_) => audit.warning(
                    5,
                    "invalid_min_host_version",
                    format!("minHostVersion '{}' is not semantic", sdk::errors::truncate(min_host)),
                ),
                Ok(required) => {
                    let host = semver::Version::parse(HOST_VERSION)
                        .unwrap_or_else(|_| semver::Version::new(0, 0, 0));
                    if required > host {
                        audit.issue(
                            20,
                            "incompatible_host",
                            Severity::High,
                            format!("Requires host {} but this host is {}", required, host),
                        );
                    }
                }
            }
        }
    }

    fn audit_permissions(&self, manifest: &Manifest, audit: &mut Audit) {
        let mut seen = BTreeSet::new();

        for permission in &manifest.permissions {
            match permission.kind {
                PermissionKind::System => {
                    audit.issue(
                        30,
                        "system_permission",
                        Severity::Critical,
                        "Requests the system permission, which is never granted".to_string(),
                    );
                    audit.recommend("Remove the system permission");
                }
                PermissionKind::Filesystem => {
                    audit.issue(
                        20,
                        "filesystem_permission",
                        Severity::High,
                        "Requests filesystem access".to_string(),
                    );
                    audit.recommend("Use the storage namespace instead of filesystem access");
                }
                PermissionKind::Storage
                | PermissionKind::Network
                | PermissionKind::Ui
                | PermissionKind::Api => {}
            }

            if permission.scope.trim().is_empty() {
                audit.warning(
                    5,
                    "missing_scope",
                    format!("The {} permission has no scope", permission.kind),
                );
                audit.recommend("Give every permission a narrow scope");
            }

            if permission.description.trim().chars().count() < MIN_JUSTIFICATION {
                audit.warning(
                    3,
                    "weak_justification",
                    format!("The {} permission is not adequately justified", permission.kind),
                );
                audit.recommend("Explain why each permission is needed");
            }

            if permission.kind == PermissionKind::Network && permission.scope.contains('*') {
                audit.warning(
                    5,
                    "wildcard_network",
                    format!("Network scope '{}' uses a wildcard", sdk::errors::truncate(&permission.scope)),
                );
                audit.recommend("List the exact hosts the plugin contacts");
            }

            if !seen.insert(permission.kind) {
                audit.warning(
                    0,
                    "duplicate_permission",
                    format!("The {} permission is declared more than once", permission.kind),
                );
            }
        }

        if let Some(declared) = manifest.isolation_variant {
            let kinds: Vec<PermissionKind> = seen.into_iter().collect();
            let required = select_variant(&kinds);
            if declared != required {
                audit.warning(
                    0,
                    "isolation_variant_mismatch",
                    format!(
                        "Declares isolation variant '{}' but its permissions require '{}'; '{}' will be used",
                        declared, required, required
                    ),
                );
            }
        }
    }

    fn audit_code(&self, package: &PluginPackage, audit: &mut Audit) {
        let code = &package.code;

        if code.len() > self.max_code_bytes {
            audit.issue(
                20,
                "code_too_large",
                Severity::High,
                format!("Code is {} bytes, above the {} byte limit", code.len(), self.max_code_bytes),
            );
        }

        for hit in self.patterns.scan(code) {
            if hit.code == DYNAMIC_EVALUATION {
                audit.issue(
                    20,
                    DYNAMIC_EVALUATION,
                    Severity::Critical,
                    format!("Dynamic code evaluation on line {}", hit.line),
                );
                audit.recommend("Remove all dynamic code evaluation");
            } else {
                audit.issue(
                    20,
                    hit.code,
                    Severity::High,
                    format!("Prohibited construct {} on line {}", hit.label, hit.line),
                );
                audit.recommend("Reach host capabilities only through the api object");
            }
        }

        let (avg_identifier, identifiers) = self.patterns.identifier_stats(code);
        if identifiers >= OBFUSCATION_MIN_IDENTIFIERS && avg_identifier < OBFUSCATION_MAX_AVG_IDENTIFIER {
            audit.warning(
                10,
                "short_identifiers",
                format!("Average identifier length is {:.1}; code may be obfuscated", avg_identifier),
            );
        }

        let longest = self.patterns.longest_string_literal(code);
        if longest > MAX_STRING_LITERAL {
            audit.warning(
                5,
                "long_string_literal",
                format!("A string literal is {} characters long", longest),
            );
        }

        let escapes = self.patterns.hex_escape_count(code);
        if escapes > MAX_HEX_ESCAPES {
            audit.warning(10, "hex_escapes", format!("Code contains {} hex escapes", escapes));
        }

        if !package.source_map && code.lines().any(|l| l.chars().count() > MINIFIED_LINE_LENGTH) {
            audit.warning(
                5,
                "minified_code",
                "Code looks minified and ships without a source map".to_string(),
            );
            audit.recommend("Ship readable code or include a source map");
        }
    }

    async fn audit_integrity(&self, package: &PluginPackage, audit: &mut Audit) {
        if let Some(expected) = &package.checksum {
            if let Err(e) = verify_checksum(package.code.as_bytes(), expected) {
                audit.issue(
                    30,
                    "checksum_mismatch",
                    Severity::Critical,
                    format!("Code checksum failed: {}", e),
                );
            }
        }

        let Some(signature) = &package.signature else {
            return;
        };

        let key = {
            let state = self.state.read().await;
            state
                .trusted
                .get(&package.manifest.author)
                .and_then(|d| d.public_key.clone())
        };

        match key {
            None => audit.warning(
                0,
                "unverified_signature",
                format!("No key is known for '{}'; signature not checked", package.manifest.author),
            ),
            Some(key) => match verify_signature(&key, package.code.as_bytes(), signature) {
                Ok(()) => audit.score += 5,
                Err(IntegrityError::InvalidFormat(reason)) => audit.issue(
                    30,
                    "invalid_signature",
                    Severity::Critical,
                    format!("Malformed signature: {}", reason),
                ),
                Err(e) => audit.issue(
                    30,
                    "invalid_signature",
                    Severity::Critical,
                    format!("Signature check failed: {}", e),
                ),
            },
        }
    }

    fn audit_dependencies(&self, package: &PluginPackage, audit: &mut Audit) {
        for (name, version) in &package.dependencies {
            let Some(requirement) = self.config.vulnerable_dependencies.get(name) else {
                continue;
            };
            let Ok(requirement) = semver::VersionReq::parse(requirement) else {
                continue;
            };
            let cleaned = version.trim().trim_start_matches(['^', '~', '=', 'v']);
            if let Ok(version) = semver::Version::parse(cleaned) {
                if requirement.matches(&version) {
                    audit.warning(
                        10,
                        "vulnerable_dependency",
                        format!("Dependency {}@{} has known vulnerabilities", name, version),
                    );
                    audit.recommend("Upgrade vulnerable dependencies");
                }
            }
        }

        if package.dependencies.len() > self.config.max_dependencies {
            audit.warning(
                5,
                "too_many_dependencies",
                format!(
                    "{} dependencies exceed the limit of {}",
                    package.dependencies.len(),
                    self.config.max_dependencies
                ),
            );
        }
    }

    async fn audit_developer(&self, manifest: &Manifest, audit: &mut Audit) {
        let trusted = self.state.read().await.trusted.contains_key(&manifest.author);
        if trusted {
            audit.score += 10;
        } else {
            audit.warning(
                5,
                "unknown_developer",
                format!("Developer '{}' is not trusted", sdk::errors::truncate(&manifest.author)),
            );
        }
    }

    fn audit_contents(&self, package: &PluginPackage, audit: &mut Audit) {
        for file in &package.files {
            let path = file.path.to_ascii_lowercase();
            if let Some(ext) = self
                .config
                .disallowed_extensions
                .iter()
                .find(|ext| path.ends_with(&ext.to_ascii_lowercase()))
            {
                audit.issue(
                    30,
                    "disallowed_file",
                    Severity::Critical,
                    format!("File '{}' has disallowed extension {}", sdk::errors::truncate(&file.path), ext),
                );
                audit.recommend("Remove executable files from the package");
            }
        }

        let total = package.total_size();
        if total > self.config.max_package_bytes {
            audit.warning(
                10,
                "package_too_large",
                format!("Package is {} bytes, above {}", total, self.config.max_package_bytes),
            );
        }
    }
}
