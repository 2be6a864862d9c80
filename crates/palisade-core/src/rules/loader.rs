//! Rule file loading.
//!
//! Rule files are YAML documents with a top-level `rules:` list. The loader
//! walks the configured directory recursively (skipping ignored
//! subdirectories), parses every `.yaml`/`.yml` file in path order, and
//! compiles the matchers. The engine itself only ever sees the compiled
//! set.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::matcher::{Matcher, MatcherSpec};
use super::{Rule, RuleAction, RuleScope, Severity};

/// A rule as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub action: Option<RuleAction>,
    pub scopes: Vec<RuleScope>,
    #[serde(rename = "match")]
    pub matcher: MatcherSpec,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RuleSpec>,
}

/// Compile a parsed rule spec.
pub fn compile_rule(spec: &RuleSpec) -> Result<Rule> {
    let matcher = Matcher::compile(&spec.matcher)
        .with_context(|| format!("invalid matcher in rule '{}'", spec.id))?;
    Ok(Rule {
        id: spec.id.clone(),
        name: spec.name.clone(),
        description: spec.description.clone(),
        severity: spec.severity,
        classification: spec.classification.clone(),
        action: spec.action,
        scopes: spec.scopes.clone(),
        matcher,
    })
}

/// Load and compile every rule file under `dir`, preserving file order and
/// in-file order. Directories listed in `ignore` (by path or by final
/// component) are skipped entirely.
pub fn load_rules_from_directory(dir: &Path, ignore: &[PathBuf]) -> Result<Vec<Rule>> {
    let mut files = Vec::new();
    collect_rule_files(dir, ignore, &mut files)
        .with_context(|| format!("reading rules directory {}", dir.display()))?;
    files.sort();

    let mut rules = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file)
            .with_context(|| format!("reading rule file {}", file.display()))?;
        let parsed: RuleFile = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing rule file {}", file.display()))?;
        debug!(file = %file.display(), count = parsed.rules.len(), "parsed rule file");
        for spec in &parsed.rules {
            rules.push(compile_rule(spec)?);
        }
    }
    Ok(rules)
}

fn collect_rule_files(dir: &Path, ignore: &[PathBuf], out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if is_ignored(&path, ignore) {
                debug!(dir = %path.display(), "skipping ignored rules directory");
                continue;
            }
            collect_rule_files(&path, ignore, out)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_ignored(dir: &Path, ignore: &[PathBuf]) -> bool {
    ignore.iter().any(|ig| {
        if ig.components().count() == 1 {
            // A bare name ignores every directory with that name.
            dir.file_name() == Some(ig.as_os_str())
        } else {
            dir == ig || dir.ends_with(ig)
        }
    })
}
