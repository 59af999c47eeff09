//! Rule packs for the offline heuristic provider.
//!
//! A pack is a directory holding `keywords.txt` (one
//! `id|category|weight|description|pattern[|recommendation]` rule per line) and/or
//! `patterns.json` (an array of regex rules). The built-in pack is compiled in.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::RiskCategory;

const BUILTIN_KEYWORDS: &str = include_str!("../../rules/keywords.txt");
const BUILTIN_PATTERNS: &str = include_str!("../../rules/patterns.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Keyword,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier, e.g. `LIAB_UNLIMITED`.
    pub id: String,
    pub category: RiskCategory,
    pub description: String,
    pub kind: RuleKind,
    /// Keyword literal or regex source.
    pub pattern: String,
    /// Severity contribution, 0.0–100.0 inclusive.
    pub weight: f32,
    pub recommendation: Option<String>,
}

impl Rule {
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.id.trim().is_empty() {
            return Err(RuleValidationError::EmptyId);
        }
        if self.pattern.trim().is_empty() {
            return Err(RuleValidationError::EmptyPattern {
                rule_id: self.id.clone(),
            });
        }
        if !(0.0..=100.0).contains(&self.weight) {
            return Err(RuleValidationError::InvalidWeight {
                rule_id: self.id.clone(),
                weight: self.weight,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleValidationError {
    #[error("rule id must not be blank")]
    EmptyId,
    #[error("rule `{rule_id}` pattern must not be empty")]
    EmptyPattern { rule_id: String },
    #[error("rule `{rule_id}` weight must be within 0.0..=100.0 (got {weight})")]
    InvalidWeight { rule_id: String, weight: f32 },
}

#[derive(Deserialize)]
struct JsonRule {
    id: String,
    category: String,
    description: String,
    pattern: String,
    weight: f32,
    #[serde(default)]
    recommendation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RulePack {
    rules: Vec<Rule>,
}

impl RulePack {
    pub fn builtin() -> Result<Self> {
        let origin = Path::new("<built-in>");
        Self::parse(Some(BUILTIN_KEYWORDS), Some(BUILTIN_PATTERNS), origin)
    }

    /// Load `keywords.txt` and `patterns.json` from `dir`; at least one must exist.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let keywords = read_optional(&dir.join("keywords.txt"))?;
        let patterns = read_optional(&dir.join("patterns.json"))?;
        if keywords.is_none() && patterns.is_none() {
            bail!(
                "rule directory {} contains neither keywords.txt nor patterns.json",
                dir.display()
            );
        }
        Self::parse(keywords.as_deref(), patterns.as_deref(), dir)
    }

    fn parse(keywords: Option<&str>, patterns: Option<&str>, origin: &Path) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::new();
        if let Some(source) = keywords {
            let path = origin.join("keywords.txt");
            rules.extend(parse_keywords(source, &path, &mut seen)?);
        }
        if let Some(source) = patterns {
            let path = origin.join("patterns.json");
            rules.extend(parse_patterns(source, &path, &mut seen)?);
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("failed to read rule file at {}", path.display()))
}

fn parse_keywords(source: &str, path: &PathBuf, seen: &mut HashSet<String>) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parts: Vec<_> = trimmed.splitn(6, '|').map(str::trim).collect();
        if parts.len() < 5 {
            bail!(
                "invalid keyword rule at {}:{} (expected id|category|weight|description|pattern)",
                path.display(),
                idx + 1
            );
        }
        let id = parts[0].to_string();
        let category = parts[1]
            .parse::<RiskCategory>()
            .with_context(|| format!("rule `{id}` at {}:{}", path.display(), idx + 1))?;
        let weight: f32 = parts[2].parse().with_context(|| {
            format!(
                "invalid weight `{}` for rule `{}` at {}:{}",
                parts[2],
                id,
                path.display(),
                idx + 1
            )
        })?;
        let recommendation = parts.get(5).filter(|s| !s.is_empty());
        let rule = Rule {
            id,
            category,
            description: parts[3].to_string(),
            kind: RuleKind::Keyword,
            pattern: parts[4].to_string(),
            weight,
            recommendation: recommendation.map(|s| s.to_string()),
        };
        push_rule(&mut rules, rule, seen)?;
    }
    Ok(rules)
}

fn parse_patterns(source: &str, path: &PathBuf, seen: &mut HashSet<String>) -> Result<Vec<Rule>> {
    let items: Vec<JsonRule> = serde_json::from_str(source).with_context(|| {
        format!(
            "invalid JSON structure in pattern rule file at {}",
            path.display()
        )
    })?;
    let mut rules = Vec::new();
    for item in items {
        let category = item
            .category
            .parse::<RiskCategory>()
            .with_context(|| format!("rule `{}` in {}", item.id, path.display()))?;
        let rule = Rule {
            id: item.id,
            category,
            description: item.description,
            kind: RuleKind::Regex,
            pattern: item.pattern,
            weight: item.weight,
            recommendation: item.recommendation,
        };
        push_rule(&mut rules, rule, seen)?;
    }
    Ok(rules)
}

fn push_rule(rules: &mut Vec<Rule>, rule: Rule, seen: &mut HashSet<String>) -> Result<()> {
    rule.validate()?;
    if !seen.insert(rule.id.clone()) {
        return Err(anyhow!("duplicate rule id `{}`", rule.id));
    }
    rules.push(rule);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn loads_keyword_and_pattern_rules() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("keywords.txt"),
            r#"
# comment
LIAB_X|liability|80|Unlimited liability|unlimited liability|Add a cap
TERM_X|termination|40|Termination for convenience|terminate for convenience
"#,
        );
        write(
            &temp.path().join("patterns.json"),
            r#"[{"id": "PAY_X", "category": "payment", "description": "Short window",
                 "pattern": "(?i)within \\d days", "weight": 35}]"#,
        );

        let pack = RulePack::from_dir(temp.path()).unwrap();
        assert_eq!(pack.len(), 3);
        let liability = pack.get("LIAB_X").unwrap();
        assert_eq!(liability.category, RiskCategory::Liability);
        assert_eq!(liability.recommendation.as_deref(), Some("Add a cap"));
        assert_eq!(pack.get("TERM_X").unwrap().recommendation, None);
        assert_eq!(pack.get("PAY_X").unwrap().kind, RuleKind::Regex);
    }

    #[test]
    fn duplicate_ids_error() {
        let temp = tempfile::tempdir().unwrap();
        write(
            &temp.path().join("keywords.txt"),
            "DUP|payment|10|desc|pattern\nDUP|payment|15|dup again|another",
        );
        let err = RulePack::from_dir(temp.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id `DUP`"));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let keywords = temp.path().join("keywords.txt");
        write(&keywords, "X|astrology|10|desc|stars");
        let err = RulePack::from_dir(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("astrology"));
    }

    #[test]
    fn out_of_range_weight_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        write(&temp.path().join("keywords.txt"), "X|payment|140|desc|fees");
        let err = RulePack::from_dir(temp.path()).unwrap_err();
        assert!(err.to_string().contains("0.0..=100.0"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        assert!(RulePack::from_dir(temp.path()).is_err());
    }

    #[test]
    fn builtin_pack_parses() {
        let pack = RulePack::builtin().expect("built-in rules should parse");
        assert!(pack.get("LIAB_UNLIMITED").is_some());
        assert!(pack.get("TERM_ANY_TIME").is_some());
        assert!(pack.rules().iter().all(|rule| rule.validate().is_ok()));
    }

    fn text_without_delimiter() -> impl Strategy<Value = String> {
        proptest::string::string_regex("[A-Za-z0-9 _\\-]{3,48}")
            .unwrap()
            .prop_filter("must contain non-whitespace", |s| !s.trim().is_empty())
    }

    proptest! {
        #[test]
        fn keyword_lines_load_with_valid_weights(
            entries in proptest::collection::vec(
                (text_without_delimiter(), 0.1f32..99.9f32, text_without_delimiter()),
                1..12
            )
        ) {
            let temp = tempfile::tempdir().unwrap();
            let mut buffer = String::new();
            for (idx, (desc, weight, pattern)) in entries.iter().enumerate() {
                buffer.push_str(&format!("AUTO{idx}|other|{weight:.3}|{desc}|{pattern}\n"));
            }
            write(&temp.path().join("keywords.txt"), &buffer);

            let pack = RulePack::from_dir(temp.path()).expect("keyword rules should parse");
            prop_assert_eq!(pack.len(), entries.len());
            for rule in pack.rules() {
                prop_assert!(rule.weight >= 0.0 && rule.weight <= 100.0);
                prop_assert_eq!(rule.kind, RuleKind::Keyword);
                prop_assert_eq!(rule.category, RiskCategory::Other);
            }
        }
    }
}
