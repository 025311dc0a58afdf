use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Which listing fields a keyword group or exclusion list looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Title,
    Description,
    #[default]
    TitleOrDescription,
}

/// Every term must appear within the scope for the group to match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub terms: Vec<String>,
    #[serde(default)]
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub name: String,
    pub include_groups: Vec<KeywordGroup>,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
    #[serde(default)]
    pub exclude_scope: Scope,
    /// Employers whose postings are never included, matched against the
    /// company name.
    #[serde(default)]
    pub exclude_companies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<ClassificationRule>,
}

/// Terms that mark a role as impact-focused wherever they appear.
const IMPACT_TERMS: &[&str] = &[
    "sustainability",
    "sustainable",
    "esg",
    "csr",
    "corporate social responsibility",
    "social impact",
    "climate change",
    "environmental and social",
    "e-sustainability",
    "sustainable finance",
    "green finance",
    "responsible investment",
    "impact investing",
    "impact fund",
    "social enterprise",
    "b corp",
];

/// Words too generic to count outside the title ("make an impact",
/// "environmental compliance").
const TITLE_ONLY_TERMS: &[&str] = &["impact", "environmental", "climate"];

/// Description phrases that put the generic words in an impact context.
const IMPACT_CONTEXT_PHRASES: &[&str] = &[
    "environmental impact",
    "environmental sustainability",
    "environmental risk",
    "environmental due diligence",
    "impact measurement",
    "impact assessment",
    "impact management",
    "impact strategy",
    "impact initiatives",
    "impact programs",
    "climate risk",
    "climate action",
];

/// Titles that keep matching on impact vocabulary without being impact roles.
const FALSE_POSITIVE_TITLES: &[&str] = &[
    "technician",
    "maintenance",
    "housekeeping",
    "sommelier",
    "bartender",
    "lobby",
    "tenancy",
    "interior designer",
    "rooms controller",
    "shift supervisor",
    "underwriter",
    "underwriting",
    "recruiter",
    "workplace coordinator",
    "property officer",
    "facilities engineer",
    "colo regional engineering",
    "resident technical officer",
];

/// Employers whose postings match on mission statements rather than roles.
const EXCLUDED_COMPANIES: &[&str] = &["jll", "jones lang lasalle"];

fn groups(terms: &[&str], scope: Scope) -> impl Iterator<Item = KeywordGroup> {
    terms.iter().map(move |term| KeywordGroup {
        terms: vec![(*term).to_string()],
        scope,
    })
}

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| (*t).to_string()).collect()
}

impl RuleSet {
    pub fn impact_default() -> Self {
        let include_groups = groups(IMPACT_TERMS, Scope::TitleOrDescription)
            .chain(groups(TITLE_ONLY_TERMS, Scope::Title))
            .chain(groups(IMPACT_CONTEXT_PHRASES, Scope::Description))
            .collect();

        Self {
            rules: vec![ClassificationRule {
                name: "core-impact".to_string(),
                include_groups,
                exclude_terms: owned(FALSE_POSITIVE_TITLES),
                exclude_scope: Scope::Title,
                exclude_companies: owned(EXCLUDED_COMPANIES),
            }],
        }
    }

    /// Load a rule set from a JSON file. Shape problems are configuration
    /// errors, never a reason to fall back to the defaults.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ClassificationConfig(format!(
                "cannot read rules file {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PipelineError::ClassificationConfig(format!(
                "malformed rules file {}: {e}",
                path.display()
            ))
        })
    }
}
