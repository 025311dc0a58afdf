use crate::error::PipelineError;
use crate::models::listing::JobListing;
use crate::models::rule::{RuleSet, Scope};

/// Lowercased alphanumeric tokens. Every other character separates tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

type Phrase = Vec<String>;

#[derive(Debug, Clone)]
struct CompiledGroup {
    terms: Vec<Phrase>,
    scope: Scope,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    groups: Vec<CompiledGroup>,
    excludes: Vec<(String, Phrase)>,
    exclude_scope: Scope,
    company_excludes: Vec<(String, Phrase)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Included { rule: String },
    Excluded { rule: String, term: String },
    NoMatch,
}

impl Verdict {
    pub fn is_included(&self) -> bool {
        matches!(self, Verdict::Included { .. })
    }
}

/// A rule set checked and pre-tokenized once per run.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<CompiledRule>,
}

impl Classifier {
    pub fn compile(rule_set: &RuleSet) -> Result<Self, PipelineError> {
        if rule_set.rules.is_empty() {
            return Err(config_error("rule set has no rules"));
        }

        let mut rules = Vec::with_capacity(rule_set.rules.len());
        for rule in &rule_set.rules {
            if rule.include_groups.is_empty() {
                return Err(config_error(format!(
                    "rule '{}' has no include groups",
                    rule.name
                )));
            }

            let mut groups = Vec::with_capacity(rule.include_groups.len());
            for (i, group) in rule.include_groups.iter().enumerate() {
                if group.terms.is_empty() {
                    return Err(config_error(format!(
                        "rule '{}' include group {i} has no terms",
                        rule.name
                    )));
                }
                let terms = group
                    .terms
                    .iter()
                    .map(|term| compile_term(&rule.name, term))
                    .collect::<Result<_, _>>()?;
                groups.push(CompiledGroup {
                    terms,
                    scope: group.scope,
                });
            }

            rules.push(CompiledRule {
                name: rule.name.clone(),
                groups,
                excludes: compile_all(&rule.name, &rule.exclude_terms)?,
                exclude_scope: rule.exclude_scope,
                company_excludes: compile_all(&rule.name, &rule.exclude_companies)?,
            });
        }

        Ok(Self { rules })
    }

    pub fn classify(&self, listing: &JobListing) -> Verdict {
        let fields = Fields {
            title: tokenize(&listing.title),
            description: tokenize(&listing.description_snippet),
        };
        let company = tokenize(&listing.company);

        for rule in &self.rules {
            let by_term = rule
                .excludes
                .iter()
                .find(|(_, phrase)| fields.contains(phrase, rule.exclude_scope));
            let by_company = || {
                rule.company_excludes
                    .iter()
                    .find(|(_, phrase)| contains_phrase(&company, phrase))
            };
            if let Some((term, _)) = by_term.or_else(by_company) {
                return Verdict::Excluded {
                    rule: rule.name.clone(),
                    term: term.clone(),
                };
            }
        }

        self.rules
            .iter()
            .find(|rule| {
                rule.groups.iter().any(|group| {
                    group
                        .terms
                        .iter()
                        .all(|phrase| fields.contains(phrase, group.scope))
                })
            })
            .map(|rule| Verdict::Included {
                rule: rule.name.clone(),
            })
            .unwrap_or(Verdict::NoMatch)
    }

    /// Keep only included listings.
    pub fn retain(&self, listings: Vec<JobListing>) -> Vec<JobListing> {
        listings
            .into_iter()
            .filter(|listing| match self.classify(listing) {
                Verdict::Excluded { rule, term } => {
                    tracing::debug!(title = %listing.title, rule = %rule, term = %term, "Listing excluded");
                    false
                }
                verdict => verdict.is_included(),
            })
            .collect()
    }
}

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::ClassificationConfig(message.into())
}

fn compile_all(rule: &str, terms: &[String]) -> Result<Vec<(String, Phrase)>, PipelineError> {
    terms
        .iter()
        .map(|term| Ok((term.clone(), compile_term(rule, term)?)))
        .collect()
}

fn compile_term(rule: &str, term: &str) -> Result<Phrase, PipelineError> {
    let phrase = tokenize(term);
    if phrase.is_empty() {
        return Err(config_error(format!(
            "rule '{rule}' has a term without words: '{term}'"
        )));
    }
    Ok(phrase)
}

struct Fields {
    title: Vec<String>,
    description: Vec<String>,
}

impl Fields {
    fn contains(&self, phrase: &[String], scope: Scope) -> bool {
        match scope {
            Scope::Title => contains_phrase(&self.title, phrase),
            Scope::Description => contains_phrase(&self.description, phrase),
            Scope::TitleOrDescription => {
                contains_phrase(&self.title, phrase) || contains_phrase(&self.description, phrase)
            }
        }
    }
}

fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    haystack.windows(phrase.len()).any(|window| window == phrase)
}
