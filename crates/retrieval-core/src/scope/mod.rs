//! Scope resolution: project/dataset naming, collection naming, and
//! expansion of a query's requested scope into the concrete set of
//! collections to search.
//!
//! `ScopeManager` holds no state of its own -- every operation is a pure
//! function over names and a snapshot of known datasets, handed in by the
//! caller (typically [`crate::catalog::CatalogStore`]).

use globset::{Glob, GlobSetBuilder};

use crate::error::{RetrievalError, RetrievalResult};
use crate::types::{Dataset, DatasetVisibility};

/// Prefix applied to every generated vector-store collection name, so a
/// `listCollections` call against the vector store can tell which
/// collections belong to this engine.
pub const COLLECTION_PREFIX: &str = "ctx_";

/// Fixed, documented vocabulary of `ns:value` semantic alias namespaces.
/// `env` is accepted as shorthand for `environment`. Anything outside this
/// list is not an alias and falls through to glob/literal matching.
const ALIAS_NAMESPACES: &[&str] = &["env", "environment", "source", "version", "branch"];

/// Result of [`ScopeManager::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// True if `input` matched at least one dataset, or `available` was
    /// empty (nothing to validate against is not itself an error).
    pub valid: bool,
    /// Ranked (closest-first) edit-distance suggestions, populated only on
    /// a miss against a non-empty dataset list.
    pub suggestions: Vec<String>,
}

/// One entry of [`ScopeManager::suggest_patterns`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSuggestion {
    /// A `ns:value` alias pattern derived from `available`.
    pub pattern: String,
    /// How many datasets in `available` that pattern matches.
    pub match_count: usize,
}

/// Pure-function scope resolution helpers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeManager;

/// A query's requested scope, before resolution against known datasets.
#[derive(Debug, Clone)]
pub struct ScopeRequest {
    /// Project the query runs within.
    pub project: String,
    /// Explicit dataset names or glob patterns to search. Empty means "all
    /// datasets in the project".
    pub datasets: Vec<String>,
    /// Whether to also include datasets marked `shared` elsewhere in the
    /// project (spec §9 Open Question 2).
    pub include_global: bool,
}

impl ScopeManager {
    /// Normalize a project or dataset name: replace runs of `.` and `/`
    /// with a single `-`, trim leading/trailing `-`, lowercase.
    ///
    /// This is the single normalization rule used everywhere a name becomes
    /// a storage key, decided in favor of collapsing over stripping because
    /// stripping can collide two distinct names into the same empty key.
    pub fn normalize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_was_delim = false;
        for ch in name.trim().chars() {
            let is_delim = ch == '.' || ch == '/' || ch == '\\';
            if is_delim {
                if !last_was_delim && !out.is_empty() {
                    out.push('-');
                }
                last_was_delim = true;
            } else {
                out.push(ch.to_ascii_lowercase());
                last_was_delim = false;
            }
        }
        out.trim_matches('-').to_string()
    }

    /// Build the vector-store-facing collection name for a `(project,
    /// dataset)` pair.
    pub fn collection_name(project: &str, dataset: &str) -> String {
        format!(
            "{COLLECTION_PREFIX}{}_{}",
            Self::normalize(project),
            Self::normalize(dataset)
        )
    }

    /// Resolve a [`ScopeRequest`] against the full set of datasets known to
    /// belong to the request's project, returning the datasets a query
    /// should search.
    ///
    /// - An empty `datasets` list matches every dataset in the project.
    /// - Each entry in `datasets` is expanded via [`Self::expand_pattern`].
    /// - `include_global` additionally pulls in every dataset elsewhere in
    ///   the project marked [`DatasetVisibility::Shared`], beyond whatever
    ///   `datasets` already matched.
    pub fn resolve<'a>(
        request: &ScopeRequest,
        known: &'a [Dataset],
    ) -> RetrievalResult<Vec<&'a Dataset>> {
        let mut matched: Vec<&Dataset> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        if request.datasets.is_empty() {
            for ds in known {
                if seen.insert(ds.id) {
                    matched.push(ds);
                }
            }
        } else {
            for pattern in &request.datasets {
                for ds in Self::expand_pattern(pattern, known)? {
                    if seen.insert(ds.id) {
                        matched.push(ds);
                    }
                }
            }
        }

        if request.include_global {
            for ds in known {
                if ds.visibility == DatasetVisibility::Shared && seen.insert(ds.id) {
                    matched.push(ds);
                }
            }
        }

        Ok(matched)
    }

    /// Expand a single requested pattern against `available` datasets, in
    /// precedence order: semantic alias (`ns:value`), then glob (`*`, `?`),
    /// then exact literal match.
    pub fn expand_pattern<'a>(pattern: &str, available: &'a [Dataset]) -> RetrievalResult<Vec<&'a Dataset>> {
        if let Some((ns, value)) = pattern.split_once(':') {
            if ALIAS_NAMESPACES.contains(&ns) {
                return Ok(Self::expand_alias(ns, value, available));
            }
        }

        if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            let mut builder = GlobSetBuilder::new();
            builder.add(Glob::new(pattern).map_err(|e| RetrievalError::Config {
                details: format!("invalid dataset glob {pattern:?}: {e}"),
            })?);
            let globset = builder.build().map_err(|e| RetrievalError::Config {
                details: format!("invalid dataset glob set: {e}"),
            })?;
            return Ok(available.iter().filter(|ds| globset.is_match(&ds.name)).collect());
        }

        let normalized = Self::normalize(pattern);
        Ok(available.iter().filter(|ds| ds.name == normalized).collect())
    }

    /// Resolve a `ns:value` alias against `available`. `ns` has already been
    /// checked against [`ALIAS_NAMESPACES`]; `env` is folded to
    /// `environment` so both spellings share the same matching rule.
    fn expand_alias<'a>(ns: &str, value: &str, available: &'a [Dataset]) -> Vec<&'a Dataset> {
        let ns = if ns == "env" { "environment" } else { ns };

        if ns == "version" {
            if let Some(include_prerelease) = match value {
                "latest" => Some(false),
                "latest-pre" => Some(true),
                _ => None,
            } {
                return Self::latest_versions(available, include_prerelease);
            }
        }

        let value = value.to_ascii_lowercase();
        available
            .iter()
            .filter(|ds| {
                let name = ds.name.to_ascii_lowercase();
                name.split('-').any(|token| token == value) || name.ends_with(value.as_str())
            })
            .collect()
    }

    /// For each distinct "base name" (a dataset name with its trailing
    /// version run and any prerelease tag stripped), pick the dataset with
    /// the highest parsed `(major, minor, patch)`. Prerelease entries are
    /// excluded unless `include_prerelease` is set.
    fn latest_versions(available: &[Dataset], include_prerelease: bool) -> Vec<&Dataset> {
        let mut best: std::collections::HashMap<String, (&Dataset, (u64, u64, u64))> = std::collections::HashMap::new();

        for ds in available {
            let Some((base, version, is_prerelease)) = Self::parse_trailing_version(&ds.name) else { continue };
            if is_prerelease && !include_prerelease {
                continue;
            }
            best.entry(base)
                .and_modify(|(best_ds, best_version)| {
                    if version > *best_version {
                        *best_ds = ds;
                        *best_version = version;
                    }
                })
                .or_insert((ds, version));
        }

        let mut out: Vec<&Dataset> = best.into_values().map(|(ds, _)| ds).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Parse a trailing semver-like version out of a normalized dataset
    /// name. Normalization already folds `.` to `-`
    /// ([`Self::normalize`]), so `api-1.4.0` arrives as `api-1-4-0`: this
    /// walks back from the rightmost numeric token to gather up to three
    /// consecutive numeric tokens as `(major, minor, patch)`, treating
    /// anything immediately after that run as a prerelease tag.
    ///
    /// Returns `(base_name, (major, minor, patch), is_prerelease)`, or
    /// `None` if the name carries no recognizable version.
    fn parse_trailing_version(name: &str) -> Option<(String, (u64, u64, u64), bool)> {
        let tokens: Vec<&str> = name.split('-').collect();
        let is_numeric = |t: &str| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit());

        let last_numeric = tokens.iter().rposition(|t| is_numeric(t))?;
        let mut start = last_numeric;
        while start > 0 && is_numeric(tokens[start - 1]) && last_numeric - (start - 1) < 3 {
            start -= 1;
        }
        let run = &tokens[start..=last_numeric];
        if run.len() < 2 {
            return None;
        }

        let major: u64 = run[0].parse().ok()?;
        let minor: u64 = run[1].parse().ok()?;
        let patch: u64 = run.get(2).map_or(Ok(0), |p| p.parse()).ok()?;
        let is_prerelease = last_numeric + 1 < tokens.len();
        let base = tokens[..start].join("-");
        Some((base, (major, minor, patch), is_prerelease))
    }

    /// Validate a requested pattern against `available` datasets.
    ///
    /// An empty `available` list is valid by definition (there is nothing
    /// to mismatch against); otherwise `input` is valid if
    /// [`Self::expand_pattern`] matches at least one dataset. On a miss,
    /// `suggestions` ranks the closest dataset names by normalized
    /// Levenshtein similarity, closest first.
    pub fn validate(input: &str, available: &[Dataset]) -> RetrievalResult<ValidationResult> {
        if available.is_empty() {
            return Ok(ValidationResult { valid: true, suggestions: Vec::new() });
        }

        if !Self::expand_pattern(input, available)?.is_empty() {
            return Ok(ValidationResult { valid: true, suggestions: Vec::new() });
        }

        let normalized_input = Self::normalize(input);
        let mut scored: Vec<(f64, &str)> = available
            .iter()
            .map(|ds| (strsim::normalized_levenshtein(&normalized_input, &ds.name), ds.name.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let suggestions = scored.into_iter().take(3).map(|(_, name)| name.to_string()).collect();
        Ok(ValidationResult { valid: false, suggestions })
    }

    /// Suggest `env:`/`source:`/`version:`/`branch:` alias patterns derived
    /// from the tokens present in `available` dataset names, ranked by how
    /// many datasets each pattern matches. Patterns matching zero datasets
    /// are excluded.
    pub fn suggest_patterns(available: &[Dataset]) -> Vec<PatternSuggestion> {
        let mut candidates: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for ds in available {
            for token in ds.name.split('-') {
                if token.is_empty() || token.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                for ns in ["environment", "source", "branch"] {
                    candidates.insert(format!("{ns}:{token}"));
                }
            }
        }
        candidates.insert("version:latest".to_string());

        let mut suggestions: Vec<PatternSuggestion> = candidates
            .into_iter()
            .filter_map(|pattern| {
                let (ns, value) = pattern.split_once(':').expect("candidate always has a ':'");
                let match_count = Self::expand_alias(ns, value, available).len();
                (match_count > 0).then_some(PatternSuggestion { pattern, match_count })
            })
            .collect();

        suggestions.sort_by(|a, b| b.match_count.cmp(&a.match_count).then_with(|| a.pattern.cmp(&b.pattern)));
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn dataset(name: &str, visibility: DatasetVisibility) -> Dataset {
        Dataset {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: name.to_string(),
            source: crate::types::DatasetSource::Code,
            visibility,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_collapses_delimiters() {
        assert_eq!(ScopeManager::normalize("acme.corp/backend"), "acme-corp-backend");
        assert_eq!(ScopeManager::normalize("a..b//c"), "a-b-c");
        assert_eq!(ScopeManager::normalize("Already-Fine"), "already-fine");
        assert_eq!(ScopeManager::normalize(".leading.dot."), "leading-dot");
    }

    #[test]
    fn test_collection_name_is_prefixed() {
        let name = ScopeManager::collection_name("Acme Corp", "main.repo");
        assert!(name.starts_with(COLLECTION_PREFIX));
        assert!(name.contains("main-repo"));
    }

    #[test]
    fn test_resolve_empty_datasets_matches_all() {
        let known = vec![dataset("a", DatasetVisibility::Private), dataset("b", DatasetVisibility::Private)];
        let req = ScopeRequest { project: "p".into(), datasets: vec![], include_global: false };
        let resolved = ScopeManager::resolve(&req, &known).expect("resolve");
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_resolve_glob_pattern() {
        let known = vec![
            dataset("service-a", DatasetVisibility::Private),
            dataset("service-b", DatasetVisibility::Private),
            dataset("other", DatasetVisibility::Private),
        ];
        let req = ScopeRequest { project: "p".into(), datasets: vec!["service-*".into()], include_global: false };
        let resolved = ScopeManager::resolve(&req, &known).expect("resolve");
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_resolve_include_global_adds_shared_datasets() {
        let known = vec![
            dataset("target", DatasetVisibility::Private),
            dataset("shared-one", DatasetVisibility::Shared),
        ];
        let req = ScopeRequest { project: "p".into(), datasets: vec!["target".into()], include_global: true };
        let resolved = ScopeManager::resolve(&req, &known).expect("resolve");
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_resolve_private_dataset_not_pulled_by_include_global() {
        let known = vec![
            dataset("target", DatasetVisibility::Private),
            dataset("other-private", DatasetVisibility::Private),
        ];
        let req = ScopeRequest { project: "p".into(), datasets: vec!["target".into()], include_global: true };
        let resolved = ScopeManager::resolve(&req, &known).expect("resolve");
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_expand_pattern_alias_matches_environment_token() {
        let known = vec![
            dataset("api-dev", DatasetVisibility::Private),
            dataset("api-prod", DatasetVisibility::Private),
            dataset("worker-dev", DatasetVisibility::Private),
        ];
        let matched = ScopeManager::expand_pattern("env:dev", &known).expect("expand");
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|d| d.name.ends_with("dev")));
    }

    #[test]
    fn test_expand_pattern_alias_takes_precedence_over_glob() {
        // "source:mirror" contains a colon, not a glob metacharacter, but it
        // exercises the same precedence rule: a recognized namespace prefix
        // is always tried as an alias before falling through to literal
        // matching against the unparsed string.
        let known = vec![dataset("github-mirror", DatasetVisibility::Private), dataset("local-notes", DatasetVisibility::Private)];
        let matched = ScopeManager::expand_pattern("source:mirror", &known).expect("expand");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "github-mirror");
    }

    #[test]
    fn test_version_latest_picks_max_semver() {
        let known = vec![dataset("api-1-2-0", DatasetVisibility::Private), dataset("api-1-3-0", DatasetVisibility::Private)];
        let matched = ScopeManager::expand_pattern("version:latest", &known).expect("expand");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "api-1-3-0");
    }

    #[test]
    fn test_version_latest_excludes_prerelease_by_default() {
        let known = vec![
            dataset("api-1-2-0", DatasetVisibility::Private),
            dataset("api-1-3-0-beta", DatasetVisibility::Private),
        ];
        let matched = ScopeManager::expand_pattern("version:latest", &known).expect("expand");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "api-1-2-0");
    }

    #[test]
    fn test_version_latest_pre_includes_prerelease() {
        let known = vec![
            dataset("api-1-2-0", DatasetVisibility::Private),
            dataset("api-1-3-0-beta", DatasetVisibility::Private),
        ];
        let matched = ScopeManager::expand_pattern("version:latest-pre", &known).expect("expand");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "api-1-3-0-beta");
    }

    #[test]
    fn test_validate_known_pattern_is_valid_with_no_suggestions() {
        let known = vec![dataset("api-dev", DatasetVisibility::Private)];
        let result = ScopeManager::validate("api-dev", &known).expect("validate");
        assert!(result.valid);
        assert!(result.suggestions.is_empty());
    }

    #[test]
    fn test_validate_miss_returns_ranked_suggestions() {
        let known = vec![
            dataset("api-dev", DatasetVisibility::Private),
            dataset("api-prod", DatasetVisibility::Private),
            dataset("worker-dev", DatasetVisibility::Private),
        ];
        let result = ScopeManager::validate("api-devv", &known).expect("validate");
        assert!(!result.valid);
        assert_eq!(result.suggestions.first().map(String::as_str), Some("api-dev"));
    }

    #[test]
    fn test_validate_pattern_against_empty_dataset_list_is_valid() {
        let result = ScopeManager::validate("env:dev", &[]).expect("validate");
        assert!(result.valid);
        assert!(result.suggestions.is_empty());
    }

    #[test]
    fn test_suggest_patterns_sorted_desc_excludes_zero_matches() {
        let known = vec![
            dataset("api-dev", DatasetVisibility::Private),
            dataset("worker-dev", DatasetVisibility::Private),
            dataset("api-prod", DatasetVisibility::Private),
        ];
        let suggestions = ScopeManager::suggest_patterns(&known);
        assert!(!suggestions.is_empty());
        assert!(suggestions.iter().all(|s| s.match_count > 0));
        for window in suggestions.windows(2) {
            assert!(window[0].match_count >= window[1].match_count);
        }
        let dev = suggestions.iter().find(|s| s.pattern == "environment:dev").expect("environment:dev present");
        assert_eq!(dev.match_count, 2);
    }
}
