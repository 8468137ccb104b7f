//! Filter rules - ordered include/exclude patterns handed to the transfer tool
//!
//! Rules are evaluated first-match in sequence by the transfer tool. Every
//! rule set produced here ends with an exclude-all, and every include for a
//! nested path is preceded by includes for each of its ancestor directories,
//! otherwise the tool prunes the parent before it ever looks at the child.

use std::fmt;

/// Action taken when a rule matches a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterAction {
    /// Include the matching path.
    Include,
    /// Exclude the matching path.
    Exclude,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Include => f.write_str("include"),
            Self::Exclude => f.write_str("exclude"),
        }
    }
}

/// A single filter rule: an action and the pattern it applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterRule {
    action: FilterAction,
    pattern: String,
}

impl FilterRule {
    /// Creates an include rule for `pattern`.
    #[must_use]
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Include,
            pattern: pattern.into(),
        }
    }

    /// Creates an exclude rule for `pattern`.
    #[must_use]
    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Exclude,
            pattern: pattern.into(),
        }
    }

    /// The catch-all exclude that terminates every rule set.
    #[must_use]
    pub fn exclude_all() -> Self {
        Self::exclude("*")
    }

    #[must_use]
    pub const fn action(&self) -> FilterAction {
        self.action
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this rule is the trailing exclude-all.
    #[must_use]
    pub fn is_exclude_all(&self) -> bool {
        self.action == FilterAction::Exclude && self.pattern == "*"
    }

    /// Renders the rule as a command line argument, e.g. `--include=/jammy/`.
    #[must_use]
    pub fn to_arg(&self) -> String {
        format!("--{}={}", self.action, self.pattern)
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.pattern)
    }
}

/// Builds the ordered rule sets for each metadata sub-phase.
///
/// All functions are pure: identical inputs always yield identical rule
/// sequences.
pub struct FilterRuleBuilder;

impl FilterRuleBuilder {
    /// Release descriptors and signatures for exactly one suite.
    pub fn metadata_rules(suite: &str) -> Vec<FilterRule> {
        vec![
            FilterRule::include(format!("/{suite}/")),
            FilterRule::include(format!("/{suite}/Release")),
            FilterRule::include(format!("/{suite}/Release.gpg")),
            FilterRule::include(format!("/{suite}/InRelease")),
            FilterRule::exclude_all(),
        ]
    }

    /// The complete `binary-<arch>` subtree of one component.
    pub fn component_arch_rules(suite: &str, component: &str, arch: &str) -> Vec<FilterRule> {
        let binary = format!("/{suite}/{component}/binary-{arch}");
        vec![
            FilterRule::include(format!("/{suite}/")),
            FilterRule::include(format!("/{suite}/{component}/")),
            FilterRule::include(format!("{binary}/")),
            FilterRule::include(format!("{binary}/**")),
            FilterRule::exclude_all(),
        ]
    }

    /// Contents indexes, translations and app-stream metadata of one component.
    pub fn metadata_extras_rules(suite: &str, component: &str) -> Vec<FilterRule> {
        let base = format!("/{suite}/{component}");
        vec![
            FilterRule::include(format!("/{suite}/")),
            FilterRule::include(format!("{base}/")),
            FilterRule::include(format!("{base}/Contents-*.gz")),
            FilterRule::include(format!("{base}/i18n/")),
            FilterRule::include(format!("{base}/i18n/**")),
            FilterRule::include(format!("{base}/dep11/")),
            FilterRule::include(format!("{base}/dep11/**")),
            FilterRule::exclude_all(),
        ]
    }

    /// The `source/` subtree (Sources index) of one component.
    pub fn component_source_rules(suite: &str, component: &str) -> Vec<FilterRule> {
        let source = format!("/{suite}/{component}/source");
        vec![
            FilterRule::include(format!("/{suite}/")),
            FilterRule::include(format!("/{suite}/{component}/")),
            FilterRule::include(format!("{source}/")),
            FilterRule::include(format!("{source}/**")),
            FilterRule::exclude_all(),
        ]
    }

    /// The `repodata/` directory of an RPM tree root.
    pub fn repodata_rules() -> Vec<FilterRule> {
        vec![
            FilterRule::include("/repodata/"),
            FilterRule::include("/repodata/**"),
            FilterRule::exclude_all(),
        ]
    }

    /// Signing keys and license files at the top of an RPM tree root.
    pub fn release_files_rules() -> Vec<FilterRule> {
        vec![
            FilterRule::include("/RPM-GPG-KEY-*"),
            FilterRule::include("/EULA"),
            FilterRule::include("/LICENSE"),
            FilterRule::include("/media.repo"),
            FilterRule::exclude_all(),
        ]
    }
}

/// Renders a rule set into command line arguments, preserving order.
pub fn to_args(rules: &[FilterRule]) -> Vec<String> {
    rules.iter().map(FilterRule::to_arg).collect()
}

/// Returns the include patterns whose ancestor directories are not included
/// earlier in the sequence. An empty result means the set is well formed.
pub fn missing_ancestors(rules: &[FilterRule]) -> Vec<String> {
    let mut included_dirs: Vec<&str> = Vec::new();
    let mut missing = Vec::new();

    for rule in rules {
        if rule.action() != FilterAction::Include {
            continue;
        }

        let pattern = rule.pattern();
        let anchor = if pattern.starts_with('/') { "/" } else { "" };
        let trimmed = pattern.trim_start_matches('/').trim_end_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();

        // Every proper prefix of the path must already be included as a directory.
        for depth in 1..segments.len() {
            let ancestor = format!("{}{}/", anchor, segments[..depth].join("/"));
            if !included_dirs.contains(&ancestor.as_str()) {
                missing.push(pattern.to_string());
                break;
            }
        }

        if pattern.ends_with('/') {
            included_dirs.push(pattern);
        }
    }

    missing
}
