//! Filename classification into logical roles.
//!
//! Rules are tried in order and the first match wins. Current-generation names come first, legacy
//! names after. A numeric suffix is exposed as the shard index but never used for ordering.

use std::path::Path;

use chatlog_core::Role;
use regex_lite::Regex;

use crate::error::StoreResult;

/// One classification rule. `pattern` is matched case-insensitively against the bare filename;
/// an optional first capture group is the shard index.
#[derive(Debug, Clone, Copy)]
pub struct NameRule {
    pub pattern: &'static str,
    pub roles: &'static [Role],
}

const MEDIA_ROLES: &[Role] = &[Role::Image, Role::Video, Role::File];

pub const STANDARD_RULES: &[NameRule] = &[
    NameRule { pattern: r"^message(?:_(\d{1,2}))?\.db$", roles: &[Role::Message] },
    NameRule { pattern: r"^contact\.db$", roles: &[Role::Contact] },
    NameRule { pattern: r"^hardlink\.db$", roles: MEDIA_ROLES },
    NameRule { pattern: r"^media(?:_(\d{1,2}))?\.db$", roles: &[Role::Voice] },
    NameRule { pattern: r"^session\.db$", roles: &[Role::Session] },
    // legacy generation
    NameRule { pattern: r"^msg(\d{1,2})?\.db$", roles: &[Role::Message] },
    NameRule { pattern: r"^micromsg\.db$", roles: &[Role::Contact, Role::Session] },
    NameRule { pattern: r"^mediamsg(\d{1,2})?\.db$", roles: &[Role::Voice] },
    NameRule { pattern: r"^hardlinkimage\.db$", roles: &[Role::Image] },
    NameRule { pattern: r"^hardlinkvideo\.db$", roles: &[Role::Video] },
    NameRule { pattern: r"^hardlinkfile\.db$", roles: &[Role::File] },
];

/// Result of classifying a filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileClass {
    /// Roles served by the file. `hardlink.db` serves three; callers pick by table.
    pub roles: &'static [Role],
    pub shard_index: Option<u32>,
}

impl FileClass {
    #[must_use]
    pub fn serves(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    roles: &'static [Role],
}

#[derive(Debug, Clone)]
pub struct NamingStrategy {
    rules: Vec<CompiledRule>,
}

impl NamingStrategy {
    /// # Errors
    /// Cannot fail for the built-in rules; kept fallible for parity with [`Self::from_rules`].
    pub fn standard() -> StoreResult<Self> {
        Self::from_rules(STANDARD_RULES)
    }

    /// # Errors
    /// Returns an error when a rule pattern is not a valid regular expression.
    pub fn from_rules(rules: &[NameRule]) -> StoreResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| -> StoreResult<CompiledRule> {
                Ok(CompiledRule {
                    regex: Regex::new(&format!("(?i){}", rule.pattern))?,
                    roles: rule.roles,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    #[must_use]
    pub fn classify(&self, filename: &str) -> Option<FileClass> {
        self.rules.iter().find_map(|rule| {
            let caps = rule.regex.captures(filename)?;
            let shard_index = caps.get(1).and_then(|m| m.as_str().parse().ok());
            Some(FileClass { roles: rule.roles, shard_index })
        })
    }

    #[must_use]
    pub fn classify_path(&self, path: &Path) -> Option<FileClass> {
        self.classify(path.file_name()?.to_str()?)
    }

    #[must_use]
    pub fn serves(&self, path: &Path, role: Role) -> bool {
        self.classify_path(path).is_some_and(|class| class.serves(role))
    }
}
