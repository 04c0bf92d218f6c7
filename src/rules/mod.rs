/// Hostname dispositions and the immutable rule table
///
/// The table is built once at engine start from the configured host
/// sources merged with the user's explicit overrides and stays
/// read-only for the lifetime of one engine run.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HostSource;

pub mod parser;

/// The rule-engine decision for a hostname.
///
/// `Ignore` entries contribute nothing; `Allow` and `Deny` are positive
/// rules. `Deny` dominates `Allow`, `Allow` dominates `Ignore`,
/// last-write-wins within the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    #[default]
    Ignore,
    Allow,
    Deny,
}

impl Disposition {
    fn priority(self) -> u8 {
        match self {
            Disposition::Ignore => 0,
            Disposition::Allow => 1,
            Disposition::Deny => 2,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Ignore => write!(f, "ignore"),
            Disposition::Allow => write!(f, "allow"),
            Disposition::Deny => write!(f, "deny"),
        }
    }
}

/// Canonical lookup form: lowercase with a single trailing dot removed.
pub fn normalize(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Immutable hostname -> disposition map consulted per query.
#[derive(Debug, Default)]
pub struct RuleTable {
    entries: HashMap<String, Disposition>,
}

impl RuleTable {
    /// Look up the exact queried name. No suffix or wildcard matching;
    /// a name absent from the table maps to `Ignore`.
    pub fn lookup(&self, name: &str) -> Disposition {
        self.entries
            .get(&normalize(name))
            .copied()
            .unwrap_or(Disposition::Ignore)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the table from configured host sources, in order.
    ///
    /// A source `location` is either a local file path or a literal
    /// hostname; the latter carries the user's explicit single-host
    /// overrides. Unreadable sources are skipped with a warning.
    pub fn from_sources(sources: &[HostSource]) -> RuleTable {
        let mut builder = RuleTableBuilder::new();

        for source in sources {
            if source.disposition == Disposition::Ignore {
                debug!("Skipping ignored host source {}", source.name);
                continue;
            }

            if parser::is_valid_hostname(&source.location) {
                builder.add_rule(&source.location, source.disposition);
                continue;
            }

            match builder.add_file(Path::new(&source.location), source.disposition) {
                Ok(count) => {
                    info!(
                        "Loaded {} entries from host source {} ({})",
                        count, source.name, source.location
                    );
                }
                Err(e) => {
                    warn!(
                        "Skipping unreadable host source {} ({}): {}",
                        source.name, source.location, e
                    );
                }
            }
        }

        builder.build()
    }
}

/// Merges sources and single rules into a [`RuleTable`].
#[derive(Debug, Default)]
pub struct RuleTableBuilder {
    entries: HashMap<String, Disposition>,
}

impl RuleTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single rule, honouring the priority ordering.
    pub fn add_rule(&mut self, name: &str, disposition: Disposition) {
        if disposition == Disposition::Ignore {
            return;
        }

        let key = normalize(name);
        match self.entries.get(&key) {
            Some(existing) if existing.priority() > disposition.priority() => {}
            _ => {
                self.entries.insert(key, disposition);
            }
        }
    }

    /// Feed every parsed line of a host file into the table.
    pub fn add_lines<'a>(
        &mut self,
        lines: impl IntoIterator<Item = &'a str>,
        disposition: Disposition,
    ) -> usize {
        let mut count = 0;
        for line in lines {
            if let Some(host) = parser::parse_line(line) {
                self.add_rule(host, disposition);
                count += 1;
            }
        }
        count
    }

    /// Read a host file from disk line by line.
    pub fn add_file(&mut self, path: &Path, disposition: Disposition) -> std::io::Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut count = 0;
        for line in reader.lines() {
            let line = line?;
            if let Some(host) = parser::parse_line(&line) {
                self.add_rule(host, disposition);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn build(self) -> RuleTable {
        RuleTable {
            entries: self.entries,
        }
    }
}
