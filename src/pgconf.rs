//! Idempotent convergence of the two server configuration files.
//!
//! The two files get deliberately different treatment:
//!
//! - `postgresql.conf` directives have one canonical value, so managed keys are
//!   *upserted*: an existing line (active or commented-out template default) is
//!   rewritten in place, a missing one is appended, and exactly one active
//!   directive per key survives.
//! - `pg_hba.conf` is an ordered allow-list where the first matching rule wins,
//!   so existing lines are never edited. Required rules are appended only when
//!   absent, leaving any pre-existing custom rules at higher precedence.

use std::path::Path;

use tokio::fs;
use tracing::{debug, info};

use crate::error::BootstrapResult;

/// Value for `listen_addresses`: accept connections on every interface.
pub const LISTEN_ALL: &str = "*";

/// One host-based access rule, matched field-wise against existing lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbaRule {
    pub conn_type: &'static str,
    pub database: &'static str,
    pub user: &'static str,
    /// `None` for `local` (socket) rules, which carry no address column.
    pub address: Option<&'static str>,
    pub method: &'static str,
}

impl HbaRule {
    fn render(&self) -> String {
        match self.address {
            Some(address) => format!(
                "{}\t{}\t{}\t{}\t{}",
                self.conn_type, self.database, self.user, address, self.method
            ),
            None => format!(
                "{}\t{}\t{}\t{}",
                self.conn_type, self.database, self.user, self.method
            ),
        }
    }
}

/// The three rules every bootstrapped instance needs: socket trust for the
/// superuser path, password auth for remote IPv4 and IPv6.
pub fn required_rules() -> [HbaRule; 3] {
    [
        HbaRule {
            conn_type: "local",
            database: "all",
            user: "all",
            address: None,
            method: "trust",
        },
        HbaRule {
            conn_type: "host",
            database: "all",
            user: "all",
            address: Some("0.0.0.0/0"),
            method: "md5",
        },
        HbaRule {
            conn_type: "host",
            database: "all",
            user: "all",
            address: Some("::/0"),
            method: "md5",
        },
    ]
}

/// Rewrite `contents` so exactly one active `key = value` directive exists.
///
/// The first line carrying the key, active or commented out, is replaced with
/// the desired directive. Any later *active* occurrence is commented out to
/// keep the file unambiguous under the engine's last-directive-wins rule;
/// later commented occurrences are left alone. No match appends the directive.
pub fn upsert_directive(contents: &str, key: &str, value: &str) -> String {
    let desired = format!("{key} = {value}");
    let mut out: Vec<String> = Vec::new();
    let mut replaced = false;

    for line in contents.lines() {
        match directive_key(line) {
            Some((found, commented)) if found == key => {
                if !replaced {
                    out.push(desired.clone());
                    replaced = true;
                } else if commented {
                    out.push(line.to_string());
                } else {
                    out.push(format!("#{line}"));
                }
            }
            _ => out.push(line.to_string()),
        }
    }

    if !replaced {
        out.push(desired);
    }

    let mut result = out.join("\n");
    result.push('\n');
    result
}

/// Extract the directive key from a settings line, if it looks like one.
///
/// Matches `key = value` with any leading whitespace and any number of leading
/// `#`s, so shipped template defaults like `#port = 5432` are recognized.
/// Narrative comments without an `=` are not directives.
fn directive_key(line: &str) -> Option<(&str, bool)> {
    let mut body = line.trim_start();
    let mut commented = false;
    while let Some(rest) = body.strip_prefix('#') {
        body = rest.trim_start();
        commented = true;
    }

    let key_end = body
        .find(|c: char| c == '=' || c.is_whitespace())
        .unwrap_or(body.len());
    let key = &body[..key_end];
    if key.is_empty() {
        return None;
    }
    if !body[key_end..].trim_start().starts_with('=') {
        return None;
    }
    Some((key, commented))
}

/// Append any of `rules` not already present. Existing lines are never edited.
pub fn ensure_rules(contents: &str, rules: &[HbaRule]) -> String {
    let mut out = contents.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for rule in rules {
        if !rule_present(&out, rule) {
            out.push_str(&rule.render());
            out.push('\n');
        }
    }
    out
}

/// Whitespace-insensitive field match against non-comment lines.
fn rule_present(contents: &str, rule: &HbaRule) -> bool {
    contents.lines().any(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match rule.address {
            Some(address) => {
                fields.len() >= 5
                    && fields[0] == rule.conn_type
                    && fields[1] == rule.database
                    && fields[2] == rule.user
                    && fields[3] == address
                    && fields[4] == rule.method
            }
            None => {
                fields.len() >= 4
                    && fields[0] == rule.conn_type
                    && fields[1] == rule.database
                    && fields[2] == rule.user
                    && fields[3] == rule.method
            }
        }
    })
}

/// Applies the managed directives and access rules to a data directory.
#[derive(Debug, Clone, Copy)]
pub struct ConfigConverger {
    port: u16,
}

impl ConfigConverger {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Converge both files. Writes only when the converged text differs, so
    /// repeated runs leave mtimes untouched.
    pub async fn converge(&self, data_dir: &Path) -> BootstrapResult<()> {
        let conf = data_dir.join("postgresql.conf");
        let original = fs::read_to_string(&conf).await?;
        let updated = upsert_directive(&original, "port", &self.port.to_string());
        let updated = upsert_directive(&updated, "listen_addresses", &format!("'{LISTEN_ALL}'"));
        if updated != original {
            fs::write(&conf, &updated).await?;
            info!(path = %conf.display(), port = self.port, "converged server settings");
        } else {
            debug!(path = %conf.display(), "server settings already converged");
        }

        let hba = data_dir.join("pg_hba.conf");
        let original = fs::read_to_string(&hba).await?;
        let updated = ensure_rules(&original, &required_rules());
        if updated != original {
            fs::write(&hba, &updated).await?;
            info!(path = %hba.display(), "appended missing access rules");
        } else {
            debug!(path = %hba.display(), "access rules already present");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF_TEMPLATE: &str = "\
# -----------------------------\n\
# PostgreSQL configuration file\n\
# -----------------------------\n\
#listen_addresses = 'localhost'\t\t# what IP address(es) to listen on;\n\
#port = 5432\t\t\t\t# (change requires restart)\n\
max_connections = 100\n";

    fn active_lines<'a>(contents: &'a str, key: &str) -> Vec<&'a str> {
        contents
            .lines()
            .filter(|line| {
                directive_key(line).is_some_and(|(found, commented)| found == key && !commented)
            })
            .collect()
    }

    #[test]
    fn activates_commented_template_defaults() {
        let out = upsert_directive(CONF_TEMPLATE, "port", "5001");
        assert_eq!(active_lines(&out, "port"), vec!["port = 5001"]);
        // untouched directives survive
        assert!(out.contains("max_connections = 100"));
    }

    #[test]
    fn rewrites_active_directive_in_place() {
        let input = "port = 5432\nlisten_addresses = 'localhost'\n";
        let out = upsert_directive(input, "port", "5001");
        assert_eq!(active_lines(&out, "port"), vec!["port = 5001"]);
        assert!(!out.contains("5432"));
    }

    #[test]
    fn appends_when_directive_missing() {
        let out = upsert_directive("max_connections = 100\n", "port", "5001");
        assert!(out.ends_with("port = 5001\n"));
    }

    #[test]
    fn collapses_duplicate_active_directives() {
        let input = "port = 5432\nport = 5433\n";
        let out = upsert_directive(input, "port", "5001");
        assert_eq!(active_lines(&out, "port"), vec!["port = 5001"]);
        // the loser is preserved as a comment, not deleted
        assert!(out.contains("#port = 5433"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let once = upsert_directive(CONF_TEMPLATE, "port", "5001");
        let twice = upsert_directive(&once, "port", "5001");
        assert_eq!(once, twice);
    }

    #[test]
    fn narrative_comments_are_not_directives() {
        let input = "# port settings live below\n#port = 5432\n";
        let out = upsert_directive(input, "port", "5001");
        assert!(out.contains("# port settings live below"));
        assert_eq!(active_lines(&out, "port"), vec!["port = 5001"]);
    }

    #[test]
    fn prefix_keys_do_not_match() {
        let input = "port_something = 7\n";
        let out = upsert_directive(input, "port", "5001");
        assert!(out.contains("port_something = 7"));
        assert!(out.ends_with("port = 5001\n"));
    }

    const HBA_TEMPLATE: &str = "\
# TYPE  DATABASE        USER            ADDRESS                 METHOD\n\
local   all             all                                     trust\n\
host    all             all             127.0.0.1/32            trust\n";

    #[test]
    fn present_rules_are_left_untouched() {
        let out = ensure_rules(HBA_TEMPLATE, &required_rules());
        // the local rule already exists, whitespace differences notwithstanding
        assert_eq!(
            out.matches("local").count(),
            HBA_TEMPLATE.matches("local").count()
        );
        assert!(out.contains("host    all             all             127.0.0.1/32            trust"));
    }

    #[test]
    fn missing_rules_are_appended_exactly_once() {
        let out = ensure_rules(HBA_TEMPLATE, &required_rules());
        assert_eq!(out.matches("0.0.0.0/0").count(), 1);
        assert_eq!(out.matches("::/0").count(), 1);

        let again = ensure_rules(&out, &required_rules());
        assert_eq!(again, out);
    }

    #[test]
    fn appended_rules_rank_below_existing_ones() {
        let out = ensure_rules(HBA_TEMPLATE, &required_rules());
        let custom = out.find("127.0.0.1/32").unwrap();
        let appended = out.find("0.0.0.0/0").unwrap();
        assert!(custom < appended);
    }

    #[test]
    fn comment_lines_do_not_count_as_rules() {
        let input = "# host  all  all  0.0.0.0/0  md5\n";
        let out = ensure_rules(input, &required_rules());
        assert_eq!(out.matches("0.0.0.0/0").count(), 2);
    }
}
