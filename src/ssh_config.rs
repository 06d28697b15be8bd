//! OpenSSH client config lookup.
//!
//! Resolves a host alias to the parameters needed to connect:
//! - `Host` blocks with `*`, `?` and `!negated` patterns
//! - `HostName`, `User`, `Port`, `IdentityFile` (first obtained value wins)
//! - `Key Value` and `Key=Value` forms, comments, quoted values
//! - `Match` blocks end the preceding `Host` block; their criteria are not
//!   evaluated, so their directives never apply

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;

use crate::error::{Error, Result};

/// Default key files under `~/.ssh`, tried after any `IdentityFile`.
const STANDARD_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Resolved connection parameters for one host alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    /// The alias that was looked up
    pub alias: String,
    /// Host to connect to (HostName, or the alias itself)
    pub hostname: String,
    /// SSH port (default: 22)
    pub port: u16,
    /// Remote login name (default: local user)
    pub user: String,
    /// Explicit private key, if configured
    pub identity_file: Option<PathBuf>,
}

impl HostProfile {
    /// `hostname:port`, suitable for `ToSocketAddrs`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Private key files to try, in order: the configured `IdentityFile`
    /// first, then whichever standard keys exist.
    pub fn identity_candidates(&self) -> Vec<PathBuf> {
        identity_candidates_in(self.identity_file.as_deref(), dirs::home_dir().as_deref())
    }
}

fn identity_candidates_in(explicit: Option<&Path>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = explicit.map(Path::to_path_buf).into_iter().collect();
    if let Some(home) = home {
        for name in STANDARD_KEY_NAMES {
            let path = home.join(".ssh").join(name);
            if path.exists() && !candidates.contains(&path) {
                candidates.push(path);
            }
        }
    }
    candidates
}

/// One `Host` block and its directives, in file order.
#[derive(Debug, Clone, Default)]
struct HostBlock {
    patterns: Vec<String>,
    directives: Vec<(String, String)>,
}

impl HostBlock {
    /// OpenSSH semantics: any negated match excludes the block, otherwise
    /// at least one positive pattern must match.
    fn matches(&self, alias: &str) -> bool {
        let mut matched = false;
        for raw in &self.patterns {
            let (negated, pattern) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            let hit = Pattern::new(pattern)
                .map(|p| p.matches(alias))
                .unwrap_or(pattern == alias);
            if hit && negated {
                return false;
            }
            matched |= hit;
        }
        matched
    }

    fn is_catch_all(&self) -> bool {
        !self.patterns.is_empty() && self.patterns.iter().all(|p| p == "*")
    }
}

fn parse_blocks(content: &str) -> Vec<HostBlock> {
    // Directives before the first Host line apply to every host.
    let mut blocks = vec![HostBlock {
        patterns: vec!["*".to_string()],
        directives: Vec::new(),
    }];

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = split_directive(line) else {
            continue;
        };

        if key.eq_ignore_ascii_case("host") {
            blocks.push(HostBlock {
                patterns: value.split_whitespace().map(str::to_string).collect(),
                directives: Vec::new(),
            });
        } else if key.eq_ignore_ascii_case("match") {
            // No patterns: the block matches no alias.
            blocks.push(HostBlock::default());
        } else if let Some(block) = blocks.last_mut() {
            block
                .directives
                .push((key.to_ascii_lowercase(), unquote(value).to_string()));
        }
    }

    blocks
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    let key_end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..key_end];
    let rest = line[key_end..].trim_start();
    let value = rest.strip_prefix('=').unwrap_or(rest).trim();
    if value.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn expand_tilde(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(value)
}

/// Resolve `alias` against config text.
///
/// Returns `None` when no block other than a catch-all `Host *` matches.
pub fn resolve(content: &str, alias: &str) -> Option<HostProfile> {
    let blocks = parse_blocks(content);

    let mut found = false;
    let mut hostname = None;
    let mut user = None;
    let mut port = None;
    let mut identity_file = None;

    for block in blocks.iter().filter(|b| b.matches(alias)) {
        if !block.is_catch_all() {
            found = true;
        }
        for (key, value) in &block.directives {
            match key.as_str() {
                "hostname" if hostname.is_none() => hostname = Some(value.clone()),
                "user" if user.is_none() => user = Some(value.clone()),
                "port" if port.is_none() => port = value.parse::<u16>().ok(),
                "identityfile" if identity_file.is_none() => {
                    identity_file = Some(expand_tilde(value))
                }
                _ => {}
            }
        }
    }

    if !found {
        return None;
    }

    Some(HostProfile {
        alias: alias.to_string(),
        hostname: hostname.unwrap_or_else(|| alias.to_string()),
        port: port.unwrap_or(22),
        user: user.unwrap_or_else(whoami::username),
        identity_file,
    })
}

/// Read the config file at `path` and resolve `alias`.
pub async fn load_profile(path: &Path, alias: &str) -> Result<HostProfile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::ConfigUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

    let profile = resolve(&content, alias).ok_or_else(|| Error::HostNotFound {
        alias: alias.to_string(),
        path: path.to_path_buf(),
    })?;

    debug!(
        "Resolved host '{}' to {}@{}",
        alias,
        profile.user,
        profile.address()
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# Comment
Host gpu-box
    HostName 10.0.0.7
    User alice
    Port 2222
    IdentityFile ~/.ssh/id_gpu

Host web-*  !web-legacy
    User deploy

Host *
    User fallback
    Port 2200
    IdentityFile ~/.ssh/id_default
"#;

    #[test]
    fn test_resolve_basic() {
        let profile = resolve(SAMPLE, "gpu-box").unwrap();
        assert_eq!(profile.hostname, "10.0.0.7");
        assert_eq!(profile.user, "alice");
        assert_eq!(profile.port, 2222);
        assert!(profile.identity_file.unwrap().ends_with(".ssh/id_gpu"));
    }

    #[test]
    fn test_first_value_wins_over_catch_all() {
        let profile = resolve(SAMPLE, "web-01").unwrap();
        assert_eq!(profile.hostname, "web-01");
        assert_eq!(profile.user, "deploy");
        assert_eq!(profile.port, 2200);
        assert!(profile.identity_file.unwrap().ends_with(".ssh/id_default"));
    }

    #[test]
    fn test_negated_pattern_excludes() {
        assert!(resolve(SAMPLE, "web-legacy").is_none());
    }

    #[test]
    fn test_catch_all_alone_is_not_found() {
        assert!(resolve(SAMPLE, "missing-host").is_none());
    }

    #[test]
    fn test_equals_syntax_and_quotes() {
        let content = "Host box\n  HostName=\"box.example.com\"\n  Port = 2022\n";
        let profile = resolve(content, "box").unwrap();
        assert_eq!(profile.hostname, "box.example.com");
        assert_eq!(profile.port, 2022);
        assert_eq!(profile.address(), "box.example.com:2022");
    }

    #[test]
    fn test_global_directives_before_first_host() {
        let content = "User early\n\nHost box\n  User late\n";
        let profile = resolve(content, "box").unwrap();
        assert_eq!(profile.user, "early");
    }

    #[test]
    fn test_invalid_port_falls_back_to_default() {
        let content = "Host box\n  Port nope\n";
        assert_eq!(resolve(content, "box").unwrap().port, 22);
    }

    #[test]
    fn test_match_block_ends_host_block() {
        let content = "Host box\n  HostName 10.0.0.1\nMatch host other\n  User intruder\n  Port 2222\n";
        let profile = resolve(content, "box").unwrap();
        assert_eq!(profile.hostname, "10.0.0.1");
        assert_eq!(profile.port, 22);
        assert_ne!(profile.user, "intruder");
    }

    #[test]
    fn test_host_after_match_still_resolves() {
        let content = "Match all\n  User ignored\nHost box\n  User real\n";
        assert_eq!(resolve(content, "box").unwrap().user, "real");
        assert!(resolve(content, "other").is_none());
    }

    #[test]
    fn test_identity_candidates_explicit_then_standard() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        std::fs::create_dir(&ssh_dir).unwrap();
        std::fs::write(ssh_dir.join("id_rsa"), b"k").unwrap();
        std::fs::write(ssh_dir.join("id_ed25519"), b"k").unwrap();

        let explicit = PathBuf::from("/keys/id_work");
        let candidates = identity_candidates_in(Some(&explicit), Some(home.path()));
        assert_eq!(
            candidates,
            vec![explicit, ssh_dir.join("id_ed25519"), ssh_dir.join("id_rsa")]
        );
    }

    #[test]
    fn test_identity_candidates_no_duplicates() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        std::fs::create_dir(&ssh_dir).unwrap();
        std::fs::write(ssh_dir.join("id_ed25519"), b"k").unwrap();

        let explicit = ssh_dir.join("id_ed25519");
        let candidates = identity_candidates_in(Some(&explicit), Some(home.path()));
        assert_eq!(candidates, vec![explicit]);
    }

    #[test]
    fn test_identity_candidates_without_keys() {
        let home = tempfile::tempdir().unwrap();
        assert!(identity_candidates_in(None, Some(home.path())).is_empty());
        assert!(identity_candidates_in(None, None).is_empty());
    }

    #[tokio::test]
    async fn test_load_profile_missing_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, SAMPLE).unwrap();

        let err = load_profile(&path, "missing-host").await.unwrap_err();
        assert!(matches!(err, Error::HostNotFound { ref alias, .. } if alias == "missing-host"));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_load_profile_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_profile(&dir.path().join("nope"), "gpu-box")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigUnreadable { .. }));
        assert!(err.is_configuration());
    }
}
