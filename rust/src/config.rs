//! Hand-rolled key-file parsing for the two small text formats this engine
//! reads: the local repo config (`remote "NAME"` sections) and the
//! remote's published `/config`. Both are simple enough that pulling in a
//! full INI crate would be overkill; the teacher parses its own
//! `key=value` metadata sidecar the same way.

use std::collections::HashMap;

use crate::error::{PullError, PullResult};

/// One `[section "subsection"]` block's `key = value` pairs.
#[derive(Debug, Default, Clone)]
pub struct Section {
    pub name: String,
    pub subsection: Option<String>,
    pub entries: HashMap<String, String>,
}

/// A parsed key-file: an ordered list of sections.
#[derive(Debug, Default, Clone)]
pub struct KeyFile {
    pub sections: Vec<Section>,
}

impl KeyFile {
    pub fn parse(text: &str) -> PullResult<Self> {
        let mut sections = Vec::new();
        let mut current: Option<Section> = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(sec) = current.take() {
                    sections.push(sec);
                }
                let (name, subsection) = parse_header(header)
                    .map_err(|e| PullError::Config(format!("line {}: {e}", lineno + 1)))?;
                current = Some(Section {
                    name,
                    subsection,
                    entries: HashMap::new(),
                });
                continue;
            }
            let Some(sec) = current.as_mut() else {
                return Err(PullError::Config(format!(
                    "line {}: key outside of any section",
                    lineno + 1
                )));
            };
            let (key, value) = line.split_once('=').ok_or_else(|| {
                PullError::Config(format!("line {}: expected `key = value`", lineno + 1))
            })?;
            sec.entries
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        if let Some(sec) = current.take() {
            sections.push(sec);
        }
        Ok(Self { sections })
    }

    pub fn section(&self, name: &str, subsection: Option<&str>) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name == name && s.subsection.as_deref() == subsection)
    }
}

fn parse_header(header: &str) -> Result<(String, Option<String>), String> {
    match header.split_once(' ') {
        None => Ok((header.trim().to_string(), None)),
        Some((name, rest)) => {
            let rest = rest.trim();
            let sub = rest
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .ok_or_else(|| format!("malformed section header {header:?}"))?;
            Ok((name.trim().to_string(), Some(sub.to_string())))
        }
    }
}

/// Configuration for one `remote "NAME"` section of the local repo config.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub name: String,
    pub url: String,
    pub branches: Vec<String>,
}

impl RemoteConfig {
    pub fn load(keyfile: &KeyFile, remote: &str) -> PullResult<Self> {
        let section = keyfile
            .section("remote", Some(remote))
            .ok_or_else(|| PullError::UnknownRemote(remote.to_string()))?;
        let url = section
            .entries
            .get("url")
            .ok_or_else(|| {
                PullError::Config(format!("remote {remote:?} has no `url` key"))
            })?
            .clone();
        let branches = section
            .entries
            .get("branches")
            .map(|v| {
                v.split(',')
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name: remote.to_string(),
            url,
            branches,
        })
    }
}

/// The storage mode the remote's `/config` declares. The pull engine can
/// only operate against the archived, per-object-HTTP-retrievable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    ArchivedObjectPerFile,
    Other,
}

#[derive(Debug, Clone)]
pub struct RemoteServerConfig {
    pub mode: RemoteMode,
    pub raw_mode: String,
}

impl RemoteServerConfig {
    pub fn parse(text: &str) -> PullResult<Self> {
        let keyfile = KeyFile::parse(text)?;
        let core = keyfile
            .section("core", None)
            .ok_or_else(|| PullError::Config("remote config has no [core] section".into()))?;
        let raw_mode = core
            .entries
            .get("mode")
            .cloned()
            .unwrap_or_else(|| "bare".to_string());
        let mode = if raw_mode == "archive-z2" || raw_mode == "archive" {
            RemoteMode::ArchivedObjectPerFile
        } else {
            RemoteMode::Other
        };
        Ok(Self { mode, raw_mode })
    }

    pub fn require_archived(&self) -> PullResult<()> {
        if self.mode == RemoteMode::ArchivedObjectPerFile {
            Ok(())
        } else {
            Err(PullError::UnsupportedRemoteMode(self.raw_mode.clone()))
        }
    }
}

/// Validates a ref/branch name: non-empty, no whitespace, no leading `-`.
pub fn validate_ref_name(name: &str) -> PullResult<()> {
    if name.is_empty()
        || name.starts_with('-')
        || name.chars().any(|c| c.is_whitespace() || c == '\0')
    {
        return Err(PullError::invalid_ref_name(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_section() {
        let text = r#"
            [remote "origin"]
                url = https://example.com/repo
                branches = main, dev
        "#;
        let kf = KeyFile::parse(text).unwrap();
        let remote = RemoteConfig::load(&kf, "origin").unwrap();
        assert_eq!(remote.url, "https://example.com/repo");
        assert_eq!(remote.branches, vec!["main", "dev"]);
    }

    #[test]
    fn missing_remote_is_an_error() {
        let kf = KeyFile::parse("").unwrap();
        assert!(RemoteConfig::load(&kf, "origin").is_err());
    }

    #[test]
    fn archived_mode_accepted_other_rejected() {
        let archived = RemoteServerConfig::parse("[core]\nmode = archive-z2\n").unwrap();
        assert!(archived.require_archived().is_ok());

        let bare = RemoteServerConfig::parse("[core]\nmode = bare\n").unwrap();
        assert!(bare.require_archived().is_err());
    }

    #[test]
    fn ref_name_validation() {
        assert!(validate_ref_name("main").is_ok());
        assert!(validate_ref_name("").is_err());
        assert!(validate_ref_name("has space").is_err());
        assert!(validate_ref_name("-flag-like").is_err());
    }
}
