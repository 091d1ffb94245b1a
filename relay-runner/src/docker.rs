//! Container image reference parsing.
//!
//! Image references are interpolated into runtime command lines, so they
//! are validated before use. Format:
//! `[registry[:port]/]repository[:tag]` where the first component is a
//! registry only if it contains a `.` or `:`.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Error, Result};

fn dns_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)(?:\.(?i:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?))*$")
            .expect("valid DNS regex")
    })
}

fn repository_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*/)*[a-z0-9]+(?:[._-][a-z0-9]+)*$")
            .expect("valid repository regex")
    })
}

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0|[1-9][0-9]*)$").expect("valid port regex"))
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.-]*$").expect("valid tag regex"))
}

/// A parsed container image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub registry_port: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            f.write_str(registry)?;
            if let Some(port) = &self.registry_port {
                write!(f, ":{port}")?;
            }
            f.write_str("/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// Parse and validate an image reference.
pub fn parse_image_ref(uri: &str) -> Result<ImageRef> {
    let components: Vec<&str> = uri.split('/').collect();

    let has_registry =
        components.len() > 1 && (components[0].contains('.') || components[0].contains(':'));

    let (registry, registry_port, rest) = if has_registry {
        let (host, port) = match components[0].split_once(':') {
            Some((host, port)) => (host, Some(port.to_string())),
            None => (components[0], None),
        };
        (Some(host.to_string()), port, &components[1..])
    } else {
        (None, None, &components[..])
    };

    let (repository, tag) = split_tag(rest);

    let parsed = ImageRef {
        registry,
        registry_port,
        repository,
        tag,
    };

    if let Some(registry) = &parsed.registry {
        if !dns_regex().is_match(registry) {
            return Err(Error::ImageRef(format!("invalid registry: '{registry}'")));
        }
    }
    if parsed.repository.len() > 255 || !repository_regex().is_match(&parsed.repository) {
        return Err(Error::ImageRef(format!(
            "invalid repository: '{}'",
            parsed.repository
        )));
    }
    if let Some(port) = &parsed.registry_port {
        if !valid_port(port) {
            return Err(Error::ImageRef(format!("invalid port: '{port}'")));
        }
    }
    if let Some(tag) = &parsed.tag {
        if !tag_regex().is_match(tag) {
            return Err(Error::ImageRef(format!("invalid tag: '{tag}'")));
        }
    }

    Ok(parsed)
}

/// Split the trailing component on `:` to separate a tag, if present.
fn split_tag(components: &[&str]) -> (String, Option<String>) {
    let Some((last, leading)) = components.split_last() else {
        return (String::new(), None);
    };
    match last.split_once(':') {
        Some((name, tag)) => {
            let mut repository = leading.join("/");
            if !repository.is_empty() {
                repository.push('/');
            }
            repository.push_str(name);
            (repository, Some(tag.to_string()))
        }
        None => (components.join("/"), None),
    }
}

fn valid_port(port: &str) -> bool {
    if !port_regex().is_match(port) {
        return false;
    }
    matches!(port.parse::<u32>(), Ok(n) if n > 0 && n <= 65535)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_repository() {
        let parsed = parse_image_ref("ubuntu").unwrap();
        assert_eq!(parsed.repository, "ubuntu");
        assert!(parsed.registry.is_none());
        assert!(parsed.tag.is_none());
    }

    #[test]
    fn parses_repository_with_tag() {
        let parsed = parse_image_ref("ubuntu:22.04").unwrap();
        assert_eq!(parsed.repository, "ubuntu");
        assert_eq!(parsed.tag.as_deref(), Some("22.04"));
    }

    #[test]
    fn parses_namespaced_repository() {
        let parsed = parse_image_ref("library/ubuntu").unwrap();
        assert_eq!(parsed.repository, "library/ubuntu");
        assert!(parsed.registry.is_none());
    }

    #[test]
    fn parses_registry_and_tag() {
        let parsed = parse_image_ref("ghcr.io/acme/agent:v1").unwrap();
        assert_eq!(parsed.registry.as_deref(), Some("ghcr.io"));
        assert_eq!(parsed.repository, "acme/agent");
        assert_eq!(parsed.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn parses_registry_with_port() {
        let parsed = parse_image_ref("registry.example.com:5000/team/app:latest").unwrap();
        assert_eq!(parsed.registry.as_deref(), Some("registry.example.com"));
        assert_eq!(parsed.registry_port.as_deref(), Some("5000"));
        assert_eq!(parsed.repository, "team/app");
        assert_eq!(parsed.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn round_trips_through_display() {
        for uri in [
            "ubuntu",
            "ubuntu:22.04",
            "library/ubuntu",
            "ghcr.io/acme/agent:v1",
            "registry.example.com:5000/team/app:latest",
        ] {
            assert_eq!(parse_image_ref(uri).unwrap().to_string(), uri);
        }
    }

    #[test]
    fn rejects_uppercase_repository() {
        assert!(parse_image_ref("ghcr.io/Acme/agent").is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(parse_image_ref("registry.example.com:0/app").is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(parse_image_ref("registry.example.com:70000/app").is_err());
    }

    #[test]
    fn rejects_invalid_tag() {
        assert!(parse_image_ref("ubuntu:!bad").is_err());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(parse_image_ref("ubuntu;rm -rf /").is_err());
        assert!(parse_image_ref("$(whoami)/app").is_err());
    }
}
