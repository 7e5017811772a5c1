//! Template volume binds.
//!
//! A template may only mount the node's own data directory, written as the
//! `{{DATA_DIR}}` placeholder (optionally followed by a relative subpath).
//! Any other host path is refused.

use std::path::{Component, Path};

use chainward_core::DATA_DIR_PLACEHOLDER;

use crate::error::{NodeError, NodeResult};

/// Resolve template volume specs (`host:container[:mode]`) against `data_dir`.
pub fn resolve_binds(volumes: &[String], data_dir: &Path) -> NodeResult<Vec<String>> {
    volumes
        .iter()
        .map(|spec| resolve_bind(spec, data_dir))
        .collect()
}

fn resolve_bind(spec: &str, data_dir: &Path) -> NodeResult<String> {
    let reject = |why: &str| NodeError::Validation(format!("volume '{spec}' rejected: {why}"));

    let mut parts = spec.split(':');
    let host = parts.next().unwrap_or_default();
    let container = parts.next().ok_or_else(|| reject("expected host:container"))?;
    let mode = parts.next();
    if parts.next().is_some() {
        return Err(reject("too many ':' separated fields"));
    }

    let Some(rest) = host.strip_prefix(DATA_DIR_PLACEHOLDER) else {
        return Err(reject("host path must be the node data directory placeholder"));
    };
    let host_path = if rest.is_empty() {
        data_dir.to_path_buf()
    } else {
        let sub = rest
            .strip_prefix('/')
            .ok_or_else(|| reject("placeholder must be followed by '/' or nothing"))?;
        let sub = Path::new(sub);
        if !sub.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(reject("subpath must be relative without '..'"));
        }
        data_dir.join(sub)
    };

    if !container.starts_with('/') {
        return Err(reject("container path must be absolute"));
    }
    match mode {
        None => Ok(format!("{}:{container}", host_path.display())),
        Some(m @ ("ro" | "rw")) => Ok(format!("{}:{container}:{m}", host_path.display())),
        Some(other) => Err(reject(&format!("unknown mount mode '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> &'static Path {
        Path::new("/var/lib/chainward/btc-1")
    }

    #[test]
    fn placeholder_is_substituted() {
        let binds = resolve_binds(
            &[
                "{{DATA_DIR}}:/home/bitcoin/.bitcoin".into(),
                "{{DATA_DIR}}/conf:/etc/node:ro".into(),
            ],
            dir(),
        )
        .unwrap();
        assert_eq!(
            binds,
            vec![
                "/var/lib/chainward/btc-1:/home/bitcoin/.bitcoin",
                "/var/lib/chainward/btc-1/conf:/etc/node:ro",
            ]
        );
    }

    #[test]
    fn arbitrary_host_paths_are_rejected() {
        for spec in [
            "/etc:/etc",
            "/var/run/docker.sock:/var/run/docker.sock",
            "{{DATA_DIR}}/../other:/data",
            "{{DATA_DIR}}x:/data",
            "{{DATA_DIR}}//abs:/data",
            "{{DATA_DIR}}:relative",
            "{{DATA_DIR}}:/data:exec",
            "{{DATA_DIR}}",
        ] {
            assert!(resolve_binds(&[spec.to_string()], dir()).is_err(), "{spec} accepted");
        }
    }
}
