//! Container command generation.
//!
//! Containerized steps shell out to the installed docker binary with a
//! deterministically assembled command line. Everything user-controlled is
//! validated and single-quote-escaped before it reaches the shell.

use std::collections::{BTreeMap, HashMap};
use std::path::Component;
use std::sync::LazyLock;

use regex::Regex;

use crucible_core::pipeline::Container;
use crucible_core::{Error, Result};

static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-/:@]+$").unwrap());
static VOLUME_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").unwrap());

const SHELL_META: &[char] = &['$', '`', ';', '&', '|', '<', '>', '(', ')', '\n', '"', '\''];

pub fn validate_image(image: &str) -> Result<()> {
    if IMAGE_RE.is_match(image) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid image name: {image}")))
    }
}

fn validate_volume_name(name: &str) -> Result<()> {
    if VOLUME_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid volume name: {name}")))
    }
}

/// Mount paths must be absolute, normalized (no `..`), and free of shell
/// metacharacters.
fn validate_mount_path(path: &str) -> Result<()> {
    let p = std::path::Path::new(path);
    if !p.is_absolute() {
        return Err(Error::InvalidInput(format!("mount path must be absolute: {path}")));
    }
    for component in p.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::InvalidInput(format!("mount path contains ..: {path}")));
        }
    }
    if path.contains(SHELL_META) || path.contains(char::is_whitespace) {
        return Err(Error::InvalidInput(format!("mount path contains shell metacharacters: {path}")));
    }
    Ok(())
}

/// POSIX single-quote escaping: `'` becomes `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the `docker run` invocation for one shell command inside a
/// container context. Flag order is fixed: volumes, workdir, env, image,
/// command.
pub fn build_run_command(
    container: &Container,
    workspace_mount: (&str, &str),
    workdir: &str,
    env: &HashMap<String, String>,
    command: &str,
) -> Result<String> {
    validate_image(&container.image)?;

    let mut parts: Vec<String> = vec!["docker".into(), "run".into(), "--rm".into()];

    let (host, target) = workspace_mount;
    validate_mount_path(host)?;
    validate_mount_path(target)?;
    parts.push("-v".into());
    parts.push(shell_quote(&format!("{host}:{target}")));

    for volume in &container.volumes {
        let (host, target) = volume
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("invalid volume spec: {volume}")))?;
        validate_mount_path(host)?;
        validate_mount_path(target)?;
        parts.push("-v".into());
        parts.push(shell_quote(volume));
    }

    // Named volumes persist across runs on the same host.
    let cache_volumes: BTreeMap<_, _> = container.cache_volumes.iter().collect();
    for (name, target) in cache_volumes {
        validate_volume_name(name)?;
        validate_mount_path(target)?;
        parts.push("-v".into());
        parts.push(shell_quote(&format!("{name}:{target}")));
    }

    validate_mount_path(workdir)?;
    parts.push("-w".into());
    parts.push(shell_quote(workdir));

    let mut sorted_env: BTreeMap<&String, &String> = env.iter().collect();
    for (key, value) in container.env.iter() {
        sorted_env.insert(key, value);
    }
    for (key, value) in sorted_env {
        if key.contains(SHELL_META) || key.contains(char::is_whitespace) {
            return Err(Error::InvalidInput(format!("invalid env key: {key}")));
        }
        parts.push("-e".into());
        parts.push(format!("{key}={}", shell_quote(value)));
    }

    parts.push(container.image.clone());
    parts.push("sh".into());
    parts.push("-c".into());
    parts.push(shell_quote(command));

    Ok(parts.join(" "))
}

/// Build the `docker compose run` invocation for a compose-backed step. The
/// image field carries the service name.
pub fn build_compose_command(
    service: &str,
    env: &HashMap<String, String>,
    command: &str,
) -> Result<String> {
    if !VOLUME_NAME_RE.is_match(service) {
        return Err(Error::InvalidInput(format!("invalid compose service name: {service}")));
    }
    let mut parts: Vec<String> = vec!["docker".into(), "compose".into(), "run".into(), "--rm".into()];
    let sorted_env: BTreeMap<&String, &String> = env.iter().collect();
    for (key, value) in sorted_env {
        if key.contains(SHELL_META) || key.contains(char::is_whitespace) {
            return Err(Error::InvalidInput(format!("invalid env key: {key}")));
        }
        parts.push("-e".into());
        parts.push(format!("{key}={}", shell_quote(value)));
    }
    parts.push(service.to_string());
    parts.push("sh".into());
    parts.push("-c".into());
    parts.push(shell_quote(command));
    Ok(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(image: &str) -> Container {
        Container {
            image: image.to_string(),
            volumes: Vec::new(),
            cache_volumes: BTreeMap::new(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn generates_deterministic_run_command() {
        let mut c = container("rust:1.85-slim");
        c.cache_volumes.insert("cargo-cache".into(), "/usr/local/cargo/registry".into());
        let env = HashMap::from([("CI".to_string(), "true".to_string())]);
        let cmd = build_run_command(
            &c,
            ("/var/lib/crucible/workspaces/b1", "/workspace"),
            "/workspace",
            &env,
            "cargo build",
        )
        .unwrap();
        assert_eq!(
            cmd,
            "docker run --rm -v '/var/lib/crucible/workspaces/b1:/workspace' \
             -v 'cargo-cache:/usr/local/cargo/registry' -w '/workspace' \
             -e CI='true' rust:1.85-slim sh -c 'cargo build'"
        );
    }

    #[test]
    fn rejects_bad_image_names() {
        assert!(validate_image("alpine:3.20").is_ok());
        assert!(validate_image("ghcr.io/org/tool@sha256:abc").is_ok());
        assert!(validate_image("alpine; rm -rf /").is_err());
        assert!(validate_image("img $(whoami)").is_err());
    }

    #[test]
    fn rejects_traversal_and_relative_mounts() {
        let mut c = container("alpine");
        c.volumes.push("/host/../etc:/x".into());
        assert!(
            build_run_command(&c, ("/w", "/workspace"), "/workspace", &HashMap::new(), "ls").is_err()
        );

        let mut c = container("alpine");
        c.volumes.push("relative:/x".into());
        // `relative` is not an absolute host path.
        assert!(
            build_run_command(&c, ("/w", "/workspace"), "/workspace", &HashMap::new(), "ls").is_err()
        );
    }

    #[test]
    fn quotes_env_values_and_command() {
        let c = container("alpine");
        let env = HashMap::from([("MSG".to_string(), "it's here".to_string())]);
        let cmd =
            build_run_command(&c, ("/w", "/workspace"), "/workspace", &env, "echo '$MSG'").unwrap();
        assert!(cmd.contains(r#"-e MSG='it'\''s here'"#));
        assert!(cmd.ends_with(r#"sh -c 'echo '\''$MSG'\'''"#));
    }

    #[test]
    fn compose_command_validates_service() {
        assert!(build_compose_command("web", &HashMap::new(), "make test").is_ok());
        assert!(build_compose_command("web; id", &HashMap::new(), "make test").is_err());
    }
}
