//! Parsing npm package specs out of dependency install commands.

use caprun_domain::error::{Error, ErrorKind, Result};

/// A resolved `name@version` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

/// Runner words and flags that precede the package spec in an install
/// command (`npx -y @mcp/memory@1.0.0`, `npm exec tavily-mcp@0.2.1`).
const RUNNER_WORDS: &[&str] = &["npx", "npm", "pnpm", "yarn", "exec", "dlx", "install", "i"];

/// Extract the package spec from an install command. When the spec
/// carries no version, `declared_version` fills it in.
pub fn parse_package_spec(install: &str, declared_version: &str) -> Result<PackageSpec> {
    let tokens = shell_words::split(install).map_err(|error| {
        Error::new(
            ErrorKind::DependencyInstallFailed,
            format!("unparseable install command: {error}"),
        )
        .with("command", install)
    })?;

    let spec_token = tokens
        .iter()
        .find(|t| !t.starts_with('-') && !RUNNER_WORDS.contains(&t.as_str()))
        .ok_or_else(|| {
            Error::new(
                ErrorKind::DependencyInstallFailed,
                format!("install command names no package: {install:?}"),
            )
            .with("command", install)
        })?;

    Ok(split_name_version(spec_token, declared_version))
}

/// Split `name@version`, keeping a leading `@scope/` intact.
fn split_name_version(token: &str, declared_version: &str) -> PackageSpec {
    match token.rfind('@') {
        // An `@` past position 0 separates name from version
        // (`@mcp/memory@1.0.0`, `tavily-mcp@0.2.1`).
        Some(pos) if pos > 0 => PackageSpec {
            name: token[..pos].to_string(),
            version: token[pos + 1..].to_string(),
        },
        // Bare name (or bare scoped name): use the declared version.
        _ => PackageSpec {
            name: token.to_string(),
            version: declared_version.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_package_with_version() {
        let spec = parse_package_spec("npx @mcp/memory@1.0.0", "9.9.9").unwrap();
        assert_eq!(spec.name, "@mcp/memory");
        assert_eq!(spec.version, "1.0.0");
    }

    #[test]
    fn unscoped_package_with_version() {
        let spec = parse_package_spec("npx -y tavily-mcp@0.2.1", "9.9.9").unwrap();
        assert_eq!(spec.name, "tavily-mcp");
        assert_eq!(spec.version, "0.2.1");
    }

    #[test]
    fn npm_exec_form() {
        let spec = parse_package_spec("npm exec @scope/pkg@2.0.0", "9.9.9").unwrap();
        assert_eq!(spec.name, "@scope/pkg");
        assert_eq!(spec.version, "2.0.0");
    }

    #[test]
    fn versionless_spec_uses_declared_version() {
        let spec = parse_package_spec("npx tavily-mcp", "0.2.1").unwrap();
        assert_eq!(spec.name, "tavily-mcp");
        assert_eq!(spec.version, "0.2.1");

        let scoped = parse_package_spec("npx @mcp/memory", "1.0.0").unwrap();
        assert_eq!(scoped.name, "@mcp/memory");
        assert_eq!(scoped.version, "1.0.0");
    }

    #[test]
    fn command_without_package_fails() {
        let err = parse_package_spec("npx -y", "1.0.0").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DependencyInstallFailed);
    }
}
