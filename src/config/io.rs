use super::Config;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Maximum size for a config file (1 MB).
pub const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

/// Read and parse a configuration file.
///
/// The format is chosen by extension: `.yaml`/`.yml`, `.toml`, anything else
/// as JSON5 (which accepts plain JSON). Symlinks at the final component,
/// hard-linked files and oversized files are refused.
pub fn read_config_file(path: &Path) -> Result<Config> {
    let metadata = std::fs::symlink_metadata(path)
        .with_context(|| format!("Cannot stat config file '{}'", path.display()))?;

    if metadata.file_type().is_symlink() {
        bail!(
            "Config file '{}' is a symlink, refusing to follow",
            path.display()
        );
    }
    if !metadata.is_file() {
        bail!("Config path '{}' is not a regular file", path.display());
    }
    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        bail!(
            "Config file '{}' is {} bytes, exceeds limit of {} bytes",
            path.display(),
            metadata.len(),
            MAX_CONFIG_FILE_BYTES,
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if metadata.nlink() > 1 {
            bail!(
                "Config file '{}' has {} hard links, refusing to read",
                path.display(),
                metadata.nlink(),
            );
        }
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    parse_config(&content, path.extension().and_then(|e| e.to_str()))
        .with_context(|| format!("Invalid config file '{}'", path.display()))
}

/// Parse configuration text in the format named by `extension`.
pub fn parse_config(content: &str, extension: Option<&str>) -> Result<Config> {
    let config = match extension {
        Some("yaml") | Some("yml") => serde_yaml::from_str(content)?,
        Some("toml") => toml::from_str(content)?,
        _ => json5::from_str(content).or_else(|_| serde_json::from_str(content))?,
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn read_json5_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secretary.json");
        fs::write(
            &file,
            "{\n  // rotate quickly\n  provider: 'file',\n  pollFrequencyMs: 500,\n}",
        )
        .unwrap();

        let config = read_config_file(&file).unwrap();
        assert_eq!(config.provider, ProviderKind::File);
        assert_eq!(config.poll_frequency_ms, 500);
    }

    #[test]
    fn read_yaml_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secretary.yaml");
        fs::write(&file, "provider: exec\nenvPrefix: VAULT_\n").unwrap();

        let config = read_config_file(&file).unwrap();
        assert_eq!(config.provider, ProviderKind::Exec);
        assert_eq!(config.env_prefix, "VAULT_");
    }

    #[test]
    fn read_toml_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secretary.toml");
        fs::write(&file, "pollTimeoutMs = 250\n\n[logging]\njson = true\n").unwrap();

        let config = read_config_file(&file).unwrap();
        assert_eq!(config.poll_timeout_ms, 250);
        assert!(config.logging.json);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let err = parse_config(r#"{"provider": "vault"}"#, Some("json")).unwrap_err();
        assert!(err.to_string().contains("vault"));
    }

    #[test]
    fn reject_oversized_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("huge.json");
        let content = "x".repeat((MAX_CONFIG_FILE_BYTES + 1) as usize);
        fs::write(&file, content).unwrap();

        let err = read_config_file(&file).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[cfg(unix)]
    #[test]
    fn reject_hardlinked_config() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("secretary.json");
        let link = dir.path().join("alias.json");
        fs::write(&file, "{}").unwrap();
        fs::hard_link(&file, &link).unwrap();

        let err = read_config_file(&file).unwrap_err();
        assert!(err.to_string().contains("hard links"));
    }

    #[cfg(unix)]
    #[test]
    fn reject_symlinked_config() {
        let dir = TempDir::new().unwrap();
        let real_file = dir.path().join("real.json");
        let symlink = dir.path().join("link.json");
        fs::write(&real_file, "{}").unwrap();
        std::os::unix::fs::symlink(&real_file, &symlink).unwrap();

        let err = read_config_file(&symlink).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }
}
