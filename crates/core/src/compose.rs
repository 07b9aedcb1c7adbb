//! Compose/Volume Parser
//!
//! Parses a Compose file's YAML structure (never text-replace) into a
//! service/volume model, classifies each volume as named or bind, and
//! rewrites bind sources for a stack migration.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("failed to parse compose YAML: {message}")]
    Parse { message: String },

    #[error("service '{service}' has a volumes entry that is not a string or mapping")]
    InvalidVolumeEntry { service: String },

    #[error("failed to render compose YAML: {message}")]
    Render { message: String },
}

pub type Result<T> = std::result::Result<T, ComposeError>;

/// A classified volume mount on a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComposeVolume {
    Named {
        name: String,
        destination: String,
        mode: Option<String>,
    },
    Bind {
        source: String,
        destination: String,
        mode: Option<String>,
        original_string: String,
    },
}

impl ComposeVolume {
    /// Parse one `source:destination[:mode]` (or mapping-form) entry. Short
    /// syntax is split at most twice so a trailing `:ro`/`:rw` mode segment
    /// is preserved even when the source path itself contains colons.
    fn from_short_syntax(entry: &str) -> Self {
        let parts: Vec<&str> = entry.splitn(3, ':').collect();
        match parts.as_slice() {
            [destination] => ComposeVolume::Named {
                name: destination.to_string(),
                destination: destination.to_string(),
                mode: None,
            },
            [source, destination] => Self::classify(source, destination, None, entry),
            [source, destination, mode] => {
                Self::classify(source, destination, Some(mode.to_string()), entry)
            }
            _ => unreachable!("splitn(3, ..) yields at most 3 parts"),
        }
    }

    fn classify(source: &str, destination: &str, mode: Option<String>, original: &str) -> Self {
        if is_bind_source(source) {
            ComposeVolume::Bind {
                source: source.to_string(),
                destination: destination.to_string(),
                mode,
                original_string: original.to_string(),
            }
        } else {
            ComposeVolume::Named {
                name: source.to_string(),
                destination: destination.to_string(),
                mode,
            }
        }
    }
}

/// A volume source counts as a bind mount iff it looks like a path: absolute,
/// or relative with an explicit `.`/`..` prefix. Anything else (a bare word)
/// is a named volume reference.
fn is_bind_source(source: &str) -> bool {
    source.starts_with('/') || source.starts_with("./") || source.starts_with("../") || source == "."
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedService {
    pub name: String,
    pub volumes: Vec<ComposeVolume>,
    pub published_ports: Vec<String>,
}

/// The parsed form of a whole compose file: services in document order, plus
/// the raw YAML document so rewrites can be applied in place and re-rendered
/// without losing unrelated structure (top-level `networks:`, `volumes:`
/// declarations, etc).
#[derive(Debug, Clone)]
pub struct ParsedCompose {
    pub services: Vec<ParsedService>,
    raw: Value,
}

fn volume_entry_to_model(service_name: &str, entry: &Value) -> Result<ComposeVolume> {
    match entry {
        Value::String(s) => Ok(ComposeVolume::from_short_syntax(s)),
        Value::Mapping(map) => {
            let get_str = |key: &str| -> Option<String> {
                map.get(Value::String(key.to_string()))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            };
            let kind = get_str("type").unwrap_or_else(|| "volume".to_string());
            let destination = get_str("target").unwrap_or_default();
            let mode = if map
                .get(Value::String("read_only".to_string()))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                Some("ro".to_string())
            } else {
                None
            };
            if kind == "bind" {
                let source = get_str("source").unwrap_or_default();
                Ok(ComposeVolume::Bind {
                    source: source.clone(),
                    destination,
                    mode,
                    original_string: source,
                })
            } else {
                let name = get_str("source").unwrap_or_default();
                Ok(ComposeVolume::Named {
                    name,
                    destination,
                    mode,
                })
            }
        }
        _ => Err(ComposeError::InvalidVolumeEntry {
            service: service_name.to_string(),
        }),
    }
}

/// Parse Compose YAML text into the service/volume model described above.
#[instrument(skip(text))]
pub fn parse(text: &str) -> Result<ParsedCompose> {
    let raw: Value = serde_yaml::from_str(text).map_err(|e| ComposeError::Parse {
        message: e.to_string(),
    })?;

    let mut services = Vec::new();
    if let Some(services_map) = raw.get("services").and_then(|s| s.as_mapping()) {
        for (name, service) in services_map {
            let name = name.as_str().unwrap_or_default().to_string();
            let mut volumes = Vec::new();
            if let Some(vols) = service.get("volumes").and_then(|v| v.as_sequence()) {
                for entry in vols {
                    volumes.push(volume_entry_to_model(&name, entry)?);
                }
            }
            let mut published_ports = Vec::new();
            if let Some(ports) = service.get("ports").and_then(|p| p.as_sequence()) {
                for entry in ports {
                    if let Some(s) = entry.as_str() {
                        published_ports.push(s.to_string());
                    } else if let Some(n) = entry.as_u64() {
                        published_ports.push(n.to_string());
                    }
                }
            }
            debug!(service = %name, volume_count = volumes.len(), "parsed compose service");
            services.push(ParsedService {
                name,
                volumes,
                published_ports,
            });
        }
    }

    Ok(ParsedCompose { services, raw })
}

fn volume_to_yaml(volume: &ComposeVolume) -> Value {
    match volume {
        ComposeVolume::Named { name, destination, mode } => {
            let short = match mode {
                Some(mode) => format!("{name}:{destination}:{mode}"),
                None => format!("{name}:{destination}"),
            };
            Value::String(short)
        }
        ComposeVolume::Bind {
            source,
            destination,
            mode,
            ..
        } => {
            let short = match mode {
                Some(mode) => format!("{source}:{destination}:{mode}"),
                None => format!("{source}:{destination}"),
            };
            Value::String(short)
        }
    }
}

/// Rewrite a bind source per the migration rules:
/// - `${APPDATA_PATH}` (exact or substring) becomes `target_appdata`.
/// - A source equal to, or a descendant of, any `old_appdata_paths` entry is
///   rebased under `target_appdata/{stack_name}/<relative-tail>`, falling
///   back to the basename when the tail is empty.
/// - Everything else is left untouched.
fn rewrite_bind_source(
    source: &str,
    target_appdata: &Path,
    stack_name: &str,
    old_appdata_paths: &[PathBuf],
) -> String {
    const APPDATA_TOKEN: &str = "${APPDATA_PATH}";
    if source == APPDATA_TOKEN {
        return target_appdata.display().to_string();
    }
    if source.contains(APPDATA_TOKEN) {
        return source.replace(APPDATA_TOKEN, &target_appdata.display().to_string());
    }

    let source_path = Path::new(source);
    for old in old_appdata_paths {
        if source_path == old.as_path() {
            let basename = old
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return target_appdata
                .join(stack_name)
                .join(basename)
                .display()
                .to_string();
        }
        if let Ok(tail) = source_path.strip_prefix(old) {
            if tail.as_os_str().is_empty() {
                let basename = old
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return target_appdata
                    .join(stack_name)
                    .join(basename)
                    .display()
                    .to_string();
            }
            return target_appdata.join(stack_name).join(tail).display().to_string();
        }
    }

    source.to_string()
}

/// Rewrite every bind-mount source across all services for a target host,
/// operating on the parsed YAML structure and re-rendering it. Named and
/// anonymous volumes are never touched. Service order is preserved.
#[instrument(skip(compose), fields(stack_name))]
pub fn update_for_migration(
    compose: &ParsedCompose,
    target_appdata: &Path,
    stack_name: &str,
    old_appdata_paths: &[PathBuf],
) -> Result<String> {
    let mut raw = compose.raw.clone();

    if let Some(services_map) = raw.get_mut("services").and_then(|s| s.as_mapping_mut()) {
        for (_name, service) in services_map.iter_mut() {
            let Some(volumes) = service.get_mut("volumes").and_then(|v| v.as_sequence_mut()) else {
                continue;
            };
            for entry in volumes.iter_mut() {
                match entry {
                    Value::String(s) => {
                        let model = ComposeVolume::from_short_syntax(s);
                        if let ComposeVolume::Bind {
                            source,
                            destination,
                            mode,
                            ..
                        } = model
                        {
                            let new_source = rewrite_bind_source(
                                &source,
                                target_appdata,
                                stack_name,
                                old_appdata_paths,
                            );
                            *entry = volume_to_yaml(&ComposeVolume::Bind {
                                source: new_source,
                                destination,
                                mode,
                                original_string: String::new(),
                            });
                        }
                    }
                    Value::Mapping(map) => {
                        let is_bind = map
                            .get(Value::String("type".to_string()))
                            .and_then(|v| v.as_str())
                            .map(|t| t == "bind")
                            .unwrap_or(false);
                        if !is_bind {
                            continue;
                        }
                        let Some(source) = map
                            .get(Value::String("source".to_string()))
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                        else {
                            continue;
                        };
                        let new_source = rewrite_bind_source(
                            &source,
                            target_appdata,
                            stack_name,
                            old_appdata_paths,
                        );
                        map.insert(
                            Value::String("source".to_string()),
                            Value::String(new_source),
                        );
                    }
                    _ => continue,
                }
            }
        }
    }

    serde_yaml::to_string(&raw).map_err(|e| ComposeError::Render {
        message: e.to_string(),
    })
}

/// Collect every bind-mount source path across all services, used by the
/// migration orchestrator to enumerate what a transfer backend must move.
pub fn bind_mount_sources(compose: &ParsedCompose) -> Vec<PathBuf> {
    compose
        .services
        .iter()
        .flat_map(|s| &s.volumes)
        .filter_map(|v| match v {
            ComposeVolume::Bind { source, .. } => Some(PathBuf::from(source)),
            ComposeVolume::Named { .. } => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
services:
  web:
    image: nginx:latest
    ports:
      - "8080:80"
    volumes:
      - /opt/appdata/web/html:/usr/share/nginx/html:ro
      - web-data:/var/lib/web
  db:
    image: postgres:16
    volumes:
      - ${APPDATA_PATH}/db:/var/lib/postgresql/data
"#;

    #[test]
    fn parses_bind_and_named_volumes() {
        let parsed = parse(SAMPLE).unwrap();
        assert_eq!(parsed.services.len(), 2);
        let web = &parsed.services[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.published_ports, vec!["8080:80".to_string()]);
        assert!(matches!(web.volumes[0], ComposeVolume::Bind { .. }));
        assert!(matches!(web.volumes[1], ComposeVolume::Named { .. }));
    }

    #[test]
    fn appdata_token_is_substituted() {
        let parsed = parse(SAMPLE).unwrap();
        let rewritten = update_for_migration(
            &parsed,
            Path::new("/srv/appdata"),
            "mystack",
            &[PathBuf::from("/opt/appdata")],
        )
        .unwrap();
        assert!(rewritten.contains("/srv/appdata/db:/var/lib/postgresql/data"));
    }

    #[test]
    fn descendant_of_old_appdata_is_rebased_under_stack_name() {
        let parsed = parse(SAMPLE).unwrap();
        let rewritten = update_for_migration(
            &parsed,
            Path::new("/srv/appdata"),
            "mystack",
            &[PathBuf::from("/opt/appdata")],
        )
        .unwrap();
        assert!(rewritten.contains("/srv/appdata/mystack/web/html:/usr/share/nginx/html:ro"));
    }

    #[test]
    fn named_volumes_are_never_rewritten() {
        let parsed = parse(SAMPLE).unwrap();
        let rewritten = update_for_migration(
            &parsed,
            Path::new("/srv/appdata"),
            "mystack",
            &[PathBuf::from("/opt/appdata")],
        )
        .unwrap();
        assert!(rewritten.contains("web-data:/var/lib/web"));
    }

    const LONG_FORM_SAMPLE: &str = r#"
services:
  web:
    image: nginx:latest
    volumes:
      - type: bind
        source: /opt/appdata/web/html
        target: /usr/share/nginx/html
        read_only: true
      - type: volume
        source: web-data
        target: /var/lib/web
"#;

    #[test]
    fn long_form_bind_source_is_rebased() {
        let parsed = parse(LONG_FORM_SAMPLE).unwrap();
        let rewritten = update_for_migration(
            &parsed,
            Path::new("/srv/appdata"),
            "mystack",
            &[PathBuf::from("/opt/appdata")],
        )
        .unwrap();
        assert!(rewritten.contains("source: /srv/appdata/mystack/web/html"));
        assert!(rewritten.contains("source: web-data"));
    }

    #[test]
    fn bind_mount_sources_collects_paths_across_services() {
        let parsed = parse(SAMPLE).unwrap();
        let sources = bind_mount_sources(&parsed);
        assert_eq!(sources.len(), 2);
    }
}
