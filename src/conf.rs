use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::error::TunnelError;

/// One tunnel entry of a YAML config file.
///
/// Keys other than these are ignored with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    /// "host" or "user@host"
    #[serde(rename = "host")]
    pub ssh_target: String,
    /// Private key path, may start with ~
    #[serde(rename = "key", default)]
    pub ssh_key_path: Option<String>,
    /// "LOCAL_HOST:LOCAL_PORT:REMOTE_HOST:REMOTE_PORT" expressions
    #[serde(rename = "locals")]
    pub forwards: Vec<String>,
}

const KNOWN_KEYS: [&str; 3] = ["host", "key", "locals"];

/// Resolve a config reference and decode every tunnel entry it holds.
pub fn load(reference: &str) -> Result<Vec<TunnelConfig>, TunnelError> {
    let path = resolve(reference)?;
    debug!("loading {}", path.display());
    load_file(&path)
}

pub fn load_file(path: &Path) -> Result<Vec<TunnelConfig>, TunnelError> {
    let content = fs::read_to_string(path).map_err(|source| TunnelError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(path, &content)
}

/// Find a config file: as given (after ~ expansion), then in the current directory,
/// the executable's directory and its `conf` subdirectory.
pub fn resolve(reference: &str) -> Result<PathBuf, TunnelError> {
    let mut search_dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        search_dirs.push(cwd);
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        search_dirs.push(exe_dir.clone());
        search_dirs.push(exe_dir.join("conf"));
    }
    resolve_in(reference, dirs::home_dir().as_deref(), &search_dirs)
}

fn resolve_in(
    reference: &str,
    home: Option<&Path>,
    search_dirs: &[PathBuf],
) -> Result<PathBuf, TunnelError> {
    let given = expand_home(reference, home);
    if given.is_file() {
        return Ok(given);
    }

    let mut searched = vec![given.clone()];
    if given.is_relative() {
        for dir in search_dirs {
            let candidate = dir.join(&given);
            if candidate.is_file() {
                return Ok(candidate);
            }
            searched.push(candidate);
        }
    }

    Err(TunnelError::ConfigNotFound {
        name: reference.to_string(),
        searched,
    })
}

fn expand_home(reference: &str, home: Option<&Path>) -> PathBuf {
    match (reference.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if reference == "~" => home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("~")),
        _ => PathBuf::from(reference),
    }
}

fn unknown_keys(entry: &Value) -> Vec<String> {
    let Value::Mapping(map) = entry else {
        return Vec::new();
    };
    map.keys()
        .filter(|key| !key.as_str().is_some_and(|k| KNOWN_KEYS.contains(&k)))
        .map(|key| match key.as_str() {
            Some(k) => k.to_string(),
            None => format!("{:?}", key),
        })
        .collect()
}

/// Decode a document holding either one mapping or a list of mappings.
fn parse_document(path: &Path, content: &str) -> Result<Vec<TunnelConfig>, TunnelError> {
    let invalid = |message: String| TunnelError::ConfigParse {
        path: path.to_path_buf(),
        message,
    };

    let doc: Value = serde_yaml::from_str(content).map_err(|e| invalid(e.to_string()))?;
    let entries = match doc {
        Value::Sequence(items) => items,
        Value::Mapping(_) => vec![doc],
        Value::Null => return Err(invalid("file is empty".to_string())),
        _ => {
            return Err(invalid(
                "expected a tunnel mapping or a list of them".to_string(),
            ));
        }
    };

    let mut configs = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        for key in unknown_keys(&entry) {
            warn!("{}: entry {}: ignoring unknown key `{}`", path.display(), i + 1, key);
        }
        let conf: TunnelConfig =
            serde_yaml::from_value(entry).map_err(|e| invalid(format!("entry {}: {}", i + 1, e)))?;
        if conf.forwards.is_empty() {
            return Err(invalid(format!(
                "entry {} (`{}`): 'locals' must list at least one forward",
                i + 1,
                conf.ssh_target
            )));
        }
        configs.push(conf);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Vec<TunnelConfig>, TunnelError> {
        parse_document(Path::new("test.yml"), content)
    }

    #[test]
    fn list_of_entries() {
        let configs = parse(
            r#"
- host: "user@bastion.example.com"
  key: "~/.ssh/id_rsa"
  locals:
    - "127.0.0.1:8080:internal-svc:80"
    - ":9090:db.internal:5432"
- host: jump
  locals: ["0.0.0.0:2222:git:22"]
"#,
        )
        .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].ssh_target, "user@bastion.example.com");
        assert_eq!(configs[0].ssh_key_path.as_deref(), Some("~/.ssh/id_rsa"));
        assert_eq!(
            configs[0].forwards,
            vec!["127.0.0.1:8080:internal-svc:80", ":9090:db.internal:5432"]
        );
        assert_eq!(configs[1].ssh_target, "jump");
        assert_eq!(configs[1].ssh_key_path, None);
    }

    #[test]
    fn single_mapping_is_one_entry() {
        let configs = parse("host: u@h\nlocals:\n  - \"127.0.0.1:80:r:8080\"\n").unwrap();
        assert_eq!(
            configs,
            vec![TunnelConfig {
                ssh_target: "u@h".to_string(),
                ssh_key_path: None,
                forwards: vec!["127.0.0.1:80:r:8080".to_string()],
            }]
        );
    }

    #[test]
    fn empty_document_is_rejected() {
        assert!(matches!(parse(""), Err(TunnelError::ConfigParse { .. })));
    }

    #[test]
    fn scalar_document_is_rejected() {
        assert!(matches!(parse("just text"), Err(TunnelError::ConfigParse { .. })));
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = parse("- locals: [\":1:r:2\"]\n").unwrap_err();
        assert!(err.to_string().contains("entry 1"), "{err}");
    }

    #[test]
    fn empty_locals_is_rejected() {
        assert!(parse("- host: h\n  locals: []\n").is_err());
        assert!(parse("- host: h\n").is_err());
    }

    #[test]
    fn extra_keys_are_ignored() {
        let configs = parse("- host: h\n  port: 22\n  comment: db\n  locals: [\":1:r:2\"]\n").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].ssh_target, "h");
        assert_eq!(configs[0].forwards, vec![":1:r:2".to_string()]);

        let entry: Value = serde_yaml::from_str("host: h\nport: 22\nlocals: []\n").unwrap();
        assert_eq!(unknown_keys(&entry), vec!["port".to_string()]);
    }

    #[test]
    fn resolves_fallback_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let conf = tmp.path().join("conf");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&conf).unwrap();
        fs::write(conf.join("tunnels.yml"), "host: h\nlocals: [\":1:r:2\"]\n").unwrap();

        let found = resolve_in("tunnels.yml", None, &[first.clone(), conf.clone()]).unwrap();
        assert_eq!(found, conf.join("tunnels.yml"));

        fs::write(first.join("tunnels.yml"), "host: h\nlocals: [\":1:r:2\"]\n").unwrap();
        let found = resolve_in("tunnels.yml", None, &[first.clone(), conf]).unwrap();
        assert_eq!(found, first.join("tunnels.yml"));
    }

    #[test]
    fn missing_file_lists_searched_locations() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_in("nope-sshfwd.yml", None, &[tmp.path().to_path_buf()]).unwrap_err();
        match err {
            TunnelError::ConfigNotFound { name, searched } => {
                assert_eq!(name, "nope-sshfwd.yml");
                assert_eq!(
                    searched,
                    vec![PathBuf::from("nope-sshfwd.yml"), tmp.path().join("nope-sshfwd.yml")]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tilde_paths_use_home() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("t.yml"), "host: h\nlocals: [\":1:r:2\"]\n").unwrap();
        let found = resolve_in("~/t.yml", Some(tmp.path()), &[]).unwrap();
        assert_eq!(found, tmp.path().join("t.yml"));
    }

    #[test]
    fn load_file_reads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.yml");
        fs::write(&path, "- host: a\n  locals: [\":1:r:2\"]\n- host: b\n  locals: [\":3:r:4\"]\n")
            .unwrap();
        let configs = load_file(&path).unwrap();
        let hosts: Vec<&str> = configs.iter().map(|c| c.ssh_target.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b"]);

        let err = load_file(&tmp.path().join("absent.yml")).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigRead { .. }));
    }
}
