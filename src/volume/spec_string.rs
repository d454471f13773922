//! Parser for the volume specification string used by config/collaborator
//! callers (spec §6): a comma-separated grammar describing how to open or
//! create a volume without a bespoke config struct.
//!
//! Grammar: `<path>[,name:<n>][,pageSize:{1024|2048|4096|8192|16384}]
//! [,initialPages|initialSize:N][,extensionPages|extensionSize:N]
//! [,maximumPages|maximumSize:N][,create|createOnly|readOnly]`.
//! `create` + `readOnly` and `create` + `createOnly` are mutually exclusive.

use crate::error::{Error, Result};

/// How the named volume should be opened relative to its existence on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum CreatePolicy {
    /// Open if present, create if absent.
    #[default]
    CreateIfMissing,
    /// Fail if the volume already exists.
    CreateOnly,
    /// Never create; fail if absent. Opens for reads only.
    ReadOnly,
    /// Open an existing volume for read/write; fail if absent.
    OpenExisting,
}

/// Parsed form of a volume specification string.
#[derive(Clone, Debug)]
pub struct VolumeSpec {
    pub path: String,
    pub name: Option<String>,
    pub page_size: Option<u32>,
    pub initial_pages: Option<u64>,
    pub extension_pages: Option<u64>,
    pub maximum_pages: Option<u64>,
    pub create_policy: CreatePolicy,
}

fn parse_count(field: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::InvalidSpec(format!("{field} must be a non-negative integer")))
}

/// Parses a volume specification string per spec §6's documented grammar.
pub fn parse_volume_spec(input: &str) -> Result<VolumeSpec> {
    let mut parts = input.split(',');
    let path = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidSpec("volume spec missing path".to_string()))?
        .to_string();

    let mut spec = VolumeSpec {
        path,
        name: None,
        page_size: None,
        initial_pages: None,
        extension_pages: None,
        maximum_pages: None,
        create_policy: CreatePolicy::OpenExisting,
    };
    let mut saw_create = false;
    let mut saw_read_only = false;
    let mut saw_create_only = false;

    for token in parts {
        if token.is_empty() {
            continue;
        }
        match token.split_once(':') {
            Some(("name", v)) => spec.name = Some(v.to_string()),
            Some(("pageSize", v)) => {
                let size: u32 = v
                    .parse()
                    .map_err(|_| Error::InvalidSpec("pageSize must be an integer".to_string()))?;
                if !matches!(size, 1024 | 2048 | 4096 | 8192 | 16384) {
                    return Err(Error::InvalidSpec(format!(
                        "pageSize {size} is not one of 1024|2048|4096|8192|16384"
                    )));
                }
                spec.page_size = Some(size);
            }
            Some(("initialPages", v)) | Some(("initialSize", v)) => {
                spec.initial_pages = Some(parse_count("initialPages", v)?);
            }
            Some(("extensionPages", v)) | Some(("extensionSize", v)) => {
                spec.extension_pages = Some(parse_count("extensionPages", v)?);
            }
            Some(("maximumPages", v)) | Some(("maximumSize", v)) => {
                spec.maximum_pages = Some(parse_count("maximumPages", v)?);
            }
            Some((key, _)) => {
                return Err(Error::InvalidSpec(format!("unknown volume spec key {key}")))
            }
            None => match token {
                "create" => {
                    saw_create = true;
                    spec.create_policy = CreatePolicy::CreateIfMissing;
                }
                "createOnly" => {
                    saw_create_only = true;
                    spec.create_policy = CreatePolicy::CreateOnly;
                }
                "readOnly" => {
                    saw_read_only = true;
                    spec.create_policy = CreatePolicy::ReadOnly;
                }
                other => {
                    return Err(Error::InvalidSpec(format!(
                        "unrecognized volume spec flag {other}"
                    )))
                }
            },
        }
    }

    if saw_create && saw_read_only {
        return Err(Error::InvalidSpec(
            "create and readOnly are mutually exclusive".to_string(),
        ));
    }
    if saw_create && saw_create_only {
        return Err(Error::InvalidSpec(
            "create and createOnly are mutually exclusive".to_string(),
        ));
    }

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_path_only() {
        let spec = parse_volume_spec("/tmp/db.vol").unwrap();
        assert_eq!(spec.path, "/tmp/db.vol");
        assert_eq!(spec.create_policy, CreatePolicy::OpenExisting);
    }

    #[test]
    fn parses_full_grammar() {
        let spec = parse_volume_spec(
            "/tmp/db.vol,name:main,pageSize:8192,initialPages:16,extensionPages:8,maximumPages:1000,create",
        )
        .unwrap();
        assert_eq!(spec.name.as_deref(), Some("main"));
        assert_eq!(spec.page_size, Some(8192));
        assert_eq!(spec.initial_pages, Some(16));
        assert_eq!(spec.extension_pages, Some(8));
        assert_eq!(spec.maximum_pages, Some(1000));
        assert_eq!(spec.create_policy, CreatePolicy::CreateIfMissing);
    }

    #[test]
    fn rejects_create_and_read_only_together() {
        assert!(parse_volume_spec("/tmp/db.vol,create,readOnly").is_err());
    }

    #[test]
    fn rejects_unsupported_page_size() {
        assert!(parse_volume_spec("/tmp/db.vol,pageSize:777").is_err());
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(parse_volume_spec("/tmp/db.vol,bogus").is_err());
    }
}
