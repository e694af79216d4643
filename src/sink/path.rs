//! Object Naming
//!
//! Every sink file maps to three object names sharing one base name:
//!
//! ```text
//! <working_dir>/<name>        inflight: every record synced so far
//! <working_dir>/<name>.part   part: the records of one flush
//! <publish_dir>/<name>        publish: the finished file
//! ```
//!
//! Names are held unencoded. `GcsClient` percent-encodes each name as a
//! whole when it becomes a URL path segment or query value.

use crate::sink::error::SinkError;
use std::fmt;

/// Separator between directory and file name
pub const PATH_SEPARATOR: char = '/';
/// Suffix naming the transient part object
pub const PART_SUFFIX: &str = ".part";
/// Store limit on object name length (UTF-8 bytes)
pub const OBJECT_NAME_MAX_BYTES: usize = 1024;
/// Prefix the store reserves for domain verification
const RESERVED_PREFIX: &str = ".well-known/acme-challenge/";

/// A validated object name within the configured bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(name: impl Into<String>) -> Result<Self, SinkError> {
        let name = name.into();
        validate_object_name(&name).map_err(SinkError::InvalidName)?;
        Ok(ObjectPath(name))
    }

    /// `<directory>/<file_name>`
    pub fn join(directory: &str, file_name: &str) -> Result<Self, SinkError> {
        validate_directory(directory).map_err(SinkError::InvalidName)?;
        validate_file_name(file_name).map_err(SinkError::InvalidName)?;
        ObjectPath::new(format!("{}{}{}", directory, PATH_SEPARATOR, file_name))
    }

    /// This name with `suffix` appended
    pub fn with_suffix(&self, suffix: &str) -> Result<Self, SinkError> {
        ObjectPath::new(format!("{}{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The three object names belonging to one sink file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePaths {
    /// Composed result of every sync so far; replaced, never renamed
    pub inflight: ObjectPath,
    /// Most recently flushed records
    pub part: ObjectPath,
    /// Final location, written exactly once
    pub publish: ObjectPath,
}

impl FilePaths {
    pub fn new(working_dir: &str, publish_dir: &str, file_name: &str) -> Result<Self, SinkError> {
        let inflight = ObjectPath::join(working_dir, file_name)?;
        let part = inflight.with_suffix(PART_SUFFIX)?;
        let publish = ObjectPath::join(publish_dir, file_name)?;

        // The part must never alias the publish path, or a sync could publish early.
        if part == publish || inflight == publish {
            return Err(SinkError::InvalidName(format!(
                "publish path '{}' collides with a working object",
                publish
            )));
        }

        Ok(FilePaths {
            inflight,
            part,
            publish,
        })
    }
}

/// Check a directory name for use as an object name prefix.
pub fn validate_directory(directory: &str) -> Result<(), String> {
    if directory.is_empty() {
        return Err("directory must not be empty".to_string());
    }
    if directory.starts_with(PATH_SEPARATOR) || directory.ends_with(PATH_SEPARATOR) {
        return Err(format!(
            "directory '{}' must not start or end with '{}'",
            directory, PATH_SEPARATOR
        ));
    }
    for segment in directory.split(PATH_SEPARATOR) {
        match segment {
            "" => return Err(format!("directory '{}' contains an empty segment", directory)),
            "." | ".." => {
                return Err(format!(
                    "directory '{}' contains a relative segment '{}'",
                    directory, segment
                ))
            }
            _ => {}
        }
    }
    check_characters(directory)?;
    if directory.len() >= OBJECT_NAME_MAX_BYTES {
        return Err(format!(
            "directory is {} bytes, object names are limited to {}",
            directory.len(),
            OBJECT_NAME_MAX_BYTES
        ));
    }
    Ok(())
}

/// Check a logical file name (the part after the directory).
pub fn validate_file_name(file_name: &str) -> Result<(), String> {
    if file_name.is_empty() {
        return Err("file name must not be empty".to_string());
    }
    if file_name.contains(PATH_SEPARATOR) {
        return Err(format!(
            "file name '{}' must not contain '{}'",
            file_name, PATH_SEPARATOR
        ));
    }
    if file_name == "." || file_name == ".." {
        return Err(format!("file name '{}' is reserved", file_name));
    }
    check_characters(file_name)
}

/// Check a complete object name against the store's naming rules.
pub fn validate_object_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("object name must not be empty".to_string());
    }
    if name.len() > OBJECT_NAME_MAX_BYTES {
        return Err(format!(
            "object name is {} bytes, limit is {}",
            name.len(),
            OBJECT_NAME_MAX_BYTES
        ));
    }
    if name == "." || name == ".." {
        return Err(format!("object name '{}' is reserved", name));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(format!("object name must not start with '{}'", RESERVED_PREFIX));
    }
    check_characters(name)
}

fn check_characters(value: &str) -> Result<(), String> {
    match value.chars().find(|c| c.is_control()) {
        Some(c) => Err(format!("'{}' contains control character {:?}", value.escape_debug(), c)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_paths_layout() {
        let paths = FilePaths::new("inflight", "published", "events-0001.rec").unwrap();
        assert_eq!(paths.inflight.as_str(), "inflight/events-0001.rec");
        assert_eq!(paths.part.as_str(), "inflight/events-0001.rec.part");
        assert_eq!(paths.publish.as_str(), "published/events-0001.rec");
    }

    #[test]
    fn test_nested_directories_allowed() {
        let paths = FilePaths::new("tmp/sink/work", "data/2024", "f").unwrap();
        assert_eq!(paths.inflight.as_str(), "tmp/sink/work/f");
        assert_eq!(paths.publish.as_str(), "data/2024/f");
    }

    #[test]
    fn test_same_directory_collision_rejected() {
        assert!(FilePaths::new("dir", "dir", "f").is_err());
    }

    #[test]
    fn test_directory_validation() {
        assert!(validate_directory("inflight").is_ok());
        assert!(validate_directory("a/b/c").is_ok());
        assert!(validate_directory("with space").is_ok());
        assert!(validate_directory("").is_err());
        assert!(validate_directory("/leading").is_err());
        assert!(validate_directory("trailing/").is_err());
        assert!(validate_directory("a//b").is_err());
        assert!(validate_directory("a/../b").is_err());
        assert!(validate_directory("line\nbreak").is_err());
        assert!(validate_directory(&"d".repeat(OBJECT_NAME_MAX_BYTES)).is_err());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("events.rec").is_ok());
        assert!(validate_file_name("ünïcödé+plus").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("tab\there").is_err());
    }

    #[test]
    fn test_object_name_limits() {
        assert!(ObjectPath::new("x".repeat(OBJECT_NAME_MAX_BYTES)).is_ok());
        assert!(ObjectPath::new("x".repeat(OBJECT_NAME_MAX_BYTES + 1)).is_err());
        assert!(ObjectPath::new(".well-known/acme-challenge/token").is_err());
    }
}
