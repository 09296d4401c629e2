//! The decoder contract.
//!
//! A [`Decoder`] turns the bytes of one resource into a stream of
//! [`ClassEvent`]s handed to an [`EventSink`]. The sink answers each event
//! with an [`Interest`]; a decoder may skip the members or annotations the
//! sink declined. After a declined `BeginRecord` the decoder sends nothing
//! for that record but its closing `EndRecord`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader<'a> {
    pub name: &'a str,
    pub modifiers: u32,
    pub superclass: Option<&'a str>,
    pub interfaces: Vec<&'a str>,
}

/// What an annotation event is attached to: the current record, or the field
/// or method most recently announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Record,
    Field,
    Method,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassEvent<'a> {
    BeginRecord(RecordHeader<'a>),
    Field {
        name: &'a str,
    },
    Method {
        signature: &'a str,
    },
    Annotation {
        owner: Owner,
        annotation: &'a str,
        detail: Option<&'a str>,
    },
    EndRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Wanted,
    Skip,
}

impl Interest {
    pub fn wanted(self) -> bool {
        self == Interest::Wanted
    }
}

pub trait EventSink {
    fn accept(&mut self, event: ClassEvent<'_>) -> Interest;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed record in {resource}: {reason}")]
    Malformed { resource: String, reason: String },

    #[error("truncated record in {resource}")]
    Truncated { resource: String },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub trait Decoder: Send + Sync {
    /// Resource suffix this decoder reads, e.g. `.class` or `.java`.
    fn extension(&self) -> &str;

    /// Decodes one resource. On error, events already delivered for the
    /// unfinished record are discarded by the sink.
    fn decode(&self, resource: &str, bytes: &[u8], sink: &mut dyn EventSink) -> Result<(), DecodeError>;

    /// Resource which holds the named class.
    fn resource_for(&self, class_name: &str) -> String {
        format!("{}{}", class_name.replace('.', "/"), self.extension())
    }

    /// Class name a resource is expected to declare, if it is one this
    /// decoder reads.
    fn class_name_of(&self, resource: &str) -> Option<String> {
        let stem = resource.strip_suffix(self.extension())?;
        let stem = stem.trim_start_matches('/');
        if stem.is_empty() || stem.starts_with("META-INF/") {
            return None;
        }
        Some(stem.replace(['/', '\\'], "."))
    }
}

pub const PACKAGE_INFO: &str = "package-info";
pub const MODULE_INFO: &str = "module-info";

/// Package named by a `package-info` record name.
pub fn package_of_info(record_name: &str) -> Option<&str> {
    if record_name == PACKAGE_INFO {
        return Some("");
    }
    record_name
        .strip_suffix(PACKAGE_INFO)
        .and_then(|p| p.strip_suffix('.'))
}

pub fn is_module_info(record_name: &str) -> bool {
    record_name == MODULE_INFO || record_name.ends_with(".module-info")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dotted;

    impl Decoder for Dotted {
        fn extension(&self) -> &str {
            ".class"
        }

        fn decode(&self, _: &str, _: &[u8], _: &mut dyn EventSink) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[test]
    fn resource_names_map_to_class_names() {
        let d = Dotted;
        assert_eq!(d.resource_for("a.b.C"), "a/b/C.class");
        assert_eq!(d.class_name_of("a/b/C.class").as_deref(), Some("a.b.C"));
        assert_eq!(d.class_name_of("a/b/C.txt"), None);
        assert_eq!(d.class_name_of("META-INF/versions/9/a/C.class"), None);
    }

    #[test]
    fn package_info_names_resolve_to_packages() {
        assert_eq!(package_of_info("a.b.package-info"), Some("a.b"));
        assert_eq!(package_of_info("a.b.C"), None);
        assert!(is_module_info("module-info"));
    }
}
