use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = pulse_common::id::prefixed_ulid("msg");
/// assert!(id.starts_with("msg_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CONNECTION: &str = "conn";
    pub const MESSAGE: &str = "msg";
    pub const NOTIFICATION: &str = "ntf";
    pub const JOB: &str = "job";
    pub const COMMENT: &str = "cmt";
}

/// Live gateway connection identifier.
pub struct ConnectionIdKind;

impl PrefixedId for ConnectionIdKind {
    const PREFIX: &'static str = prefix::CONNECTION;
}

/// Queue job identifier.
pub struct JobIdKind;

impl PrefixedId for JobIdKind {
    const PREFIX: &'static str = prefix::JOB;
}

/// Returns true when `id` carries `prefix` followed by a well-formed ULID.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|ulid| Ulid::from_string(ulid).is_ok())
}
