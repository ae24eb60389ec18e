use crate::dir::SEGMENT_EXTENSION;
use uuid::Uuid;

/// Name of a new segment file: `<prefix>-<id:08>-<uuid8>.log`.
#[must_use]
pub fn segment_name(prefix: &str, id: u64) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{id:08}-{}.{SEGMENT_EXTENSION}", &uuid[..8])
}

/// File stem (name without extension) shared by a segment's side files.
#[must_use]
pub fn segment_stem(name: &str) -> &str {
    name.strip_suffix(SEGMENT_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .unwrap_or(name)
}

/// Segment id encoded in a segment file name.
#[must_use]
pub fn segment_id(prefix: &str, name: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    rest.split('-').next()?.parse().ok()
}
