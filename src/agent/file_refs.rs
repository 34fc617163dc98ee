//! Conversions between bus-level [`FileRef`]s and the serializable
//! [`FileRefMeta`] persisted in session history. Metadata only — the
//! resolved payload never round-trips.

use crate::bus::{FileRef, FileRefSource};
use crate::providers::FileRefMeta;

pub fn to_file_ref_meta(file_refs: &[FileRef]) -> Vec<FileRefMeta> {
    file_refs
        .iter()
        .map(|r| FileRefMeta {
            name: r.name.clone(),
            media_type: r.media_type.clone(),
            kind: r.kind.as_str().to_string(),
            source: r.source.as_str().to_string(),
            message_id: r.message_id.clone(),
            file_key: r.file_key.clone(),
            resource_type: r.resource_type.clone(),
        })
        .collect()
}

pub fn to_bus_file_refs(metas: &[FileRefMeta]) -> Vec<FileRef> {
    metas
        .iter()
        .map(|m| FileRef {
            name: m.name.clone(),
            media_type: m.media_type.clone(),
            size_bytes: None,
            kind: m.kind.parse().unwrap_or_default(),
            source: match m.source.as_str() {
                "feishu" => FileRefSource::Feishu,
                other => FileRefSource::Other(other.to_string()),
            },
            message_id: m.message_id.clone(),
            file_key: m.file_key.clone(),
            resource_type: m.resource_type.clone(),
        })
        .collect()
}
