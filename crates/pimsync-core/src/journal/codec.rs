//! Journal encoding and the format version history
//!
//! A journal starts with a 64-bit header word holding the record count in
//! its low 32 bits and the format version in bits 32..48. From version 1 on
//! the header is followed by a 64-bit start offset: the number of leading
//! records that were already acknowledged and must be skipped on load.
//!
//! Every record starts with the session id and a type tag. The payload that
//! follows depends on the format version. Only [`FormatVersion::CURRENT`] is
//! ever written; every version in [`SUPPORTED_VERSION_RANGE`] can be read.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use tracing::warn;

use super::wire::{WireReader, WireWriter};
use crate::error::{DecodeError, Error, Result};
use crate::models::{
    Ancestor, CachePolicy, ChangePayload, CollectionOperation, CollectionRecord,
    CollectionStatistics, EntityId, ItemOperation, ItemPart, ItemRecord, LegacyEntry,
    LegacyOperation, Notification, NotificationKind, PartMetaData, StorageType, TagOperation,
    TagRecord, Tristate, FETCH_COLLECTION, FETCH_ITEM, FETCH_TAG,
};

/// Versions this build can read.
pub const SUPPORTED_VERSION_RANGE: RangeInclusive<u16> = 0..=7;

/// Byte position of the start offset word.
pub const START_OFFSET_POSITION: u64 = 8;

const COUNT_MASK: u64 = 0xffff_ffff;
const VERSION_MASK: u64 = 0xffff;
const VERSION_SHIFT: u32 = 32;

const ITEM_TAG: i32 = NotificationKind::Items.tag();
const COLLECTION_TAG: i32 = NotificationKind::Collections.tag();
const TAG_TAG: i32 = NotificationKind::Tags.tag();
const RELATION_TAG: i32 = 4;

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Journal format revisions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatVersion {
    /// Bare record count, flat id-only records
    Unversioned,
    /// Start offset word added to the header
    StartOffset,
    /// Entity lists, destination resource and flag sets
    EntityLists,
    /// Added and removed tag sets on item changes
    TagSets,
    /// Per-kind operation codes
    NativeOperations,
    /// Full entity records instead of stubs
    FullRecords,
    /// `must_retrieve` hint on item changes
    MustRetrieve,
    /// Marker set at the end of every payload
    Metadata,
}

impl FormatVersion {
    pub const CURRENT: Self = Self::Metadata;

    #[must_use]
    pub const fn from_number(number: u16) -> Option<Self> {
        Some(match number {
            0 => Self::Unversioned,
            1 => Self::StartOffset,
            2 => Self::EntityLists,
            3 => Self::TagSets,
            4 => Self::NativeOperations,
            5 => Self::FullRecords,
            6 => Self::MustRetrieve,
            7 => Self::Metadata,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn number(self) -> u16 {
        match self {
            Self::Unversioned => 0,
            Self::StartOffset => 1,
            Self::EntityLists => 2,
            Self::TagSets => 3,
            Self::NativeOperations => 4,
            Self::FullRecords => 5,
            Self::MustRetrieve => 6,
            Self::Metadata => 7,
        }
    }

    #[must_use]
    pub const fn has_start_offset(self) -> bool {
        !matches!(self, Self::Unversioned)
    }

    const fn layout(self) -> Layout {
        match self {
            Self::Unversioned | Self::StartOffset => Layout::Flat,
            Self::EntityLists => Layout::Stubs {
                tag_sets: false,
                native_operations: false,
            },
            Self::TagSets => Layout::Stubs {
                tag_sets: true,
                native_operations: false,
            },
            Self::NativeOperations => Layout::Stubs {
                tag_sets: true,
                native_operations: true,
            },
            Self::FullRecords => Layout::Records {
                must_retrieve: false,
                metadata: false,
            },
            Self::MustRetrieve => Layout::Records {
                must_retrieve: true,
                metadata: false,
            },
            Self::Metadata => Layout::Records {
                must_retrieve: true,
                metadata: true,
            },
        }
    }
}

/// Record payload shape for a version.
#[derive(Debug, Clone, Copy)]
enum Layout {
    Flat,
    Stubs {
        tag_sets: bool,
        native_operations: bool,
    },
    Records {
        must_retrieve: bool,
        metadata: bool,
    },
}

/// Parsed journal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub version: FormatVersion,
    pub count: u32,
    pub start_offset: u64,
}

/// Everything recovered from a journal byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedJournal {
    pub header: JournalHeader,
    /// Records past the start offset, in order
    pub notifications: Vec<Notification>,
    /// Records past the start offset that were read but had no meaning here
    pub discarded: usize,
    /// Error that cut the stream short, if any
    pub truncated: Option<DecodeError>,
}

impl DecodedJournal {
    /// Whether the on-disk layout should be normalized by a full rewrite.
    ///
    /// Offset patches assume on-disk record `i` is queue entry `i`, which no
    /// longer holds once a record was dropped.
    #[must_use]
    pub fn needs_full_save(&self) -> bool {
        self.header.start_offset > 0
            || self.header.version < FormatVersion::CURRENT
            || self.discarded > 0
            || self.truncated.is_some()
    }
}

/// Serialize notifications as a current-version journal with start offset 0.
pub fn encode_journal<'a, I>(notifications: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a Notification>,
    I::IntoIter: ExactSizeIterator,
{
    let notifications = notifications.into_iter();
    let count = u32::try_from(notifications.len())
        .map_err(|_| Error::InvalidInput("too many notifications for one journal".to_string()))?;

    let mut writer = WireWriter::new();
    writer.put_u64(header_word(count, FormatVersion::CURRENT));
    writer.put_u64(0);
    for ntf in notifications {
        write_notification(&mut writer, ntf)?;
    }
    Ok(writer.into_bytes())
}

/// Pack a record count and version into the header word.
#[must_use]
pub fn header_word(count: u32, version: FormatVersion) -> u64 {
    u64::from(count) | (u64::from(version.number()) << VERSION_SHIFT)
}

/// Read only the header of a journal.
pub fn decode_header(reader: &mut WireReader<'_>) -> Result<JournalHeader> {
    let word = reader.get_u64()?;
    #[allow(clippy::cast_possible_truncation)]
    let count = (word & COUNT_MASK) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let number = ((word >> VERSION_SHIFT) & VERSION_MASK) as u16;

    if !SUPPORTED_VERSION_RANGE.contains(&number) {
        return Err(Error::UnsupportedVersion(number));
    }
    let version = FormatVersion::from_number(number).ok_or(Error::UnsupportedVersion(number))?;
    let start_offset = if version.has_start_offset() {
        reader.get_u64()?
    } else {
        0
    };

    Ok(JournalHeader {
        version,
        count,
        start_offset,
    })
}

/// Parse a journal byte stream.
///
/// Header problems are errors. A record that fails to decode ends the stream:
/// everything before it is kept and the error is reported in
/// [`DecodedJournal::truncated`].
pub fn decode_journal(bytes: &[u8]) -> Result<DecodedJournal> {
    if bytes.is_empty() {
        return Ok(DecodedJournal {
            header: JournalHeader {
                version: FormatVersion::CURRENT,
                count: 0,
                start_offset: 0,
            },
            notifications: Vec::new(),
            discarded: 0,
            truncated: None,
        });
    }

    let mut reader = WireReader::new(bytes);
    let header = decode_header(&mut reader)?;

    let mut notifications = Vec::new();
    let mut discarded = 0;
    let mut truncated = None;
    for index in 0..u64::from(header.count) {
        let record = match decode_record(&mut reader, header.version) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    "Journal truncated at record {} of {}: {}",
                    index, header.count, err
                );
                truncated = Some(err);
                break;
            }
        };
        if index < header.start_offset {
            continue;
        }
        match record {
            Some(ntf) => notifications.push(ntf),
            None => discarded += 1,
        }
    }

    Ok(DecodedJournal {
        header,
        notifications,
        discarded,
        truncated,
    })
}

/// Decode one record. `Ok(None)` means the record was read but is dropped,
/// e.g. relation records or operations without meaning for their kind.
fn decode_record(
    reader: &mut WireReader<'_>,
    version: FormatVersion,
) -> DecodeResult<Option<Notification>> {
    let session_id = reader.get_bytes()?;
    let type_tag = reader.get_i32()?;

    let ntf = match version.layout() {
        Layout::Flat => read_flat_record(reader, version, type_tag)?,
        Layout::Stubs {
            tag_sets,
            native_operations,
        } => read_stub_record(reader, type_tag, tag_sets, native_operations)?,
        Layout::Records {
            must_retrieve,
            metadata,
        } => read_full_record(reader, type_tag, must_retrieve, metadata)?,
    };

    Ok(ntf.map(|ntf| ntf.with_session(session_id)))
}

fn read_flat_record(
    reader: &mut WireReader<'_>,
    version: FormatVersion,
    type_tag: i32,
) -> DecodeResult<Option<Notification>> {
    let kind = match type_tag {
        ITEM_TAG => NotificationKind::Items,
        COLLECTION_TAG => NotificationKind::Collections,
        RELATION_TAG => return Err(DecodeError::UnreadableRelation(version.number())),
        other => return Err(DecodeError::UnknownType(other)),
    };

    let entry = LegacyEntry {
        kind,
        operation: LegacyOperation::from_code(reader.get_i32()?),
        uid: reader.get_i64()?,
        remote_id: reader.get_string()?,
        mime_type: reader.get_string()?,
        session_id: Vec::new(),
        resource: reader.get_string()?,
        parent_collection: reader.get_i64()?,
        parent_dest_collection: reader.get_i64()?,
        item_parts: reader.get_byte_list()?.into_iter().collect(),
    };
    Ok(entry.into_notification())
}

struct EntityStub {
    id: EntityId,
    remote_id: String,
    remote_revision: String,
    mime_type: String,
}

fn read_entity_stub(reader: &mut WireReader<'_>) -> DecodeResult<EntityStub> {
    Ok(EntityStub {
        id: reader.get_i64()?,
        remote_id: reader.get_string()?,
        remote_revision: reader.get_string()?,
        mime_type: reader.get_string()?,
    })
}

fn read_stub_record(
    reader: &mut WireReader<'_>,
    type_tag: i32,
    tag_sets: bool,
    native_operations: bool,
) -> DecodeResult<Option<Notification>> {
    match type_tag {
        ITEM_TAG | COLLECTION_TAG => {}
        TAG_TAG => return read_tag_stub(reader, native_operations),
        RELATION_TAG => {
            skip_relation(reader)?;
            return Ok(None);
        }
        other => return Err(DecodeError::UnknownType(other)),
    }

    let op_code = reader.get_i32()?;
    let entity_count = reader.get_i32()?;
    let entity_count =
        usize::try_from(entity_count).map_err(|_| DecodeError::NegativeCount(entity_count))?;
    let mut stubs = Vec::with_capacity(entity_count.min(reader.remaining()));
    for _ in 0..entity_count {
        stubs.push(read_entity_stub(reader)?);
    }
    let resource = reader.get_string()?;
    let destination_resource = reader.get_string()?;
    let parent = reader.get_i64()?;
    let parent_dest = reader.get_i64()?;
    let item_parts: BTreeSet<Vec<u8>> = reader.get_byte_list()?.into_iter().collect();
    let added_flags = reader.get_byte_list()?;
    let removed_flags = reader.get_byte_list()?;
    let (added_tags, removed_tags) = if tag_sets {
        (reader.get_id_list()?, reader.get_id_list()?)
    } else {
        (Vec::new(), Vec::new())
    };

    let ntf = if type_tag == ITEM_TAG {
        let operation = if native_operations {
            ItemOperation::from_code(op_code)
        } else {
            LegacyOperation::from_code(op_code).to_item()
        };
        let Some(operation) = operation else {
            return Ok(None);
        };
        let items = stubs
            .into_iter()
            .map(|stub| {
                let mut item = ItemRecord::stub(stub.id, stub.remote_id, stub.mime_type);
                item.remote_revision = stub.remote_revision;
                item
            })
            .collect();
        let mut ntf = Notification::items(operation, items).with_marker(FETCH_ITEM);
        if let ChangePayload::Item(change) = &mut ntf.payload {
            change.item_parts = item_parts;
            change.added_flags = added_flags.into_iter().collect();
            change.removed_flags = removed_flags.into_iter().collect();
            change.added_tags = tag_stubs(added_tags);
            change.removed_tags = tag_stubs(removed_tags);
        }
        ntf
    } else {
        let operation = if native_operations {
            CollectionOperation::from_code(op_code)
        } else {
            LegacyOperation::from_code(op_code).to_collection()
        };
        // Collection changes only ever name one collection; keep the last.
        let (Some(operation), Some(stub)) = (operation, stubs.pop()) else {
            return Ok(None);
        };
        let mut collection = CollectionRecord::stub(stub.id, stub.remote_id);
        collection.remote_revision = stub.remote_revision;
        let mut ntf =
            Notification::collection(operation, collection).with_marker(FETCH_COLLECTION);
        if let ChangePayload::Collection(change) = &mut ntf.payload {
            change.changed_parts = item_parts;
        }
        ntf
    };

    Ok(Some(
        ntf.with_resource(resource)
            .with_parent(parent)
            .with_destination(parent_dest, destination_resource),
    ))
}

fn tag_stubs(ids: Vec<EntityId>) -> Vec<TagRecord> {
    ids.into_iter()
        .map(|id| TagRecord::stub(id, Vec::new()))
        .collect()
}

fn read_tag_stub(
    reader: &mut WireReader<'_>,
    native_operations: bool,
) -> DecodeResult<Option<Notification>> {
    let op_code = reader.get_i32()?;
    let id = reader.get_i64()?;
    let remote_id = reader.get_bytes()?;
    let resource = reader.get_string()?;

    let operation = if native_operations {
        TagOperation::from_code(op_code)
    } else {
        LegacyOperation::from_code(op_code).to_tag()
    };
    Ok(operation.map(|operation| {
        Notification::tag(operation, TagRecord::stub(id, remote_id))
            .with_marker(FETCH_TAG)
            .with_resource(resource)
    }))
}

/// Relation records are never written; older journals may still hold them.
fn skip_relation(reader: &mut WireReader<'_>) -> DecodeResult<()> {
    reader.get_i32()?;
    reader.get_i64()?;
    reader.get_i64()?;
    reader.get_bytes()?;
    reader.get_bytes()?;
    reader.get_string()?;
    reader.get_byte_list()?;
    Ok(())
}

fn read_full_record(
    reader: &mut WireReader<'_>,
    type_tag: i32,
    must_retrieve: bool,
    metadata: bool,
) -> DecodeResult<Option<Notification>> {
    let ntf = match type_tag {
        ITEM_TAG => {
            let operation = ItemOperation::from_code(reader.get_i32()?);
            let items = reader.get_list_with(read_item)?;
            let resource = reader.get_string()?;
            let destination_resource = reader.get_string()?;
            let parent = reader.get_i64()?;
            let parent_dest = reader.get_i64()?;
            let item_parts = reader.get_byte_list()?.into_iter().collect();
            let added_flags = reader.get_byte_list()?.into_iter().collect();
            let removed_flags = reader.get_byte_list()?.into_iter().collect();
            let added_tags = reader.get_list_with(read_tag)?;
            let removed_tags = reader.get_list_with(read_tag)?;
            let retrieve = if must_retrieve {
                reader.get_bool()?
            } else {
                false
            };

            operation.map(|operation| {
                let mut ntf = Notification::items(operation, items)
                    .with_resource(resource)
                    .with_parent(parent)
                    .with_destination(parent_dest, destination_resource);
                if let ChangePayload::Item(change) = &mut ntf.payload {
                    change.item_parts = item_parts;
                    change.added_flags = added_flags;
                    change.removed_flags = removed_flags;
                    change.added_tags = added_tags;
                    change.removed_tags = removed_tags;
                    change.must_retrieve = retrieve;
                }
                ntf
            })
        }
        COLLECTION_TAG => {
            let operation = CollectionOperation::from_code(reader.get_i32()?);
            let collection = read_collection(reader)?;
            let resource = reader.get_string()?;
            let destination_resource = reader.get_string()?;
            let parent = reader.get_i64()?;
            let parent_dest = reader.get_i64()?;
            let changed_parts = reader.get_byte_list()?.into_iter().collect();

            operation.map(|operation| {
                let mut ntf = Notification::collection(operation, collection)
                    .with_resource(resource)
                    .with_parent(parent)
                    .with_destination(parent_dest, destination_resource);
                if let ChangePayload::Collection(change) = &mut ntf.payload {
                    change.changed_parts = changed_parts;
                }
                ntf
            })
        }
        TAG_TAG => {
            let operation = TagOperation::from_code(reader.get_i32()?);
            let tag = read_tag(reader)?;
            let resource = reader.get_string()?;
            operation.map(|operation| Notification::tag(operation, tag).with_resource(resource))
        }
        RELATION_TAG => {
            skip_relation(reader)?;
            return Ok(None);
        }
        other => return Err(DecodeError::UnknownType(other)),
    };

    // The marker set is the last payload field, so it is read even when the
    // record itself gets dropped.
    let markers: BTreeSet<Vec<u8>> = if metadata {
        reader.get_byte_list()?.into_iter().collect()
    } else {
        BTreeSet::new()
    };
    Ok(ntf.map(|mut ntf| {
        ntf.metadata = markers;
        ntf
    }))
}

fn write_notification(writer: &mut WireWriter, ntf: &Notification) -> Result<()> {
    writer.put_bytes(&ntf.session_id)?;
    match &ntf.payload {
        ChangePayload::Item(change) => {
            writer.put_i32(ITEM_TAG);
            writer.put_i32(change.operation.code());
            writer.put_len(change.items.len())?;
            for item in &change.items {
                write_item(writer, item)?;
            }
            write_routing(writer, ntf)?;
            writer.put_byte_list(&change.item_parts)?;
            writer.put_byte_list(&change.added_flags)?;
            writer.put_byte_list(&change.removed_flags)?;
            write_tags(writer, &change.added_tags)?;
            write_tags(writer, &change.removed_tags)?;
            writer.put_bool(change.must_retrieve);
        }
        ChangePayload::Collection(change) => {
            writer.put_i32(COLLECTION_TAG);
            writer.put_i32(change.operation.code());
            write_collection(writer, &change.collection)?;
            write_routing(writer, ntf)?;
            writer.put_byte_list(&change.changed_parts)?;
        }
        ChangePayload::Tag(change) => {
            writer.put_i32(TAG_TAG);
            writer.put_i32(change.operation.code());
            write_tag(writer, &change.tag)?;
            writer.put_str(&ntf.resource)?;
        }
    }
    writer.put_byte_list(&ntf.metadata)
}

fn write_routing(writer: &mut WireWriter, ntf: &Notification) -> Result<()> {
    writer.put_str(&ntf.resource)?;
    writer.put_str(&ntf.destination_resource)?;
    writer.put_i64(ntf.parent_collection);
    writer.put_i64(ntf.parent_dest_collection);
    Ok(())
}

fn write_tags(writer: &mut WireWriter, tags: &[TagRecord]) -> Result<()> {
    writer.put_len(tags.len())?;
    for tag in tags {
        write_tag(writer, tag)?;
    }
    Ok(())
}

fn write_tag(writer: &mut WireWriter, tag: &TagRecord) -> Result<()> {
    writer.put_i64(tag.id);
    writer.put_i64(tag.parent_id);
    writer.put_bytes(&tag.gid)?;
    writer.put_bytes(&tag.tag_type)?;
    writer.put_bytes(&tag.remote_id)?;
    writer.put_attributes(&tag.attributes)
}

fn read_tag(reader: &mut WireReader<'_>) -> DecodeResult<TagRecord> {
    Ok(TagRecord {
        id: reader.get_i64()?,
        parent_id: reader.get_i64()?,
        gid: reader.get_bytes()?,
        tag_type: reader.get_bytes()?,
        remote_id: reader.get_bytes()?,
        attributes: reader.get_attributes()?,
    })
}

fn write_ancestors(writer: &mut WireWriter, ancestors: &[Ancestor]) -> Result<()> {
    writer.put_len(ancestors.len())?;
    for ancestor in ancestors {
        writer.put_i64(ancestor.id);
        writer.put_str(&ancestor.remote_id)?;
        writer.put_str(&ancestor.name)?;
        writer.put_attributes(&ancestor.attributes)?;
    }
    Ok(())
}

fn read_ancestor(reader: &mut WireReader<'_>) -> DecodeResult<Ancestor> {
    Ok(Ancestor {
        id: reader.get_i64()?,
        remote_id: reader.get_string()?,
        name: reader.get_string()?,
        attributes: reader.get_attributes()?,
    })
}

fn write_item(writer: &mut WireWriter, item: &ItemRecord) -> Result<()> {
    writer.put_i64(item.id);
    writer.put_i32(item.revision);
    writer.put_i64(item.parent_id);
    writer.put_str(&item.remote_id)?;
    writer.put_str(&item.remote_revision)?;
    writer.put_str(&item.gid)?;
    writer.put_i64(item.size);
    writer.put_str(&item.mime_type)?;
    writer.put_timestamp(item.mtime);
    writer.put_byte_list(&item.flags)?;
    write_tags(writer, &item.tags)?;
    writer.put_id_list(&item.virtual_references)?;
    write_ancestors(writer, &item.ancestors)?;
    writer.put_len(item.parts.len())?;
    for part in &item.parts {
        writer.put_bytes(&part.payload_name)?;
        writer.put_bytes(&part.meta_data.name)?;
        writer.put_i64(part.meta_data.size);
        writer.put_i32(part.meta_data.version);
        writer.put_i32(part.meta_data.storage_type.code());
        writer.put_bytes(&part.data)?;
    }
    writer.put_byte_list(&item.cached_parts)
}

fn read_part(reader: &mut WireReader<'_>) -> DecodeResult<ItemPart> {
    Ok(ItemPart {
        payload_name: reader.get_bytes()?,
        meta_data: PartMetaData {
            name: reader.get_bytes()?,
            size: reader.get_i64()?,
            version: reader.get_i32()?,
            storage_type: StorageType::from_code(reader.get_i32()?),
        },
        data: reader.get_bytes()?,
    })
}

fn read_item(reader: &mut WireReader<'_>) -> DecodeResult<ItemRecord> {
    Ok(ItemRecord {
        id: reader.get_i64()?,
        revision: reader.get_i32()?,
        parent_id: reader.get_i64()?,
        remote_id: reader.get_string()?,
        remote_revision: reader.get_string()?,
        gid: reader.get_string()?,
        size: reader.get_i64()?,
        mime_type: reader.get_string()?,
        mtime: reader.get_timestamp()?,
        flags: reader.get_byte_list()?,
        tags: reader.get_list_with(read_tag)?,
        virtual_references: reader.get_id_list()?,
        ancestors: reader.get_list_with(read_ancestor)?,
        parts: reader.get_list_with(read_part)?,
        cached_parts: reader.get_byte_list()?,
    })
}

fn write_collection(writer: &mut WireWriter, collection: &CollectionRecord) -> Result<()> {
    writer.put_i64(collection.id);
    writer.put_i64(collection.parent_id);
    writer.put_str(&collection.name)?;
    writer.put_string_list(&collection.mime_types)?;
    writer.put_str(&collection.remote_id)?;
    writer.put_str(&collection.remote_revision)?;
    writer.put_str(&collection.resource)?;
    writer.put_i64(collection.statistics.count);
    writer.put_i64(collection.statistics.unseen);
    writer.put_i64(collection.statistics.size);
    writer.put_str(&collection.search_query)?;
    writer.put_id_list(&collection.search_collections)?;
    write_ancestors(writer, &collection.ancestors)?;

    let policy = &collection.cache_policy;
    writer.put_bool(policy.inherit);
    writer.put_i32(policy.check_interval);
    writer.put_i32(policy.cache_timeout);
    writer.put_bool(policy.sync_on_demand);
    writer.put_string_list(&policy.local_parts)?;

    writer.put_attributes(&collection.attributes)?;
    writer.put_bool(collection.enabled);
    writer.put_i8(collection.display_pref.code());
    writer.put_i8(collection.sync_pref.code());
    writer.put_i8(collection.index_pref.code());
    writer.put_bool(collection.is_virtual);
    Ok(())
}

fn read_collection(reader: &mut WireReader<'_>) -> DecodeResult<CollectionRecord> {
    Ok(CollectionRecord {
        id: reader.get_i64()?,
        parent_id: reader.get_i64()?,
        name: reader.get_string()?,
        mime_types: reader.get_string_list()?,
        remote_id: reader.get_string()?,
        remote_revision: reader.get_string()?,
        resource: reader.get_string()?,
        statistics: CollectionStatistics {
            count: reader.get_i64()?,
            unseen: reader.get_i64()?,
            size: reader.get_i64()?,
        },
        search_query: reader.get_string()?,
        search_collections: reader.get_id_list()?,
        ancestors: reader.get_list_with(read_ancestor)?,
        cache_policy: CachePolicy {
            inherit: reader.get_bool()?,
            check_interval: reader.get_i32()?,
            cache_timeout: reader.get_i32()?,
            sync_on_demand: reader.get_bool()?,
            local_parts: reader.get_string_list()?,
        },
        attributes: reader.get_attributes()?,
        enabled: reader.get_bool()?,
        display_pref: Tristate::from_code(reader.get_i8()?),
        sync_pref: Tristate::from_code(reader.get_i8()?),
        index_pref: Tristate::from_code(reader.get_i8()?),
        is_virtual: reader.get_bool()?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::Operation;

    fn rich_item_change() -> Notification {
        let tag = TagRecord {
            id: 9,
            parent_id: -1,
            gid: b"important".to_vec(),
            tag_type: b"PLAIN".to_vec(),
            remote_id: b"tag-9".to_vec(),
            attributes: BTreeMap::from([(b"NAME".to_vec(), b"Important".to_vec())]),
        };
        let item = ItemRecord {
            id: 101,
            revision: 3,
            parent_id: 12,
            remote_id: "imap:101".to_string(),
            remote_revision: "r3".to_string(),
            gid: "<msg@example.org>".to_string(),
            size: 2048,
            mime_type: "message/rfc822".to_string(),
            mtime: Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()),
            flags: vec![b"\\SEEN".to_vec()],
            tags: vec![tag.clone()],
            virtual_references: vec![40, 41],
            ancestors: vec![Ancestor {
                id: 12,
                remote_id: "INBOX".to_string(),
                name: "Inbox".to_string(),
                attributes: BTreeMap::new(),
            }],
            parts: vec![ItemPart {
                payload_name: b"PLD:HEAD".to_vec(),
                meta_data: PartMetaData {
                    name: b"PLD:HEAD".to_vec(),
                    size: 5,
                    version: 1,
                    storage_type: StorageType::External,
                },
                data: b"Hello".to_vec(),
            }],
            cached_parts: vec![b"PLD:HEAD".to_vec()],
        };
        let mut ntf = Notification::items(ItemOperation::ModifyTags, vec![item])
            .with_session(b"session-1".to_vec())
            .with_resource("akonadi_imap_0")
            .with_parent(12)
            .with_marker(FETCH_ITEM);
        if let ChangePayload::Item(change) = &mut ntf.payload {
            change.item_parts.insert(b"PLD:HEAD".to_vec());
            change.added_flags.insert(b"\\FLAGGED".to_vec());
            change.added_tags.push(tag);
            change.must_retrieve = true;
        }
        ntf
    }

    fn rich_collection_change() -> Notification {
        let mut collection = CollectionRecord::stub(12, "INBOX");
        collection.parent_id = 2;
        collection.name = "Inbox".to_string();
        collection.mime_types = vec!["message/rfc822".to_string()];
        collection.statistics = CollectionStatistics {
            count: 10,
            unseen: 2,
            size: 4096,
        };
        collection.cache_policy.local_parts = vec!["PLD:ENVELOPE".to_string()];
        collection.sync_pref = Tristate::False;
        collection.is_virtual = true;
        Notification::collection(CollectionOperation::Move, collection)
            .with_resource("akonadi_imap_0")
            .with_parent(2)
            .with_destination(3, "akonadi_maildir_1")
    }

    #[test]
    fn test_current_version_round_trip() {
        let notifications = vec![
            rich_item_change(),
            rich_collection_change(),
            Notification::tag(TagOperation::Modify, TagRecord::stub(4, b"t4".to_vec()))
                .with_resource("akonadi_imap_0")
                .with_marker(FETCH_TAG),
        ];

        let bytes = encode_journal(&notifications).unwrap();
        let decoded = decode_journal(&bytes).unwrap();

        assert_eq!(decoded.header.version, FormatVersion::CURRENT);
        assert_eq!(decoded.header.count, 3);
        assert_eq!(decoded.header.start_offset, 0);
        assert_eq!(decoded.truncated, None);
        assert!(!decoded.needs_full_save());
        assert_eq!(decoded.notifications, notifications);
    }

    #[test]
    fn test_header_word_layout() {
        let bytes = encode_journal(&[rich_collection_change()]).unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 7, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..16], &[0; 8]);
    }

    #[test]
    fn test_start_offset_skips_leading_records() {
        let notifications: Vec<_> = (1..=4)
            .map(|id| Notification::tag(TagOperation::Add, TagRecord::stub(id, Vec::new())))
            .collect();
        let mut bytes = encode_journal(&notifications).unwrap();
        bytes[8..16].copy_from_slice(&2u64.to_be_bytes());

        let decoded = decode_journal(&bytes).unwrap();
        let ids: Vec<_> = decoded
            .notifications
            .iter()
            .flat_map(Notification::entity_ids)
            .collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(decoded.needs_full_save());
    }

    #[test]
    fn test_truncated_tail_keeps_complete_records() {
        let notifications = vec![rich_item_change(), rich_collection_change()];
        let bytes = encode_journal(&notifications).unwrap();
        let cut = &bytes[..bytes.len() - 5];

        let decoded = decode_journal(cut).unwrap();
        assert_eq!(decoded.notifications, vec![rich_item_change()]);
        assert!(matches!(
            decoded.truncated,
            Some(DecodeError::UnexpectedEof { .. })
        ));
        assert!(decoded.needs_full_save());
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let mut writer = WireWriter::new();
        writer.put_u64(1 | (8 << 32));
        writer.put_u64(0);
        let result = decode_journal(&writer.into_bytes());
        assert!(matches!(result, Err(Error::UnsupportedVersion(8))));
    }

    #[test]
    fn test_unversioned_flat_records() {
        let mut writer = WireWriter::new();
        writer.put_u64(2);
        for (uid, op) in [(5_i64, LegacyOperation::Modify), (6, LegacyOperation::Invalid)] {
            writer.put_bytes(b"sess").unwrap();
            writer.put_i32(ITEM_TAG);
            writer.put_i32(op.code());
            writer.put_i64(uid);
            writer.put_str("rid").unwrap();
            writer.put_str("text/plain").unwrap();
            writer.put_str("res").unwrap();
            writer.put_i64(1);
            writer.put_i64(-1);
            writer.put_byte_list(&Vec::<Vec<u8>>::new()).unwrap();
        }

        let decoded = decode_journal(&writer.into_bytes()).unwrap();
        assert_eq!(decoded.header.version, FormatVersion::Unversioned);
        assert_eq!(decoded.discarded, 1);
        assert!(decoded.needs_full_save());
        let ntf = &decoded.notifications[0];
        assert_eq!(ntf.session_id, b"sess".to_vec());
        assert_eq!(ntf.operation(), Operation::Item(ItemOperation::Modify));
        assert!(ntf.has_marker(FETCH_ITEM));
    }

    #[test]
    fn test_relation_before_entity_lists_aborts() {
        let mut writer = WireWriter::new();
        writer.put_u64(header_word(1, FormatVersion::StartOffset));
        writer.put_u64(0);
        writer.put_bytes(b"").unwrap();
        writer.put_i32(RELATION_TAG);

        let decoded = decode_journal(&writer.into_bytes()).unwrap();
        assert!(decoded.notifications.is_empty());
        assert_eq!(decoded.truncated, Some(DecodeError::UnreadableRelation(1)));
    }

    #[test]
    fn test_unknown_type_tag_aborts() {
        let mut writer = WireWriter::new();
        writer.put_u64(header_word(1, FormatVersion::CURRENT));
        writer.put_u64(0);
        writer.put_bytes(b"").unwrap();
        writer.put_i32(17);

        let decoded = decode_journal(&writer.into_bytes()).unwrap();
        assert_eq!(decoded.truncated, Some(DecodeError::UnknownType(17)));
    }

    #[test]
    fn test_dropped_record_forces_full_save() {
        let mut writer = WireWriter::new();
        writer.put_u64(header_word(2, FormatVersion::CURRENT));
        writer.put_u64(0);
        writer.put_bytes(b"").unwrap();
        writer.put_i32(RELATION_TAG);
        writer.put_i32(1);
        writer.put_i64(100);
        writer.put_i64(200);
        writer.put_bytes(b"GENERIC").unwrap();
        writer.put_bytes(b"").unwrap();
        writer.put_str("akonadi_imap_0").unwrap();
        writer.put_byte_list(&Vec::<Vec<u8>>::new()).unwrap();
        let mut bytes = writer.into_bytes();
        let tail = encode_journal(&[rich_collection_change()]).unwrap();
        bytes.extend_from_slice(&tail[16..]);

        let decoded = decode_journal(&bytes).unwrap();
        assert_eq!(decoded.notifications, vec![rich_collection_change()]);
        assert_eq!(decoded.discarded, 1);
        assert!(decoded.needs_full_save());
    }

    #[test]
    fn test_older_version_forces_full_save() {
        let mut writer = WireWriter::new();
        writer.put_u64(header_word(0, FormatVersion::MustRetrieve));
        writer.put_u64(0);
        let decoded = decode_journal(&writer.into_bytes()).unwrap();
        assert_eq!(decoded.discarded, 0);
        assert!(decoded.needs_full_save());
    }

    #[test]
    fn test_empty_input_is_empty_journal() {
        let decoded = decode_journal(&[]).unwrap();
        assert!(decoded.notifications.is_empty());
        assert!(!decoded.needs_full_save());
    }
}
