//! Durable journal of pending notifications
//!
//! [`codec`] turns notification sequences into bytes and back across every
//! supported format version. [`store`] owns the journal file.

pub mod codec;
pub mod store;
pub mod wire;

pub use codec::{
    decode_journal, encode_journal, DecodedJournal, FormatVersion, JournalHeader,
    SUPPORTED_VERSION_RANGE,
};
pub use store::{
    inspect_journal, journal_path_for, read_journal, JournalInfo, JournalStore, LoadedJournal,
};
