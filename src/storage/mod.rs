pub mod journal;

pub use journal::{FileJournal, Journal, JournalEntry, JournalError, MemoryJournal, RecoveredState};
