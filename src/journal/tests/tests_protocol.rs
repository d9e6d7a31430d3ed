//! Entry append / status-flip protocol and the on-disk layout.

#[cfg(test)]
mod tests {
    use crate::journal::{
        Journal, JournalError, STATUS_COMMITTED, STATUS_INCOMPLETE, STATUS_PENDING,
    };
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn fresh_journal_writes_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.entry_count(), 0);

        let raw = fs::read(&path).unwrap();
        assert_eq!(raw.len(), 6);
        assert_eq!(u16::from_le_bytes(raw[0..2].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(raw[2..6].try_into().unwrap()), 0);
    }

    #[test]
    fn begin_appends_pending_entry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");
        let mut journal = Journal::open(&path).unwrap();

        let offset = journal.begin(128, b"record-bytes").unwrap();
        assert_eq!(offset, 6, "first entry starts right after the header");
        assert_eq!(journal.entry_count(), 1);

        let raw = fs::read(&path).unwrap();
        assert_eq!(u32::from_le_bytes(raw[2..6].try_into().unwrap()), 1);
        assert_eq!(raw[6], STATUS_PENDING);
        assert_eq!(u64::from_le_bytes(raw[7..15].try_into().unwrap()), 128);
        assert_eq!(u32::from_le_bytes(raw[15..19].try_into().unwrap()), 12);
        assert_eq!(&raw[19..31], b"record-bytes");
    }

    #[test]
    fn commit_flips_only_the_status_byte() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");
        let mut journal = Journal::open(&path).unwrap();

        let offset = journal.begin(0, b"abc").unwrap();
        let before = fs::read(&path).unwrap();

        journal.commit(offset).unwrap();
        let after = fs::read(&path).unwrap();

        assert_eq!(after[6], STATUS_COMMITTED);
        assert_eq!(before[7..], after[7..], "only the status byte may change");
    }

    #[test]
    fn abandon_marks_entry_incomplete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");
        let mut journal = Journal::open(&path).unwrap();

        let offset = journal.begin(0, b"abc").unwrap();
        journal.abandon(offset).unwrap();

        let raw = fs::read(&path).unwrap();
        assert_eq!(raw[6], STATUS_INCOMPLETE);
    }

    #[test]
    fn entries_accumulate_until_reset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");
        let mut journal = Journal::open(&path).unwrap();

        let a = journal.begin(0, b"first").unwrap();
        let b = journal.begin(100, b"second").unwrap();
        assert!(b > a);
        assert_eq!(journal.entry_count(), 2);

        journal.reset().unwrap();
        assert_eq!(journal.entry_count(), 0);
        assert_eq!(fs::read(&path).unwrap().len(), 6);
    }

    #[test]
    fn reopen_recovers_entry_count() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.begin(0, b"x").unwrap();
            journal.begin(50, b"y").unwrap();
        }

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.entry_count(), 2);
    }

    #[test]
    fn foreign_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("audit.wal.journal");
        let mut raw = vec![0u8; 6];
        raw[0..2].copy_from_slice(&9u16.to_le_bytes());
        fs::write(&path, &raw).unwrap();

        let err = Journal::open(&path).unwrap_err();
        assert!(matches!(err, JournalError::InvalidHeader(_)));
    }
}
