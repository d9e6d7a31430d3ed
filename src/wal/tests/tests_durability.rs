//! Durability modes and the torn-write guarantee.

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::{event, init_tracing, message_of};
    use crate::wal::{SyncMode, Wal, WalOptions};
    use std::fs::OpenOptions;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn batch_mode_survives_reopen() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        {
            let options = WalOptions {
                sync_mode: SyncMode::Batch(10),
                ..WalOptions::default()
            };
            let wal = Wal::open(&base, options).unwrap();
            // 25 appends: two full batches synced, 5 writes pending.
            for i in 0..25 {
                wal.append(&event(&format!("e{i}"))).unwrap();
            }
            wal.close().unwrap();
        }

        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 25);
    }

    #[test]
    fn interval_mode_relies_on_the_journal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        {
            let options = WalOptions {
                sync_mode: SyncMode::Interval(Duration::from_millis(50)),
                ..WalOptions::default()
            };
            let wal = Wal::open(&base, options).unwrap();
            for i in 0..10 {
                wal.append(&event(&format!("e{i}"))).unwrap();
            }
            // Dropped without close: the flush thread may not have run,
            // but every record has a COMMITTED journal entry.
        }

        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(message_of(&records[9].payload), "e9");
    }

    #[test]
    fn torn_main_tail_is_restored_from_the_journal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        {
            let wal = Wal::open(&base, WalOptions::default()).unwrap();
            wal.append(&event("first")).unwrap();
            wal.append(&event("second")).unwrap();
            // No close: journal entries for both records remain.
        }

        // Tear the last record: cut the main file mid-way through it.
        let len = std::fs::metadata(&base).unwrap().len();
        let file = OpenOptions::new().write(true).open(&base).unwrap();
        file.set_len(len - 17).unwrap();
        file.sync_all().unwrap();

        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2, "torn record must be restored");
        assert_eq!(message_of(&records[1].payload), "second");

        let report = wal.verify_integrity().unwrap();
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn garbage_tail_is_discarded_on_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        {
            let wal = Wal::open(&base, WalOptions::default()).unwrap();
            wal.append(&event("kept")).unwrap();
            wal.close().unwrap();
        }

        // A clean close reset nothing — the journal still lists the
        // record, so replay verifies it. Now smear garbage after it
        // that no journal entry covers.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&base).unwrap();
            file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11]).unwrap();
            file.sync_all().unwrap();
        }

        let wal = Wal::open(&base, WalOptions::default()).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
        assert_eq!(wal.sequence().unwrap(), 1);

        // Appending after the cleanup keeps the log valid.
        wal.append(&event("appended")).unwrap();
        let report = wal.verify_integrity().unwrap();
        assert!(report.valid, "errors: {:?}", report.errors);
        assert_eq!(report.total_records, 2);
    }

    #[test]
    fn failure_callback_fires_on_durability_errors() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("audit.wal");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        let options = WalOptions {
            failure_callback: Some(Arc::new(move |_err| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            })),
            ..WalOptions::default()
        };

        let wal = Wal::open(&base, options).unwrap();
        // A healthy append must not fire the callback.
        wal.append(&event("fine")).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
