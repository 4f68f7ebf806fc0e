//! # Engine End-to-End Tests
//!
//! Exercises the full write path (bucket creation, puts, spill, commit)
//! and the read path (cursor descent over committed pages) through the
//! public API, including the on-disk layout of a freshly initialized
//! file and persistence across close/reopen cycles.

use cairndb::storage::{Meta, PageHeader, META_SIZE, PAGE_HEADER_SIZE};
use cairndb::{Db, Error};
use tempfile::tempdir;

mod fresh_file_tests {
    use super::*;

    #[test]
    fn open_of_missing_path_initializes_four_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let db = Db::open(&path).unwrap();
        let page_size = db.page_size() as usize;
        drop(db);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4 * page_size, "file SHOULD hold the four reserved pages");

        let meta0 = Meta::read_from_page(&bytes[..page_size]);
        let meta1 = Meta::read_from_page(&bytes[page_size..2 * page_size]);
        assert!(meta0.validate());
        assert!(meta1.validate());
        assert_eq!(meta0.txid(), 0);
        assert_eq!(meta1.txid(), 1);
        assert_eq!(meta0.page_size(), page_size as u64);
        assert_eq!(meta0.freelist(), 2);
        assert_eq!(meta0.buckets(), 3);
        assert_eq!(meta0.watermark(), 4);

        let freelist = PageHeader::from_bytes(&bytes[2 * page_size..3 * page_size]);
        assert!(freelist.is_freelist());
        assert_eq!(freelist.count(), 0);

        let buckets = PageHeader::from_bytes(&bytes[3 * page_size..4 * page_size]);
        assert!(buckets.is_bucket_index());
        assert_eq!(buckets.count(), 0);
    }

    #[test]
    fn reopen_of_fresh_file_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.db");

        {
            let _db = Db::open(&path).unwrap();
        }
        let db = Db::open(&path).unwrap();

        let tx = db.begin(false).unwrap();
        assert_eq!(tx.id(), 1);
    }
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn single_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("kv.db")).unwrap();

        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.bucket_mut("b").unwrap().put(b"key1", b"val1").unwrap();
        tx.commit().unwrap();

        let tx = db.begin(false).unwrap();
        let b = tx.bucket("b").unwrap();
        assert_eq!(b.get(b"key1").unwrap().as_deref(), Some(&b"val1"[..]));
        assert_eq!(b.get(b"key2").unwrap(), None);
    }

    #[test]
    fn committed_root_is_a_single_leaf_page() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("leaf.db")).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?;
            tx.bucket_mut("b")?.put(b"key1", b"val1")
        })
        .unwrap();

        let rendering = db.debug_bucket_pages("b").unwrap();
        assert!(rendering.starts_with("LeafPage"), "got: {}", rendering);
        assert!(rendering.contains("key1"));
        assert!(!rendering.contains("BranchPage"));
    }

    #[test]
    fn put_overwrites_existing_value() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("ow.db")).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?;
            tx.bucket_mut("b")?.put(b"k", b"first")
        })
        .unwrap();
        db.update(|tx| tx.bucket_mut("b")?.put(b"k", b"second"))
            .unwrap();

        db.view(|tx| {
            assert_eq!(
                tx.bucket("b")?.get(b"k")?.as_deref(),
                Some(&b"second"[..])
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn uncommitted_writes_are_visible_inside_their_own_tx() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("self.db")).unwrap();

        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        let mut b = tx.bucket_mut("b").unwrap();
        b.put(b"k", b"v").unwrap();
        assert_eq!(b.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        tx.rollback().unwrap();

        db.view(|tx| {
            assert!(matches!(tx.bucket("b"), Err(Error::BucketNotFound(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_removes_a_committed_key() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("del.db")).unwrap();

        db.update(|tx| {
            tx.create_bucket("b")?;
            let mut b = tx.bucket_mut("b")?;
            b.put(b"keep", b"1")?;
            b.put(b"drop", b"2")
        })
        .unwrap();
        db.update(|tx| {
            let mut b = tx.bucket_mut("b")?;
            assert!(b.delete(b"drop")?);
            assert!(!b.delete(b"never-there")?);
            Ok(())
        })
        .unwrap();

        db.view(|tx| {
            let b = tx.bucket("b")?;
            assert_eq!(b.get(b"keep")?.as_deref(), Some(&b"1"[..]));
            assert_eq!(b.get(b"drop")?, None);
            Ok(())
        })
        .unwrap();
    }
}

mod persistence_tests {
    use super::*;

    #[test]
    fn two_hundred_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let db = Db::open(&path).unwrap();
            db.update(|tx| {
                tx.create_bucket("b")?;
                let mut b = tx.bucket_mut("b")?;
                for i in 0..200 {
                    let key = format!("key{:05}", i);
                    let value = format!("val{:05}", i);
                    b.put(key.as_bytes(), value.as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
            db.close();
        }

        let db = Db::open(&path).unwrap();
        db.view(|tx| {
            let b = tx.bucket("b")?;
            for i in 0..200 {
                let key = format!("key{:05}", i);
                let expected = format!("val{:05}", i);
                let got = b.get(key.as_bytes())?;
                assert_eq!(
                    got.as_deref(),
                    Some(expected.as_bytes()),
                    "key {} SHOULD survive reopen",
                    key
                );
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn iterative_insertion_of_two_thousand_keys() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("iter.db")).unwrap();

        db.update(|tx| tx.create_bucket("b")).unwrap();

        for i in 0..2000 {
            let key = format!("key{}", i);
            let value = format!("val{}", i);

            db.update(|tx| tx.bucket_mut("b")?.put(key.as_bytes(), value.as_bytes()))
                .unwrap();

            db.view(|tx| {
                let got = tx.bucket("b")?.get(key.as_bytes())?;
                assert_eq!(
                    got.as_deref(),
                    Some(value.as_bytes()),
                    "key {} SHOULD be readable right after its commit",
                    key
                );
                Ok(())
            })
            .unwrap();
        }

        // Spot-check older keys after two thousand spills and meta swings.
        db.view(|tx| {
            let b = tx.bucket("b")?;
            for i in [0, 1, 999, 1998] {
                let key = format!("key{}", i);
                let value = format!("val{}", i);
                assert_eq!(b.get(key.as_bytes())?.as_deref(), Some(value.as_bytes()));
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn multi_page_tree_has_branch_root() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("split.db")).unwrap();
        let page_size = db.page_size();

        // Enough payload to force at least one split at commit.
        let value = vec![0x78u8; (page_size / 8) as usize];
        db.update(|tx| {
            tx.create_bucket("b")?;
            let mut b = tx.bucket_mut("b")?;
            for i in 0..32 {
                b.put(format!("key{:03}", i).as_bytes(), &value)?;
            }
            Ok(())
        })
        .unwrap();

        let rendering = db.debug_bucket_pages("b").unwrap();
        assert!(
            rendering.starts_with("BranchPage"),
            "a spilled multi-page tree SHOULD hang off a branch root"
        );
        assert!(rendering.contains("LeafPage"));
    }
}

mod api_error_tests {
    use super::*;

    #[test]
    fn create_bucket_rejects_duplicates_and_empty_names() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("err.db")).unwrap();

        db.update(|tx| tx.create_bucket("b")).unwrap();

        let mut tx = db.begin(true).unwrap();
        assert!(matches!(
            tx.create_bucket("b"),
            Err(Error::BucketExists(_))
        ));
        assert!(matches!(tx.create_bucket(""), Err(Error::BucketNameEmpty)));
        tx.rollback().unwrap();
    }

    #[test]
    fn write_operations_fail_on_read_only_tx() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("ro.db")).unwrap();
        db.update(|tx| tx.create_bucket("b")).unwrap();

        let mut tx = db.begin(false).unwrap();
        assert!(matches!(tx.create_bucket("x"), Err(Error::NotWritable)));
        assert!(matches!(tx.bucket_mut("b"), Err(Error::NotWritable)));
    }

    #[test]
    fn missing_bucket_is_reported() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("miss.db")).unwrap();

        db.view(|tx| {
            assert!(matches!(tx.bucket("ghost"), Err(Error::BucketNotFound(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn put_rejects_empty_key_and_oversized_value() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("val.db")).unwrap();
        let too_big = vec![0u8; (db.page_size() / 4) as usize + 1];

        db.update(|tx| {
            tx.create_bucket("b")?;
            let mut b = tx.bucket_mut("b")?;
            assert!(matches!(b.put(b"", b"v"), Err(Error::KeyEmpty)));
            assert!(matches!(
                b.put(b"k", &too_big),
                Err(Error::ValueTooLarge { .. })
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn value_at_the_quarter_page_limit_is_accepted() {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("limit.db")).unwrap();
        let max = vec![0x42u8; (db.page_size() / 4) as usize];

        db.update(|tx| {
            tx.create_bucket("b")?;
            tx.bucket_mut("b")?.put(b"k", &max)
        })
        .unwrap();

        db.view(|tx| {
            assert_eq!(tx.bucket("b")?.get(b"k")?.as_deref(), Some(max.as_slice()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn second_process_style_open_is_rejected_while_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let _db = Db::open(&path).unwrap();

        let second = Db::open(&path);

        assert!(matches!(second, Err(Error::Io { .. })));
    }

    #[test]
    fn unused_page_header_word_is_zero_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zero.db");
        {
            let db = Db::open(&path).unwrap();
            db.update(|tx| {
                tx.create_bucket("b")?;
                tx.bucket_mut("b")?.put(b"k", b"v")
            })
            .unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let page_size = {
            let meta = Meta::read_from_page(&bytes[..PAGE_HEADER_SIZE + META_SIZE]);
            meta.page_size() as usize
        };
        for page in bytes.chunks(page_size) {
            assert_eq!(&page[32..40], &[0u8; 8], "reserved header word SHOULD be 0");
        }
    }
}
