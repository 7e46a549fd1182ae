use super::*;
use crate::{MetaInfo, MetaInfoValue, MetaStore, OssError};
use tempfile::TempDir;

fn value(index: u64, start: u64, end: u64, is_last: bool, fid: u64) -> MetaInfoValue {
    MetaInfoValue {
        index,
        start,
        end,
        is_last,
        fid,
        group_id: 3,
    }
}

fn info(path: &str, v: MetaInfoValue) -> MetaInfo {
    MetaInfo {
        path: path.to_string(),
        value: v,
    }
}

#[test]
fn test_store_and_list_fragments_in_order() {
    let store = SqliteMetaStore::in_memory().unwrap();
    // inserted out of order, listed by index
    store
        .store_meta_info(&info("/b/f.bin", value(2, 128, 192, true, 12)))
        .unwrap();
    store
        .store_meta_info(&info("/b/f.bin", value(0, 0, 64, false, 10)))
        .unwrap();
    store
        .store_meta_info(&info("/b/f.bin", value(1, 64, 128, false, 11)))
        .unwrap();

    let values = store.get_file_meta_info("/b/f.bin", false).unwrap();
    assert_eq!(values.len(), 3);
    assert_eq!(
        values.iter().map(|v| v.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(values[2].is_last, true);
    assert_eq!(values[1].fid, 11);
}

#[test]
fn test_fragment_lookup_by_key() {
    let store = SqliteMetaStore::in_memory().unwrap();
    store
        .store_meta_info(&info("/b/g.bin", value(0, 0, 100, true, 77)))
        .unwrap();

    let got = store.get_fragment_meta_info("/b/g.bin", 0, 0, 100).unwrap();
    assert_eq!(got, value(0, 0, 100, true, 77));

    let err = store
        .get_fragment_meta_info("/b/g.bin", 0, 0, 99)
        .unwrap_err();
    assert!(matches!(err, OssError::NotFound(_)));
}

#[test]
fn test_rewrite_same_key_is_a_new_version() {
    let store = SqliteMetaStore::in_memory().unwrap();
    store
        .store_meta_info(&info("/b/h.bin", value(0, 0, 100, false, 5)))
        .unwrap();
    store
        .store_meta_info(&info("/b/h.bin", value(0, 0, 100, true, 6)))
        .unwrap();

    let values = store.get_file_meta_info("/b/h.bin", false).unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].fid, 6);
    assert!(values[0].is_last);
}

#[test]
fn test_soft_delete_and_include_deleted() {
    let store = SqliteMetaStore::in_memory().unwrap();
    store
        .store_meta_info(&info("/b/i.bin", value(0, 0, 100, true, 9)))
        .unwrap();
    store.delete_file_meta_info("/b/i.bin").unwrap();

    let err = store.get_file_meta_info("/b/i.bin", false).unwrap_err();
    assert!(matches!(err, OssError::NotFound(_)));
    let values = store.get_file_meta_info("/b/i.bin", true).unwrap();
    assert_eq!(values.len(), 1);

    // deleting again reports not found
    let err = store.delete_file_meta_info("/b/i.bin").unwrap_err();
    assert!(matches!(err, OssError::NotFound(_)));

    // a rewrite resurrects the path
    store
        .store_meta_info(&info("/b/i.bin", value(0, 0, 100, true, 15)))
        .unwrap();
    let values = store.get_file_meta_info("/b/i.bin", false).unwrap();
    assert_eq!(values[0].fid, 15);
}

#[test]
fn test_on_disk_store_reopens() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("meta.db");
    {
        let store = SqliteMetaStore::new(&db_path).unwrap();
        store
            .store_meta_info(&info("/b/j.bin", value(0, 0, 10, true, 1)))
            .unwrap();
    }
    let store = SqliteMetaStore::new(&db_path).unwrap();
    let values = store.get_file_meta_info("/b/j.bin", false).unwrap();
    assert_eq!(values.len(), 1);
}
