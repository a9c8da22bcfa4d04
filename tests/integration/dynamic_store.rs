#![allow(missing_docs)]

use proptest::prelude::*;
use sombra_records::primitives::pager::PageLock;
use sombra_records::storage::{
    DynamicRecord, RecordLoad, StoreConfig, StoreFactory, ValueKind, BLOCK_HEADER_SIZE,
};
use sombra_records::types::{Result, StoreError, NULL_REFERENCE};
use tempfile::tempdir;

fn small_blocks() -> StoreConfig {
    StoreConfig::default().string_block_size(16).array_block_size(16)
}

#[test]
fn strings_span_chained_blocks() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    assert_eq!(store.data_block_size(), 16);
    assert_eq!(store.store().record_size(), 16 + BLOCK_HEADER_SIZE);

    let text = "hello world".repeat(10);
    let start = store.write_string(&text)?;
    let read = store.get_records(start, RecordLoad::Normal)?;
    assert!(read.satisfied);
    assert_eq!(read.records.len(), 8);
    assert!(read.records[0].start_record);
    assert!(read.records[1..].iter().all(|record| !record.start_record));
    assert_eq!(read.records.last().map(|r| r.next_block), Some(NULL_REFERENCE));
    assert_eq!(store.read_string(start)?, text);
    store.close()?;

    let store = factory.open_string_store(false)?;
    assert_eq!(store.read_string(start)?, text);
    store.close()?;
    Ok(())
}

#[test]
fn force_follows_deleted_chains() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let text = "x".repeat(40);
    let start = store.write_string(&text)?;
    let live = store.get_records(start, RecordLoad::Normal)?.records;
    assert_eq!(store.delete_value(start)?, live.len());

    let normal = store.get_records(start, RecordLoad::Normal)?;
    assert!(normal.records.is_empty());
    assert!(!normal.satisfied);

    let forced = store.get_records(start, RecordLoad::Force)?;
    assert!(forced.satisfied);
    assert_eq!(forced.records.len(), live.len());
    for (stale, original) in forced.records.iter().zip(&live) {
        assert!(!stale.in_use);
        assert_eq!(stale.id, original.id);
        assert_eq!(stale.data, original.data);
        assert_eq!(stale.next_block, original.next_block);
    }
    assert!(matches!(
        store.read_string(start),
        Err(StoreError::InvalidRecord(_))
    ));
    store.close()?;
    Ok(())
}

#[test]
fn normal_reads_stop_at_a_broken_link() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let start = store.write_string(&"y".repeat(60))?;
    let records = store.get_records(start, RecordLoad::Normal)?.records;
    assert!(records.len() > 3);

    let mut middle = records[2].clone();
    middle.in_use = false;
    store.store().update_record(&middle)?;

    let read = store.get_records(start, RecordLoad::Normal)?;
    assert_eq!(read.records.len(), 2);
    assert!(!read.satisfied);
    assert!(matches!(
        store.read_value(start),
        Err(StoreError::InvalidRecord(_))
    ));

    let forced = store.get_records(start, RecordLoad::Force)?;
    assert_eq!(forced.records.len(), records.len());
    assert!(forced.satisfied);
    store.close()?;
    Ok(())
}

#[test]
fn cyclic_chains_are_reported() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let first = store.store().next_id()?;
    let second = store.store().next_id()?;
    let records = [
        DynamicRecord {
            id: first,
            in_use: true,
            start_record: true,
            created: true,
            data: vec![1, 2],
            next_block: second,
        },
        DynamicRecord {
            id: second,
            in_use: true,
            start_record: false,
            created: true,
            data: vec![3],
            next_block: first,
        },
    ];
    store.store().update_records(&records)?;

    let mut chain = store.chain(first, RecordLoad::Normal)?;
    assert_eq!(chain.next().transpose()?.map(|r| r.id), Some(first));
    assert_eq!(chain.next().transpose()?.map(|r| r.id), Some(second));
    assert!(matches!(chain.next(), Some(Err(StoreError::Consistency(_)))));
    assert!(chain.next().is_none());
    assert!(!chain.is_satisfied());
    store.close()?;
    Ok(())
}

#[test]
fn block_size_comes_from_the_store_header() -> Result<()> {
    let dir = tempdir()?;
    {
        let factory = StoreFactory::new(dir.path(), small_blocks())?;
        factory.open_string_store(true)?.close()?;
    }
    let factory = StoreFactory::new(dir.path(), StoreConfig::default().string_block_size(64))?;
    let store = factory.open_string_store(false)?;
    assert_eq!(store.data_block_size(), 16);
    store.close()?;
    Ok(())
}

#[test]
fn oversized_block_data_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let id = store.store().next_id()?;
    let record = DynamicRecord {
        id,
        in_use: true,
        start_record: true,
        created: true,
        data: vec![0xAB; 17],
        next_block: NULL_REFERENCE,
    };
    assert!(matches!(
        store.store().update_record(&record),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(!store.store().is_in_use(id)?);
    store.close()?;
    Ok(())
}

#[test]
fn value_kinds_are_preserved() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_array_store(true)?;
    let start = store.write_value(ValueKind::Array, &[9, 8, 7])?;
    let value = store.read_value(start)?;
    assert_eq!(value.kind, ValueKind::Array);
    assert_eq!(value.bytes, vec![9, 8, 7]);
    assert!(matches!(
        store.read_string(start),
        Err(StoreError::InvalidRecord(_))
    ));

    let empty = store.write_value(ValueKind::String, &[])?;
    assert_eq!(store.read_string(empty)?, "");
    assert_eq!(store.get_records(empty, RecordLoad::Normal)?.records.len(), 1);
    store.close()?;
    Ok(())
}

#[test]
fn freed_blocks_are_reused() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let first = store.write_string("short")?;
    store.delete_value(first)?;
    let second = store.write_string("again")?;
    assert_eq!(second, first);
    assert_eq!(store.read_string(second)?, "again");
    store.close()?;
    Ok(())
}

#[test]
fn undecodable_blocks_only_fail_normal_reads() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let start = store.write_string(&"z".repeat(40))?;
    let layout = store.store().layout();
    {
        let file = store.store().paged_file()?;
        let mut cursor = file.io(layout.page_id_for(start), PageLock::Write)?;
        assert!(cursor.next()?);
        cursor.set_offset(layout.offset_for(start) + 1);
        cursor.put_u24(9999);
    }

    let mut record = store.store().new_record();
    assert!(matches!(
        store.store().get_record(start, &mut record, RecordLoad::Normal),
        Err(StoreError::InvalidRecord(_))
    ));
    store.store().get_record(start, &mut record, RecordLoad::Check)?;
    assert!(record.in_use);
    store.store().get_record(start, &mut record, RecordLoad::Force)?;
    assert!(record.in_use);

    assert!(matches!(
        store.get_records(start, RecordLoad::Normal),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(matches!(
        store.read_string(start),
        Err(StoreError::InvalidRecord(_))
    ));
    let checked = store.get_records(start, RecordLoad::Check)?;
    assert_eq!(checked.records.len(), 3);
    assert!(checked.satisfied);
    store.close()?;
    Ok(())
}

#[test]
fn forced_walk_from_a_never_written_slot_stops_there() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let start = store.write_string(&"w".repeat(40))?;
    let blank = start + 20;
    assert_eq!(
        store.store().layout().page_id_for(blank),
        store.store().layout().page_id_for(start)
    );

    let forced = store.get_records(blank, RecordLoad::Force)?;
    assert_eq!(forced.records.len(), 1);
    assert_eq!(forced.records[0].id, blank);
    assert!(!forced.records[0].in_use);
    assert_eq!(forced.records[0].next_block, NULL_REFERENCE);
    assert!(forced
        .records
        .iter()
        .all(|record| record.id >= store.store().number_of_reserved_low_ids()));
    store.close()?;
    Ok(())
}

#[test]
fn links_into_reserved_ids_break_the_chain() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let id = store.store().next_id()?;
    store.store().update_record(&DynamicRecord {
        id,
        in_use: true,
        start_record: true,
        created: true,
        data: vec![ValueKind::Bytes as u8, 0, 0, 0, 0],
        next_block: 0,
    })?;

    for mode in [RecordLoad::Normal, RecordLoad::Force] {
        let read = store.get_records(id, mode)?;
        assert_eq!(read.records.len(), 1);
        assert!(!read.satisfied);
    }
    assert!(matches!(
        store.read_value(id),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(store.get_records(0, RecordLoad::Force)?.records.is_empty());
    store.close()?;
    Ok(())
}

#[test]
fn rejected_batch_keeps_the_ids_of_blocks_already_written() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let start = store.write_string("short")?;
    let mut deleted = store.get_records(start, RecordLoad::Normal)?.records.remove(0);
    deleted.in_use = false;
    let oversized = DynamicRecord {
        id: store.store().next_id()?,
        in_use: true,
        start_record: true,
        created: true,
        data: vec![0xCD; 17],
        next_block: NULL_REFERENCE,
    };

    assert!(matches!(
        store.store().update_records(&[deleted, oversized]),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(!store.store().is_in_use(start)?);
    assert_eq!(store.store().next_id()?, start);
    store.close()?;
    Ok(())
}

#[test]
fn forced_walks_follow_blocks_reused_in_the_same_session() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), small_blocks())?;
    let store = factory.open_string_store(true)?;
    let first = store.write_string(&"a".repeat(40))?;
    let old_ids: Vec<i64> = store
        .get_records(first, RecordLoad::Normal)?
        .records
        .iter()
        .map(|record| record.id)
        .collect();
    let high_id = store.store().high_id()?;
    store.delete_value(first)?;
    let second = store.write_string(&"b".repeat(40))?;
    assert_eq!(store.store().high_id()?, high_id);
    assert!(old_ids.contains(&second));

    let forced = store.get_records(first, RecordLoad::Force)?;
    assert!(forced.satisfied);
    assert!(!forced.records.is_empty());
    for record in &forced.records {
        assert!(record.in_use);
        assert!(old_ids.contains(&record.id));
    }
    assert_eq!(store.read_string(second)?, "b".repeat(40));
    store.close()?;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn values_of_any_length_read_back(
        block in 1u32..40,
        bytes in proptest::collection::vec(any::<u8>(), 0..300),
    ) {
        let dir = tempdir().unwrap();
        let factory =
            StoreFactory::new(dir.path(), StoreConfig::default().string_block_size(block)).unwrap();
        let store = factory.open_string_store(true).unwrap();
        let start = store.write_value(ValueKind::Bytes, &bytes).unwrap();
        let read = store.get_records(start, RecordLoad::Normal).unwrap();
        let expected_blocks = (bytes.len() + 5).div_ceil(block as usize);
        prop_assert_eq!(read.records.len(), expected_blocks);
        let value = store.read_value(start).unwrap();
        prop_assert_eq!(value.bytes, bytes);
        store.close().unwrap();
    }
}
