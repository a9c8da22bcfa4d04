#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sombra_records::storage::{
    CounterMetrics, NodeRecord, Record, RecordLoad, RecordStore, NodeRecordFormat, StoreConfig,
    StoreFactory,
};
use sombra_records::types::{Result, StoreError, INTEGER_MINUS_ONE, NULL_REFERENCE};
use tempfile::tempdir;

fn write_live(store: &RecordStore<NodeRecordFormat>, next_rel: i64, next_prop: i64) -> Result<i64> {
    let id = store.next_id()?;
    let mut record = NodeRecord::live(id, next_rel, next_prop);
    store.prepare_for_commit(&mut record)?;
    store.update_record(&record)?;
    Ok(id)
}

fn delete(store: &RecordStore<NodeRecordFormat>, id: i64) -> Result<()> {
    let mut record = store.new_record();
    store.get_record(id, &mut record, RecordLoad::Normal)?;
    record.in_use = false;
    store.update_record(&record)
}

#[test]
fn node_records_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    assert_eq!(store.number_of_reserved_low_ids(), 2);
    let id = write_live(&store, 10, 20)?;
    assert_eq!(id, 2);
    store.close()?;

    let store = factory.open_node_store(false)?;
    let mut record = store.new_record();
    store.get_record(id, &mut record, RecordLoad::Normal)?;
    assert!(record.in_use);
    assert_eq!(record.next_rel, 10);
    assert_eq!(record.next_prop, 20);
    assert_eq!(record.secondary_unit_id, NULL_REFERENCE);
    assert_eq!(store.high_id()?, 3);
    assert_eq!(store.next_id()?, 3);
    store.close()?;
    Ok(())
}

#[test]
fn missing_store_is_not_created_without_permission() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    assert!(matches!(
        factory.open_node_store(false),
        Err(StoreError::StoreNotFound(_))
    ));
    Ok(())
}

#[test]
fn load_modes_treat_deleted_records_differently() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let id = write_live(&store, 7, 8)?;
    delete(&store, id)?;

    let mut record = store.new_record();
    assert!(matches!(
        store.get_record(id, &mut record, RecordLoad::Normal),
        Err(StoreError::InvalidRecord(_))
    ));

    store.get_record(id, &mut record, RecordLoad::Check)?;
    assert!(!record.in_use);
    assert_eq!(record.id, id);
    assert_eq!(record.next_rel, NULL_REFERENCE);

    store.get_record(id, &mut record, RecordLoad::Force)?;
    assert!(!record.in_use);
    assert_eq!(record.next_rel, 7);
    assert_eq!(record.next_prop, 8);

    store.get_record(100_000, &mut record, RecordLoad::Check)?;
    assert!(!record.in_use);
    store.close()?;
    Ok(())
}

#[test]
fn negative_ids_read_as_absent_in_every_mode() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    write_live(&store, 3, 4)?;

    let mut record = store.new_record();
    for id in [-1, -5, i64::MIN] {
        assert!(matches!(
            store.get_record(id, &mut record, RecordLoad::Normal),
            Err(StoreError::InvalidRecord(_))
        ));
        for mode in [RecordLoad::Check, RecordLoad::Force] {
            store.get_record(id, &mut record, mode)?;
            assert_eq!(record.id, id);
            assert!(!record.in_use);
            assert_eq!(record.next_rel, NULL_REFERENCE);
        }
        assert!(!store.is_in_use(id)?);
    }

    let mut records = vec![store.new_record(), store.new_record()];
    assert!(matches!(
        store.get_records_consistent(&[2, -1], &mut records, RecordLoad::Check),
        Err(StoreError::NegativeId(-1))
    ));
    store.close()?;
    Ok(())
}

#[test]
fn invalid_ids_are_rejected_before_any_write() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let high_before = store.high_id()?;
    let pages_before = store.paged_file()?.last_page_id();

    let negative = NodeRecord::live(-5, 1, 1);
    assert!(matches!(
        store.update_record(&negative),
        Err(StoreError::NegativeId(-5))
    ));
    let too_large = NodeRecord::live(1 << 35, 1, 1);
    assert!(matches!(
        store.update_record(&too_large),
        Err(StoreError::IdCapacityExceeded { .. })
    ));
    let reserved = NodeRecord::live(INTEGER_MINUS_ONE, 1, 1);
    assert!(matches!(
        store.update_record(&reserved),
        Err(StoreError::ReservedId(_))
    ));
    let valid = NodeRecord::live(store.next_id()?, 1, 1);
    assert!(store.update_records(&[valid, negative]).is_err());

    assert_eq!(store.high_id()?, high_before + 1);
    assert_eq!(store.paged_file()?.last_page_id(), pages_before);
    assert!(!store.is_in_use(high_before)?);
    store.close()?;
    Ok(())
}

#[test]
fn wide_references_use_a_secondary_unit() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let wide = 1i64 << 33;
    let id = write_live(&store, 3, wide)?;

    let mut record = store.new_record();
    store.get_record(id, &mut record, RecordLoad::Normal)?;
    assert_eq!(record.next_rel, 3);
    assert_eq!(record.next_prop, wide);
    assert!(record.has_secondary_unit_id());
    let unit = record.secondary_unit_id;
    assert!(store.is_in_use(unit)?);

    let mut unit_record = store.new_record();
    store.get_record(unit, &mut unit_record, RecordLoad::Check)?;
    assert!(!unit_record.in_use, "secondary units are not records");

    record.next_prop = 5;
    store.update_record(&record)?;
    store.get_record(id, &mut record, RecordLoad::Normal)?;
    assert_eq!(record.next_prop, 5);
    assert_eq!(record.secondary_unit_id, NULL_REFERENCE);
    assert!(!store.is_in_use(unit)?);
    store.close()?;
    Ok(())
}

#[test]
fn secondary_unit_on_another_page_is_reached_through_a_linked_cursor() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let id = store.next_id()?;
    let far = (store.records_per_page() * 2 + 5) as i64;
    store.set_high_id(far)?;

    let mut record = NodeRecord::live(id, 1 << 40, NULL_REFERENCE);
    store.prepare_for_commit(&mut record)?;
    assert_eq!(record.secondary_unit_id, far);
    store.update_record(&record)?;
    store.close()?;

    let store = factory.open_node_store(false)?;
    let mut read = store.new_record();
    store.get_record(id, &mut read, RecordLoad::Normal)?;
    assert_eq!(read.next_rel, 1 << 40);
    assert_eq!(read.next_prop, NULL_REFERENCE);
    assert_eq!(read.secondary_unit_id, far);
    store.close()?;
    Ok(())
}

#[test]
fn unprepared_secondary_unit_fails_the_write() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let record = NodeRecord::live(store.next_id()?, 1 << 34, 1);
    assert!(matches!(
        store.update_record(&record),
        Err(StoreError::InvalidRecord(_))
    ));
    assert!(!store.is_in_use(record.id)?);
    store.close()?;
    Ok(())
}

#[test]
fn scan_yields_each_live_record_once() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(write_live(&store, n, NULL_REFERENCE)?);
    }
    for id in ids.iter().step_by(3) {
        delete(&store, *id)?;
    }
    let expected: Vec<i64> = ids
        .iter()
        .enumerate()
        .filter(|(index, _)| index % 3 != 0)
        .map(|(_, id)| *id)
        .collect();

    let scanned: Vec<i64> = store
        .records()?
        .map(|record| record.map(|record| record.id))
        .collect::<Result<_>>()?;
    assert_eq!(scanned, expected);

    let mut visited = 0;
    store.scan_all_records(|_| {
        visited += 1;
        Ok(visited < 5)
    })?;
    assert_eq!(visited, 5);
    store.close()?;
    Ok(())
}

#[test]
fn sticky_id_file_is_rebuilt_by_scanning() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig::default().rebuild_idgenerators_fast(false);
    {
        let factory = StoreFactory::new(dir.path(), config.clone())?;
        let store = factory.open_node_store(true)?;
        let ids: Vec<i64> = (0..5)
            .map(|n| write_live(&store, n, NULL_REFERENCE))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        delete(&store, 3)?;
        delete(&store, 5)?;
        store.flush()?;
        // Dropped without closing: the id file stays sticky.
    }

    let metrics = Arc::new(CounterMetrics::default());
    let factory = StoreFactory::new(dir.path(), config)?.with_metrics(metrics.clone());
    let store = factory.open_node_store(false)?;
    assert_eq!(metrics.slow_rebuilds.load(Ordering::Relaxed), 1);
    assert_eq!(store.high_id()?, 7);
    assert_eq!(store.next_id()?, 3);
    assert_eq!(store.next_id()?, 5);
    assert_eq!(store.next_id()?, 7);
    store.close()?;
    Ok(())
}

#[test]
fn fast_rebuild_only_restores_the_high_id() -> Result<()> {
    let dir = tempdir()?;
    {
        let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
        let store = factory.open_node_store(true)?;
        for n in 0..4 {
            write_live(&store, n, NULL_REFERENCE)?;
        }
        delete(&store, 2)?;
        store.flush()?;
    }

    let metrics = Arc::new(CounterMetrics::default());
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?.with_metrics(metrics.clone());
    let store = factory.open_node_store(false)?;
    assert_eq!(metrics.fast_rebuilds.load(Ordering::Relaxed), 1);
    assert_eq!(store.next_id()?, 6);
    store.close()?;
    Ok(())
}

#[test]
fn slow_rebuild_frees_the_last_slot_of_each_page() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let per_page = store.records_per_page() as i64;
    let last_on_first_page = per_page - 1;
    while store.high_id()? <= per_page + 1 {
        write_live(&store, 1, NULL_REFERENCE)?;
    }
    delete(&store, last_on_first_page)?;
    delete(&store, per_page)?;

    store.rebuild_id_generator()?;
    assert_eq!(store.high_id()?, per_page + 2);
    assert_eq!(store.number_of_ids_in_use()?, per_page);
    assert_eq!(store.next_id()?, last_on_first_page);
    assert_eq!(store.next_id()?, per_page);
    store.close()?;
    Ok(())
}

#[test]
fn torn_reads_are_retried_invisibly() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let id = write_live(&store, 11, 12)?;
    store.paged_file()?.inject_torn_reads(3);
    let mut record = store.new_record();
    store.get_record(id, &mut record, RecordLoad::Normal)?;
    assert_eq!(record.next_rel, 11);
    assert!(store.paged_file_stats()?.read_retries >= 3);
    store.close()?;
    Ok(())
}

#[test]
fn records_read_together_must_share_a_page() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    let far = store.records_per_page() as i64 + 3;
    let mut records = vec![store.new_record(), store.new_record()];
    assert!(matches!(
        store.get_records_consistent(&[2, far], &mut records, RecordLoad::Check),
        Err(StoreError::Invalid(_))
    ));
    store.close()?;
    Ok(())
}

#[test]
fn closed_store_rejects_operations() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let store = factory.open_node_store(true)?;
    store.close()?;
    store.close()?;
    assert!(matches!(store.next_id(), Err(StoreError::IllegalState(_))));
    let mut record = store.new_record();
    assert!(matches!(
        store.get_record(2, &mut record, RecordLoad::Check),
        Err(StoreError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn delete_on_close_removes_files() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default().delete_on_close(true))?;
    let store = factory.open_node_store(true)?;
    write_live(&store, 1, 1)?;
    let store_path = store.store_path().to_path_buf();
    let id_path = store.id_path().to_path_buf();
    assert!(store_path.exists());
    store.close()?;
    assert!(!store_path.exists());
    assert!(!id_path.exists());
    Ok(())
}
