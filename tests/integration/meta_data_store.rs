#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sombra_records::storage::meta::{
    BASE_TX_CHECKSUM, BASE_TX_ID, BASE_TX_LOG_BYTE_OFFSET, BASE_TX_LOG_VERSION,
};
use sombra_records::storage::{
    version_long_to_string, MetaDataStore, Position, StoreConfig, StoreFactory, TransactionId,
    ALL_STORES_VERSION, META_DATA_STORE_NAME,
};
use sombra_records::types::{Result, StoreError, NULL_REFERENCE};
use tempfile::tempdir;

#[test]
fn new_store_gets_default_fields() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = factory.open_meta_data_store(true)?;
    assert!(meta.creation_time()? > 0);
    assert!(meta.random_number()? >= 0);
    assert_eq!(meta.current_log_version()?, BASE_TX_LOG_VERSION);
    assert_eq!(version_long_to_string(meta.store_version()?)?, ALL_STORES_VERSION);
    assert_eq!(meta.graph_next_prop()?, NULL_REFERENCE);
    assert_eq!(
        meta.last_committed_transaction()?,
        TransactionId {
            id: BASE_TX_ID,
            checksum: BASE_TX_CHECKSUM
        }
    );
    let closed = meta.last_closed_transaction()?;
    assert_eq!(closed.id, BASE_TX_ID);
    assert_eq!(closed.log_position.log_version, BASE_TX_LOG_VERSION);
    assert_eq!(closed.log_position.byte_offset, BASE_TX_LOG_BYTE_OFFSET);
    assert!(meta.closed_transaction_id_is_on_par_with_opened_transaction_id()?);
    assert_eq!(meta.scan_all_records()?.len(), Position::ALL.len());
    meta.close()?;
    Ok(())
}

#[test]
fn fields_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = factory.open_meta_data_store(true)?;
    let store_id = meta.store_id()?;
    meta.set_current_log_version(7)?;
    assert_eq!(meta.increment_and_get_version()?, 8);
    meta.set_upgrade_transaction(42, 4242, 99)?;
    meta.set_latest_constraint_introducing_tx(17)?;
    meta.close()?;

    let meta = factory.open_meta_data_store(false)?;
    assert_eq!(meta.store_id()?.random_number, store_id.random_number);
    assert_eq!(meta.current_log_version()?, 8);
    assert_eq!(
        meta.upgrade_transaction()?,
        TransactionId {
            id: 42,
            checksum: 4242
        }
    );
    assert_eq!(meta.upgrade_time()?, 99);
    assert_eq!(meta.latest_constraint_introducing_tx()?, 17);
    assert_eq!(
        meta.read_field_pair_from_file(Position::UpgradeTransactionId)?,
        (42, 4242)
    );
    meta.close()?;
    Ok(())
}

#[test]
fn fields_spanning_several_pages_load_page_by_page() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig::default().page_size(128);
    let factory = StoreFactory::new(dir.path(), config.clone())?;
    let meta = factory.open_meta_data_store(true)?;
    assert!(meta.store().records_per_page() < Position::ALL.len() + 3);
    assert_eq!(meta.current_log_version()?, BASE_TX_LOG_VERSION);
    assert_eq!(meta.graph_next_prop()?, NULL_REFERENCE);
    meta.set_current_log_version(5)?;
    meta.transaction_committed(BASE_TX_ID + 1, 22)?;
    assert_eq!(meta.read_field_pair_from_file(Position::LastTransactionId)?, (2, 22));
    meta.set_last_committed_and_closed_transaction_id(9, 99, 5, 700)?;
    assert_eq!(meta.scan_all_records()?.len(), Position::ALL.len());
    meta.close()?;

    let factory = StoreFactory::new(dir.path(), config)?;
    let meta = factory.open_meta_data_store(false)?;
    assert_eq!(meta.current_log_version()?, 5);
    assert_eq!(
        meta.last_committed_transaction()?,
        TransactionId {
            id: 9,
            checksum: 99
        }
    );
    assert_eq!(
        meta.read_field_pair_from_file(Position::LastClosedTransactionLogVersion)?,
        (5, 700)
    );
    meta.close()?;
    Ok(())
}

#[test]
fn pages_that_split_a_paired_field_are_rejected_at_open() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default().page_size(64))?;
    assert!(matches!(
        factory.open_meta_data_store(true),
        Err(StoreError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn committed_transactions_advance_over_gap_free_prefixes() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = factory.open_meta_data_store(true)?;
    let ids: Vec<i64> = (0..3)
        .map(|_| meta.next_committing_transaction_id())
        .collect::<Result<_>>()?;
    assert_eq!(ids, vec![2, 3, 4]);

    meta.transaction_committed(3, 33)?;
    assert_eq!(meta.last_committed_transaction_id()?, BASE_TX_ID);
    meta.transaction_committed(2, 22)?;
    assert_eq!(
        meta.last_committed_transaction()?,
        TransactionId { id: 3, checksum: 33 }
    );
    assert_eq!(
        meta.read_field_pair_from_file(Position::LastTransactionId)?,
        (3, 33)
    );
    meta.transaction_committed(4, 44)?;
    assert_eq!(meta.last_committed_transaction_id()?, 4);

    meta.transaction_closed(2, 0, 100)?;
    meta.transaction_closed(4, 0, 300)?;
    assert!(!meta.closed_transaction_id_is_on_par_with_opened_transaction_id()?);
    meta.transaction_closed(3, 0, 200)?;
    assert!(meta.closed_transaction_id_is_on_par_with_opened_transaction_id()?);
    let closed = meta.last_closed_transaction()?;
    assert_eq!(closed.id, 4);
    assert_eq!(closed.log_position.byte_offset, 300);
    assert!(meta.await_closed_transaction_id(4, Duration::from_millis(10))?);
    meta.close()?;

    let meta = factory.open_meta_data_store(false)?;
    assert_eq!(meta.last_committed_transaction_id()?, 4);
    assert_eq!(meta.next_committing_transaction_id()?, 5);
    assert_eq!(meta.last_closed_transaction()?.log_position.byte_offset, 300);
    meta.close()?;
    Ok(())
}

#[test]
fn recovery_resets_every_transaction_counter() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = factory.open_meta_data_store(true)?;
    meta.set_last_committed_and_closed_transaction_id(10, 1010, 2, 500)?;
    assert_eq!(meta.next_committing_transaction_id()?, 11);
    assert_eq!(meta.last_committed_transaction()?.checksum, 1010);
    assert_eq!(meta.last_closed_transaction_id()?, 10);
    assert_eq!(
        meta.read_field_pair_from_file(Position::LastClosedTransactionLogVersion)?,
        (2, 500)
    );
    meta.close()?;
    Ok(())
}

#[test]
fn closed_store_rejects_field_access() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = factory.open_meta_data_store(true)?;
    meta.close()?;
    meta.close()?;
    assert!(matches!(meta.creation_time(), Err(StoreError::IllegalState(_))));
    assert!(matches!(
        meta.transaction_committed(2, 2),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(
        meta.next_committing_transaction_id(),
        Err(StoreError::IllegalState(_))
    ));
    Ok(())
}

#[test]
fn tooling_reads_and_writes_fields_of_a_closed_store() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    factory.open_meta_data_store(true)?.close()?;
    let path = factory.store_path(META_DATA_STORE_NAME);

    let cache = factory.page_cache();
    assert_eq!(MetaDataStore::get_record(cache, &path, Position::LogVersion)?, 0);
    assert_eq!(MetaDataStore::set_record(cache, &path, Position::LogVersion, 12)?, 0);
    assert_eq!(MetaDataStore::get_record(cache, &path, Position::LogVersion)?, 12);

    let meta = factory.open_meta_data_store(false)?;
    assert_eq!(meta.current_log_version()?, 12);
    meta.close()?;

    let missing = dir.path().join("absent");
    assert!(matches!(
        MetaDataStore::get_record(cache, &missing, Position::Time),
        Err(StoreError::StoreNotFound(_))
    ));
    Ok(())
}

#[test]
fn paired_fields_never_tear_under_racing_readers() -> Result<()> {
    let dir = tempdir()?;
    let factory = StoreFactory::new(dir.path(), StoreConfig::default())?;
    let meta = Arc::new(factory.open_meta_data_store(true)?);
    meta.set_upgrade_transaction(0, 0, 0)?;
    meta.store().paged_file()?.inject_torn_reads(64);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let meta = Arc::clone(&meta);
            let done = Arc::clone(&done);
            thread::spawn(move || -> Result<u64> {
                let mut reads = 0;
                loop {
                    let (id, checksum) =
                        meta.read_field_pair_from_file(Position::UpgradeTransactionId)?;
                    assert_eq!(id, checksum, "torn pair read");
                    let cached = meta.upgrade_transaction()?;
                    assert_eq!(cached.id, cached.checksum, "torn cached pair");
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        return Ok(reads);
                    }
                }
            })
        })
        .collect();

    for n in 1..=2_000 {
        meta.set_upgrade_transaction(n, n, n)?;
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        let reads = reader.join().expect("reader thread panicked")?;
        assert!(reads > 0);
    }
    assert!(meta.store().paged_file_stats()?.read_retries >= 64);
    assert_eq!(
        meta.read_field_pair_from_file(Position::UpgradeTransactionId)?,
        (2_000, 2_000)
    );
    meta.close()?;
    Ok(())
}
