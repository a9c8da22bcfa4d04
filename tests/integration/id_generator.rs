#![allow(missing_docs)]

use std::path::Path;

use proptest::prelude::*;
use sombra_records::storage::{DefaultIdGeneratorFactory, IdGenerator, IdGeneratorFactory, IdType};
use sombra_records::types::{Result, StoreError};
use tempfile::tempdir;

const MAX_ID: i64 = (1 << 35) - 1;

fn take(generator: &IdGenerator, count: usize) -> Result<Vec<i64>> {
    (0..count).map(|_| generator.next_id()).collect()
}

fn fresh(path: &Path, grab_size: usize, id_type: IdType) -> Result<IdGenerator> {
    IdGenerator::create(path, 0, true)?;
    IdGenerator::open(path, grab_size, id_type, MAX_ID)
}

#[test]
fn freed_ids_come_back_after_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nodes.id");
    let generator = fresh(&path, 3, IdType::Node)?;
    assert_eq!(take(&generator, 10)?, (0..10).collect::<Vec<_>>());
    for id in [2, 4, 6, 8] {
        generator.free_id(id)?;
    }
    // Only the first full batch of three reached the file.
    assert_eq!(generator.next_id()?, 2);
    generator.free_id(2)?;
    generator.close()?;

    let generator = IdGenerator::open(&path, 3, IdType::Node, MAX_ID)?;
    assert_eq!(generator.high_id(), 10);
    assert_eq!(generator.number_of_ids_in_use(), 6);
    assert_eq!(take(&generator, 5)?, vec![4, 6, 8, 2, 10]);
    generator.close()
}

#[test]
fn non_aggressive_types_wait_for_a_full_batch() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nodes.id");
    let generator = fresh(&path, 2, IdType::Node)?;
    take(&generator, 6)?;
    generator.free_id(1)?;
    assert_eq!(generator.next_id()?, 6);
    generator.free_id(3)?;
    assert_eq!(take(&generator, 3)?, vec![1, 3, 7]);
    generator.close()
}

#[test]
fn checkpoint_makes_released_ids_reusable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nodes.id");
    let generator = fresh(&path, 64, IdType::Node)?;
    take(&generator, 4)?;
    generator.free_id(0)?;
    generator.checkpoint()?;
    assert_eq!(generator.next_id()?, 0);
    assert_eq!(generator.next_id()?, 4);
    generator.close()
}

#[test]
fn factory_creates_missing_files_and_refuses_double_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("strings.id");
    let factory = DefaultIdGeneratorFactory::new(8);
    let generator = factory.open(&path, IdType::StringBlock, &mut || Ok(5), MAX_ID)?;
    assert!(path.exists());
    assert_eq!(generator.next_id()?, 5);
    assert!(matches!(
        factory.open(&path, IdType::StringBlock, &mut || Ok(0), MAX_ID),
        Err(StoreError::StoreFailure(_))
    ));
    generator.close()?;

    let created = factory.create(&path, IdType::StringBlock, 40, false, MAX_ID)?;
    assert_eq!(created.next_id()?, 40);
    created.close()?;
    assert!(matches!(
        factory.create(&path, IdType::StringBlock, 0, true, MAX_ID),
        Err(StoreError::IllegalState(_))
    ));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn reopen_replays_freed_ids_in_order(
        grab_size in 1usize..8,
        freed in proptest::collection::vec(any::<bool>(), 1..60),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.id");
        let generator = fresh(&path, grab_size, IdType::Node).unwrap();
        let count = freed.len();
        take(&generator, count).unwrap();
        let released: Vec<i64> = freed
            .iter()
            .enumerate()
            .filter(|(_, free)| **free)
            .map(|(id, _)| id as i64)
            .collect();
        for id in &released {
            generator.free_id(*id).unwrap();
        }
        generator.close().unwrap();

        let generator = IdGenerator::open(&path, grab_size, IdType::Node, MAX_ID).unwrap();
        prop_assert_eq!(
            generator.number_of_ids_in_use(),
            (count - released.len()) as i64
        );
        let mut expected = released.clone();
        expected.push(count as i64);
        prop_assert_eq!(take(&generator, expected.len()).unwrap(), expected);
        generator.close().unwrap();
    }
}
