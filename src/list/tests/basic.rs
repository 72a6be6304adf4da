use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::{backward, forward, memory_list, reopen};
use crate::list::{ListError, PersistentLinkedList};
use crate::buffer::ProtectionLevel;
use crate::serialize::Persistable;

#[test]
fn front_back_ordering_survives_reopen() {
    let mut list = memory_list::<String>();
    list.push_front(Some(&"A".to_string())).expect("push");
    list.push_front(Some(&"B".to_string())).expect("push");
    list.push_back(Some(&"C".to_string())).expect("push");
    assert_eq!(list.len(), 3);

    let list = reopen(list, true);
    assert_eq!(list.len(), 3);
    assert!(list.is_read_only());
    assert_eq!(
        forward(&list),
        vec![
            Some("B".to_string()),
            Some("A".to_string()),
            Some("C".to_string()),
        ]
    );
}

#[test]
fn indexed_remove_and_both_iteration_orders() {
    let mut list = memory_list::<i32>();
    for value in [1, 2, 3, 4, 5] {
        list.push_back(Some(&value)).expect("push");
    }
    assert_eq!(list.remove(2).expect("remove"), Some(3));
    assert_eq!(
        forward(&list),
        vec![Some(1), Some(2), Some(4), Some(5)]
    );
    assert_eq!(
        backward(&list),
        vec![Some(5), Some(4), Some(2), Some(1)]
    );
}

#[test]
fn nulls_are_stored_without_a_serializer() {
    let mut list = memory_list::<i64>();
    list.push_back(Some(&10)).expect("push");
    list.push_back(None).expect("push null");
    list.push_back(Some(&-10)).expect("push");

    let list = reopen(list, false);
    assert_eq!(forward(&list), vec![Some(10), None, Some(-10)]);
    assert_eq!(list.get(1).expect("get"), None);
}

fn assert_round_trip<T>(value: T)
where
    T: Persistable + PartialEq + std::fmt::Debug + Clone,
    T::Serializer: 'static,
{
    let mut list = memory_list::<T>();
    list.push_back(Some(&value)).expect("push");
    list.push_back(None).expect("push null");
    let list = reopen(list, true);
    assert_eq!(forward(&list), vec![Some(value), None]);
}

#[test]
fn every_built_in_type_round_trips() {
    assert_round_trip(true);
    assert_round_trip(0xFEu8);
    assert_round_trip(-5i8);
    assert_round_trip(-30000i16);
    assert_round_trip(60000u16);
    assert_round_trip(i32::MIN);
    assert_round_trip(i64::MAX);
    assert_round_trip(1.5f32);
    assert_round_trip(-0.125f64);
    assert_round_trip(String::from("round trip ✓"));
    assert_round_trip(String::new());
    assert_round_trip(vec![0u8, 127, 255]);
    assert_round_trip(Vec::<u8>::new());
}

#[test]
fn insert_at_index_walks_from_the_nearer_end() {
    let mut list = memory_list::<i32>();
    for value in [10, 20, 30, 40] {
        list.push_back(Some(&value)).expect("push");
    }
    list.insert(0, Some(&5)).expect("insert at head");
    list.insert(5, Some(&35)).expect("insert near tail");
    list.insert(6, Some(&45)).expect("insert at len appends");
    assert_eq!(
        forward(&list),
        vec![
            Some(5),
            Some(10),
            Some(20),
            Some(30),
            Some(35),
            Some(40),
            Some(45),
        ]
    );
    for index in 0..list.len() {
        assert_eq!(list.get(index).expect("get"), forward(&list)[index as usize]);
    }
}

#[test]
fn set_replaces_and_returns_the_previous_element() {
    let mut list = memory_list::<String>();
    for value in ["a", "b", "c"] {
        list.push_back(Some(&value.to_string())).expect("push");
    }
    let old = list.set(1, Some(&"B".to_string())).expect("set");
    assert_eq!(old, Some("b".to_string()));
    let old = list.set(2, None).expect("set to null");
    assert_eq!(old, Some("c".to_string()));
    assert_eq!(
        forward(&list),
        vec![Some("a".to_string()), Some("B".to_string()), None]
    );
}

#[test]
fn pops_empty_and_clear() {
    let mut list = memory_list::<i32>();
    assert_eq!(list.pop_front().expect("pop"), None);
    assert_eq!(list.pop_back().expect("pop"), None);

    for value in [1, 2, 3] {
        list.push_back(Some(&value)).expect("push");
    }
    assert_eq!(list.pop_front().expect("pop"), Some(Some(1)));
    assert_eq!(list.pop_back().expect("pop"), Some(Some(3)));
    list.clear().expect("clear");
    assert!(list.is_empty());
    assert_eq!(forward(&list), Vec::<Option<i32>>::new());
}

#[test]
fn out_of_bounds_indices_are_rejected() {
    let mut list = memory_list::<i32>();
    list.push_back(Some(&1)).expect("push");
    assert!(matches!(
        list.get(1),
        Err(ListError::IndexOutOfBounds { index: 1, len: 1 })
    ));
    assert!(matches!(
        list.remove(5),
        Err(ListError::IndexOutOfBounds { .. })
    ));
    // insert at len is the append position, one past it is not.
    list.insert(1, Some(&2)).expect("insert at len");
    assert!(matches!(
        list.insert(3, Some(&3)),
        Err(ListError::IndexOutOfBounds { .. })
    ));
}

#[test]
fn read_only_lists_reject_mutation() {
    let mut list = memory_list::<i32>();
    list.push_back(Some(&1)).expect("push");
    let mut list = reopen(list, true);
    assert!(matches!(
        list.push_back(Some(&2)),
        Err(ListError::ReadOnly)
    ));
    assert!(matches!(list.pop_front(), Err(ListError::ReadOnly)));
    assert_eq!(forward(&list), vec![Some(1)]);
}

#[test]
fn wrong_magic_is_rejected() {
    use crate::block::{DynamicBlockBuffer, PersistentBlockBuffer};
    use crate::test::MemoryBuffer;

    let mut blocks =
        DynamicBlockBuffer::open(MemoryBuffer::new()).expect("open should not fail");
    let id = blocks.allocate(24).expect("allocate");
    blocks.put(id, 0, b"NOPE").expect("put");
    let opened = PersistentLinkedList::<i32, _>::open(blocks, false);
    assert!(matches!(opened, Err(ListError::BadMagic { .. })));
}

#[test]
fn full_stack_on_disk_round_trip() {
    let dir = TempDir::new().expect("tempdir should not fail");
    let path = dir.path().join("list");
    {
        let mut list =
            PersistentLinkedList::<String, _>::open_path(&path, ProtectionLevel::Force)
                .expect("open should not fail");
        list.push_front(Some(&"A".to_string())).expect("push");
        list.push_front(Some(&"B".to_string())).expect("push");
        list.push_back(Some(&"C".to_string())).expect("push");
        list.close().expect("close should not fail");
    }
    let list = PersistentLinkedList::<String, _>::open_path(&path, ProtectionLevel::ReadOnly)
        .expect("reopen should not fail");
    assert_eq!(list.len(), 3);
    let contents = list
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("iteration should not fail");
    assert_eq!(
        contents,
        vec![
            Some("B".to_string()),
            Some("A".to_string()),
            Some("C".to_string()),
        ]
    );
}
