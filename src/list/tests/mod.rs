use crate::block::DynamicBlockBuffer;
use crate::list::PersistentLinkedList;
use crate::serialize::Persistable;
use crate::test::MemoryBuffer;

mod basic;

pub(crate) type MemoryList<T> = PersistentLinkedList<T, DynamicBlockBuffer<MemoryBuffer>>;

/// Creates a list over a fresh in-memory dynamic block buffer.
pub(crate) fn memory_list<T>() -> MemoryList<T>
where
    T: Persistable,
    T::Serializer: 'static,
{
    let blocks = DynamicBlockBuffer::open(MemoryBuffer::new()).expect("open should not fail");
    PersistentLinkedList::open(blocks, false).expect("create should not fail")
}

/// Tears a list down to raw bytes and reopens it, optionally read-only.
pub(crate) fn reopen<T>(list: MemoryList<T>, read_only: bool) -> MemoryList<T>
where
    T: Persistable,
    T::Serializer: 'static,
{
    let raw = list.into_inner().into_inner().into_bytes();
    let blocks = DynamicBlockBuffer::open(MemoryBuffer::from_bytes(raw))
        .expect("reopen should not fail");
    PersistentLinkedList::open(blocks, read_only).expect("recovery should not fail")
}

/// Collects the forward iteration, failing the test on any storage error.
pub(crate) fn forward<T>(list: &MemoryList<T>) -> Vec<Option<T>> {
    list.iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("iteration should not fail")
}

/// Collects the descending iteration.
pub(crate) fn backward<T>(list: &MemoryList<T>) -> Vec<Option<T>> {
    list.iter_descending()
        .collect::<Result<Vec<_>, _>>()
        .expect("iteration should not fail")
}
